use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use mirrex_contracts::FdId;
use mirrex_model::{
    ChildMask, Errno, Flock, Gfid, LkCmd, LockKind, ReplySet, Xdata, keys,
};

use crate::error::FopResult;
use crate::fop_lock::ClusterLockKind;
use crate::policy::ReadArgs;
use crate::volume::ReplicaSet;

/// A held user lock that must be re-asserted on replicas that reconnect.
#[derive(Debug, Clone)]
pub(crate) struct LkHealRecord {
    pub id: u64,
    pub fd: FdId,
    pub gfid: Gfid,
    pub cmd: LkCmd,
    pub flock: Flock,
    pub xdata_req: Xdata,
    pub locked_nodes: ChildMask,
    pub child_up_event_gen: Vec<u32>,
    pub child_down_event_gen: Vec<u32>,
}

/// The two lock-heal queues plus per-child up/down generation stamps used
/// to detect flaps that intervene while a heal is in flight.
#[derive(Debug)]
pub(crate) struct LockTables {
    inner: Mutex<Tables>,
    draining: AtomicBool,
}

#[derive(Debug)]
struct Tables {
    saved: Vec<LkHealRecord>,
    healq: VecDeque<LkHealRecord>,
    child_up_gen: Vec<u32>,
    child_down_gen: Vec<u32>,
    next_id: u64,
}

impl LockTables {
    pub(crate) fn new(child_count: usize) -> Self {
        LockTables {
            inner: Mutex::new(Tables {
                saved: Vec::new(),
                healq: VecDeque::new(),
                child_up_gen: vec![0; child_count],
                child_down_gen: vec![0; child_count],
                next_id: 1,
            }),
            draining: AtomicBool::new(false),
        }
    }

    pub(crate) fn saved_count(&self) -> usize {
        self.inner.lock().expect("lock tables poisoned").saved.len()
    }

    pub(crate) fn healq_count(&self) -> usize {
        self.inner.lock().expect("lock tables poisoned").healq.len()
    }
}

enum HealOneOutcome {
    Healed,
    Requeue,
    Drop,
}

impl ReplicaSet {
    /// Register a freshly granted mandatory lock for healing.
    pub(crate) fn register_lock_heal(
        &self,
        fd: FdId,
        gfid: Gfid,
        cmd: LkCmd,
        flock: Flock,
        xdata_req: Xdata,
        locked_nodes: ChildMask,
    ) -> u64 {
        let n = self.child_count();
        let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
        let id = tables.next_id;
        tables.next_id += 1;
        tables.saved.push(LkHealRecord {
            id,
            fd,
            gfid,
            cmd,
            flock,
            xdata_req,
            locked_nodes,
            child_up_event_gen: vec![0; n],
            child_down_event_gen: vec![0; n],
        });
        debug!(%gfid, record = id, "registered lock for healing");
        id
    }

    /// Drop the heal record matching an explicit unlock of the same range.
    pub(crate) fn remove_lock_heal(&self, record_id: u64, flock: &Flock) -> Option<ChildMask> {
        let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
        let matches = |record: &LkHealRecord| record.id == record_id && record.flock.same_range(flock);
        if let Some(at) = tables.saved.iter().position(matches) {
            return Some(tables.saved.remove(at).locked_nodes);
        }
        if let Some(at) = tables.healq.iter().position(matches) {
            return tables.healq.remove(at).map(|record| record.locked_nodes);
        }
        None
    }

    /// Drop a heal record regardless of range; used on fd release.
    pub(crate) fn remove_lock_heal_by_id(&self, record_id: u64) {
        let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
        tables.saved.retain(|record| record.id != record_id);
        tables.healq.retain(|record| record.id != record_id);
    }

    /// CHILD_UP hook: stamp the up generation, move every tracked record to
    /// the heal queue, and start the single drain task.
    pub(crate) fn locks_on_child_up(self: &Arc<Self>, child: usize, event_gen: u32) {
        {
            let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
            tables.child_up_gen[child] = event_gen;
            let mut moved = std::mem::take(&mut tables.saved);
            for record in &mut moved {
                record.child_up_event_gen[child] = event_gen;
            }
            tables.healq.extend(moved);
            if tables.healq.is_empty() {
                return;
            }
        }
        if self
            .locks
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let set = Arc::clone(self);
            tokio::spawn(async move {
                set.drain_lock_healq().await;
                set.locks.draining.store(false, Ordering::Release);
            });
        }
    }

    /// CHILD_DOWN hook: stamp the down generation, drop the node from every
    /// record, and fence fds whose lock fell below quorum.
    ///
    /// No unlock is wound to surviving replicas for a fenced fd: a new
    /// client taking over is expected to preempt the remnants.
    pub(crate) fn locks_on_child_down(&self, child: usize, event_gen: u32) {
        let required = if self.quorum_count > 0 {
            self.quorum_count
        } else {
            self.child_count()
        };
        let mut fenced: Vec<FdId> = Vec::new();
        {
            let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
            tables.child_down_gen[child] = event_gen;
            let mut keep = |record: &mut LkHealRecord| {
                record.child_down_event_gen[child] = event_gen;
                record.locked_nodes.set(child, false);
                if record.locked_nodes.count() < required {
                    warn!(gfid = %record.gfid, record = record.id,
                          "lock lost quorum, fencing fd");
                    fenced.push(record.fd);
                    false
                } else {
                    true
                }
            };
            tables.saved.retain_mut(&mut keep);
            tables.healq.retain_mut(&mut keep);
        }
        for fd in fenced {
            self.mark_fd_bad(fd);
        }
    }

    /// (saved, queued) record counts; the testable face of invariant that a
    /// quorate lock is tracked and a sub-quorate one is gone.
    pub fn lock_heal_queue_sizes(&self) -> (usize, usize) {
        (self.locks.saved_count(), self.locks.healq_count())
    }

    /// Where the heal record of `fd` currently believes its lock is held.
    pub fn lock_heal_nodes(&self, fd: FdId) -> Option<ChildMask> {
        let tables = self.locks.inner.lock().expect("lock tables poisoned");
        tables
            .saved
            .iter()
            .chain(tables.healq.iter())
            .find(|record| record.fd == fd)
            .map(|record| record.locked_nodes.clone())
    }

    /// Shutdown: queued heals are abandoned, not replayed. Records still in
    /// `saved` die with the process anyway.
    pub(crate) fn abandon_lock_heals(&self) {
        let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
        if !tables.healq.is_empty() {
            info!(abandoned = tables.healq.len(), "dropping queued lock heals");
            tables.healq.clear();
        }
    }

    pub(crate) fn mark_fd_bad(&self, fd: FdId) {
        if let Some(ctx) = self.fds.get(&fd) {
            ctx.mark_bad();
        }
    }

    /// One pass over the heal queue. Single-writer: at most one drain task
    /// runs per replica set; records that cannot be healed yet go back to
    /// the queue and wait for the next CHILD_UP.
    pub(crate) async fn drain_lock_healq(self: &Arc<Self>) {
        let batch: Vec<LkHealRecord> = {
            let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
            tables.healq.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        info!(records = batch.len(), "healing re-connected locks");

        for mut record in batch {
            if self
                .fds
                .get(&record.fd)
                .map(|ctx| ctx.is_bad())
                .unwrap_or(true)
            {
                debug!(record = record.id, "skipping heal for fenced or closed fd");
                continue;
            }
            let outcome = self.lock_heal_one(&mut record).await;
            let mut tables = self.locks.inner.lock().expect("lock tables poisoned");
            match outcome {
                HealOneOutcome::Healed => tables.saved.push(record),
                HealOneOutcome::Requeue => tables.healq.push_back(record),
                HealOneOutcome::Drop => {}
            }
        }
    }

    async fn lock_heal_one(self: &Arc<Self>, record: &mut LkHealRecord) -> HealOneOutcome {
        let Ok(frame) = self.frame() else {
            return HealOneOutcome::Requeue;
        };

        // Serialize against competing user locks on the same range.
        let dom = ClusterLockKind::Finodelk {
            dom: keys::DOM_LOCK_HEAL.to_owned(),
            fd: record.fd,
            flock: Flock::write(0, 0, record.flock.owner),
        };
        let dom_grant = self.cluster_lock(&frame, &dom, true).await;
        if dom_grant.op_ret < 0 {
            warn!(gfid = %record.gfid, errno = %dom_grant.op_errno,
                  "could not acquire lock-heal domain, requeueing");
            return HealOneOutcome::Requeue;
        }

        let outcome = self.lock_heal_verify_and_replay(&frame, record).await;
        self.cluster_unlock(&dom, &dom_grant.granted).await;
        outcome
    }

    async fn lock_heal_verify_and_replay(
        self: &Arc<Self>,
        frame: &crate::frame::FopFrame,
        record: &mut LkHealRecord,
    ) -> HealOneOutcome {
        let mut replay_on = ChildMask::none(self.child_count());
        for i in frame.child_up.iter_set() {
            if !record.locked_nodes.get(i) {
                replay_on.set(i, true);
            }
        }

        // GETLK everywhere before touching anything. On replicas recorded
        // as holding the lock, anything but our own owner (including a free
        // range) means we lost it. On replay targets, a foreign owner means
        // a fencing client got there first; a free range is the expected
        // state after a reconnect.
        let verify_on = record
            .locked_nodes
            .intersect(&frame.child_up)
            .iter_set()
            .chain(replay_on.iter_set())
            .fold(ChildMask::none(self.child_count()), |mut mask, i| {
                mask.set(i, true);
                mask
            });
        if verify_on.any() {
            let fd = record.fd;
            let flock = record.flock;
            let xdata = record.xdata_req.clone();
            let replies = self
                .wind_on(&verify_on, move |_, child| {
                    let xdata = xdata.clone();
                    async move { child.lk(fd, LkCmd::GetLk, &flock, &xdata).await }
                })
                .await;
            if !replies.any_success() {
                return HealOneOutcome::Requeue;
            }
            for i in verify_on.iter_set() {
                let reply = replies.get(i);
                if !reply.succeeded() {
                    continue;
                }
                let Some(held) = reply.flock else {
                    continue;
                };
                let preempted = if record.locked_nodes.get(i) {
                    held.kind == LockKind::Unlock || held.owner != record.flock.owner
                } else {
                    held.kind != LockKind::Unlock && held.owner != record.flock.owner
                };
                if preempted {
                    warn!(gfid = %record.gfid, record = record.id, child = i,
                          "lock pre-empted by another client, fencing fd");
                    self.mark_fd_bad(record.fd);
                    return HealOneOutcome::Drop;
                }
            }
        }

        if !replay_on.any() {
            return HealOneOutcome::Requeue;
        }

        let sampled_up_gen: Vec<u32> = {
            let tables = self.locks.inner.lock().expect("lock tables poisoned");
            tables.child_up_gen.clone()
        };

        let fd = record.fd;
        let cmd = record.cmd;
        let flock = record.flock;
        let xdata = record.xdata_req.clone();
        let replies: ReplySet = self
            .wind_on(&replay_on, move |_, child| {
                let xdata = xdata.clone();
                async move { child.lk(fd, cmd, &flock, &xdata).await }
            })
            .await;

        let mut any_healed = false;
        {
            let tables = self.locks.inner.lock().expect("lock tables poisoned");
            for i in replay_on.iter_set() {
                if !replies.get(i).succeeded() {
                    continue;
                }
                let no_flap = tables.child_up_gen[i] == sampled_up_gen[i]
                    && tables.child_up_gen[i] > tables.child_down_gen[i];
                if no_flap {
                    record.locked_nodes.set(i, true);
                    record.child_up_event_gen[i] = tables.child_up_gen[i];
                    any_healed = true;
                } else {
                    error!(child = i, gfid = %record.gfid,
                           "event generation mismatch, not marking lock healed");
                }
            }
        }

        if any_healed {
            info!(gfid = %record.gfid, record = record.id,
                  nodes = ?record.locked_nodes, "lock healed");
            HealOneOutcome::Healed
        } else {
            HealOneOutcome::Requeue
        }
    }

    /// User-visible POSIX lock FOP.
    ///
    /// GETLK consults the read child. SETLK/SETLKW go through the cluster
    /// lock protocol; a grant under mandatory-lock mode is registered for
    /// healing. Unlocks fan out to the replicas recorded as holding the
    /// lock.
    pub async fn lk(
        self: &Arc<Self>,
        fd: FdId,
        cmd: LkCmd,
        flock: Flock,
        xdata: Xdata,
    ) -> FopResult<Option<Flock>> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        if fd_ctx.is_bad() {
            return Err(Errno::EBADFD);
        }
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }

        if cmd == LkCmd::GetLk {
            let inode = self.inode_ctx(fd_ctx.gfid());
            let args = ReadArgs {
                gfid: fd_ctx.gfid(),
                ia_type: inode.ia_type(),
            };
            let child = self
                .select_read_child(&frame.child_up, &args)
                .ok_or(Errno::ENOTCONN)?;
            let reply = self.children[child].lk(fd, LkCmd::GetLk, &flock, &xdata).await;
            if reply.failed() {
                return Err(reply.op_errno);
            }
            return Ok(reply.flock);
        }

        if flock.kind == LockKind::Unlock {
            let (on, record) = match fd_ctx.lk_heal_record() {
                Some(id) => match self.remove_lock_heal(id, &flock) {
                    Some(nodes) => (nodes.intersect(&frame.child_up), Some(id)),
                    None => (frame.child_up.clone(), None),
                },
                None => (frame.child_up.clone(), None),
            };
            if record.is_some() {
                fd_ctx.set_lk_heal_record(None);
            }
            let kind = ClusterLockKind::PosixLk { fd, flock, xdata };
            self.cluster_unlock(&kind, &on).await;
            return Ok(None);
        }

        let kind = ClusterLockKind::PosixLk {
            fd,
            flock,
            xdata: xdata.clone(),
        };
        let outcome = self
            .cluster_lock(&frame, &kind, cmd == LkCmd::SetLkw)
            .await;
        if outcome.op_ret < 0 {
            return Err(outcome.op_errno);
        }

        let mandatory = fd_ctx.mandatory_lock() || xdata.contains(keys::MANDATORY_LOCK_XATTR);
        if mandatory && fd_ctx.lk_heal_record().is_none() {
            let id = self.register_lock_heal(
                fd,
                fd_ctx.gfid(),
                cmd,
                flock,
                xdata,
                outcome.granted.clone(),
            );
            fd_ctx.set_lk_heal_record(Some(id));
        }
        Ok(None)
    }
}
