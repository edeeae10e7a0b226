use std::future::Future;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use mirrex_contracts::{FdId, Subvolume};
use mirrex_model::{
    ChangelogDelta, ChildMask, Errno, Flock, FopReply, Gfid, LkOwner, ReplySet, TxnType, Xdata,
    keys,
};

use crate::error::quorum_errno;
use crate::fop_lock::ClusterLockKind;
use crate::inode::InodeCtx;
use crate::volume::ReplicaSet;

/// What a transaction operates on. Entry transactions name the parent
/// directory (whose gfid doubles as the context inode) plus the basename
/// being locked.
#[derive(Debug, Clone)]
pub struct TxnRequest {
    pub txn_type: TxnType,
    pub gfid: Gfid,
    pub fd: Option<FdId>,
    pub basename: Option<String>,
}

impl TxnRequest {
    pub fn data_on_fd(gfid: Gfid, fd: FdId) -> Self {
        TxnRequest {
            txn_type: TxnType::Data,
            gfid,
            fd: Some(fd),
            basename: None,
        }
    }

    pub fn metadata(gfid: Gfid) -> Self {
        TxnRequest {
            txn_type: TxnType::Metadata,
            gfid,
            fd: None,
            basename: None,
        }
    }

    pub fn entry(parent: Gfid, basename: impl Into<String>) -> Self {
        TxnRequest {
            txn_type: TxnType::Entry,
            gfid: parent,
            fd: None,
            basename: Some(basename.into()),
        }
    }
}

/// The aggregated result of one mutating transaction.
#[derive(Debug)]
pub struct TxnOutcome {
    pub op_ret: i32,
    pub op_errno: Errno,
    pub replies: ReplySet,
    /// Replicas that missed the mutation and now carry pending marks.
    pub failed_subvols: ChildMask,
}

impl TxnOutcome {
    fn errored(op_errno: Errno, child_count: usize) -> Self {
        TxnOutcome {
            op_ret: -1,
            op_errno,
            replies: ReplySet::new(child_count),
            failed_subvols: ChildMask::none(child_count),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.op_ret >= 0
    }
}

/// A post-op whose changelog flush is deferred. The flush task owns the
/// work; `flush_now` wakes it early when a conflicting transaction or
/// shutdown cannot wait out the delay.
#[derive(Debug)]
pub(crate) struct DelayedPostOp {
    pub flush_now: Arc<Notify>,
    pub handle: JoinHandle<()>,
}

/// Everything a post-op flush needs, whether it runs inline or deferred.
#[derive(Debug, Clone)]
struct PostOpWork {
    request: TxnRequest,
    pre_op: ChildMask,
    post_op_on: ChildMask,
    post_delta: Xdata,
    lock_kind: ClusterLockKind,
    locked: ChildMask,
}

impl ReplicaSet {
    /// Run one mutating transaction:
    /// LOCK → PRE-OP → WIND → COLLECT → POST-OP → UNLOCK.
    ///
    /// `wind` issues the actual operation against a single replica. It is
    /// invoked once per participating replica, concurrently.
    pub async fn transaction<F, Fut>(self: &Arc<Self>, request: TxnRequest, wind: F) -> TxnOutcome
    where
        F: Fn(usize, Arc<dyn Subvolume>) -> Fut + Send + Sync,
        Fut: Future<Output = FopReply> + Send,
    {
        let n = self.child_count();
        match self.transaction_inner(request, wind).await {
            Ok(outcome) => outcome,
            Err(errno) => TxnOutcome::errored(errno, n),
        }
    }

    async fn transaction_inner<F, Fut>(
        self: &Arc<Self>,
        request: TxnRequest,
        wind: F,
    ) -> Result<TxnOutcome, Errno>
    where
        F: Fn(usize, Arc<dyn Subvolume>) -> Fut + Send + Sync,
        Fut: Future<Output = FopReply> + Send,
    {
        let n = self.child_count();
        if let Some(fd) = request.fd {
            let ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
            if ctx.is_bad() {
                return Err(Errno::EBADFD);
            }
        }

        // A delayed post-op on the same inode still holds the cluster lock.
        self.flush_delayed_post_op(request.gfid).await;

        let frame = self.frame()?;
        if self.options.consistent_io && frame.up_count() != n {
            debug!("not all subvolumes are up, failing under consistent-io");
            return Err(Errno::ENOTCONN);
        }
        if self.quorum_count > 0 && frame.up_count() < self.quorum_count {
            return Err(quorum_errno());
        }
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }

        let inode = self.inode_ctx(request.gfid);
        self.refresh_if_needed(&inode, request.fd).await?;

        // LOCK: serialize against every other writer of this inode/entry.
        let owner = LkOwner(self.next_txn_owner());
        let lock_kind = match (&request.basename, request.fd) {
            (Some(basename), _) => ClusterLockKind::Entrylk {
                dom: self.name.clone(),
                parent: request.gfid,
                basename: basename.clone(),
            },
            (None, Some(fd)) => ClusterLockKind::Finodelk {
                dom: self.name.clone(),
                fd,
                flock: Flock::write(0, 0, owner),
            },
            (None, None) => ClusterLockKind::Inodelk {
                dom: self.name.clone(),
                gfid: request.gfid,
                flock: Flock::write(0, 0, owner),
            },
        };
        let lock = self.cluster_lock(&frame, &lock_kind, true).await;
        if lock.op_ret < 0 {
            return Err(lock.op_errno);
        }

        inode.txn_begin(n);
        let result = self
            .locked_transaction(&request, &frame, &inode, &lock.granted, &lock_kind, wind)
            .await;

        if let Err(errno) = &result {
            // Failure paths flush inline; the lock never outlives them.
            inode.txn_end(n);
            self.cluster_unlock(&lock_kind, &lock.granted).await;
            return Err(*errno);
        }
        result
    }

    async fn locked_transaction<F, Fut>(
        self: &Arc<Self>,
        request: &TxnRequest,
        frame: &crate::frame::FopFrame,
        inode: &Arc<InodeCtx>,
        participants: &ChildMask,
        lock_kind: &ClusterLockKind,
        wind: F,
    ) -> Result<TxnOutcome, Errno>
    where
        F: Fn(usize, Arc<dyn Subvolume>) -> Fut + Send + Sync,
        Fut: Future<Output = FopReply> + Send,
    {
        let n = self.child_count();
        let txn_type = request.txn_type;

        // PRE-OP: mark intent on every participant.
        let mut pre_op_delta = Xdata::new();
        pre_op_delta.set_delta(keys::DIRTY_XATTR, &ChangelogDelta::dirty(txn_type, 1));
        let pre_replies = self
            .wind_xattrop(request, participants, &pre_op_delta)
            .await;
        let pre_op = pre_replies.success_mask();
        inode.pre_op_inc(txn_type, &pre_op);

        if !pre_op.any() || (self.quorum_count > 0 && pre_op.count() < self.quorum_count) {
            warn!(gfid = %request.gfid, "pre-op failed to reach quorum, aborting transaction");
            self.undo_pre_op(request, &pre_op, txn_type).await;
            inode.pre_op_dec(txn_type, &pre_op);
            let mut errno = pre_replies.final_errno();
            if errno.is_ok() {
                errno = quorum_errno();
            }
            return Err(errno);
        }

        // WIND the operation to every replica that accepted the pre-op.
        let replies = self.wind_on(&pre_op, wind).await;

        // COLLECT: interpret the replies.
        let successes = replies.success_mask();
        let mut failed_subvols = ChildMask::none(n);
        let mut op_ret = -1;
        let mut op_errno;
        let mut in_flight_sb = false;

        if let Some(symmetric) = replies.symmetric_error() {
            // The operation failed identically everywhere; no replica is at
            // fault and nothing is recorded against anyone.
            op_errno = symmetric;
        } else {
            // Every replica that did not apply the mutation is charged:
            // failed repliers, failed pre-ops, and replicas that were down
            // before the transaction started.
            for i in 0..n {
                if !replies.get(i).succeeded() {
                    failed_subvols.set(i, true);
                }
            }

            // In-flight split-brain: the one replica this dimension could
            // still be read from just missed a mutation.
            let (write_data, write_meta, _) = inode.write_subvol_get(n);
            let dim_mask = match txn_type {
                TxnType::Metadata => &write_meta,
                _ => &write_data,
            };
            if dim_mask.count() == 1
                && let Some(only) = dim_mask.first()
                && failed_subvols.get(only)
            {
                in_flight_sb = true;
                op_errno = replies.get(only).op_errno;
                inode.mark_heal_candidate(n, txn_type, only);
                warn!(gfid = %request.gfid, child = only,
                      "last readable replica failed in flight, marking for heal");
            } else {
                op_errno = Errno::OK;
            }

            if successes.any() && !in_flight_sb {
                op_ret = pre_op
                    .iter_set()
                    .filter_map(|i| {
                        let reply = replies.get(i);
                        reply.succeeded().then_some(reply.op_ret)
                    })
                    .next()
                    .unwrap_or(0);
            } else if !in_flight_sb {
                op_errno = replies.final_errno();
            }
        }

        // Quorum enforcement on the replies.
        if self.quorum_count > 0 && successes.count() < self.quorum_count {
            op_ret = -1;
            let agreed = replies.final_errno();
            op_errno = if agreed.is_ok() { quorum_errno() } else { agreed };
        }

        // POST-OP: clear intent everywhere except on replicas that are
        // genuinely accused (a symmetric failure accuses nobody), and
        // charge the accused on the survivors.
        let mut post_op_on = pre_op.clone();
        for j in failed_subvols.iter_set() {
            post_op_on.set(j, false);
        }
        let mut post_delta = Xdata::new();
        post_delta.set_delta(keys::DIRTY_XATTR, &ChangelogDelta::dirty(txn_type, -1));
        for j in failed_subvols.iter_set() {
            post_delta.set_delta(&self.pending_keys[j], &ChangelogDelta::dirty(txn_type, 1));
        }
        // Replicas that failed the op but passed the pre-op keep their
        // dirty mark; that is the heal hint.
        let work = PostOpWork {
            request: request.clone(),
            pre_op: pre_op.clone(),
            post_op_on: post_op_on.clone(),
            post_delta,
            lock_kind: lock_kind.clone(),
            locked: participants.clone(),
        };
        let clean_result = op_ret >= 0 && !failed_subvols.any();
        let delay = self.options.post_op_delay();
        if clean_result && !delay.is_zero() && !self.is_shutting_down() {
            self.schedule_delayed_post_op(work, delay);
        } else {
            self.flush_post_op(&work).await;
        }

        if op_ret >= 0 && post_op_on.any() {
            inode.update_dimension(n, txn_type, &post_op_on, frame.event_generation);
        }
        if failed_subvols.any() && !in_flight_sb {
            self.trigger_heal(
                request.gfid,
                txn_type == TxnType::Data,
                txn_type == TxnType::Metadata,
                txn_type == TxnType::Entry,
            )
            .await;
            if self.thin_arbiter.is_some() && op_ret >= 0 {
                self.ta_post_op(request.gfid, txn_type, &failed_subvols).await;
            }
        }

        // Stale-topology gate: the world changed under this frame.
        if self.options.consistent_io
            && self.current_event_generation() != frame.event_generation
            && op_ret >= 0
        {
            op_ret = -1;
            op_errno = Errno::ENOTCONN;
        }

        Ok(TxnOutcome {
            op_ret,
            op_errno,
            replies,
            failed_subvols,
        })
    }

    async fn wind_xattrop(
        &self,
        request: &TxnRequest,
        on: &ChildMask,
        delta: &Xdata,
    ) -> ReplySet {
        let gfid = request.gfid;
        let fd = request.fd;
        let delta = delta.clone();
        self.wind_on(on, move |_, child| {
            let delta = delta.clone();
            async move {
                match fd {
                    Some(fd) => child.fxattrop(fd, &delta).await,
                    None => child.xattrop(gfid, &delta).await,
                }
            }
        })
        .await
    }

    async fn undo_pre_op(&self, request: &TxnRequest, on: &ChildMask, txn_type: TxnType) {
        if !on.any() {
            return;
        }
        let mut delta = Xdata::new();
        delta.set_delta(keys::DIRTY_XATTR, &ChangelogDelta::dirty(txn_type, -1));
        let _ = self.wind_xattrop(request, on, &delta).await;
    }

    /// Flush the post-op changelog and release the transaction lock.
    async fn flush_post_op(self: &Arc<Self>, work: &PostOpWork) {
        if work.post_op_on.any() {
            let _ = self
                .wind_xattrop(&work.request, &work.post_op_on, &work.post_delta)
                .await;
        }
        let inode = self.inode_ctx(work.request.gfid);
        inode.pre_op_dec(work.request.txn_type, &work.pre_op);
        inode.txn_end(self.child_count());
        self.cluster_unlock(&work.lock_kind, &work.locked).await;
    }

    fn schedule_delayed_post_op(self: &Arc<Self>, work: PostOpWork, delay: std::time::Duration) {
        let gfid = work.request.gfid;
        let flush_now = Arc::new(Notify::new());
        let notified = Arc::clone(&flush_now);
        let set = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = notified.notified() => {}
            }
            set.flush_post_op(&work).await;
            set.delayed.remove(&gfid);
        });
        self.delayed.insert(gfid, DelayedPostOp { flush_now, handle });
    }

    /// Force a pending delayed post-op (if any) to flush and wait for it.
    pub(crate) async fn flush_delayed_post_op(&self, gfid: Gfid) {
        let Some((_, delayed)) = self.delayed.remove(&gfid) else {
            return;
        };
        delayed.flush_now.notify_one();
        let _ = delayed.handle.await;
    }

    /// Flush every outstanding delayed post-op; used by shutdown.
    pub(crate) async fn flush_all_delayed(&self) {
        let gfids: Vec<Gfid> = self.delayed.iter().map(|entry| *entry.key()).collect();
        for gfid in gfids {
            self.flush_delayed_post_op(gfid).await;
        }
    }
}
