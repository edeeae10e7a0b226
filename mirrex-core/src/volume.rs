use std::future::Future;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info};

use mirrex_config::ReplicationOptions;
use mirrex_contracts::{FdId, HealSink, Subvolume, UpstreamNotifier};
use mirrex_model::{
    ChildEvent, ChildMask, ClusterEvent, Errno, FopReply, Gfid, ReplySet, keys, pending_key,
};

use crate::error::{FopResult, ReplicationError, Result};
use crate::fd::FdCtx;
use crate::frame::{FopFrame, InflightGauge};
use crate::inode::InodeCtx;
use crate::lock_heal::LockTables;
use crate::thin_arbiter::ThinArbiterState;
use crate::topology::{Topology, TopologyAction, TopologySettings};
use crate::txn::DelayedPostOp;

/// One replicated volume: N brick subvolumes presented as a single logical
/// filesystem with quorum-gated writes, interpreted readability, and lock
/// healing.
///
/// The struct is the `priv` of the translator: immutable configuration plus
/// the mutable topology behind a short-lived mutex. Everything async happens
/// outside that mutex.
pub struct ReplicaSet {
    pub(crate) name: String,
    pub(crate) options: Arc<ReplicationOptions>,
    pub(crate) children: Vec<Arc<dyn Subvolume>>,
    pub(crate) pending_keys: Vec<String>,
    pub(crate) quorum_count: usize,
    pub(crate) arbiter: Option<usize>,
    pub(crate) topology: Mutex<Topology>,
    pub(crate) settings: TopologySettings,
    pub(crate) inodes: DashMap<Gfid, Arc<InodeCtx>>,
    pub(crate) fds: DashMap<FdId, Arc<FdCtx>>,
    pub(crate) locks: LockTables,
    pub(crate) delayed: DashMap<Gfid, DelayedPostOp>,
    pub(crate) heal_sink: Arc<dyn HealSink>,
    pub(crate) notifier: Arc<dyn UpstreamNotifier>,
    pub(crate) thin_arbiter: Option<ThinArbiterState>,
    pub(crate) pending_reads: Vec<AtomicU64>,
    next_fd: AtomicU64,
    next_owner: AtomicU64,
    pub(crate) inflight: Arc<InflightGauge>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for ReplicaSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaSet")
            .field("name", &self.name)
            .field("children", &self.pending_keys)
            .field("quorum_count", &self.quorum_count)
            .field("arbiter", &self.arbiter)
            .field("inode_count", &self.inodes.len())
            .field("fd_count", &self.fds.len())
            .finish()
    }
}

impl ReplicaSet {
    /// Assemble a replica set over `children`. The thin-arbiter subvolume,
    /// when configured in `options`, is passed separately: it is a witness,
    /// not a data replica.
    pub fn new(
        name: impl Into<String>,
        children: Vec<Arc<dyn Subvolume>>,
        options: ReplicationOptions,
        heal_sink: Arc<dyn HealSink>,
        notifier: Arc<dyn UpstreamNotifier>,
        thin_arbiter_subvol: Option<Arc<dyn Subvolume>>,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let child_count = children.len();
        options.validate(child_count)?;

        let thin_arbiter = match (&options.thin_arbiter, thin_arbiter_subvol) {
            (Some(ta_options), Some(subvol)) => {
                Some(ThinArbiterState::new(subvol, ta_options.id_file.clone()))
            }
            (Some(_), None) => {
                return Err(ReplicationError::Config(
                    mirrex_config::ConfigError::ThinArbiterNeedsTwo(child_count),
                ));
            }
            _ => None,
        };

        let pending_keys = children
            .iter()
            .map(|child| pending_key(child.name()))
            .collect();
        let quorum_count = options.quorum.effective(child_count);
        let arbiter = (options.arbiter_count > 0).then_some(0);
        let settings = TopologySettings {
            halo: options.halo,
            quorum_count,
            has_thin_arbiter: thin_arbiter.is_some(),
        };

        info!(
            %name,
            children = %name_of(&children),
            quorum = quorum_count,
            "assembling replica set"
        );

        Ok(Arc::new(ReplicaSet {
            name,
            options: Arc::new(options),
            children,
            pending_keys,
            quorum_count,
            arbiter,
            topology: Mutex::new(Topology::new(child_count)),
            settings,
            inodes: DashMap::new(),
            fds: DashMap::new(),
            locks: LockTables::new(child_count),
            delayed: DashMap::new(),
            heal_sink,
            notifier,
            thin_arbiter,
            pending_reads: (0..child_count).map(|_| AtomicU64::new(0)).collect(),
            next_fd: AtomicU64::new(1),
            // Transaction lk-owners must not collide across clients of the
            // same bricks, or their locks would not conflict.
            next_owner: AtomicU64::new(rand::random::<u64>() | 1),
            inflight: Arc::new(InflightGauge::default()),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn options(&self) -> &ReplicationOptions {
        &self.options
    }

    pub fn quorum_count(&self) -> usize {
        self.quorum_count
    }

    pub fn is_arbiter(&self, child: usize) -> bool {
        self.arbiter == Some(child)
    }

    /// The self-heal lock domain of this volume.
    pub fn selfheal_domain(&self) -> String {
        format!("{}{}", self.name, keys::SELF_HEAL_DOM_SUFFIX)
    }

    pub fn current_event_generation(&self) -> u32 {
        self.topology
            .lock()
            .expect("topology poisoned")
            .event_generation()
    }

    pub fn up_mask(&self) -> ChildMask {
        self.topology.lock().expect("topology poisoned").up_mask()
    }

    pub(crate) fn latencies(&self) -> Vec<i64> {
        self.topology.lock().expect("topology poisoned").latencies()
    }

    pub(crate) fn next_txn_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_fd_id(&self) -> FdId {
        FdId(self.next_fd.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Frame a new operation against a consistent topology snapshot.
    pub(crate) fn frame(&self) -> FopResult<FopFrame> {
        if self.is_shutting_down() {
            return Err(Errno::ENOTCONN);
        }
        let (child_up, event_generation) = {
            let topology = self.topology.lock().expect("topology poisoned");
            (topology.up_mask(), topology.event_generation())
        };
        Ok(FopFrame::new(child_up, event_generation, self.inflight.enter()))
    }

    /// Wind one request to every replica in `on` concurrently and wait for
    /// all replies (the barrier of the transaction model). Slots for
    /// replicas outside `on` stay invalid.
    pub(crate) async fn wind_on<F, Fut>(&self, on: &ChildMask, wind: F) -> ReplySet
    where
        F: Fn(usize, Arc<dyn Subvolume>) -> Fut,
        Fut: Future<Output = FopReply> + Send,
    {
        let calls = on.iter_set().map(|i| {
            let fut = wind(i, Arc::clone(&self.children[i]));
            async move { (i, fut.await) }
        });
        let mut replies = ReplySet::new(self.child_count());
        for (i, mut reply) in join_all(calls).await {
            reply.valid = true;
            replies.set(i, reply);
        }
        replies
    }

    /// The lazily created per-inode context.
    pub fn inode_ctx(&self, gfid: Gfid) -> Arc<InodeCtx> {
        self.inodes
            .entry(gfid)
            .or_insert_with(|| Arc::new(InodeCtx::new(gfid, self.child_count())))
            .clone()
    }

    /// The upper layer no longer references this inode.
    pub fn forget(&self, gfid: Gfid) {
        if let Some((_, inode)) = self.inodes.remove(&gfid)
            && let Some(timer) = inode.take_spb_timer()
        {
            timer.abort();
        }
    }

    pub fn fd_ctx(&self, fd: FdId) -> Option<Arc<FdCtx>> {
        self.fds.get(&fd).map(|entry| Arc::clone(&entry))
    }

    /// Feed one child notification through the event machine. Actions the
    /// machine computes under the topology lock run here, after unlock.
    pub async fn notify_child(self: &Arc<Self>, child: usize, event: ChildEvent) {
        if child >= self.child_count() {
            debug!(child, "notification for unknown child index");
            return;
        }
        let actions = {
            let mut topology = self.topology.lock().expect("topology poisoned");
            topology.apply(child, event, &self.settings)
        };
        self.run_topology_actions(actions).await;
    }

    /// Thin-arbiter witness notification.
    pub async fn notify_thin_arbiter(self: &Arc<Self>, event: ChildEvent) {
        if self.thin_arbiter.is_none() {
            return;
        }
        let mut topology = self.topology.lock().expect("topology poisoned");
        topology.apply_ta(event);
    }

    /// PARENT_UP: arm the stagger timer that bounds how long propagation
    /// waits for silent children.
    pub async fn notify_parent_up(self: &Arc<Self>) {
        let set = Arc::clone(self);
        let timeout = self.options.stagger_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let aggregate = {
                let mut topology = set.topology.lock().expect("topology poisoned");
                topology.stagger_fired()
            };
            if let Some(event) = aggregate {
                set.notifier.notify(event).await;
            }
        });
        let previous = {
            let mut topology = self.topology.lock().expect("topology poisoned");
            topology.stagger.replace(handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Upcall: a peer changed pending xattrs under this inode; cached
    /// readability can no longer be trusted.
    pub fn upcall_cache_invalidation(&self, gfid: Gfid) {
        if let Some(inode) = self.inodes.get(&gfid) {
            inode.set_need_refresh(true);
        }
    }

    /// Upcall: another client wants a domain lock we hold.
    pub async fn upcall_inodelk_contention(self: &Arc<Self>, dom: &str) {
        if dom == keys::DOM_TA_NOTIFY {
            self.ta_release_notify_lock().await;
        }
    }

    pub(crate) async fn run_topology_actions(self: &Arc<Self>, actions: Vec<TopologyAction>) {
        for action in actions {
            match action {
                TopologyAction::Propagate(event) => {
                    self.propagate(event).await;
                }
                TopologyAction::LaunchLockHeal { child, event_gen } => {
                    self.locks_on_child_up(child, event_gen);
                }
                TopologyAction::MarkLocksDown { child, event_gen } => {
                    self.locks_on_child_down(child, event_gen);
                }
            }
        }
    }

    pub(crate) async fn propagate(&self, event: ClusterEvent) {
        debug!(?event, "propagating aggregate event");
        self.notifier.notify(event).await;
    }

    /// Orderly teardown: refuse new frames, flush deferred changelogs, wait
    /// for in-flight frames to drain, stop timers, abandon queued lock
    /// heals, and emit a final Down.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.name, "replica set shutting down");
        self.flush_all_delayed().await;
        self.inflight.wait_drained().await;

        let stagger = {
            let mut topology = self.topology.lock().expect("topology poisoned");
            topology.stagger.take()
        };
        if let Some(stagger) = stagger {
            stagger.abort();
        }
        for inode in self.inodes.iter() {
            if let Some(timer) = inode.take_spb_timer() {
                timer.abort();
            }
        }
        self.abandon_lock_heals();
        self.propagate(ClusterEvent::Down).await;
    }
}

fn name_of(children: &[Arc<dyn Subvolume>]) -> String {
    children
        .iter()
        .map(|child| child.name())
        .collect::<Vec<_>>()
        .join(",")
}
