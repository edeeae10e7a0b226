//! Shared test fixture: an in-memory brick implementing the `Subvolume`
//! contract with controllable connectivity, a per-file xattr store, and a
//! brick-side lock table with real conflict semantics.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use mirrex_config::ReplicationOptions;
use mirrex_contracts::{FdId, HealRequest, Subvolume};
use mirrex_core::{ChannelHealSink, ChannelNotifier, ReplicaSet};
use mirrex_model::{
    ChangelogCounts, ChildEvent, ClusterEvent, EntrylkCmd, Errno, FileType, Flock, FopReply, Gfid,
    Iatt, LkCmd, LockKind, Xdata, keys,
};

#[derive(Debug, Clone)]
struct FileState {
    iatt: Iatt,
    data: Vec<u8>,
    xattrs: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
struct PosixLock {
    gfid: Gfid,
    flock: Flock,
}

#[derive(Debug, Clone)]
struct DomainLock {
    dom: String,
    gfid: Gfid,
    flock: Flock,
}

#[derive(Debug, Clone)]
struct EntryLock {
    dom: String,
    parent: Gfid,
    basename: String,
}

#[derive(Debug, Default)]
struct BrickState {
    files: HashMap<Gfid, FileState>,
    named: HashMap<String, Gfid>,
    fds: HashMap<FdId, Gfid>,
    posix_locks: Vec<PosixLock>,
    domain_locks: Vec<DomainLock>,
    entry_locks: Vec<EntryLock>,
    fail_ops: HashMap<&'static str, Errno>,
}

#[derive(Debug)]
pub struct FakeBrick {
    name: String,
    connected: AtomicBool,
    state: std::sync::Mutex<BrickState>,
    lock_released: Notify,
}

impl FakeBrick {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(FakeBrick {
            name: name.into(),
            connected: AtomicBool::new(true),
            state: std::sync::Mutex::new(BrickState::default()),
            lock_released: Notify::new(),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Make one named operation fail with `errno` until cleared.
    pub fn fail_op(&self, op: &'static str, errno: Errno) {
        self.state.lock().unwrap().fail_ops.insert(op, errno);
    }

    pub fn clear_fail_op(&self, op: &'static str) {
        self.state.lock().unwrap().fail_ops.remove(op);
    }

    pub fn seed_file(&self, gfid: Gfid, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(
            gfid,
            FileState {
                iatt: Iatt::regular(gfid, data.len() as u64),
                data: data.to_vec(),
                xattrs: BTreeMap::new(),
            },
        );
    }

    pub fn seed_dir(&self, gfid: Gfid) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(
            gfid,
            FileState {
                iatt: Iatt::directory(gfid),
                data: Vec::new(),
                xattrs: BTreeMap::new(),
            },
        );
    }

    pub fn set_xattr(&self, gfid: Gfid, key: &str, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.files.get_mut(&gfid) {
            file.xattrs.insert(key.to_owned(), value);
        }
    }

    pub fn set_pending(&self, gfid: Gfid, key: &str, counts: ChangelogCounts) {
        self.set_xattr(gfid, key, counts.to_wire());
    }

    pub fn counts(&self, gfid: Gfid, key: &str) -> ChangelogCounts {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&gfid)
            .and_then(|file| file.xattrs.get(key))
            .and_then(|raw| ChangelogCounts::from_wire(raw).ok())
            .unwrap_or_default()
    }

    pub fn contents(&self, gfid: Gfid) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state
            .files
            .get(&gfid)
            .map(|file| file.data.clone())
            .unwrap_or_default()
    }

    pub fn set_size(&self, gfid: Gfid, size: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(file) = state.files.get_mut(&gfid) {
            file.iatt.size = size;
        }
    }

    pub fn has_posix_lock(&self, gfid: Gfid, owner: mirrex_model::LkOwner) -> bool {
        let state = self.state.lock().unwrap();
        state
            .posix_locks
            .iter()
            .any(|lock| lock.gfid == gfid && lock.flock.owner == owner)
    }

    /// Simulate a fencing client grabbing the lock directly on this brick.
    pub fn force_posix_lock(&self, gfid: Gfid, flock: Flock) {
        let mut state = self.state.lock().unwrap();
        state.posix_locks.push(PosixLock { gfid, flock });
    }

    /// Park a foreign holder on a lock domain, blocking cluster locks.
    pub fn force_domain_lock(&self, dom: &str, gfid: Gfid, flock: Flock) {
        let mut state = self.state.lock().unwrap();
        state.domain_locks.push(DomainLock {
            dom: dom.to_owned(),
            gfid,
            flock,
        });
    }

    pub fn drop_domain_locks(&self, gfid: Gfid) {
        let mut state = self.state.lock().unwrap();
        state.domain_locks.retain(|lock| lock.gfid != gfid);
        drop(state);
        self.lock_released.notify_waiters();
    }

    pub fn drop_posix_locks(&self, gfid: Gfid) {
        let mut state = self.state.lock().unwrap();
        state.posix_locks.retain(|lock| lock.gfid != gfid);
        self.lock_released.notify_waiters();
    }

    fn check(&self, op: &'static str) -> Option<FopReply> {
        if !self.connected.load(Ordering::Acquire) {
            return Some(FopReply::disconnected());
        }
        let state = self.state.lock().unwrap();
        state.fail_ops.get(op).map(|errno| FopReply::err(*errno))
    }

    fn reply_with_xattrs(&self, gfid: Gfid) -> FopReply {
        let state = self.state.lock().unwrap();
        match state.files.get(&gfid) {
            Some(file) => {
                let mut xdata = Xdata::new();
                for (key, value) in &file.xattrs {
                    xdata.set(key.clone(), value.clone());
                }
                FopReply::ok(0, Some(file.iatt), xdata)
            }
            None => FopReply::err(Errno::ENOENT),
        }
    }

    fn resolve_fd(&self, fd: FdId) -> Option<Gfid> {
        let state = self.state.lock().unwrap();
        state.fds.get(&fd).copied()
    }

    fn apply_xattrop(&self, gfid: Gfid, delta: &Xdata) -> FopReply {
        let mut state = self.state.lock().unwrap();
        let Some(file) = state.files.get_mut(&gfid) else {
            return FopReply::err(Errno::ENOENT);
        };
        let mut result = Xdata::new();
        for (key, _) in delta.iter() {
            let Some(change) = delta.get_delta(key) else {
                continue;
            };
            let mut counts = file
                .xattrs
                .get(key)
                .and_then(|raw| ChangelogCounts::from_wire(raw).ok())
                .unwrap_or_default();
            counts.apply(&change);
            file.xattrs.insert(key.to_owned(), counts.to_wire());
            result.set_counts(key.to_owned(), &counts);
        }
        FopReply::ok(0, Some(file.iatt), result)
    }

    fn posix_conflict(&self, gfid: Gfid, flock: &Flock) -> Option<Flock> {
        let state = self.state.lock().unwrap();
        state
            .posix_locks
            .iter()
            .find(|held| held.gfid == gfid && held.flock.conflicts(flock))
            .map(|held| held.flock)
    }

    fn posix_overlapping(&self, gfid: Gfid, flock: &Flock) -> Option<Flock> {
        let state = self.state.lock().unwrap();
        state
            .posix_locks
            .iter()
            .find(|held| held.gfid == gfid && held.flock.overlaps(flock))
            .map(|held| held.flock)
    }

    fn posix_unlock(&self, gfid: Gfid, flock: &Flock) {
        let mut state = self.state.lock().unwrap();
        state
            .posix_locks
            .retain(|held| !(held.gfid == gfid && held.flock.owner == flock.owner && held.flock.overlaps(flock)));
        drop(state);
        self.lock_released.notify_waiters();
    }

    async fn posix_setlk(&self, gfid: Gfid, cmd: LkCmd, flock: &Flock) -> FopReply {
        loop {
            // Register for wakeups before checking, so a release racing the
            // check is not missed.
            let released = self.lock_released.notified();
            {
                let mut state = self.state.lock().unwrap();
                let conflict = state
                    .posix_locks
                    .iter()
                    .any(|held| held.gfid == gfid && held.flock.conflicts(flock));
                if !conflict {
                    state.posix_locks.push(PosixLock { gfid, flock: *flock });
                    return FopReply::ok(0, None, Xdata::new());
                }
            }
            if cmd == LkCmd::SetLk {
                return FopReply::err(Errno::EAGAIN);
            }
            released.await;
            if !self.connected.load(Ordering::Acquire) {
                return FopReply::disconnected();
            }
        }
    }

    async fn domain_setlk(&self, dom: &str, gfid: Gfid, cmd: LkCmd, flock: &Flock) -> FopReply {
        match flock.kind {
            LockKind::Unlock => {
                let mut state = self.state.lock().unwrap();
                state.domain_locks.retain(|held| {
                    !(held.dom == dom
                        && held.gfid == gfid
                        && held.flock.owner == flock.owner
                        && held.flock.overlaps(flock))
                });
                drop(state);
                self.lock_released.notify_waiters();
                FopReply::ok(0, None, Xdata::new())
            }
            _ => loop {
                let released = self.lock_released.notified();
                {
                    let mut state = self.state.lock().unwrap();
                    let conflict = state.domain_locks.iter().any(|held| {
                        held.dom == dom && held.gfid == gfid && held.flock.conflicts(flock)
                    });
                    if !conflict {
                        state.domain_locks.push(DomainLock {
                            dom: dom.to_owned(),
                            gfid,
                            flock: *flock,
                        });
                        return FopReply::ok(0, None, Xdata::new());
                    }
                }
                if cmd == LkCmd::SetLk {
                    return FopReply::err(Errno::EAGAIN);
                }
                released.await;
                if !self.connected.load(Ordering::Acquire) {
                    return FopReply::disconnected();
                }
            },
        }
    }
}

#[async_trait]
impl Subvolume for FakeBrick {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, gfid: Gfid, _xattr_req: &Xdata) -> FopReply {
        if let Some(reply) = self.check("lookup") {
            return reply;
        }
        self.reply_with_xattrs(gfid)
    }

    async fn lookup_name(&self, name: &str) -> FopReply {
        if let Some(reply) = self.check("lookup_name") {
            return reply;
        }
        let gfid = {
            let state = self.state.lock().unwrap();
            state.named.get(name).copied()
        };
        match gfid {
            Some(gfid) => self.reply_with_xattrs(gfid),
            None => FopReply::err(Errno::ENOENT),
        }
    }

    async fn stat(&self, gfid: Gfid) -> FopReply {
        if let Some(reply) = self.check("stat") {
            return reply;
        }
        self.reply_with_xattrs(gfid)
    }

    async fn fstat(&self, fd: FdId) -> FopReply {
        if let Some(reply) = self.check("fstat") {
            return reply;
        }
        match self.resolve_fd(fd) {
            Some(gfid) => self.reply_with_xattrs(gfid),
            None => FopReply::err(Errno::EBADFD),
        }
    }

    async fn open(&self, gfid: Gfid, fd: FdId, _xdata: &Xdata) -> FopReply {
        if let Some(reply) = self.check("open") {
            return reply;
        }
        let mut state = self.state.lock().unwrap();
        if !state.files.contains_key(&gfid) {
            return FopReply::err(Errno::ENOENT);
        }
        state.fds.insert(fd, gfid);
        FopReply::ok(0, None, Xdata::new())
    }

    async fn create(&self, name: &str, gfid: Gfid, _xdata: &Xdata) -> FopReply {
        if let Some(reply) = self.check("create") {
            return reply;
        }
        let mut state = self.state.lock().unwrap();
        if state.named.contains_key(name) {
            return FopReply::err(Errno::EEXIST);
        }
        state.named.insert(name.to_owned(), gfid);
        state.files.insert(
            gfid,
            FileState {
                iatt: Iatt::regular(gfid, 0),
                data: Vec::new(),
                xattrs: BTreeMap::new(),
            },
        );
        FopReply::ok(0, Some(Iatt::regular(gfid, 0)), Xdata::new())
    }

    async fn readv(&self, fd: FdId, size: usize, offset: u64) -> FopReply {
        if let Some(reply) = self.check("readv") {
            return reply;
        }
        let Some(gfid) = self.resolve_fd(fd) else {
            return FopReply::err(Errno::EBADFD);
        };
        let state = self.state.lock().unwrap();
        let Some(file) = state.files.get(&gfid) else {
            return FopReply::err(Errno::ENOENT);
        };
        let start = (offset as usize).min(file.data.len());
        let end = (start + size).min(file.data.len());
        let slice = file.data[start..end].to_vec();
        let mut xdata = Xdata::new();
        let len = slice.len() as i32;
        xdata.set(keys::CONTENT_XDATA, slice);
        FopReply::ok(len, Some(file.iatt), xdata)
    }

    async fn writev(&self, fd: FdId, data: &[u8], offset: u64, _xdata: &Xdata) -> FopReply {
        if let Some(reply) = self.check("writev") {
            return reply;
        }
        let Some(gfid) = self.resolve_fd(fd) else {
            return FopReply::err(Errno::EBADFD);
        };
        let mut state = self.state.lock().unwrap();
        let Some(file) = state.files.get_mut(&gfid) else {
            return FopReply::err(Errno::ENOENT);
        };
        let end = offset as usize + data.len();
        if file.data.len() < end {
            file.data.resize(end, 0);
        }
        file.data[offset as usize..end].copy_from_slice(data);
        file.iatt.size = file.data.len() as u64;
        let iatt = file.iatt;
        FopReply::ok(data.len() as i32, Some(iatt), Xdata::new())
    }

    async fn xattrop(&self, gfid: Gfid, delta: &Xdata) -> FopReply {
        if let Some(reply) = self.check("xattrop") {
            return reply;
        }
        self.apply_xattrop(gfid, delta)
    }

    async fn fxattrop(&self, fd: FdId, delta: &Xdata) -> FopReply {
        if let Some(reply) = self.check("fxattrop") {
            return reply;
        }
        match self.resolve_fd(fd) {
            Some(gfid) => self.apply_xattrop(gfid, delta),
            None => FopReply::err(Errno::EBADFD),
        }
    }

    async fn getxattr(&self, gfid: Gfid, name: &str) -> FopReply {
        if let Some(reply) = self.check("getxattr") {
            return reply;
        }
        let state = self.state.lock().unwrap();
        let Some(file) = state.files.get(&gfid) else {
            return FopReply::err(Errno::ENOENT);
        };
        match file.xattrs.get(name) {
            Some(value) => {
                let mut xdata = Xdata::new();
                xdata.set(name.to_owned(), value.clone());
                FopReply::ok(0, None, xdata)
            }
            None => FopReply::err(Errno::ENODATA),
        }
    }

    async fn setxattr(&self, gfid: Gfid, xdata: &Xdata) -> FopReply {
        if let Some(reply) = self.check("setxattr") {
            return reply;
        }
        let mut state = self.state.lock().unwrap();
        let Some(file) = state.files.get_mut(&gfid) else {
            return FopReply::err(Errno::ENOENT);
        };
        for (key, value) in xdata.iter() {
            file.xattrs.insert(key.to_owned(), value.to_vec());
        }
        FopReply::ok(0, None, Xdata::new())
    }

    async fn inodelk(&self, dom: &str, gfid: Gfid, cmd: LkCmd, flock: &Flock) -> FopReply {
        if let Some(reply) = self.check("inodelk") {
            return reply;
        }
        self.domain_setlk(dom, gfid, cmd, flock).await
    }

    async fn finodelk(&self, dom: &str, fd: FdId, cmd: LkCmd, flock: &Flock) -> FopReply {
        if let Some(reply) = self.check("finodelk") {
            return reply;
        }
        match self.resolve_fd(fd) {
            Some(gfid) => self.domain_setlk(dom, gfid, cmd, flock).await,
            None => FopReply::err(Errno::EBADFD),
        }
    }

    async fn entrylk(&self, dom: &str, parent: Gfid, basename: &str, cmd: EntrylkCmd) -> FopReply {
        if let Some(reply) = self.check("entrylk") {
            return reply;
        }
        match cmd {
            EntrylkCmd::Unlock => {
                let mut state = self.state.lock().unwrap();
                state.entry_locks.retain(|held| {
                    !(held.dom == dom && held.parent == parent && held.basename == basename)
                });
                drop(state);
                self.lock_released.notify_waiters();
                FopReply::ok(0, None, Xdata::new())
            }
            _ => loop {
                let released = self.lock_released.notified();
                {
                    let mut state = self.state.lock().unwrap();
                    let conflict = state.entry_locks.iter().any(|held| {
                        held.dom == dom && held.parent == parent && held.basename == basename
                    });
                    if !conflict {
                        state.entry_locks.push(EntryLock {
                            dom: dom.to_owned(),
                            parent,
                            basename: basename.to_owned(),
                        });
                        return FopReply::ok(0, None, Xdata::new());
                    }
                }
                if cmd == EntrylkCmd::LockNb {
                    return FopReply::err(Errno::EAGAIN);
                }
                released.await;
                if !self.connected.load(Ordering::Acquire) {
                    return FopReply::disconnected();
                }
            },
        }
    }

    async fn lk(&self, fd: FdId, cmd: LkCmd, flock: &Flock, _xdata: &Xdata) -> FopReply {
        if let Some(reply) = self.check("lk") {
            return reply;
        }
        let Some(gfid) = self.resolve_fd(fd) else {
            return FopReply::err(Errno::EBADFD);
        };
        match cmd {
            LkCmd::GetLk => {
                // Self-reporting GETLK: return whatever lock is held on the
                // range, or an Unlock-kind flock when the range is free.
                let held = self
                    .posix_overlapping(gfid, flock)
                    .unwrap_or(flock.unlock_of());
                let mut reply = FopReply::ok(0, None, Xdata::new());
                reply.flock = Some(held);
                reply
            }
            _ => {
                if flock.kind == LockKind::Unlock {
                    self.posix_unlock(gfid, flock);
                    return FopReply::ok(0, None, Xdata::new());
                }
                self.posix_setlk(gfid, cmd, flock).await
            }
        }
    }

    async fn flush(&self, fd: FdId) -> FopReply {
        if let Some(reply) = self.check("flush") {
            return reply;
        }
        match self.resolve_fd(fd) {
            Some(_) => FopReply::ok(0, None, Xdata::new()),
            None => FopReply::err(Errno::EBADFD),
        }
    }
}

/// A replica set over fake bricks plus the channels its collaborators feed.
#[derive(Debug)]
pub struct Cluster {
    pub set: Arc<ReplicaSet>,
    pub bricks: Vec<Arc<FakeBrick>>,
    pub heal_rx: mpsc::UnboundedReceiver<HealRequest>,
    pub events_rx: mpsc::UnboundedReceiver<ClusterEvent>,
}

impl Cluster {
    pub fn brick(&self, i: usize) -> &Arc<FakeBrick> {
        &self.bricks[i]
    }

    pub async fn child_down(&self, i: usize) {
        self.bricks[i].set_connected(false);
        self.set.notify_child(i, ChildEvent::Down).await;
    }

    pub async fn child_up(&self, i: usize) {
        self.bricks[i].set_connected(true);
        self.set.notify_child(i, ChildEvent::Up).await;
    }

    /// Seed the same regular file on every connected brick.
    pub fn seed_everywhere(&self, gfid: Gfid, data: &[u8]) {
        for brick in &self.bricks {
            brick.seed_file(gfid, data);
        }
    }
}

pub async fn cluster(n: usize, options: ReplicationOptions) -> Cluster {
    cluster_named("testvol", n, options).await
}

pub async fn cluster_named(volume: &str, n: usize, options: ReplicationOptions) -> Cluster {
    let cluster = quiet_cluster(volume, n, options).await;
    for i in 0..n {
        cluster.set.notify_child(i, ChildEvent::Up).await;
    }
    cluster
}

static TRACING: std::sync::Once = std::sync::Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into());
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// A cluster whose bricks have not yet reported; for topology tests.
pub async fn quiet_cluster(volume: &str, n: usize, options: ReplicationOptions) -> Cluster {
    init_tracing();
    let bricks: Vec<Arc<FakeBrick>> = (0..n).map(|i| FakeBrick::new(format!("brick{i}"))).collect();
    let children = bricks
        .iter()
        .map(|brick| Arc::clone(brick) as Arc<dyn Subvolume>)
        .collect();
    let (heal_sink, heal_rx) = ChannelHealSink::new();
    let (notifier, events_rx) = ChannelNotifier::new();
    let set = ReplicaSet::new(
        volume,
        children,
        options,
        Arc::new(heal_sink),
        Arc::new(notifier),
        None,
    )
    .expect("replica set assembles");
    Cluster {
        set,
        bricks,
        heal_rx,
        events_rx,
    }
}

/// A two-replica cluster with a thin-arbiter witness brick.
#[derive(Debug)]
pub struct TaCluster {
    pub cluster: Cluster,
    pub witness: Arc<FakeBrick>,
}

pub async fn ta_cluster(options: ReplicationOptions) -> TaCluster {
    init_tracing();
    let bricks: Vec<Arc<FakeBrick>> = (0..2).map(|i| FakeBrick::new(format!("brick{i}"))).collect();
    let witness = FakeBrick::new("witness");
    let children = bricks
        .iter()
        .map(|brick| Arc::clone(brick) as Arc<dyn Subvolume>)
        .collect();
    let (heal_sink, heal_rx) = ChannelHealSink::new();
    let (notifier, events_rx) = ChannelNotifier::new();
    let set = ReplicaSet::new(
        "ta-vol",
        children,
        options,
        Arc::new(heal_sink),
        Arc::new(notifier),
        Some(Arc::clone(&witness) as Arc<dyn Subvolume>),
    )
    .expect("replica set assembles");
    for i in 0..2 {
        set.notify_child(i, ChildEvent::Up).await;
    }
    set.notify_thin_arbiter(ChildEvent::Up).await;
    TaCluster {
        cluster: Cluster {
            set,
            bricks,
            heal_rx,
            events_rx,
        },
        witness,
    }
}

/// Poll until `condition` holds or the timeout elapses.
pub async fn wait_for<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn file_type_of(iatt: &Iatt) -> FileType {
    iatt.ia_type
}
