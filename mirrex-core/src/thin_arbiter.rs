use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use mirrex_contracts::Subvolume;
use mirrex_model::{
    ChangelogDelta, ChildMask, Errno, Flock, Gfid, LkCmd, LkOwner, TxnType, Xdata, keys,
};

use crate::error::FopResult;
use crate::volume::ReplicaSet;

/// Thin-arbiter client state: the witness subvolume and the lazily resolved
/// gfid of its id file. Pending marks on the id file are the tie-breaker
/// when only one data replica is reachable.
pub(crate) struct ThinArbiterState {
    pub subvol: Arc<dyn Subvolume>,
    pub id_file: String,
    id_gfid: Mutex<Option<Gfid>>,
    notify_locked: AtomicBool,
}

impl std::fmt::Debug for ThinArbiterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThinArbiterState")
            .field("id_file", &self.id_file)
            .finish()
    }
}

impl ThinArbiterState {
    pub(crate) fn new(subvol: Arc<dyn Subvolume>, id_file: String) -> Self {
        ThinArbiterState {
            subvol,
            id_file,
            id_gfid: Mutex::new(None),
            notify_locked: AtomicBool::new(false),
        }
    }
}

impl ReplicaSet {
    /// Resolve the witness id file, creating it with a fresh gfid on first
    /// use. Failure here degrades the two-replica quorum path; it is never
    /// fatal to the volume.
    pub(crate) async fn ta_id_gfid(&self) -> FopResult<Gfid> {
        let ta = self.thin_arbiter.as_ref().ok_or(Errno::EINVAL)?;
        let mut slot = ta.id_gfid.lock().await;
        if let Some(gfid) = *slot {
            return Ok(gfid);
        }

        let reply = ta.subvol.lookup_name(&ta.id_file).await;
        if reply.succeeded() {
            let gfid = reply.iatt.map(|iatt| iatt.gfid).unwrap_or_default();
            if gfid.is_null() {
                return Err(Errno::EIO);
            }
            *slot = Some(gfid);
            return Ok(gfid);
        }
        if reply.op_errno != Errno::ENOENT {
            return Err(reply.op_errno);
        }

        let gfid = Gfid::new();
        let mut xdata = Xdata::new();
        xdata.set(keys::GFID_REQ_XDATA, gfid.as_bytes().to_vec());
        let created = ta.subvol.create(&ta.id_file, gfid, &xdata).await;
        if created.failed() && created.op_errno != Errno::EEXIST {
            warn!(errno = %created.op_errno, "failed to create thin-arbiter id file");
            return Err(created.op_errno);
        }
        debug!(%gfid, "thin-arbiter id file ready");
        *slot = Some(gfid);
        Ok(gfid)
    }

    /// Whether the witness permits reading from the only reachable replica:
    /// a pending mark against the survivor means it missed updates and must
    /// not serve.
    pub(crate) async fn ta_allows_single_read(&self, survivor: usize) -> bool {
        let Ok(id_gfid) = self.ta_id_gfid().await else {
            // No witness verdict available: degrade to refusing the read.
            return false;
        };
        let ta = match self.thin_arbiter.as_ref() {
            Some(ta) => ta,
            None => return true,
        };
        let key = &self.pending_keys[survivor];
        let reply = ta.subvol.getxattr(id_gfid, key).await;
        if reply.failed() {
            // Absent xattr means nobody ever accused the survivor.
            return reply.op_errno == Errno::ENODATA || reply.op_errno == Errno::ENOENT;
        }
        match reply.xdata.get_counts(key) {
            Some(counts) => counts.is_zero(),
            None => true,
        }
    }

    /// Record a failed replica on the witness after a degraded transaction:
    /// take the modify domain lock, bump the peer's pending counter on the
    /// id file, release. The notify domain lock is taken once and held so
    /// peers learn of our interest via contention upcalls.
    pub(crate) async fn ta_post_op(
        &self,
        gfid: Gfid,
        txn_type: TxnType,
        failed_subvols: &ChildMask,
    ) {
        let Some(ta) = self.thin_arbiter.as_ref() else {
            return;
        };
        let Ok(id_gfid) = self.ta_id_gfid().await else {
            warn!(%gfid, "no thin-arbiter id file, skipping witness post-op");
            return;
        };

        if !ta.notify_locked.load(Ordering::Acquire) {
            let flock = Flock::write(0, 0, LkOwner(1));
            let reply = ta
                .subvol
                .inodelk(keys::DOM_TA_NOTIFY, id_gfid, LkCmd::SetLkw, &flock)
                .await;
            if reply.succeeded() {
                ta.notify_locked.store(true, Ordering::Release);
            }
        }

        let flock = Flock::write(0, 0, LkOwner(2));
        let locked = ta
            .subvol
            .inodelk(keys::DOM_TA_MODIFY, id_gfid, LkCmd::SetLkw, &flock)
            .await;
        if locked.failed() {
            warn!(errno = %locked.op_errno, "could not take thin-arbiter modify lock");
            return;
        }

        let mut delta = Xdata::new();
        for child in failed_subvols.iter_set() {
            delta.set_delta(&self.pending_keys[child], &ChangelogDelta::dirty(txn_type, 1));
        }
        let marked = ta.subvol.xattrop(id_gfid, &delta).await;
        if marked.failed() {
            warn!(errno = %marked.op_errno, "thin-arbiter post-op failed");
        }

        let unlock = flock.unlock_of();
        let _ = ta
            .subvol
            .inodelk(keys::DOM_TA_MODIFY, id_gfid, LkCmd::SetLk, &unlock)
            .await;
    }

    /// Contention upcall on the notify domain: another client needs the
    /// witness; release our hold once in-flight transactions are done.
    pub(crate) async fn ta_release_notify_lock(self: &Arc<Self>) {
        let Some(ta) = self.thin_arbiter.as_ref() else {
            return;
        };
        if !ta.notify_locked.swap(false, Ordering::AcqRel) {
            return;
        }
        let Ok(id_gfid) = self.ta_id_gfid().await else {
            return;
        };
        self.inflight.wait_drained().await;
        let flock = Flock::write(0, 0, LkOwner(1)).unlock_of();
        let _ = ta
            .subvol
            .inodelk(keys::DOM_TA_NOTIFY, id_gfid, LkCmd::SetLk, &flock)
            .await;
        debug!("released thin-arbiter notify lock");
    }
}
