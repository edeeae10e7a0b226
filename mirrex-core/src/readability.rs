use std::sync::Arc;

use tracing::{debug, warn};

use mirrex_contracts::{FdId, HealRequest};
use mirrex_model::{ChildMask, Errno, ReplySet, TxnType, keys};

use crate::error::FopResult;
use crate::inode::InodeCtx;
use crate::policy::ReadArgs;
use crate::volume::ReplicaSet;

/// Result of running the accusation algorithm over one set of replies.
#[derive(Debug)]
pub(crate) struct Interpretation {
    pub data_readable: ChildMask,
    pub meta_readable: ChildMask,
    pub data_accused: ChildMask,
    pub meta_accused: ChildMask,
    pub start_heal: bool,
}

impl ReplicaSet {
    /// The xattr_req sent with discover lookups: ask every brick to reflect
    /// the dirty counter, the full pending matrix, and the lock/link-count
    /// hints the upper layers consume.
    pub(crate) fn pending_xattr_req(&self) -> mirrex_model::Xdata {
        let mut req = mirrex_model::Xdata::new();
        req.mark(keys::DIRTY_XATTR);
        for key in &self.pending_keys {
            req.mark(key.clone());
        }
        req.mark(keys::LINK_COUNT_XDATA);
        req.mark(keys::INODELK_DOM_COUNT_XDATA);
        req.mark(keys::INODELK_COUNT_XDATA);
        req.mark(keys::ENTRYLK_COUNT_XDATA);
        req
    }

    /// Run the readability interpretation of §readability over `replies`.
    ///
    /// Accusations per replica come from invalid/failed replies, bad-inode
    /// markers, peers' pending counters, and (for regular files with no
    /// transaction possibly in flight) strictly smaller file sizes.
    pub(crate) fn interpret_replies(
        &self,
        replies: &ReplySet,
        inode: &InodeCtx,
    ) -> Interpretation {
        let n = self.child_count();
        let mut data_accused = ChildMask::none(n);
        let mut meta_accused = ChildMask::none(n);

        if let Some(arbiter) = self.arbiter {
            data_accused.set(arbiter, true);
            meta_accused.set(arbiter, true);
        }

        let mut ia_type = inode.ia_type();
        for reply in replies.iter() {
            if reply.succeeded()
                && let Some(iatt) = reply.iatt
            {
                ia_type = iatt.ia_type;
                break;
            }
        }

        for i in 0..n {
            let reply = replies.get(i);
            if !reply.valid || reply.op_ret < 0 || reply.xdata.contains(keys::BAD_INODE_XDATA) {
                data_accused.set(i, true);
                meta_accused.set(i, true);
                continue;
            }
            // Directories log entry operations where files log data ones;
            // the data dimension of a directory is its entry counter.
            let data_dim = if ia_type.is_dir() {
                TxnType::Entry
            } else {
                TxnType::Data
            };
            for (j, key) in self.pending_keys.iter().enumerate() {
                let Some(counts) = reply.xdata.get_counts(key) else {
                    continue;
                };
                if counts.accuses(data_dim) {
                    data_accused.set(j, true);
                }
                if counts.accuses(TxnType::Metadata) {
                    meta_accused.set(j, true);
                }
            }
        }

        if ia_type.is_regular() && !inode.possibly_under_txn(TxnType::Data) {
            self.accuse_smaller_files(replies, &mut data_accused);
        }

        let mut data_readable = ChildMask::all(n);
        let mut meta_readable = ChildMask::all(n);
        for i in 0..n {
            if data_accused.get(i) {
                data_readable.set(i, false);
            }
            if meta_accused.get(i) {
                meta_readable.set(i, false);
            }
        }

        let up = self.up_mask();
        let start_heal = (0..n).any(|i| up.get(i) && (data_accused.get(i) || meta_accused.get(i)));

        Interpretation {
            data_readable,
            meta_readable,
            data_accused,
            meta_accused,
            start_heal,
        }
    }

    /// Accuse unaccused replicas whose file is strictly smaller than the
    /// largest unaccused copy. Only safe when no write can be racing the
    /// stat replies, which the caller has already established.
    fn accuse_smaller_files(&self, replies: &ReplySet, data_accused: &mut ChildMask) {
        let mut max_size = 0u64;
        for i in 0..self.child_count() {
            let reply = replies.get(i);
            if !reply.valid || reply.xdata.contains(keys::BAD_INODE_XDATA) {
                continue;
            }
            if data_accused.get(i) {
                continue;
            }
            if let Some(iatt) = reply.iatt {
                max_size = max_size.max(iatt.size);
            }
        }

        for i in 0..self.child_count() {
            if data_accused.get(i) || self.is_arbiter(i) {
                continue;
            }
            let reply = replies.get(i);
            if let Some(iatt) = reply.iatt
                && reply.valid
                && iatt.size < max_size
            {
                debug!(child = i, size = iatt.size, max_size, "accusing smaller file");
                data_accused.set(i, true);
            }
        }
    }

    /// Store an interpretation into the inode context at `event_gen` and
    /// trigger self-heal if any up replica stands accused.
    pub(crate) async fn store_interpretation(
        &self,
        inode: &InodeCtx,
        interpretation: &Interpretation,
        event_gen: u32,
    ) {
        if let Err(error) = inode.read_subvol_set(
            &interpretation.data_readable,
            &interpretation.meta_readable,
            event_gen,
        ) {
            warn!(gfid = %inode.gfid(), %error, "failed to store readability maps");
            return;
        }
        if interpretation.start_heal {
            self.trigger_heal(
                inode.gfid(),
                interpretation.data_accused.any(),
                interpretation.meta_accused.any(),
                false,
            )
            .await;
        }
    }

    /// Hand a heal descriptor to the self-heal layer, filtered by the
    /// per-dimension toggles. Heal is only ever triggered, never inline.
    pub(crate) async fn trigger_heal(&self, gfid: mirrex_model::Gfid, data: bool, metadata: bool, entry: bool) {
        let request = HealRequest {
            gfid,
            data: data && self.options.data_self_heal,
            metadata: metadata && self.options.metadata_self_heal,
            entry: entry && self.options.entry_self_heal,
        };
        if request.any() {
            self.heal_sink.enqueue(request).await;
        }
    }

    /// Re-derive readability by querying every up replica: a lightweight
    /// fstat when an fd is at hand, a nameless lookup otherwise.
    pub async fn refresh(self: &Arc<Self>, inode: &Arc<InodeCtx>, fd: Option<FdId>) -> FopResult<()> {
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }

        let gfid = inode.gfid();
        let replies = match fd {
            Some(fd) => {
                self.wind_on(&frame.child_up, |_, child| async move { child.fstat(fd).await })
                    .await
            }
            None => {
                let xattr_req = self.pending_xattr_req();
                self.wind_on(&frame.child_up, move |_, child| {
                    let xattr_req = xattr_req.clone();
                    async move { child.lookup(gfid, &xattr_req).await }
                })
                .await
            }
        };

        if !replies.any_success() {
            let errno = replies.final_errno();
            return Err(if errno.is_ok() { Errno::ENOTCONN } else { errno });
        }

        for reply in replies.iter() {
            if reply.succeeded()
                && let Some(iatt) = reply.iatt
            {
                inode.note_ia_type(iatt.ia_type);
                break;
            }
        }

        let interpretation = self.interpret_replies(&replies, inode);
        self.store_interpretation(inode, &interpretation, frame.event_generation)
            .await;
        debug!(
            %gfid,
            data = ?interpretation.data_readable,
            metadata = ?interpretation.meta_readable,
            event_gen = frame.event_generation,
            "readability refreshed"
        );
        Ok(())
    }

    /// Refresh only when the cached maps are stale against the live event
    /// generation or were explicitly invalidated.
    pub async fn refresh_if_needed(
        self: &Arc<Self>,
        inode: &Arc<InodeCtx>,
        fd: Option<FdId>,
    ) -> FopResult<()> {
        if inode.needs_refresh(self.child_count(), self.current_event_generation()) {
            self.refresh(inode, fd).await?;
        }
        Ok(())
    }

    /// The readable set for one transaction dimension, refusing with EIO
    /// when the inode is in split-brain for the caller's purposes.
    ///
    /// Directories only require metadata readability; regular files need a
    /// source in both dimensions.
    pub fn inode_get_readable(
        &self,
        inode: &InodeCtx,
        txn_type: TxnType,
    ) -> FopResult<(ChildMask, u32)> {
        let n = self.child_count();
        let (data, metadata, event) = inode.read_subvol_get(n);

        if inode.ia_type().is_dir() {
            if txn_type == TxnType::Metadata && !metadata.any() {
                return Err(Errno::EIO);
            }
        } else if !data.any() || !metadata.any() {
            return Err(Errno::EIO);
        }

        let readable = match txn_type {
            TxnType::Metadata => metadata,
            _ => {
                if data.any() {
                    data
                } else {
                    // Directory data reads fall back to the up mask.
                    self.up_mask()
                }
            }
        };
        Ok((readable, event))
    }

    /// Select the replica to read from, preferring replicas readable in both
    /// dimensions, falling back to the per-type map.
    pub fn read_subvol(
        &self,
        inode: &InodeCtx,
        txn_type: TxnType,
        args: &ReadArgs,
    ) -> FopResult<(usize, ChildMask, u32)> {
        let (readable, event) = self.inode_get_readable(inode, txn_type)?;
        let n = self.child_count();
        let (data, metadata, _) = inode.read_subvol_get(n);
        let intersection = data.intersect(&metadata);

        let candidates = if intersection.any() {
            &intersection
        } else {
            &readable
        };
        match self.select_read_child(candidates, args) {
            Some(child) => Ok((child, readable, event)),
            None => Err(Errno::ENOTCONN),
        }
    }
}
