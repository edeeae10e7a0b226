use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use mirrex_contracts::FdId;
use mirrex_model::{
    Errno, FopReply, Gfid, Iatt, ReplySet, TxnType, Xdata, keys,
};

use crate::error::FopResult;
use crate::policy::ReadArgs;
use crate::txn::TxnRequest;
use crate::volume::ReplicaSet;

/// What a lookup resolved to: the authoritative attributes, the replica
/// they came from, and the raw replies for callers that dig deeper.
#[derive(Debug)]
pub struct LookupOutcome {
    pub iatt: Iatt,
    pub read_child: usize,
    pub replies: ReplySet,
}

struct PendingReadGuard<'a> {
    counter: &'a std::sync::atomic::AtomicU64,
}

impl Drop for PendingReadGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ReplicaSet {
    fn pending_read_guard(&self, child: usize) -> PendingReadGuard<'_> {
        self.pending_reads[child].fetch_add(1, Ordering::Relaxed);
        PendingReadGuard {
            counter: &self.pending_reads[child],
        }
    }

    /// Discover an inode: wind a nameless lookup to every up replica, run
    /// the readability interpretation, and answer from the elected read
    /// child. A split-brained regular file answers EIO unless a manual
    /// choice or favorite-child policy resolves it.
    pub async fn lookup(self: &Arc<Self>, gfid: Gfid) -> FopResult<LookupOutcome> {
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }

        let xattr_req = self.pending_xattr_req();
        let replies = self
            .wind_on(&frame.child_up, move |_, child| {
                let xattr_req = xattr_req.clone();
                async move { child.lookup(gfid, &xattr_req).await }
            })
            .await;
        if !replies.any_success() {
            let errno = replies.final_errno();
            return Err(if errno.is_ok() { Errno::ENOTCONN } else { errno });
        }

        let inode = self.inode_ctx(gfid);
        for reply in replies.iter() {
            if reply.succeeded()
                && let Some(iatt) = reply.iatt
            {
                inode.note_ia_type(iatt.ia_type);
                break;
            }
        }

        let interpretation = self.interpret_replies(&replies, &inode);
        self.store_interpretation(&inode, &interpretation, frame.event_generation)
            .await;

        let split = !inode.ia_type().is_dir()
            && (!interpretation.data_readable.any() || !interpretation.meta_readable.any());
        if split {
            if let Some(choice) = self.split_brain_read_child(&inode, Some(&replies)) {
                let chosen = replies.get(choice).clone();
                if chosen.succeeded()
                    && let Some(iatt) = chosen.iatt
                {
                    debug!(%gfid, choice, "answering split-brain lookup from chosen replica");
                    return Ok(LookupOutcome {
                        iatt,
                        read_child: choice,
                        replies,
                    });
                }
            }
            warn!(%gfid, "split brain observed during lookup");
            return Err(Errno::EIO);
        }

        let args = ReadArgs {
            gfid,
            ia_type: inode.ia_type(),
        };
        let (read_child, _, _) = self.read_subvol(&inode, TxnType::Data, &args)?;
        let iatt = replies
            .get(read_child)
            .iatt
            .or_else(|| replies.iter().filter(|r| r.succeeded()).find_map(|r| r.iatt))
            .ok_or(Errno::EIO)?;
        Ok(LookupOutcome {
            iatt,
            read_child,
            replies,
        })
    }

    /// Open an fd on every reachable replica.
    pub async fn open(self: &Arc<Self>, gfid: Gfid, xdata: Xdata) -> FopResult<FdId> {
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }
        let fd = self.next_fd_id();
        let opened = {
            let xdata = xdata.clone();
            self.wind_on(&frame.child_up, move |_, child| {
                let xdata = xdata.clone();
                async move { child.open(gfid, fd, &xdata).await }
            })
            .await
        };
        if !opened.any_success() {
            let errno = opened.final_errno();
            return Err(if errno.is_ok() { Errno::ENOTCONN } else { errno });
        }

        let ctx = crate::fd::FdCtx::new(fd, gfid, opened.success_mask());
        if xdata.contains(keys::MANDATORY_LOCK_XATTR) {
            ctx.set_mandatory_lock();
        }
        self.fds.insert(fd, Arc::new(ctx));
        Ok(fd)
    }

    /// Flush an fd: force any deferred changelog out first so the brick
    /// sees a settled state.
    pub async fn flush(self: &Arc<Self>, fd: FdId) -> FopResult<()> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        if fd_ctx.is_bad() {
            return Err(Errno::EBADFD);
        }
        self.flush_delayed_post_op(fd_ctx.gfid()).await;
        let frame = self.frame()?;
        let on = fd_ctx.opened_on().intersect(&frame.child_up);
        if !on.any() {
            return Err(Errno::ENOTCONN);
        }
        let replies = self
            .wind_on(&on, |_, child| async move { child.flush(fd).await })
            .await;
        if replies.any_success() {
            Ok(())
        } else {
            Err(replies.final_errno())
        }
    }

    /// Drop the client-side state of an fd. Any lock-heal record tied to it
    /// dies with it.
    pub fn release(&self, fd: FdId) {
        if let Some((_, ctx)) = self.fds.remove(&fd)
            && let Some(record) = ctx.lk_heal_record()
        {
            self.remove_lock_heal_by_id(record);
        }
    }

    /// Read from the elected read child, failing over to the next readable
    /// replica when one dies mid-read.
    pub async fn readv(self: &Arc<Self>, fd: FdId, size: usize, offset: u64) -> FopResult<Vec<u8>> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        if fd_ctx.is_bad() {
            return Err(Errno::EBADFD);
        }
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }
        let gfid = fd_ctx.gfid();
        let inode = self.inode_ctx(gfid);
        self.refresh_if_needed(&inode, Some(fd)).await?;

        // A lone survivor in a thin-arbiter pair serves only if the witness
        // has nothing recorded against it.
        if self.thin_arbiter.is_some()
            && frame.up_count() == 1
            && let Some(survivor) = frame.child_up.first()
            && !self.ta_allows_single_read(survivor).await
        {
            return Err(Errno::EIO);
        }

        if let Some(choice) = inode.split_brain_choice() {
            let reply = self.children[choice].readv(fd, size, offset).await;
            return read_payload(reply);
        }

        let (readable, _) = self.inode_get_readable(&inode, TxnType::Data)?;
        let mut candidates = readable.intersect(&frame.child_up);
        let args = ReadArgs {
            gfid,
            ia_type: inode.ia_type(),
        };

        let mut last_errno = Errno::ENOTCONN;
        while let Some(child) = self.select_read_child(&candidates, &args) {
            let reply = {
                let _guard = self.pending_read_guard(child);
                self.children[child].readv(fd, size, offset).await
            };
            if reply.succeeded() {
                return read_payload(reply);
            }
            last_errno = reply.op_errno;
            if reply.op_errno.is_disconnect() || reply.op_errno == Errno::EIO {
                debug!(child, errno = %last_errno, "read child failed, trying the next");
                candidates.set(child, false);
                inode.set_need_refresh(true);
                continue;
            }
            return Err(last_errno);
        }
        Err(last_errno)
    }

    /// Attribute read from the metadata read child.
    pub async fn stat(self: &Arc<Self>, gfid: Gfid) -> FopResult<Iatt> {
        let inode = self.inode_ctx(gfid);
        self.refresh_if_needed(&inode, None).await?;
        let frame = self.frame()?;
        let (readable, _) = self.inode_get_readable(&inode, TxnType::Metadata)?;
        let mut candidates = readable.intersect(&frame.child_up);
        let args = ReadArgs {
            gfid,
            ia_type: inode.ia_type(),
        };
        let mut last_errno = Errno::ENOTCONN;
        while let Some(child) = self.select_read_child(&candidates, &args) {
            let reply = self.children[child].stat(gfid).await;
            if reply.succeeded() {
                return reply.iatt.ok_or(Errno::EIO);
            }
            last_errno = reply.op_errno;
            if !reply.op_errno.is_disconnect() {
                return Err(last_errno);
            }
            candidates.set(child, false);
            inode.set_need_refresh(true);
        }
        Err(last_errno)
    }

    pub async fn fstat(self: &Arc<Self>, fd: FdId) -> FopResult<Iatt> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        if fd_ctx.is_bad() {
            return Err(Errno::EBADFD);
        }
        self.stat(fd_ctx.gfid()).await
    }

    /// Replicated write: a data transaction winding writev to each replica.
    pub async fn writev(
        self: &Arc<Self>,
        fd: FdId,
        data: &[u8],
        offset: u64,
    ) -> FopResult<i32> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        let gfid = fd_ctx.gfid();
        let payload: Arc<[u8]> = Arc::from(data);
        let outcome = self
            .transaction(TxnRequest::data_on_fd(gfid, fd), move |_, child| {
                let payload = Arc::clone(&payload);
                async move {
                    child
                        .writev(fd, &payload, offset, &Xdata::new())
                        .await
                }
            })
            .await;
        if outcome.succeeded() {
            Ok(outcome.op_ret)
        } else {
            Err(outcome.op_errno)
        }
    }

    /// Replicated setxattr: the administrative split-brain keys are
    /// intercepted client-side, everything else is a metadata transaction.
    pub async fn setxattr(self: &Arc<Self>, gfid: Gfid, xdata: Xdata) -> FopResult<()> {
        if let Some(value) = xdata.get_str(keys::SBRAIN_CHOICE_XATTR) {
            let choice = self.parse_spb_choice(value)?;
            return self.set_split_brain_choice(gfid, choice).await;
        }
        if xdata.contains(keys::SBRAIN_HEAL_FINALIZE_XATTR) {
            return self.split_brain_heal_finalize(gfid).await;
        }

        let outcome = self
            .transaction(TxnRequest::metadata(gfid), move |_, child| {
                let xdata = xdata.clone();
                async move { child.setxattr(gfid, &xdata).await }
            })
            .await;
        if outcome.succeeded() {
            Ok(())
        } else {
            Err(outcome.op_errno)
        }
    }

    /// Read one xattr, serving the virtual split-brain status key from the
    /// interpretation instead of any brick.
    pub async fn getxattr(self: &Arc<Self>, gfid: Gfid, name: &str) -> FopResult<Vec<u8>> {
        if name == keys::SBRAIN_STATUS_XDATA {
            return Ok(self.split_brain_status(gfid).await?.into_bytes());
        }

        let inode = self.inode_ctx(gfid);
        self.refresh_if_needed(&inode, None).await?;
        let frame = self.frame()?;
        let (readable, _) = self.inode_get_readable(&inode, TxnType::Metadata)?;
        let candidates = readable.intersect(&frame.child_up);
        let args = ReadArgs {
            gfid,
            ia_type: inode.ia_type(),
        };
        let child = self
            .select_read_child(&candidates, &args)
            .ok_or(Errno::ENOTCONN)?;
        let reply = self.children[child].getxattr(gfid, name).await;
        if reply.failed() {
            return Err(reply.op_errno);
        }
        reply
            .xdata
            .get(name)
            .map(|value| value.to_vec())
            .ok_or(Errno::ENODATA)
    }

    fn parse_spb_choice(&self, value: &str) -> FopResult<Option<usize>> {
        if value == "none" {
            return Ok(None);
        }
        self.children
            .iter()
            .position(|child| child.name() == value)
            .map(Some)
            .ok_or(Errno::EINVAL)
    }
}

fn read_payload(reply: FopReply) -> FopResult<Vec<u8>> {
    if reply.failed() {
        return Err(reply.op_errno);
    }
    Ok(reply
        .xdata
        .get(keys::CONTENT_XDATA)
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default())
}
