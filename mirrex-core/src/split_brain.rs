use std::sync::Arc;

use tracing::{debug, info};

use mirrex_config::FavoriteChildPolicy;
use mirrex_model::{Errno, Gfid, ReplySet};

use crate::error::FopResult;
use crate::inode::InodeCtx;
use crate::volume::ReplicaSet;

impl ReplicaSet {
    /// Install a manual split-brain resolution: reads of an unresolvable
    /// inode are served from `choice` until it is cleared, the timer
    /// expires, or heal-finalize runs.
    pub async fn set_split_brain_choice(
        self: &Arc<Self>,
        gfid: Gfid,
        choice: Option<usize>,
    ) -> FopResult<()> {
        if let Some(child) = choice
            && child >= self.child_count()
        {
            return Err(Errno::EINVAL);
        }
        let inode = self.inode_ctx(gfid);

        let timer = choice.map(|child| {
            let inode = Arc::clone(&inode);
            let timeout = self.options.spb_choice_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                debug!(gfid = %inode.gfid(), child, "split-brain choice expired");
                inode.expire_split_brain_choice(child);
            })
        });

        let previous = inode.set_split_brain_choice(choice, timer);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(%gfid, ?choice, "split-brain choice updated");
        Ok(())
    }

    pub fn split_brain_choice(&self, gfid: Gfid) -> Option<usize> {
        self.inodes
            .get(&gfid)
            .and_then(|inode| inode.split_brain_choice())
    }

    /// The administrative heal-finalize knob: forget the choice and force
    /// the next read to re-interpret.
    pub async fn split_brain_heal_finalize(self: &Arc<Self>, gfid: Gfid) -> FopResult<()> {
        let inode = self.inode_ctx(gfid);
        let previous = inode.set_split_brain_choice(None, None);
        if let Some(previous) = previous {
            previous.abort();
        }
        inode.set_need_refresh(true);
        Ok(())
    }

    /// Resolve a split-brain read: the manual choice wins, then the
    /// configured favorite-child policy over the discover replies.
    pub(crate) fn split_brain_read_child(
        &self,
        inode: &InodeCtx,
        replies: Option<&ReplySet>,
    ) -> Option<usize> {
        if let Some(choice) = inode.split_brain_choice() {
            return Some(choice);
        }
        replies.and_then(|replies| self.favorite_child(replies))
    }

    /// Pick a replica by the favorite-child policy. Only meaningful when
    /// nothing else could elect a source.
    pub(crate) fn favorite_child(&self, replies: &ReplySet) -> Option<usize> {
        let candidates: Vec<usize> = (0..self.child_count())
            .filter(|i| !self.is_arbiter(*i) && replies.get(*i).succeeded())
            .filter(|i| replies.get(*i).iatt.is_some())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let iatt = |i: usize| replies.get(i).iatt.unwrap_or_default();

        match self.options.favorite_child_policy {
            FavoriteChildPolicy::None => None,
            FavoriteChildPolicy::Size => candidates
                .into_iter()
                .max_by_key(|i| iatt(*i).size),
            FavoriteChildPolicy::LatestMtime => candidates
                .into_iter()
                .max_by_key(|i| (iatt(*i).mtime, iatt(*i).mtime_nsec)),
            FavoriteChildPolicy::OldestCtime => candidates
                .into_iter()
                .min_by_key(|i| (iatt(*i).ctime, iatt(*i).ctime_nsec)),
            FavoriteChildPolicy::Majority => {
                let mut best: Option<(usize, usize)> = None;
                for &i in &candidates {
                    let agreeing = candidates
                        .iter()
                        .filter(|j| iatt(**j).size == iatt(i).size && iatt(**j).mtime == iatt(i).mtime)
                        .count();
                    if best.is_none_or(|(_, count)| agreeing > count) {
                        best = Some((i, agreeing));
                    }
                }
                // A majority policy without a majority resolves nothing.
                best.and_then(|(i, count)| (count > self.child_count() / 2).then_some(i))
            }
        }
    }

    /// The `replica.split-brain-status` virtual xattr: run a discover and
    /// report, per dimension, whether a source exists.
    pub async fn split_brain_status(self: &Arc<Self>, gfid: Gfid) -> FopResult<String> {
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }
        let inode = self.inode_ctx(gfid);
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

        let interpretation = self.interpret_replies(&replies, &inode);
        let data_spb = !interpretation.data_readable.any();
        let metadata_spb = !interpretation.meta_readable.any();

        let choices = (0..self.child_count())
            .filter(|i| !self.is_arbiter(*i))
            .map(|i| self.children[i].name().to_owned())
            .collect::<Vec<_>>()
            .join(",");
        if !data_spb && !metadata_spb {
            return Ok("The file is not under data or metadata split-brain".to_owned());
        }
        Ok(format!(
            "data-split-brain:{} metadata-split-brain:{} Choices:{}",
            if data_spb { "yes" } else { "no" },
            if metadata_spb { "yes" } else { "no" },
            choices
        ))
    }

    /// Whether the inode currently has no electable source, per dimension.
    pub async fn is_split_brain(self: &Arc<Self>, gfid: Gfid) -> FopResult<(bool, bool)> {
        let frame = self.frame()?;
        if frame.up_count() == 0 {
            return Err(Errno::ENOTCONN);
        }
        let inode = self.inode_ctx(gfid);
        let xattr_req = self.pending_xattr_req();
        let replies = self
            .wind_on(&frame.child_up, move |_, child| {
                let xattr_req = xattr_req.clone();
                async move { child.lookup(gfid, &xattr_req).await }
            })
            .await;
        if !replies.any_success() {
            return Err(Errno::ENOTCONN);
        }
        let interpretation = self.interpret_replies(&replies, &inode);
        Ok((
            !interpretation.data_readable.any(),
            !interpretation.meta_readable.any(),
        ))
    }
}
