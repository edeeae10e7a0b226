use std::sync::Arc;

use tracing::{debug, warn};

use mirrex_contracts::{FdId, Subvolume};
use mirrex_model::{
    ChildMask, EntrylkCmd, Errno, Flock, FopReply, Gfid, LkCmd, LockKind, ReplySet, Xdata,
};

use crate::error::{FopResult, quorum_errno};
use crate::frame::FopFrame;
use crate::volume::ReplicaSet;

/// Progress of a cluster-visible lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FopLockState {
    Init,
    Parallel,
    Serial,
    QuorumFailed,
}

/// One cluster lock target: what gets wound to each brick.
#[derive(Debug, Clone)]
pub(crate) enum ClusterLockKind {
    Inodelk {
        dom: String,
        gfid: Gfid,
        flock: Flock,
    },
    Finodelk {
        dom: String,
        fd: FdId,
        flock: Flock,
    },
    Entrylk {
        dom: String,
        parent: Gfid,
        basename: String,
    },
    PosixLk {
        fd: FdId,
        flock: Flock,
        xdata: Xdata,
    },
}

impl ClusterLockKind {
    async fn wind(&self, child: Arc<dyn Subvolume>, blocking: bool, unlock: bool) -> FopReply {
        match self {
            ClusterLockKind::Inodelk { dom, gfid, flock } => {
                let (cmd, flock) = lk_wire(flock, blocking, unlock);
                child.inodelk(dom, *gfid, cmd, &flock).await
            }
            ClusterLockKind::Finodelk { dom, fd, flock } => {
                let (cmd, flock) = lk_wire(flock, blocking, unlock);
                child.finodelk(dom, *fd, cmd, &flock).await
            }
            ClusterLockKind::Entrylk {
                dom,
                parent,
                basename,
            } => {
                let cmd = if unlock {
                    EntrylkCmd::Unlock
                } else if blocking {
                    EntrylkCmd::Lock
                } else {
                    EntrylkCmd::LockNb
                };
                child.entrylk(dom, *parent, basename, cmd).await
            }
            ClusterLockKind::PosixLk { fd, flock, xdata } => {
                let (cmd, flock) = lk_wire(flock, blocking, unlock);
                child.lk(*fd, cmd, &flock, xdata).await
            }
        }
    }
}

fn lk_wire(flock: &Flock, blocking: bool, unlock: bool) -> (LkCmd, Flock) {
    if unlock {
        (LkCmd::SetLk, flock.unlock_of())
    } else if blocking {
        (LkCmd::SetLkw, *flock)
    } else {
        (LkCmd::SetLk, *flock)
    }
}

/// Result of a cluster lock attempt: the grant mask plus the op_ret/op_errno
/// pair the caller unwinds with.
#[derive(Debug)]
pub(crate) struct ClusterLockOutcome {
    pub granted: ChildMask,
    pub op_ret: i32,
    pub op_errno: Errno,
    pub state: FopLockState,
}

impl ClusterLockOutcome {
    fn denied(op_errno: Errno, state: FopLockState, child_count: usize) -> Self {
        ClusterLockOutcome {
            granted: ChildMask::none(child_count),
            op_ret: -1,
            op_errno,
            state,
        }
    }
}

enum LockEval {
    Granted(ChildMask),
    Conflict(ChildMask),
    QuorumFail { granted: ChildMask, errno: Errno },
    NoLock(Errno),
}

impl ReplicaSet {
    /// Acquire a cluster lock with the parallel-then-serial protocol.
    ///
    /// Phase one winds the non-blocking form to every up replica at once.
    /// A full, conflict-free grant wins immediately. Any conflict unwinds
    /// the partial grants and falls into phase two: one replica at a time
    /// in index order, using the caller's original (possibly blocking)
    /// command, so two contending clients cannot both end up holding
    /// partial, mutually-blocking grants.
    pub(crate) async fn cluster_lock(
        &self,
        frame: &FopFrame,
        kind: &ClusterLockKind,
        serial_blocking: bool,
    ) -> ClusterLockOutcome {
        let n = self.child_count();
        if frame.up_count() == 0 {
            return ClusterLockOutcome::denied(Errno::ENOTCONN, FopLockState::Init, n);
        }

        let replies = self
            .wind_on(&frame.child_up, |_, child| {
                let kind = kind.clone();
                async move { kind.wind(child, false, false).await }
            })
            .await;

        match self.evaluate_locks(&replies) {
            LockEval::Granted(granted) => ClusterLockOutcome {
                granted,
                op_ret: 0,
                op_errno: Errno::OK,
                state: FopLockState::Parallel,
            },
            LockEval::NoLock(errno) => {
                ClusterLockOutcome::denied(errno, FopLockState::Parallel, n)
            }
            LockEval::QuorumFail { granted, errno } => {
                self.cluster_unlock(kind, &granted).await;
                ClusterLockOutcome::denied(errno, FopLockState::QuorumFailed, n)
            }
            LockEval::Conflict(granted) => {
                debug!("lock conflict in parallel phase, serializing");
                self.cluster_unlock(kind, &granted).await;
                self.serial_lock(frame, kind, serial_blocking).await
            }
        }
    }

    async fn serial_lock(
        &self,
        frame: &FopFrame,
        kind: &ClusterLockKind,
        serial_blocking: bool,
    ) -> ClusterLockOutcome {
        let n = self.child_count();
        let mut replies = ReplySet::new(n);
        for i in frame.child_up.iter_set() {
            let reply = kind.wind(self.children[i].clone(), serial_blocking, false).await;
            let conflict = reply.failed() && reply.op_errno == Errno::EAGAIN;
            replies.set(i, reply);
            if conflict {
                break;
            }
        }

        match self.evaluate_locks(&replies) {
            LockEval::Granted(granted) => ClusterLockOutcome {
                granted,
                op_ret: 0,
                op_errno: Errno::OK,
                state: FopLockState::Serial,
            },
            LockEval::NoLock(errno) => ClusterLockOutcome::denied(errno, FopLockState::Serial, n),
            LockEval::QuorumFail { granted, errno } => {
                self.cluster_unlock(kind, &granted).await;
                ClusterLockOutcome::denied(errno, FopLockState::QuorumFailed, n)
            }
            LockEval::Conflict(granted) => {
                // Serial conflict: somebody else holds the range. Give back
                // the prefix and report the contention.
                self.cluster_unlock(kind, &granted).await;
                ClusterLockOutcome::denied(Errno::EAGAIN, FopLockState::Serial, n)
            }
        }
    }

    fn evaluate_locks(&self, replies: &ReplySet) -> LockEval {
        let granted = replies.success_mask();
        let conflict = replies
            .iter()
            .any(|reply| reply.failed() && reply.op_errno == Errno::EAGAIN);
        if conflict {
            return LockEval::Conflict(granted);
        }
        if self.quorum_count > 0 && granted.count() < self.quorum_count {
            let mut errno = replies.final_errno();
            if errno.is_ok() {
                errno = quorum_errno();
            }
            return LockEval::QuorumFail { granted, errno };
        }
        if !granted.any() {
            let mut errno = replies.final_errno();
            if errno.is_ok() {
                errno = Errno::ENOTCONN;
            }
            return LockEval::NoLock(errno);
        }
        LockEval::Granted(granted)
    }

    /// Release a cluster lock wherever it was granted.
    pub(crate) async fn cluster_unlock(&self, kind: &ClusterLockKind, on: &ChildMask) {
        if !on.any() {
            return;
        }
        let replies = self
            .wind_on(on, |_, child| {
                let kind = kind.clone();
                async move { kind.wind(child, false, true).await }
            })
            .await;
        for (i, reply) in replies.iter().enumerate() {
            if reply.failed() && reply.op_errno != Errno::ENOTCONN {
                warn!(child = i, errno = %reply.op_errno, "failed to release cluster lock");
            }
        }
    }

    /// Cluster-visible inode lock on an arbitrary domain.
    pub async fn inodelk(
        self: &Arc<Self>,
        dom: &str,
        gfid: Gfid,
        cmd: LkCmd,
        flock: Flock,
    ) -> FopResult<()> {
        let frame = self.frame()?;
        let kind = ClusterLockKind::Inodelk {
            dom: dom.to_owned(),
            gfid,
            flock,
        };
        if flock.kind == LockKind::Unlock {
            self.cluster_unlock(&kind, &frame.child_up).await;
            return Ok(());
        }
        let outcome = self
            .cluster_lock(&frame, &kind, cmd == LkCmd::SetLkw)
            .await;
        if outcome.op_ret < 0 {
            return Err(outcome.op_errno);
        }
        Ok(())
    }

    /// Fd-based variant of [`ReplicaSet::inodelk`].
    pub async fn finodelk(
        self: &Arc<Self>,
        dom: &str,
        fd: FdId,
        cmd: LkCmd,
        flock: Flock,
    ) -> FopResult<()> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        if fd_ctx.is_bad() {
            return Err(Errno::EBADFD);
        }
        let frame = self.frame()?;
        let kind = ClusterLockKind::Finodelk {
            dom: dom.to_owned(),
            fd,
            flock,
        };
        if flock.kind == LockKind::Unlock {
            self.cluster_unlock(&kind, &frame.child_up).await;
            return Ok(());
        }
        let outcome = self
            .cluster_lock(&frame, &kind, cmd == LkCmd::SetLkw)
            .await;
        if outcome.op_ret < 0 {
            return Err(outcome.op_errno);
        }
        Ok(())
    }

    /// Fd-based entry lock: the fd names the directory being locked.
    pub async fn fentrylk(
        self: &Arc<Self>,
        dom: &str,
        fd: FdId,
        basename: &str,
        cmd: EntrylkCmd,
    ) -> FopResult<()> {
        let fd_ctx = self.fd_ctx(fd).ok_or(Errno::EBADFD)?;
        if fd_ctx.is_bad() {
            return Err(Errno::EBADFD);
        }
        self.entrylk(dom, fd_ctx.gfid(), basename, cmd).await
    }

    /// Cluster-visible entry lock on a directory + basename.
    pub async fn entrylk(
        self: &Arc<Self>,
        dom: &str,
        parent: Gfid,
        basename: &str,
        cmd: EntrylkCmd,
    ) -> FopResult<()> {
        let frame = self.frame()?;
        let kind = ClusterLockKind::Entrylk {
            dom: dom.to_owned(),
            parent,
            basename: basename.to_owned(),
        };
        if cmd == EntrylkCmd::Unlock {
            self.cluster_unlock(&kind, &frame.child_up).await;
            return Ok(());
        }
        let outcome = self
            .cluster_lock(&frame, &kind, cmd == EntrylkCmd::Lock)
            .await;
        if outcome.op_ret < 0 {
            return Err(outcome.op_errno);
        }
        Ok(())
    }
}
