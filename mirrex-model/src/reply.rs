use crate::bitmap::ChildMask;
use crate::errno::Errno;
use crate::iatt::Iatt;
use crate::lock::Flock;
use crate::xdata::Xdata;

/// One replica's reply slot inside a frame. `valid` distinguishes "replied"
/// from "never wound / still outstanding". `flock` is populated only by
/// GETLK-shaped replies.
#[derive(Debug, Clone, Default)]
pub struct FopReply {
    pub valid: bool,
    pub op_ret: i32,
    pub op_errno: Errno,
    pub iatt: Option<Iatt>,
    pub xdata: Xdata,
    pub flock: Option<Flock>,
    pub need_heal: bool,
}

impl FopReply {
    pub fn ok(op_ret: i32, iatt: Option<Iatt>, xdata: Xdata) -> Self {
        FopReply {
            valid: true,
            op_ret,
            op_errno: Errno::OK,
            iatt,
            xdata,
            flock: None,
            need_heal: false,
        }
    }

    pub fn err(op_errno: Errno) -> Self {
        FopReply {
            valid: true,
            op_ret: -1,
            op_errno,
            ..Default::default()
        }
    }

    pub fn disconnected() -> Self {
        FopReply::err(Errno::ENOTCONN)
    }

    pub fn succeeded(&self) -> bool {
        self.valid && self.op_ret >= 0
    }

    pub fn failed(&self) -> bool {
        self.valid && self.op_ret < 0
    }
}

/// The reply vector of a frame plus the aggregate queries the core keeps
/// asking of it.
#[derive(Debug, Clone)]
pub struct ReplySet(Vec<FopReply>);

impl ReplySet {
    pub fn new(child_count: usize) -> Self {
        ReplySet(vec![FopReply::default(); child_count])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> &FopReply {
        &self.0[index]
    }

    pub fn set(&mut self, index: usize, reply: FopReply) {
        self.0[index] = reply;
    }

    pub fn iter(&self) -> impl Iterator<Item = &FopReply> {
        self.0.iter()
    }

    pub fn wipe(&mut self) {
        for slot in &mut self.0 {
            *slot = FopReply::default();
        }
    }

    /// Mask of replicas that replied with success.
    pub fn success_mask(&self) -> ChildMask {
        self.0
            .iter()
            .map(FopReply::succeeded)
            .collect::<Vec<_>>()
            .into()
    }

    pub fn success_count(&self) -> usize {
        self.0.iter().filter(|r| r.succeeded()).count()
    }

    pub fn any_success(&self) -> bool {
        self.0.iter().any(|r| r.succeeded())
    }

    /// Fold the errnos of failed replies by surfacing priority.
    pub fn final_errno(&self) -> Errno {
        let mut op_errno = Errno::OK;
        for reply in &self.0 {
            if !reply.failed() {
                continue;
            }
            op_errno = Errno::higher_of(op_errno, reply.op_errno);
        }
        op_errno
    }

    /// The symmetric-failure test: every valid reply failed, every errno is
    /// identical, and none is a disconnect. Such a failure happened the same
    /// way everywhere and is not a replica fault.
    pub fn symmetric_error(&self) -> Option<Errno> {
        let mut seen: Option<Errno> = None;
        for reply in &self.0 {
            if !reply.valid {
                continue;
            }
            if reply.op_ret >= 0 {
                return None;
            }
            if reply.op_errno == Errno::ENOTCONN {
                return None;
            }
            match seen {
                None => seen = Some(reply.op_errno),
                Some(errno) if errno == reply.op_errno => {}
                Some(_) => return None,
            }
        }
        seen
    }
}
