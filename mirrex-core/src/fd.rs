use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use mirrex_model::{ChildMask, Gfid};
use mirrex_contracts::FdId;

/// Per-open-file replication context.
///
/// The lock-heal record is owned by the replica-set lock tables; the fd only
/// holds its id, so a record dropped by the tables cannot dangle here.
#[derive(Debug)]
pub struct FdCtx {
    fd: FdId,
    gfid: Gfid,
    opened_on: Mutex<ChildMask>,
    is_bad: AtomicBool,
    mandatory_lock: AtomicBool,
    lk_heal_record: Mutex<Option<u64>>,
}

impl FdCtx {
    pub(crate) fn new(fd: FdId, gfid: Gfid, opened_on: ChildMask) -> Self {
        FdCtx {
            fd,
            gfid,
            opened_on: Mutex::new(opened_on),
            is_bad: AtomicBool::new(false),
            mandatory_lock: AtomicBool::new(false),
            lk_heal_record: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> FdId {
        self.fd
    }

    pub fn gfid(&self) -> Gfid {
        self.gfid
    }

    pub fn opened_on(&self) -> ChildMask {
        self.opened_on.lock().expect("fd ctx poisoned").clone()
    }

    pub(crate) fn note_opened(&self, child: usize) {
        self.opened_on
            .lock()
            .expect("fd ctx poisoned")
            .set(child, true);
    }

    /// A fenced fd: every subsequent operation fails EBADFD until reopen.
    pub fn is_bad(&self) -> bool {
        self.is_bad.load(Ordering::Acquire)
    }

    pub(crate) fn mark_bad(&self) {
        self.is_bad.store(true, Ordering::Release);
        *self.lk_heal_record.lock().expect("fd ctx poisoned") = None;
    }

    pub(crate) fn set_mandatory_lock(&self) {
        self.mandatory_lock.store(true, Ordering::Release);
    }

    pub(crate) fn mandatory_lock(&self) -> bool {
        self.mandatory_lock.load(Ordering::Acquire)
    }

    pub(crate) fn lk_heal_record(&self) -> Option<u64> {
        *self.lk_heal_record.lock().expect("fd ctx poisoned")
    }

    pub(crate) fn set_lk_heal_record(&self, record: Option<u64>) {
        *self.lk_heal_record.lock().expect("fd ctx poisoned") = record;
    }
}
