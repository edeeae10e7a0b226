use std::sync::Mutex;

use tokio::task::JoinHandle;

use mirrex_model::{ChildMask, FileType, Gfid, ReadableMaps, TxnType};

/// Per-inode replication context. Created lazily on first access, dropped
/// when the upper layer forgets the inode.
#[derive(Debug)]
pub struct InodeCtx {
    gfid: Gfid,
    inner: Mutex<InodeInner>,
}

#[derive(Debug)]
struct InodeInner {
    read_subvol: ReadableMaps,
    write_subvol: ReadableMaps,
    need_refresh: bool,
    spb_choice: Option<usize>,
    spb_timer: Option<JoinHandle<()>>,
    lock_count: u32,
    /// In-flight pre-op count per transaction dimension and replica.
    pre_op_done: [Vec<u32>; 3],
    ia_type: FileType,
}

impl InodeCtx {
    pub(crate) fn new(gfid: Gfid, child_count: usize) -> Self {
        InodeCtx {
            gfid,
            inner: Mutex::new(InodeInner {
                read_subvol: ReadableMaps::new(child_count),
                write_subvol: ReadableMaps::new(child_count),
                need_refresh: false,
                spb_choice: None,
                spb_timer: None,
                lock_count: 0,
                pre_op_done: [
                    vec![0; child_count],
                    vec![0; child_count],
                    vec![0; child_count],
                ],
                ia_type: FileType::Invalid,
            }),
        }
    }

    pub fn gfid(&self) -> Gfid {
        self.gfid
    }

    pub fn ia_type(&self) -> FileType {
        self.inner.lock().expect("inode ctx poisoned").ia_type
    }

    pub(crate) fn note_ia_type(&self, ia_type: FileType) {
        if ia_type == FileType::Invalid {
            return;
        }
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        inner.ia_type = ia_type;
    }

    /// The cached readability triple: (data map, metadata map, event gen).
    pub fn read_subvol_get(&self, child_count: usize) -> (ChildMask, ChildMask, u32) {
        let inner = self.inner.lock().expect("inode ctx poisoned");
        inner.read_subvol.get(child_count)
    }

    pub(crate) fn read_subvol_set(
        &self,
        data: &ChildMask,
        metadata: &ChildMask,
        event: u32,
    ) -> mirrex_model::ModelResult<()> {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        inner.read_subvol.set(data, metadata, event)?;
        inner.need_refresh = false;
        Ok(())
    }

    /// Whether readability must be recomputed before the next read: the
    /// cached generation is behind `current_gen`, the maps were never
    /// filled, or an external event marked them suspect.
    pub fn needs_refresh(&self, child_count: usize, current_gen: u32) -> bool {
        let inner = self.inner.lock().expect("inode ctx poisoned");
        if inner.need_refresh || inner.read_subvol.is_zero() {
            return true;
        }
        let (_, _, event) = inner.read_subvol.get(child_count);
        event < current_gen
    }

    pub(crate) fn set_need_refresh(&self, value: bool) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        inner.need_refresh = value;
    }

    /// Re-set a single dimension bit as a pending-heal marker after an
    /// in-flight split-brain was detected. The maps keep their generation;
    /// `need_refresh` forces re-interpretation before the next read.
    pub(crate) fn mark_heal_candidate(
        &self,
        child_count: usize,
        txn_type: TxnType,
        child: usize,
    ) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        let (mut data, mut metadata, event) = inner.read_subvol.get(child_count);
        match txn_type {
            TxnType::Metadata => metadata.set(child, true),
            _ => data.set(child, true),
        }
        let _ = inner.read_subvol.set(&data, &metadata, event);
        inner.need_refresh = true;
    }

    /// Overwrite one readability dimension after a transaction settles:
    /// the replicas that applied the mutation are the new readable set for
    /// that dimension. Entry transactions land in the data dimension, the
    /// same slot their pending counters are interpreted from.
    pub(crate) fn update_dimension(
        &self,
        child_count: usize,
        txn_type: TxnType,
        mask: &ChildMask,
        event: u32,
    ) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        let (data, metadata, _) = inner.read_subvol.get(child_count);
        let (data, metadata) = match txn_type {
            TxnType::Metadata => (data, mask.clone()),
            _ => (mask.clone(), metadata),
        };
        let _ = inner.read_subvol.set(&data, &metadata, event);
    }

    /// Begin a mutating transaction: pin the write maps to the current read
    /// maps on the first concurrent transaction.
    pub(crate) fn txn_begin(&self, child_count: usize) -> (ChildMask, ChildMask, u32) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        if inner.lock_count == 0 {
            inner.write_subvol = inner.read_subvol.clone();
        }
        inner.lock_count += 1;
        inner.write_subvol.get(child_count)
    }

    /// End a transaction; the write maps clear when the last one finishes.
    pub(crate) fn txn_end(&self, child_count: usize) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        inner.lock_count = inner.lock_count.saturating_sub(1);
        if inner.lock_count == 0 {
            inner.write_subvol = ReadableMaps::new(child_count);
        }
    }

    pub fn lock_count(&self) -> u32 {
        self.inner.lock().expect("inode ctx poisoned").lock_count
    }

    pub(crate) fn write_subvol_get(&self, child_count: usize) -> (ChildMask, ChildMask, u32) {
        let inner = self.inner.lock().expect("inode ctx poisoned");
        inner.write_subvol.get(child_count)
    }

    pub(crate) fn pre_op_inc(&self, txn_type: TxnType, on: &ChildMask) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        for child in on.iter_set() {
            inner.pre_op_done[txn_type.index()][child] += 1;
        }
    }

    pub(crate) fn pre_op_dec(&self, txn_type: TxnType, on: &ChildMask) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        for child in on.iter_set() {
            let slot = &mut inner.pre_op_done[txn_type.index()][child];
            *slot = slot.saturating_sub(1);
        }
    }

    /// Whether a transaction of this dimension may currently be in flight,
    /// which suppresses size-based accusations during interpretation.
    pub(crate) fn possibly_under_txn(&self, txn_type: TxnType) -> bool {
        let inner = self.inner.lock().expect("inode ctx poisoned");
        inner.lock_count > 0
            || inner.pre_op_done[txn_type.index()]
                .iter()
                .any(|count| *count > 0)
    }

    pub fn split_brain_choice(&self) -> Option<usize> {
        self.inner.lock().expect("inode ctx poisoned").spb_choice
    }

    /// Install (or clear) the manual split-brain choice, returning the
    /// previous expiry timer so the caller can abort it outside the lock.
    pub(crate) fn set_split_brain_choice(
        &self,
        choice: Option<usize>,
        timer: Option<JoinHandle<()>>,
    ) -> Option<JoinHandle<()>> {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        inner.spb_choice = choice;
        std::mem::replace(&mut inner.spb_timer, timer)
    }

    /// Timer-driven expiry: clears the choice only if it is still the one
    /// the timer was armed for.
    pub(crate) fn expire_split_brain_choice(&self, choice: usize) {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        if inner.spb_choice == Some(choice) {
            inner.spb_choice = None;
            inner.spb_timer = None;
        }
    }

    pub(crate) fn take_spb_timer(&self) -> Option<JoinHandle<()>> {
        let mut inner = self.inner.lock().expect("inode ctx poisoned");
        inner.spb_timer.take()
    }
}
