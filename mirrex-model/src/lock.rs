use serde::{Deserialize, Serialize};

/// Opaque lock-owner token. Two locks with the same owner belong to the same
/// client-side holder regardless of which brick granted them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LkOwner(pub u64);

impl std::fmt::Display for LkOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    Read,
    Write,
    Unlock,
}

/// Lock command, mirroring the fcntl trio. `SetLk` is the non-blocking form;
/// `SetLkw` queues on the brick until the range frees up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LkCmd {
    SetLk,
    SetLkw,
    GetLk,
}

/// Entry-lock command on a directory + basename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntrylkCmd {
    Lock,
    LockNb,
    Unlock,
}

/// POSIX-style byte-range lock. `len == 0` means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flock {
    pub kind: LockKind,
    pub start: u64,
    pub len: u64,
    pub owner: LkOwner,
    pub pid: i32,
}

impl Flock {
    pub fn write(start: u64, len: u64, owner: LkOwner) -> Self {
        Flock {
            kind: LockKind::Write,
            start,
            len,
            owner,
            pid: 0,
        }
    }

    pub fn read(start: u64, len: u64, owner: LkOwner) -> Self {
        Flock {
            kind: LockKind::Read,
            start,
            len,
            owner,
            pid: 0,
        }
    }

    pub fn unlock_of(&self) -> Self {
        Flock {
            kind: LockKind::Unlock,
            ..*self
        }
    }

    /// Range identity, ignoring kind and owner. Used when matching an
    /// unlock request against a registered heal record.
    pub fn same_range(&self, other: &Flock) -> bool {
        self.start == other.start && self.len == other.len
    }

    pub fn overlaps(&self, other: &Flock) -> bool {
        let end = |l: &Flock| {
            if l.len == 0 {
                u64::MAX
            } else {
                l.start.saturating_add(l.len)
            }
        };
        self.start < end(other) && other.start < end(self)
    }

    /// Two locks conflict when their ranges overlap, they belong to
    /// different owners, and at least one side wants exclusivity.
    pub fn conflicts(&self, other: &Flock) -> bool {
        if self.owner == other.owner {
            return false;
        }
        if self.kind == LockKind::Read && other.kind == LockKind::Read {
            return false;
        }
        if self.kind == LockKind::Unlock || other.kind == LockKind::Unlock {
            return false;
        }
        self.overlaps(other)
    }
}
