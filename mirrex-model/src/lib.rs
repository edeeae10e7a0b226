//! Core data model definitions shared across mirrex crates.
#![allow(missing_docs)]

pub mod bitmap;
pub mod errno;
pub mod error;
pub mod events;
pub mod gfid;
pub mod iatt;
pub mod keys;
pub mod lock;
pub mod pending;
pub mod reply;
pub mod txn;
pub mod xdata;

// Intentionally curated re-exports for downstream consumers.
pub use bitmap::{ChildMask, ReadableMaps, ReadableWord, SMALL_MAP_LIMIT};
pub use errno::Errno;
pub use error::{ModelError, Result as ModelResult};
pub use events::{ChildEvent, ClusterEvent};
pub use gfid::Gfid;
pub use iatt::{FileType, Iatt};
pub use keys::{
    DIRTY_XATTR, DOM_LOCK_HEAL, DOM_TA_MODIFY, DOM_TA_NOTIFY,
    MANDATORY_LOCK_XATTR, pending_key,
};
pub use lock::{EntrylkCmd, Flock, LkCmd, LkOwner, LockKind};
pub use pending::{ChangelogCounts, ChangelogDelta};
pub use reply::{FopReply, ReplySet};
pub use txn::TxnType;
pub use xdata::Xdata;
