//! mirrex-core: the automatic file replication layer.
//!
//! Mirrors every filesystem operation across N brick subvolumes and presents
//! them as one logical filesystem: readability derived from reply
//! interpretation, quorum-gated mutations with a pre-op/post-op changelog,
//! parallel-then-serial cluster locks, lock healing on reconnect, and a
//! monotonic event generation tying it all to the live topology.

pub mod error;
pub mod fd;
pub mod fop_lock;
pub mod fops;
pub mod frame;
pub mod heal;
pub mod inode;
pub mod lock_heal;
pub mod policy;
pub mod readability;
pub mod split_brain;
pub mod thin_arbiter;
pub mod topology;
pub mod txn;
pub mod volume;

pub use error::{FopResult, ReplicationError, Result, quorum_errno};
pub use fd::FdCtx;
pub use fop_lock::FopLockState;
pub use fops::LookupOutcome;
pub use frame::FopFrame;
pub use heal::{ChannelHealSink, ChannelNotifier, NullHealSink, NullNotifier};
pub use inode::InodeCtx;
pub use policy::{ReadArgs, super_fast_hash};
pub use txn::{TxnOutcome, TxnRequest};
pub use volume::ReplicaSet;
