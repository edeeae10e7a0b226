//! Extended-attribute and xdata key constants. These are the administrative
//! and wire interface of the replication layer; the byte-exact names matter.

/// Pre-op intent counter, present on every replica of a file under mutation.
pub const DIRTY_XATTR: &str = "trusted.afr.dirty";

/// Per-peer changelog matrix key: `trusted.afr.<brick-name>-pending`.
pub fn pending_key(brick_name: &str) -> String {
    format!("trusted.afr.{brick_name}-pending")
}

/// Fd xattr requesting mandatory-lock semantics; locks taken under it are
/// registered for lock-heal.
pub const MANDATORY_LOCK_XATTR: &str = "trusted.glusterfs.enforce-mandatory-lock";

/// Reply xdata marker: the brick considers this inode unusable.
pub const BAD_INODE_XDATA: &str = "glusterfs.bad-inode";

/// Lookup xdata keys consumed or produced on the lookup path.
pub const LINK_COUNT_XDATA: &str = "link-count";
pub const INODELK_DOM_COUNT_XDATA: &str = "glusterfs.inodelk-dom-count";
pub const INODELK_COUNT_XDATA: &str = "glusterfs.inodelk.count";
pub const ENTRYLK_COUNT_XDATA: &str = "glusterfs.entrylk.count";
pub const PARENT_ENTRYLK_XDATA: &str = "glusterfs.parent-entrylk";
pub const CONTENT_XDATA: &str = "glusterfs.content";
pub const GFID_REQ_XDATA: &str = "gfid-req";
pub const GFID_CHANGED_XDATA: &str = "gfid-changed";
pub const GFID_HEAL_MSG_XDATA: &str = "gfid-heal-msg";

/// Split-brain administrative keys (the getxattr/setxattr control surface).
pub const SBRAIN_STATUS_XDATA: &str = "replica.split-brain-status";
pub const SBRAIN_CHOICE_XATTR: &str = "replica.split-brain-choice";
pub const SBRAIN_HEAL_FINALIZE_XATTR: &str = "replica.split-brain-heal-finalize";

/// Lock domain serializing lock-heal replay against competing user locks.
pub const DOM_LOCK_HEAL: &str = "afr-lock-heal";

/// Thin-arbiter coordination domains.
pub const DOM_TA_NOTIFY: &str = "afr-ta-notify";
pub const DOM_TA_MODIFY: &str = "afr-ta-modify";

/// Suffix of the volume's self-heal domain (`<volume>:self-heal`).
pub const SELF_HEAL_DOM_SUFFIX: &str = ":self-heal";
