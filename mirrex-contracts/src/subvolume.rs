use async_trait::async_trait;

use mirrex_model::{EntrylkCmd, Flock, FopReply, Gfid, LkCmd, Xdata};

use crate::id::FdId;

/// The per-brick FOP surface the replication core winds operations to.
///
/// Every method resolves to a [`FopReply`]; transport failures surface as a
/// reply with `op_errno = ENOTCONN` rather than as a separate error channel,
/// so the core's reply interpretation sees one uniform shape. Implementations
/// must be cancel-safe: the core never cancels a wound request, but replies
/// may arrive after the issuing frame has already aggregated its result.
#[async_trait]
pub trait Subvolume: Send + Sync {
    /// Brick name as it appears in `trusted.afr.<name>-pending` keys.
    fn name(&self) -> &str;

    /// Nameless lookup by gfid. `xattr_req` lists the xattrs the caller
    /// wants reflected into the reply xdata (pending counters, link-count).
    async fn lookup(&self, gfid: Gfid, xattr_req: &Xdata) -> FopReply;

    /// Lookup by name in the brick's flat witness namespace. Only the
    /// thin-arbiter id-file protocol uses this.
    async fn lookup_name(&self, name: &str) -> FopReply;

    /// Stat-family replies carry the inode's replication xattrs (dirty and
    /// pending counters) in the reply xdata so the core can re-interpret
    /// readability from an open fd without a named lookup.
    async fn stat(&self, gfid: Gfid) -> FopReply;

    async fn fstat(&self, fd: FdId) -> FopReply;

    async fn open(&self, gfid: Gfid, fd: FdId, xdata: &Xdata) -> FopReply;

    /// Create a regular file under the (flat) witness namespace. Only the
    /// thin-arbiter id-file protocol uses this.
    async fn create(&self, name: &str, gfid: Gfid, xdata: &Xdata) -> FopReply;

    /// Read up to `size` bytes at `offset`. The reply's `op_ret` is the byte
    /// count; the bytes themselves travel in the reply xdata under the
    /// `glusterfs.content` key.
    async fn readv(&self, fd: FdId, size: usize, offset: u64) -> FopReply;

    async fn writev(&self, fd: FdId, data: &[u8], offset: u64, xdata: &Xdata) -> FopReply;

    /// Counter add-and-get on the inode's xattrs: each changelog-shaped
    /// value in `delta` is added element-wise to the stored value and the
    /// resulting values are returned in the reply xdata.
    async fn xattrop(&self, gfid: Gfid, delta: &Xdata) -> FopReply;

    async fn fxattrop(&self, fd: FdId, delta: &Xdata) -> FopReply;

    async fn getxattr(&self, gfid: Gfid, name: &str) -> FopReply;

    async fn setxattr(&self, gfid: Gfid, xdata: &Xdata) -> FopReply;

    /// Domain-scoped inode lock. `cmd = SetLk` is non-blocking (EAGAIN on
    /// conflict), `SetLkw` blocks brick-side.
    async fn inodelk(&self, dom: &str, gfid: Gfid, cmd: LkCmd, flock: &Flock) -> FopReply;

    async fn finodelk(&self, dom: &str, fd: FdId, cmd: LkCmd, flock: &Flock) -> FopReply;

    async fn entrylk(
        &self,
        dom: &str,
        parent: Gfid,
        basename: &str,
        cmd: EntrylkCmd,
    ) -> FopReply;

    /// User-visible POSIX lock on an open fd. GETLK replies carry the
    /// blocking lock (or `Unlock` kind when the range is free) in
    /// `FopReply::flock`.
    async fn lk(&self, fd: FdId, cmd: LkCmd, flock: &Flock, xdata: &Xdata) -> FopReply;

    async fn flush(&self, fd: FdId) -> FopReply;
}
