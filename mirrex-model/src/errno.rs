use serde::{Deserialize, Serialize};

/// POSIX errno as carried on the wire between the core and its bricks.
///
/// Only the values the replication core reasons about get named constants;
/// anything else passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Errno(pub i32);

impl Errno {
    pub const OK: Errno = Errno(0);
    pub const EPERM: Errno = Errno(1);
    pub const ENOENT: Errno = Errno(2);
    pub const EIO: Errno = Errno(5);
    pub const EBADFD: Errno = Errno(77);
    pub const EAGAIN: Errno = Errno(11);
    pub const ENOMEM: Errno = Errno(12);
    pub const EEXIST: Errno = Errno(17);
    pub const EINVAL: Errno = Errno(22);
    pub const ENOSPC: Errno = Errno(28);
    pub const EROFS: Errno = Errno(30);
    pub const ENODATA: Errno = Errno(61);
    pub const ESTALE: Errno = Errno(116);
    pub const ENOTCONN: Errno = Errno(107);
    pub const EUCLEAN: Errno = Errno(117);

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Whether this errno marks a replica as transiently unreachable rather
    /// than as having genuinely failed the operation.
    pub fn is_disconnect(self) -> bool {
        self == Errno::ENOTCONN || self == Errno::EBADFD
    }

    /// Merge two errnos, keeping the one with higher surfacing priority.
    ///
    /// The hierarchy is ENODATA > ENOENT > ESTALE > ENOSPC > others: a
    /// missing xattr or entry on one replica matters more to the caller than
    /// whatever else went wrong elsewhere.
    pub fn higher_of(old: Errno, new: Errno) -> Errno {
        for important in [Errno::ENODATA, Errno::ENOENT, Errno::ESTALE, Errno::ENOSPC] {
            if old == important || new == important {
                return important;
            }
        }
        new
    }
}

impl Default for Errno {
    fn default() -> Self {
        Errno::OK
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Errno::OK => "OK",
            Errno::EPERM => "EPERM",
            Errno::ENOENT => "ENOENT",
            Errno::EIO => "EIO",
            Errno::EBADFD => "EBADFD",
            Errno::EAGAIN => "EAGAIN",
            Errno::ENOMEM => "ENOMEM",
            Errno::EEXIST => "EEXIST",
            Errno::EINVAL => "EINVAL",
            Errno::ENOSPC => "ENOSPC",
            Errno::EROFS => "EROFS",
            Errno::ENODATA => "ENODATA",
            Errno::ESTALE => "ESTALE",
            Errno::ENOTCONN => "ENOTCONN",
            Errno::EUCLEAN => "EUCLEAN",
            Errno(other) => return write!(f, "errno({other})"),
        };
        f.write_str(name)
    }
}
