use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Volume-wide file identity. Every replica of a file carries the same gfid;
/// a mismatch between replicas is itself a heal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gfid(pub Uuid);

impl Gfid {
    pub fn new() -> Self {
        Gfid(Uuid::new_v4())
    }

    /// The nil gfid, used before an entry has been assigned one.
    pub const fn null() -> Self {
        Gfid(Uuid::nil())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for Gfid {
    fn default() -> Self {
        Self::null()
    }
}

impl From<Uuid> for Gfid {
    fn from(value: Uuid) -> Self {
        Gfid(value)
    }
}

impl std::fmt::Display for Gfid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
