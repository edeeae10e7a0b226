use serde::{Deserialize, Serialize};

use crate::gfid::Gfid;

/// File type subset relevant to replication decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FileType {
    #[default]
    Invalid,
    Regular,
    Directory,
    Symlink,
    Other,
}

impl FileType {
    pub fn is_dir(self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_regular(self) -> bool {
        matches!(self, FileType::Regular)
    }
}

/// Post-operation attributes returned by a brick. Only the fields the
/// replication core consults are modeled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iatt {
    pub gfid: Gfid,
    pub ia_type: FileType,
    pub size: u64,
    pub nlink: u32,
    pub mtime: i64,
    pub mtime_nsec: u32,
    pub ctime: i64,
    pub ctime_nsec: u32,
}

impl Iatt {
    pub fn regular(gfid: Gfid, size: u64) -> Self {
        Iatt {
            gfid,
            ia_type: FileType::Regular,
            size,
            nlink: 1,
            ..Default::default()
        }
    }

    pub fn directory(gfid: Gfid) -> Self {
        Iatt {
            gfid,
            ia_type: FileType::Directory,
            nlink: 2,
            ..Default::default()
        }
    }
}
