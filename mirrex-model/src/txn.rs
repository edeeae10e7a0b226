use serde::{Deserialize, Serialize};

/// Transaction dimension. The wire order of the changelog counters is fixed:
/// data = 0, metadata = 1, entry = 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnType {
    Data,
    Metadata,
    Entry,
}

impl TxnType {
    pub const ALL: [TxnType; 3] = [TxnType::Data, TxnType::Metadata, TxnType::Entry];

    pub fn index(self) -> usize {
        match self {
            TxnType::Data => 0,
            TxnType::Metadata => 1,
            TxnType::Entry => 2,
        }
    }
}

impl std::fmt::Display for TxnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxnType::Data => "data",
            TxnType::Metadata => "metadata",
            TxnType::Entry => "entry",
        };
        f.write_str(name)
    }
}
