use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::txn::TxnType;

/// One changelog cell: unfinished-transaction counters for the three
/// transaction dimensions, in wire order data, metadata, entry.
///
/// On disk this is the value of `trusted.afr.dirty` and of each
/// `trusted.afr.<brick>-pending` xattr: three 32-bit counters in network
/// byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogCounts {
    pub data: u32,
    pub metadata: u32,
    pub entry: u32,
}

impl ChangelogCounts {
    pub const WIRE_LEN: usize = 12;

    pub fn get(&self, txn: TxnType) -> u32 {
        match txn {
            TxnType::Data => self.data,
            TxnType::Metadata => self.metadata,
            TxnType::Entry => self.entry,
        }
    }

    pub fn bump(&mut self, txn: TxnType, delta: i32) {
        let slot = match txn {
            TxnType::Data => &mut self.data,
            TxnType::Metadata => &mut self.metadata,
            TxnType::Entry => &mut self.entry,
        };
        *slot = slot.saturating_add_signed(delta);
    }

    pub fn is_zero(&self) -> bool {
        self.data == 0 && self.metadata == 0 && self.entry == 0
    }

    /// Whether any dimension accuses (nonzero counter).
    pub fn accuses(&self, txn: TxnType) -> bool {
        self.get(txn) != 0
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::WIRE_LEN);
        buf.extend_from_slice(&self.data.to_be_bytes());
        buf.extend_from_slice(&self.metadata.to_be_bytes());
        buf.extend_from_slice(&self.entry.to_be_bytes());
        buf
    }

    /// Decode from an xattr value. Longer buffers are tolerated (the tail is
    /// ignored); shorter ones are rejected.
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(ModelError::ShortChangelog(buf.len()));
        }
        let word = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(ChangelogCounts {
            data: word(0),
            metadata: word(4),
            entry: word(8),
        })
    }
}

/// Signed counter adjustment applied by an xattrop: the pre-op marks intent
/// with +1, the post-op takes it back with -1 and charges failed peers.
/// Same 3 × i32 network-byte-order wire shape as [`ChangelogCounts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogDelta {
    pub data: i32,
    pub metadata: i32,
    pub entry: i32,
}

impl ChangelogDelta {
    pub fn dirty(txn: TxnType, amount: i32) -> Self {
        let mut delta = ChangelogDelta::default();
        match txn {
            TxnType::Data => delta.data = amount,
            TxnType::Metadata => delta.metadata = amount,
            TxnType::Entry => delta.entry = amount,
        }
        delta
    }

    pub fn is_zero(&self) -> bool {
        self.data == 0 && self.metadata == 0 && self.entry == 0
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ChangelogCounts::WIRE_LEN);
        buf.extend_from_slice(&self.data.to_be_bytes());
        buf.extend_from_slice(&self.metadata.to_be_bytes());
        buf.extend_from_slice(&self.entry.to_be_bytes());
        buf
    }

    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < ChangelogCounts::WIRE_LEN {
            return Err(ModelError::ShortChangelog(buf.len()));
        }
        let word = |at: usize| i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        Ok(ChangelogDelta {
            data: word(0),
            metadata: word(4),
            entry: word(8),
        })
    }
}

impl ChangelogCounts {
    /// Apply a signed delta, clamping at zero the way the brick-side
    /// counter add does.
    pub fn apply(&mut self, delta: &ChangelogDelta) {
        self.data = self.data.saturating_add_signed(delta.data);
        self.metadata = self.metadata.saturating_add_signed(delta.metadata);
        self.entry = self.entry.saturating_add_signed(delta.entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_round_trip_and_apply() {
        let delta = ChangelogDelta {
            data: -1,
            metadata: 0,
            entry: 2,
        };
        let decoded = ChangelogDelta::from_wire(&delta.to_wire()).expect("decode");
        assert_eq!(decoded, delta);

        let mut counts = ChangelogCounts {
            data: 0,
            metadata: 1,
            entry: 1,
        };
        counts.apply(&delta);
        assert_eq!(
            counts,
            ChangelogCounts {
                data: 0,
                metadata: 1,
                entry: 3,
            }
        );
    }

    #[test]
    fn wire_round_trip() {
        let counts = ChangelogCounts {
            data: 1,
            metadata: 0,
            entry: 3,
        };
        let wire = counts.to_wire();
        assert_eq!(wire.len(), ChangelogCounts::WIRE_LEN);
        assert_eq!(ChangelogCounts::from_wire(&wire).expect("decode"), counts);
    }

    #[test]
    fn wire_is_network_byte_order() {
        let counts = ChangelogCounts {
            data: 1,
            metadata: 2,
            entry: 0x0102_0304,
        };
        let wire = counts.to_wire();
        assert_eq!(&wire[..4], &[0, 0, 0, 1]);
        assert_eq!(&wire[4..8], &[0, 0, 0, 2]);
        assert_eq!(&wire[8..], &[1, 2, 3, 4]);
    }

    #[test]
    fn short_buffer_rejected_long_tolerated() {
        assert!(ChangelogCounts::from_wire(&[0; 11]).is_err());
        let mut long = ChangelogCounts::default().to_wire();
        long.extend_from_slice(&[0xff; 4]);
        assert_eq!(
            ChangelogCounts::from_wire(&long).expect("decode"),
            ChangelogCounts::default()
        );
    }
}
