use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Largest replica count representable by the packed [`ReadableWord`].
pub const SMALL_MAP_LIMIT: usize = 16;

/// Per-child boolean mask. Used for up-masks, readability, lock grants and
/// failure tracking alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildMask(Vec<bool>);

impl ChildMask {
    pub fn none(child_count: usize) -> Self {
        ChildMask(vec![false; child_count])
    }

    pub fn all(child_count: usize) -> Self {
        ChildMask(vec![true; child_count])
    }

    pub fn from_bits(bits: u64, child_count: usize) -> Self {
        ChildMask((0..child_count).map(|i| bits >> i & 1 == 1).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = value;
        }
    }

    /// Number of set children.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|b| **b).count()
    }

    pub fn any(&self) -> bool {
        self.0.iter().any(|b| *b)
    }

    /// Lowest set index, if any.
    pub fn first(&self) -> Option<usize> {
        self.0.iter().position(|b| *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.0.iter().copied()
    }

    /// Indices of set children, in index order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.then_some(i))
    }

    pub fn intersect(&self, other: &ChildMask) -> ChildMask {
        ChildMask(
            self.0
                .iter()
                .zip(other.0.iter())
                .map(|(a, b)| *a && *b)
                .collect(),
        )
    }

    pub fn bits(&self) -> u64 {
        self.0
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, b)| if *b { acc | 1 << i } else { acc })
    }
}

impl From<Vec<bool>> for ChildMask {
    fn from(value: Vec<bool>) -> Self {
        ChildMask(value)
    }
}

/// The packed per-inode readability word: metadata map in the low 16 bits,
/// data map in the next 16, event generation in the high 32. Readers must
/// observe the triple as one value, which the single u64 guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadableWord(pub u64);

impl ReadableWord {
    pub fn pack(data: &ChildMask, metadata: &ChildMask, event: u32) -> Result<Self> {
        if data.len() > SMALL_MAP_LIMIT || metadata.len() > SMALL_MAP_LIMIT {
            return Err(ModelError::TooManyChildren(data.len().max(metadata.len())));
        }
        let meta_bits = metadata.bits() & 0xffff;
        let data_bits = data.bits() & 0xffff;
        Ok(ReadableWord(
            meta_bits | data_bits << 16 | (event as u64) << 32,
        ))
    }

    pub fn unpack(self, child_count: usize) -> (ChildMask, ChildMask, u32) {
        let meta = ChildMask::from_bits(self.0 & 0xffff, child_count);
        let data = ChildMask::from_bits(self.0 >> 16 & 0xffff, child_count);
        let event = (self.0 >> 32) as u32;
        (data, meta, event)
    }
}

/// Readability storage that degrades from the packed word to heap-allocated
/// maps when the replica count exceeds 16. Selection policies are unaffected
/// by which representation is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadableMaps {
    Small(ReadableWord),
    Wide {
        data: ChildMask,
        metadata: ChildMask,
        event: u32,
    },
}

impl ReadableMaps {
    pub fn new(child_count: usize) -> Self {
        if child_count <= SMALL_MAP_LIMIT {
            ReadableMaps::Small(ReadableWord::default())
        } else {
            ReadableMaps::Wide {
                data: ChildMask::none(child_count),
                metadata: ChildMask::none(child_count),
                event: 0,
            }
        }
    }

    pub fn get(&self, child_count: usize) -> (ChildMask, ChildMask, u32) {
        match self {
            ReadableMaps::Small(word) => word.unpack(child_count),
            ReadableMaps::Wide {
                data,
                metadata,
                event,
            } => (data.clone(), metadata.clone(), *event),
        }
    }

    pub fn set(&mut self, data: &ChildMask, metadata: &ChildMask, event: u32) -> Result<()> {
        match self {
            ReadableMaps::Small(word) => {
                *word = ReadableWord::pack(data, metadata, event)?;
            }
            ReadableMaps::Wide {
                data: d,
                metadata: m,
                event: e,
            } => {
                *d = data.clone();
                *m = metadata.clone();
                *e = event;
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        match self {
            ReadableMaps::Small(word) => word.0 = 0,
            ReadableMaps::Wide {
                data,
                metadata,
                event,
            } => {
                *data = ChildMask::none(data.len());
                *metadata = ChildMask::none(metadata.len());
                *event = 0;
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            ReadableMaps::Small(word) => word.0 == 0,
            ReadableMaps::Wide {
                data,
                metadata,
                event,
            } => !data.any() && !metadata.any() && *event == 0,
        }
    }
}
