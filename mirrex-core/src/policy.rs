use std::sync::atomic::Ordering;

use mirrex_config::ReadHashMode;
use mirrex_model::{ChildMask, FileType, Gfid};

use crate::volume::ReplicaSet;

/// Paul Hsieh's SuperFastHash, the spread function behind the gfid-based
/// read policies. Stable across platforms: 16-bit words are read
/// little-endian.
pub fn super_fast_hash(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let get16 = |b: &[u8]| u32::from(u16::from_le_bytes([b[0], b[1]]));

    let mut hash = data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        hash = hash.wrapping_add(get16(&chunk[0..2]));
        let tmp = (get16(&chunk[2..4]) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        hash = hash.wrapping_add(hash >> 11);
    }

    let rem = chunks.remainder();
    match rem.len() {
        3 => {
            hash = hash.wrapping_add(get16(&rem[0..2]));
            hash ^= hash << 16;
            hash ^= u32::from(rem[2]) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(get16(rem));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(u32::from(rem[0]));
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash.wrapping_add(hash >> 6)
}

/// Identity of the file a read child is being chosen for.
#[derive(Debug, Clone, Copy)]
pub struct ReadArgs {
    pub gfid: Gfid,
    pub ia_type: FileType,
}

impl ReplicaSet {
    /// Pick the replica to service a read, given the candidate mask.
    ///
    /// Ladder: operator-pinned read child, then the configured hash mode,
    /// then any readable replica. The arbiter never serves reads.
    pub fn select_read_child(&self, readable: &ChildMask, args: &ReadArgs) -> Option<usize> {
        if let Some(pinned) = self.options.read_child
            && readable.get(pinned)
            && !self.is_arbiter(pinned)
        {
            return Some(pinned);
        }

        if let Some(child) = self.hash_child(readable, args)
            && readable.get(child)
            && !self.is_arbiter(child)
        {
            return Some(child);
        }

        readable.iter_set().find(|child| !self.is_arbiter(*child))
    }

    fn hash_child(&self, readable: &ChildMask, args: &ReadArgs) -> Option<usize> {
        let child_count = self.child_count() as u32;
        match self.options.read_hash_mode {
            ReadHashMode::FirstUp => None,
            ReadHashMode::GfidHash => {
                Some((super_fast_hash(args.gfid.as_bytes()) % child_count) as usize)
            }
            ReadHashMode::GfidPidHash => {
                let mut bytes = *args.gfid.as_bytes();
                if !args.ia_type.is_dir() {
                    // Mix the pid in so concurrent clients spread across
                    // replicas even for the same file.
                    let pid = std::process::id().to_le_bytes();
                    for (slot, byte) in bytes.iter_mut().zip(pid) {
                        *slot ^= byte;
                    }
                }
                Some((super_fast_hash(&bytes) % child_count) as usize)
            }
            ReadHashMode::LessLoad => self.least_pending_reads_child(readable),
            ReadHashMode::LeastLatency => self.least_latency_child(readable),
            ReadHashMode::LoadLatencyHybrid => self.least_weighted_latency_child(readable),
        }
    }

    fn least_pending_reads_child(&self, readable: &ChildMask) -> Option<usize> {
        let mut child: Option<(usize, u64)> = None;
        for i in readable.iter_set() {
            if self.is_arbiter(i) {
                continue;
            }
            let pending = self.pending_reads[i].load(Ordering::Relaxed);
            if child.is_none_or(|(_, least)| pending < least) {
                child = Some((i, pending));
            }
        }
        child.map(|(i, _)| i)
    }

    fn least_latency_child(&self, readable: &ChildMask) -> Option<usize> {
        let latencies = self.latencies();
        let mut child: Option<(usize, i64)> = None;
        for i in readable.iter_set() {
            if self.is_arbiter(i) || latencies[i] < 0 {
                continue;
            }
            if child.is_none_or(|(_, least)| latencies[i] < least) {
                child = Some((i, latencies[i]));
            }
        }
        child.map(|(i, _)| i)
    }

    fn least_weighted_latency_child(&self, readable: &ChildMask) -> Option<usize> {
        let latencies = self.latencies();
        let mut child: Option<(usize, i64)> = None;
        for i in readable.iter_set() {
            if self.is_arbiter(i) || latencies[i] < 0 {
                continue;
            }
            let pending = self.pending_reads[i].load(Ordering::Relaxed) as i64;
            let weighted = (pending + 1).saturating_mul(latencies[i]);
            if child.is_none_or(|(_, least)| weighted < least) {
                child = Some((i, weighted));
            }
        }
        child.map(|(i, _)| i)
    }
}
