//! Security descriptor set (C4) — a deduplicating table of raw
//! `SECURITY_DESCRIPTOR` byte strings, and its on-wire layout (spec §6.2).

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Sentinel meaning "no security descriptor".
pub const NO_SECURITY_ID: i64 = -1;

fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

#[derive(Default)]
pub struct SecurityDescriptorSet {
    descriptors: Vec<Vec<u8>>,
    by_hash: HashMap<(usize, u64), Vec<usize>>,
}

impl SecurityDescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `bytes`, returning its ID. A byte-identical descriptor
    /// already in the table returns that descriptor's existing ID instead
    /// of growing the table.
    pub fn add(&mut self, bytes: &[u8]) -> i64 {
        let key = (bytes.len(), content_hash(bytes));
        if let Some(candidates) = self.by_hash.get(&key) {
            for &id in candidates {
                if self.descriptors[id] == bytes {
                    return id as i64;
                }
            }
        }
        let id = self.descriptors.len();
        self.descriptors.push(bytes.to_vec());
        self.by_hash.entry(key).or_default().push(id);
        id as i64
    }

    /// Appends `bytes` at the next index unconditionally, preserving
    /// positional identity instead of deduping against existing entries.
    /// For decoding an on-disk security block (spec §6.2), where a
    /// descriptor's table slot is its ID and two on-disk entries may
    /// legitimately be byte-identical without collapsing to one ID. Still
    /// registers the new entry in the hash index so a later `add()` call
    /// correctly finds it as a duplicate.
    pub fn push_positional(&mut self, bytes: Vec<u8>) -> i64 {
        let key = (bytes.len(), content_hash(&bytes));
        let id = self.descriptors.len();
        self.by_hash.entry(key).or_default().push(id);
        self.descriptors.push(bytes);
        id as i64
    }

    pub fn get(&self, id: i64) -> Option<&[u8]> {
        if id < 0 {
            return None;
        }
        self.descriptors.get(id as usize).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Serialized length of the security block (header + sizes +
    /// descriptors), rounded up to 8 bytes.
    pub fn total_length(&self) -> u64 {
        let header = 8u64 + 8 * self.descriptors.len() as u64;
        let payload: u64 = self.descriptors.iter().map(|d| d.len() as u64).sum();
        align8(header + payload)
    }

    /// Emits the security block: `total_length`, `num_entries`, the size
    /// table, the concatenated descriptors, then zero padding to 8 bytes.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let total_length = self.total_length();
        out.extend_from_slice(&(total_length as u32).to_le_bytes());
        out.extend_from_slice(&(self.descriptors.len() as u32).to_le_bytes());
        for d in &self.descriptors {
            out.extend_from_slice(&(d.len() as u64).to_le_bytes());
        }
        for d in &self.descriptors {
            out.extend_from_slice(d);
        }
        let written = 8 + 8 * self.descriptors.len() + self.descriptors.iter().map(Vec::len).sum::<usize>();
        let padded = align8(written as u64) as usize;
        out.resize(out.len() + (padded - written), 0);
    }

    /// Parses a security block starting at `data[0]`. `total_length == 0`
    /// is treated as `total_length = 8, num_entries = 0` per spec.
    pub fn parse(data: &[u8]) -> Result<(Self, u64), wim_core::WimError> {
        if data.len() < 8 {
            return Err(wim_core::WimError::invalid_metadata(
                0,
                "security block shorter than 8 bytes",
            ));
        }
        let mut total_length = u32::from_le_bytes(data[0..4].try_into().unwrap()) as u64;
        let num_entries = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if total_length == 0 {
            total_length = 8;
        }
        if (total_length as usize) > data.len() {
            return Err(wim_core::WimError::invalid_metadata(
                0,
                "security block total_length exceeds buffer",
            ));
        }

        let sizes_start = 8usize;
        let sizes_end = sizes_start + 8 * num_entries;
        if sizes_end > data.len() {
            return Err(wim_core::WimError::invalid_metadata(
                sizes_start,
                "security descriptor size table truncated",
            ));
        }

        let mut set = SecurityDescriptorSet::new();
        let mut cursor = sizes_end;
        for i in 0..num_entries {
            let size_offset = sizes_start + i * 8;
            let size = u64::from_le_bytes(data[size_offset..size_offset + 8].try_into().unwrap()) as usize;
            if cursor + size > data.len() {
                return Err(wim_core::WimError::invalid_metadata(
                    cursor,
                    "security descriptor data truncated",
                ));
            }
            // Positional, not `add`: decoding must preserve on-disk slot
            // indices even if two entries happen to be byte-identical.
            set.push_positional(data[cursor..cursor + size].to_vec());
            cursor += size;
        }

        Ok((set, total_length))
    }
}
