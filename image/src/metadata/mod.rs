//! Metadata resource codec (C7/C8) — the on-wire format for a WIM image's
//! security data and dentry tree (spec §6.2). Decompression and the
//! compressed-resource container itself are handled by an external
//! collaborator; this module only speaks the decompressed byte layout.

pub mod reader;
pub mod writer;

pub use reader::read_metadata_resource;
pub use writer::write_metadata_resource;

use wim_core::WimError;

/// Fixed portion of one on-disk dentry record, before its variable-length
/// names and alternate-stream entries (spec §6.2).
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct RawDentryHeader {
    length: u64,
    attributes: u32,
    security_id: i32,
    subdir_offset: u64,
    reserved1: u64,
    reserved2: u64,
    creation_time: u64,
    last_access_time: u64,
    last_write_time: u64,
    unnamed_stream_hash: [u8; 20],
    reparse_reserved: u32,
    reparse_tag_or_link_group_low: u32,
    hard_link_group_id: u64,
    num_alternate_streams: u16,
    short_name_nbytes: u16,
    file_name_nbytes: u16,
    reserved3: u16,
}

/// Minimum size of a dentry's fixed header. The spec's prose calls this
/// "~102 bytes before names"; this crate uses the actual size of
/// [`RawDentryHeader`] rather than a hardcoded literal, since the floor
/// check only needs to be a cheap first pass — every field access past it is
/// bounds-checked on its own.
const DENTRY_MIN_SIZE: usize = std::mem::size_of::<RawDentryHeader>();

/// Group ID meaning "this dentry's inode is not shared with any other
/// dentry" (mirrors the real WIM format's convention of 0 = unlinked).
const NO_HARD_LINK_GROUP: u64 = 0;

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn decode_utf16le(data: &[u8]) -> Result<String, WimError> {
    if data.len() % 2 != 0 {
        return Err(WimError::invalid_metadata(0, "odd-length UTF-16LE string"));
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| WimError::invalid_metadata(0, "invalid UTF-16LE string"))
}

fn encode_utf16le_with_nul(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2 + 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// The external compressed-resource writer this crate hands a finished
/// metadata-resource buffer to (spec C8 step 7, out of scope here). Captured
/// as a trait so callers can plug in the real WIM writer without this crate
/// depending on it.
pub trait MetadataResourceSink {
    fn write_resource(&mut self, bytes: &[u8]) -> Result<(), WimError>;
}
