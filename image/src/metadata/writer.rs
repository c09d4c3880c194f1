//! Metadata resource writer (C8).

use std::collections::HashMap;

use wim_core::WimError;

use super::{align8, encode_utf16le_with_nul, RawDentryHeader, DENTRY_MIN_SIZE, NO_HARD_LINK_GROUP};
use crate::dentry::DentryId;
use crate::inode::{Inode, InodeId, Stream};
use crate::scanner::ImageMetadata;

/// Serializes `image` into a metadata resource buffer (spec §4.8, steps
/// 1–6). Handing the result to the compressed-resource writer (step 7) is
/// the caller's job, through [`super::MetadataResourceSink`].
pub fn write_metadata_resource(image: &ImageMetadata) -> Result<Vec<u8>, WimError> {
    let mut out = Vec::new();
    image.security_data.serialize(&mut out);
    let security_len = align8(out.len());
    out.resize(security_len, 0);

    let Some(root) = image.dentries.root() else {
        // 1. No root: synthesize an empty filler directory and stop; it has
        // no children, so there's nothing further to serialize.
        write_filler_root(&mut out)?;
        return Ok(out);
    };

    let writer = Writer { image };

    let root_len = writer.record_len(root)? as u64;
    let cursor0 = security_len as u64 + root_len + 8;

    let mut offsets: HashMap<DentryId, u64> = HashMap::new();
    let root_children = &image.dentries.get(root).children;
    let final_len = if root_children.is_empty() {
        cursor0
    } else {
        offsets.insert(root, cursor0);
        writer.assign_offsets(root, cursor0, &mut offsets)?
    };

    writer.write_dentry_record(root, &offsets, &mut out)?;
    out.extend_from_slice(&0u64.to_le_bytes());
    if !root_children.is_empty() {
        writer.serialize_children(root, &offsets, &mut out)?;
    }

    if out.len() as u64 != final_len {
        return Err(WimError::InvalidParam(format!(
            "writer cursor mismatch: computed {final_len}, wrote {}",
            out.len()
        )));
    }

    Ok(out)
}

fn write_filler_root(out: &mut Vec<u8>) -> Result<(), WimError> {
    let header = RawDentryHeader {
        length: DENTRY_MIN_SIZE as u64,
        attributes: crate::inode::FILE_ATTRIBUTE_DIRECTORY,
        security_id: -1,
        subdir_offset: 0,
        reserved1: 0,
        reserved2: 0,
        creation_time: 0,
        last_access_time: 0,
        last_write_time: 0,
        unnamed_stream_hash: [0u8; 20],
        reparse_reserved: 0,
        reparse_tag_or_link_group_low: 0,
        hard_link_group_id: NO_HARD_LINK_GROUP,
        num_alternate_streams: 0,
        short_name_nbytes: 0,
        file_name_nbytes: 0,
        reserved3: 0,
    };
    write_raw_header(&header, out);
    out.resize(align8(out.len()), 0);
    out.extend_from_slice(&0u64.to_le_bytes());
    Ok(())
}

fn write_raw_header(header: &RawDentryHeader, out: &mut Vec<u8>) {
    let bytes = unsafe {
        std::slice::from_raw_parts(
            header as *const RawDentryHeader as *const u8,
            std::mem::size_of::<RawDentryHeader>(),
        )
    };
    out.extend_from_slice(bytes);
}

struct Writer<'a> {
    image: &'a ImageMetadata,
}

impl<'a> Writer<'a> {
    fn is_directory(&self, id: DentryId) -> bool {
        let d = self.image.dentries.get(id);
        self.image.inodes.get(d.inode).is_directory()
    }

    fn inode_of(&self, id: DentryId) -> &Inode {
        self.image.inodes.get(self.image.dentries.get(id).inode)
    }

    fn name_field(name: &str) -> Vec<u8> {
        if name.is_empty() {
            Vec::new()
        } else {
            encode_utf16le_with_nul(name)
        }
    }

    fn alt_stream_len(stream: &Stream) -> usize {
        let name_bytes = stream
            .name
            .as_deref()
            .map(Self::name_field)
            .unwrap_or_default();
        align8(8 + 20 + 2 + 2 + name_bytes.len())
    }

    fn record_len(&self, id: DentryId) -> Result<usize, WimError> {
        let d = self.image.dentries.get(id);
        let file_name_len = Self::name_field(&d.long_name).len();
        let short_name_len = Self::name_field(&d.short_name).len();
        let names_len = align8(DENTRY_MIN_SIZE + file_name_len + short_name_len);
        let inode = self.inode_of(id);
        let alt_len: usize = inode
            .streams
            .iter()
            .filter(|s| s.name.is_some())
            .map(Self::alt_stream_len)
            .sum();
        Ok(align8(names_len + alt_len))
    }

    /// Reserves the contiguous block holding `parent`'s children (assumed
    /// non-empty) starting at `cursor`, then recurses into each directory
    /// child that itself has children, in order. Returns the cursor
    /// position just past everything reserved under `parent`.
    fn assign_offsets(
        &self,
        parent: DentryId,
        start_cursor: u64,
        offsets: &mut HashMap<DentryId, u64>,
    ) -> Result<u64, WimError> {
        let children = self.image.dentries.get(parent).children.clone();
        let mut cursor = start_cursor;
        for &child in &children {
            cursor += self.record_len(child)? as u64;
        }
        cursor += 8;

        for &child in &children {
            if self.is_directory(child) && !self.image.dentries.get(child).children.is_empty() {
                offsets.insert(child, cursor);
                cursor = self.assign_offsets(child, cursor, offsets)?;
            }
        }
        Ok(cursor)
    }

    fn serialize_children(
        &self,
        parent: DentryId,
        offsets: &HashMap<DentryId, u64>,
        out: &mut Vec<u8>,
    ) -> Result<(), WimError> {
        let children = self.image.dentries.get(parent).children.clone();
        for &child in &children {
            self.write_dentry_record(child, offsets, out)?;
        }
        out.extend_from_slice(&0u64.to_le_bytes());
        for &child in &children {
            if self.is_directory(child) && !self.image.dentries.get(child).children.is_empty() {
                self.serialize_children(child, offsets, out)?;
            }
        }
        Ok(())
    }

    fn write_dentry_record(
        &self,
        id: DentryId,
        offsets: &HashMap<DentryId, u64>,
        out: &mut Vec<u8>,
    ) -> Result<(), WimError> {
        let d = self.image.dentries.get(id);
        let inode = self.inode_of(id);

        let security_id = i32::try_from(inode.security_id).map_err(|_| {
            WimError::InvalidParam(format!(
                "security id {} does not fit a 32-bit field",
                inode.security_id
            ))
        })?;

        let hard_link_group_id = if inode.link_count > 1 {
            self.group_id(d.inode)
        } else {
            NO_HARD_LINK_GROUP
        };

        let file_name_bytes = Self::name_field(&d.long_name);
        let short_name_bytes = Self::name_field(&d.short_name);
        let named_streams: Vec<&Stream> = inode.streams.iter().filter(|s| s.name.is_some()).collect();

        let header = RawDentryHeader {
            length: self.record_len(id)? as u64,
            attributes: inode.attributes,
            security_id,
            subdir_offset: offsets.get(&id).copied().unwrap_or(0),
            reserved1: 0,
            reserved2: 0,
            creation_time: inode.times.creation_time,
            last_access_time: inode.times.last_access_time,
            last_write_time: inode.times.last_write_time,
            unnamed_stream_hash: [0u8; 20],
            reparse_reserved: 0,
            reparse_tag_or_link_group_low: inode.reparse_tag.unwrap_or(0),
            hard_link_group_id,
            num_alternate_streams: named_streams.len() as u16,
            short_name_nbytes: short_name_bytes.len() as u16,
            file_name_nbytes: file_name_bytes.len() as u16,
            reserved3: 0,
        };

        let start = out.len();
        write_raw_header(&header, out);
        out.extend_from_slice(&file_name_bytes);
        out.extend_from_slice(&short_name_bytes);
        let names_end = align8(out.len());
        out.resize(names_end, 0);

        for stream in named_streams {
            self.write_alt_stream(stream, out);
        }
        let record_end = align8(out.len());
        out.resize(record_end, 0);

        debug_assert_eq!(out.len() - start, self.record_len(id)?);
        Ok(())
    }

    fn write_alt_stream(&self, stream: &Stream, out: &mut Vec<u8>) {
        let name_bytes = stream
            .name
            .as_deref()
            .map(Self::name_field)
            .unwrap_or_default();
        let start = out.len();
        let len = align8(8 + 20 + 2 + 2 + name_bytes.len());
        out.extend_from_slice(&(len as u64).to_le_bytes());
        out.extend_from_slice(&[0u8; 20]);
        out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&name_bytes);
        out.resize(start + len, 0);
    }

    fn group_id(&self, inode_id: InodeId) -> u64 {
        inode_id.0 as u64 + 1
    }
}
