//! Metadata resource reader (C7).

use std::collections::HashSet;

use sha1::{Digest, Sha1};
use wim_core::WimError;

use super::{align8, decode_utf16le, RawDentryHeader, DENTRY_MIN_SIZE, NO_HARD_LINK_GROUP};
use crate::dentry::{Dentry, DentryArena, DentryId};
use crate::inode::{FileTimes, InodeId, InodeTable, Stream, StreamType, FILE_ATTRIBUTE_REPARSE_POINT};
use crate::scanner::ImageMetadata;
use crate::security::SecurityDescriptorSet;

/// Parses a decompressed metadata resource buffer into (security data,
/// dentry tree, inode table) (spec §4.7).
///
/// `expected_sha1` is the hash the external resource entry recorded for this
/// buffer; `None` skips step 2 (the caller's `dont_check_metadata_hash`).
pub fn read_metadata_resource(
    buffer: &[u8],
    expected_sha1: Option<&[u8; 20]>,
) -> Result<ImageMetadata, WimError> {
    if buffer.len() < 8 + DENTRY_MIN_SIZE {
        return Err(WimError::invalid_metadata(
            0,
            format!("buffer of {} bytes is shorter than the minimum resource", buffer.len()),
        ));
    }

    if let Some(expected) = expected_sha1 {
        let mut hasher = Sha1::new();
        hasher.update(buffer);
        let got: [u8; 20] = hasher.finalize().into();
        if &got != expected {
            return Err(WimError::invalid_metadata(0, "metadata resource hash mismatch"));
        }
    }

    let (security, sd_total_length) = SecurityDescriptorSet::parse(buffer)?;
    let root_offset = sd_total_length as usize;
    if root_offset + 8 > buffer.len() {
        return Err(WimError::invalid_metadata(root_offset, "truncated root dentry"));
    }

    let root_length = u64::from_le_bytes(buffer[root_offset..root_offset + 8].try_into().unwrap());
    if root_length == 0 {
        return Ok(ImageMetadata {
            security_data: security,
            dentries: DentryArena::new(),
            inodes: InodeTable::new(),
            unhashed_blobs: Vec::new(),
        });
    }

    let mut reader = Reader {
        buffer,
        dentries: DentryArena::new(),
        inodes: InodeTable::new(),
        consumed: Vec::new(),
        visited_lists: HashSet::new(),
    };

    let root = reader.read_dentry_at(root_offset, root_length as usize)?;
    if !reader.inodes.get(reader.dentries.get(root.id).inode).is_directory() {
        return Err(WimError::invalid_metadata(root_offset, "root dentry is not a directory"));
    }
    {
        let d = reader.dentries.get_mut(root.id);
        if !d.long_name.is_empty() || !d.short_name.is_empty() {
            log::warn!("metadata resource root dentry carries a non-empty name, clearing it");
            d.long_name.clear();
            d.short_name.clear();
        }
    }
    reader.dentries.set_root(root.id);
    reader.read_children(root.id, root.subdir_offset)?;

    for inode in reader.inodes.iter() {
        if inode.security_id >= 0 && security.get(inode.security_id).is_none() {
            return Err(WimError::invalid_metadata(
                root_offset,
                format!("inode references out-of-range security id {}", inode.security_id),
            ));
        }
    }

    Ok(ImageMetadata {
        security_data: security,
        dentries: reader.dentries,
        inodes: reader.inodes,
        unhashed_blobs: Vec::new(),
    })
}

struct ParsedDentry {
    id: DentryId,
    subdir_offset: u64,
}

struct Reader<'a> {
    buffer: &'a [u8],
    dentries: DentryArena,
    inodes: InodeTable,
    consumed: Vec<(usize, usize)>,
    visited_lists: HashSet<usize>,
}

impl<'a> Reader<'a> {
    fn mark_consumed(&mut self, start: usize, end: usize) -> Result<(), WimError> {
        for &(s, e) in &self.consumed {
            if start < e && s < end {
                return Err(WimError::invalid_metadata(start, "overlapping dentry records"));
            }
        }
        self.consumed.push((start, end));
        Ok(())
    }

    /// Reads the sibling list starting at `list_offset` (already validated
    /// to be the child block of `parent`), attaching each entry to `parent`
    /// and recursing into any directory children.
    fn read_children(&mut self, parent: DentryId, list_offset: u64) -> Result<(), WimError> {
        if list_offset == 0 {
            return Ok(());
        }
        let list_offset = list_offset as usize;
        if list_offset >= self.buffer.len() {
            return Err(WimError::invalid_metadata(list_offset, "child list offset out of bounds"));
        }
        if !self.visited_lists.insert(list_offset) {
            return Err(WimError::invalid_metadata(list_offset, "cycle detected in dentry tree"));
        }

        let mut cursor = list_offset;
        let mut directories = Vec::new();
        loop {
            if cursor + 8 > self.buffer.len() {
                return Err(WimError::invalid_metadata(cursor, "truncated sibling list"));
            }
            let length = u64::from_le_bytes(self.buffer[cursor..cursor + 8].try_into().unwrap());
            if length == 0 {
                break;
            }
            let parsed = self.read_dentry_at(cursor, length as usize)?;
            self.dentries.attach_child(parent, parsed.id);
            let inode_id = self.dentries.get(parsed.id).inode;
            if self.inodes.get(inode_id).is_directory() && parsed.subdir_offset != 0 {
                directories.push((parsed.id, parsed.subdir_offset));
            }
            cursor += length as usize;
        }

        for (child, subdir_offset) in directories {
            self.read_children(child, subdir_offset)?;
        }
        Ok(())
    }

    fn read_dentry_at(&mut self, offset: usize, length: usize) -> Result<ParsedDentry, WimError> {
        if length < DENTRY_MIN_SIZE {
            return Err(WimError::invalid_metadata(
                offset,
                format!("dentry length {length} shorter than the fixed header"),
            ));
        }
        if offset + length > self.buffer.len() {
            return Err(WimError::invalid_metadata(offset, "dentry record exceeds buffer"));
        }
        self.mark_consumed(offset, offset + length)?;

        let header = unsafe {
            std::ptr::read_unaligned(self.buffer[offset..].as_ptr() as *const RawDentryHeader)
        };

        let record_end = offset + length;
        let mut pos = offset + DENTRY_MIN_SIZE;
        let file_name_nbytes = header.file_name_nbytes as usize;
        let short_name_nbytes = header.short_name_nbytes as usize;
        if pos + file_name_nbytes + short_name_nbytes > record_end {
            return Err(WimError::invalid_metadata(pos, "dentry names exceed record length"));
        }

        let long_name = Self::decode_name(self.buffer, pos, file_name_nbytes)?;
        pos += file_name_nbytes;
        let short_name = Self::decode_name(self.buffer, pos, short_name_nbytes)?;
        pos += short_name_nbytes;

        let mut alt_names = Vec::with_capacity(header.num_alternate_streams as usize);
        let mut acursor = align8(pos);
        for _ in 0..header.num_alternate_streams {
            if acursor + 32 > record_end {
                return Err(WimError::invalid_metadata(acursor, "truncated alternate stream entry"));
            }
            let alen = u64::from_le_bytes(self.buffer[acursor..acursor + 8].try_into().unwrap()) as usize;
            if alen < 32 || acursor + alen > record_end {
                return Err(WimError::invalid_metadata(acursor, "invalid alternate stream length"));
            }
            let name_nbytes =
                u16::from_le_bytes(self.buffer[acursor + 28..acursor + 30].try_into().unwrap()) as usize;
            let name_start = acursor + 32;
            if name_start + name_nbytes > acursor + alen {
                return Err(WimError::invalid_metadata(name_start, "alternate stream name exceeds entry"));
            }
            alt_names.push(Self::decode_name(self.buffer, name_start, name_nbytes)?);
            acursor += alen;
        }

        let hard_link_group_id = header.hard_link_group_id;
        let key = if hard_link_group_id == NO_HARD_LINK_GROUP {
            // High bit set so an unshared dentry's synthetic key can never
            // collide with a real (small) hard-link group id.
            offset as u64 | (1u64 << 63)
        } else {
            hard_link_group_id
        };
        let (inode_id, is_new) = self.inodes.new_dentry(key);
        if is_new {
            Self::populate_inode(self.inodes.get_mut(inode_id), &header, &alt_names);
            self.inodes.get(inode_id).check_invariants()?;
        } else {
            Self::check_consistent(self.inodes.get(inode_id), &header, &alt_names, offset)?;
        }

        let mut dentry = Dentry::new(long_name, inode_id);
        dentry.short_name = short_name;
        let id = self.dentries.alloc(dentry);

        Ok(ParsedDentry {
            id,
            subdir_offset: header.subdir_offset,
        })
    }

    fn decode_name(buffer: &[u8], start: usize, nbytes: usize) -> Result<String, WimError> {
        if nbytes == 0 {
            return Ok(String::new());
        }
        if nbytes < 2 {
            return Err(WimError::invalid_metadata(start, "name field shorter than its null terminator"));
        }
        decode_utf16le(&buffer[start..start + nbytes - 2])
    }

    fn populate_inode(inode: &mut crate::inode::Inode, header: &RawDentryHeader, alt_names: &[String]) {
        inode.attributes = header.attributes;
        inode.security_id = header.security_id as i64;
        inode.times = FileTimes {
            creation_time: header.creation_time,
            last_write_time: header.last_write_time,
            last_access_time: header.last_access_time,
        };
        inode.reparse_tag = if header.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
            Some(header.reparse_tag_or_link_group_low)
        } else {
            None
        };
        inode.reparse_flags = 0;

        inode.streams.clear();
        if inode.is_reparse_point() {
            inode.streams.push(Stream {
                stream_type: StreamType::ReparsePoint,
                name: None,
                blob: None,
            });
        } else if !inode.is_directory() {
            inode.streams.push(Stream {
                stream_type: StreamType::Data,
                name: None,
                blob: None,
            });
        }
        for name in alt_names {
            inode.streams.push(Stream {
                stream_type: StreamType::Data,
                name: Some(name.clone()),
                blob: None,
            });
        }
    }

    fn check_consistent(
        inode: &crate::inode::Inode,
        header: &RawDentryHeader,
        alt_names: &[String],
        offset: usize,
    ) -> Result<(), WimError> {
        let attributes = header.attributes;
        let security_id = header.security_id as i64;
        if inode.attributes != attributes || inode.security_id != security_id {
            return Err(WimError::invalid_metadata(
                offset,
                "hard-linked dentries disagree on inode attributes",
            ));
        }
        let existing: Vec<&str> = inode
            .streams
            .iter()
            .filter_map(|s| s.name.as_deref())
            .collect();
        let incoming: Vec<&str> = alt_names.iter().map(String::as_str).collect();
        if existing != incoming {
            return Err(WimError::invalid_metadata(
                offset,
                "hard-linked dentries disagree on alternate stream lists",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::write_metadata_resource;
    use crate::scanner::{build_tree, CaptureParams};
    use crate::volume::mock::{MockAttr, MockInode, MockVolume};
    use crate::volume::{AttrInfo, AttrType, DirEntry, MftReference, NameType, Volume};

    #[test]
    fn empty_buffer_returns_null_root() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&8u32.to_le_bytes());
        let image = read_metadata_resource(&buf, None).unwrap();
        assert!(image.dentries.root().is_none());
        assert!(image.security_data.is_empty());
    }

    #[test]
    fn too_short_buffer_is_rejected() {
        let buf = vec![0u8; 20];
        let err = read_metadata_resource(&buf, None).unwrap_err();
        assert!(matches!(err, WimError::InvalidMetadataResource { .. }));
    }

    #[test]
    fn hash_mismatch_is_rejected_unless_skipped() {
        let mut buf = vec![0u8; 16];
        buf[0..4].copy_from_slice(&8u32.to_le_bytes());
        let wrong = [0xAAu8; 20];
        let err = read_metadata_resource(&buf, Some(&wrong)).unwrap_err();
        assert!(matches!(err, WimError::InvalidMetadataResource { .. }));
        assert!(read_metadata_resource(&buf, None).is_ok());
    }

    fn volume_with_root_and_file() -> Volume {
        let mock = MockVolume::new();
        mock.insert(
            5,
            MockInode {
                file_attributes: 0x10,
                children: vec![DirEntry {
                    mft_reference: MftReference::new(6, 1),
                    file_name: "hello.txt".into(),
                    name_type: NameType::Win32AndDos,
                    is_directory: false,
                }],
                ..Default::default()
            },
        );
        mock.insert(
            6,
            MockInode {
                file_attributes: 0x20,
                attrs: vec![MockAttr {
                    info: AttrInfo {
                        attr_type: AttrType::Data,
                        name: None,
                        value_len: 4,
                    },
                    data: b"data".to_vec(),
                    lcn: Some(100),
                }],
                ..Default::default()
            },
        );
        Volume::new(mock)
    }

    #[test]
    fn round_trip_single_file() {
        let volume = volume_with_root_and_file();
        let params = CaptureParams::default();
        let image = build_tree(
            &volume,
            MftReference::new(5, 1),
            &params,
            &crate::scanner::NoExclusions,
            &mut crate::scanner::NoProgress,
            &mut crate::scanner::AbortOnError,
        )
        .unwrap();

        let buf = write_metadata_resource(&image).unwrap();
        let decoded = read_metadata_resource(&buf, None).unwrap();

        assert_eq!(decoded.inodes.into_inodes().len(), image.inodes.into_inodes().len());
        let root = decoded.dentries.root().unwrap();
        assert_eq!(decoded.dentries.get(root).children.len(), 1);
        let child = decoded.dentries.get(root).children[0];
        assert_eq!(decoded.dentries.get(child).long_name, "hello.txt");
    }
}
