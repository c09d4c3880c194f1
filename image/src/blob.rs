//! Blob descriptor (C2) — a deferred handle to one stream's file data.

use std::cmp::Ordering;
use std::ops::ControlFlow;

use wim_core::WimError;

use crate::volume::{AttrInfo, AttrType, InodeHandle, Volume};

/// Recommended chunk size for `read_prefix` (spec §4.2).
pub const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Where a blob's bytes actually live. Only the in-volume variant is
/// implemented here; the wider WIM engine has others (in-buffer staging,
/// content-addressed blob store) that this crate never constructs but must
/// leave room for so a `BlobDescriptor` can flow through code that doesn't
/// care which kind it has.
#[derive(Debug, Clone)]
pub enum BlobLocation {
    InNtfsVolume {
        volume: Volume,
        mft_no: u64,
        attr_type: AttrType,
        attr_name: Option<String>,
        /// Already adjusted: 8 bytes subtracted for `REPARSE_POINT`.
        size: u64,
        sort_key: u64,
    },
    /// Stand-in for the other location kinds (out of scope for this crate).
    Opaque,
}

#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    location: BlobLocation,
}

impl BlobDescriptor {
    pub fn in_ntfs_volume(
        volume: Volume,
        mft_no: u64,
        attr_type: AttrType,
        attr_name: Option<String>,
        size: u64,
        sort_key: u64,
    ) -> Self {
        BlobDescriptor {
            location: BlobLocation::InNtfsVolume {
                volume,
                mft_no,
                attr_type,
                attr_name,
                size,
                sort_key,
            },
        }
    }

    pub fn location(&self) -> &BlobLocation {
        &self.location
    }

    pub fn size(&self) -> u64 {
        match &self.location {
            BlobLocation::InNtfsVolume { size, .. } => *size,
            BlobLocation::Opaque => 0,
        }
    }

    fn sort_key(&self) -> u64 {
        match &self.location {
            BlobLocation::InNtfsVolume { sort_key, .. } => *sort_key,
            BlobLocation::Opaque => 0,
        }
    }

    /// Total order over blobs by `sort_key`, so a scheduler can read them in
    /// roughly on-disk order. Ties are broken by `mft_no` and then attribute
    /// name — arbitrary, but stable across calls.
    pub fn order(a: &BlobDescriptor, b: &BlobDescriptor) -> Ordering {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.tiebreak_key().cmp(&b.tiebreak_key()))
    }

    fn tiebreak_key(&self) -> (u64, Option<String>) {
        match &self.location {
            BlobLocation::InNtfsVolume {
                mft_no, attr_name, ..
            } => (*mft_no, attr_name.clone()),
            BlobLocation::Opaque => (0, None),
        }
    }

    /// Reads the first `n` bytes of the referenced attribute in
    /// `READ_CHUNK_SIZE` chunks, delivering each to `sink`. For a
    /// `REPARSE_POINT` attribute the read starts 8 bytes into the
    /// attribute, skipping the reparse header (the blob's `size` already
    /// excludes those 8 bytes, so `n <= size` covers it). `sink` may abort
    /// by returning `ControlFlow::Break`.
    pub fn read_prefix(
        &self,
        n: u64,
        sink: &mut dyn FnMut(&[u8]) -> ControlFlow<()>,
    ) -> Result<(), WimError> {
        let (volume, mft_no, attr_type, attr_name, base_offset) = match &self.location {
            BlobLocation::InNtfsVolume {
                volume,
                mft_no,
                attr_type,
                attr_name,
                ..
            } => {
                let base = if *attr_type == AttrType::ReparsePoint {
                    8u64
                } else {
                    0
                };
                (volume, *mft_no, *attr_type, attr_name.clone(), base)
            }
            BlobLocation::Opaque => return Ok(()),
        };

        let handle = InodeHandle(mft_no);
        let attr = AttrInfo {
            attr_type,
            name: attr_name,
            value_len: n,
        };

        let mut remaining = n;
        let mut offset = base_offset;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        while remaining > 0 {
            let want = remaining.min(READ_CHUNK_SIZE as u64) as usize;
            let read = volume
                .driver()
                .read_attribute_at(handle, &attr, offset, &mut buf[..want])?;
            if read < want {
                return Err(WimError::ReadError {
                    offset,
                    expected: want,
                    actual: read,
                });
            }
            if sink(&buf[..read]).is_break() {
                return Ok(());
            }
            offset += read as u64;
            remaining -= read as u64;
        }
        Ok(())
    }
}

impl PartialEq for BlobDescriptor {
    /// Spec §6.3: two blobs are equal iff they name the same
    /// (volume, mft_no, attr_type, attr_name).
    fn eq(&self, other: &Self) -> bool {
        match (&self.location, &other.location) {
            (
                BlobLocation::InNtfsVolume {
                    volume: v1,
                    mft_no: m1,
                    attr_type: t1,
                    attr_name: n1,
                    ..
                },
                BlobLocation::InNtfsVolume {
                    volume: v2,
                    mft_no: m2,
                    attr_type: t2,
                    attr_name: n2,
                    ..
                },
            ) => v1.is_same_volume(v2) && m1 == m2 && t1 == t2 && n1 == n2,
            _ => false,
        }
    }
}

impl Eq for BlobDescriptor {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::mock::{MockAttr, MockInode, MockVolume};

    fn volume_with_data(mft_no: u64, data: &[u8]) -> Volume {
        let mock = MockVolume::new();
        mock.insert(
            mft_no,
            MockInode {
                attrs: vec![MockAttr {
                    info: AttrInfo {
                        attr_type: AttrType::Data,
                        name: None,
                        value_len: data.len() as u64,
                    },
                    data: data.to_vec(),
                    lcn: Some(1),
                }],
                ..Default::default()
            },
        );
        Volume::new(mock)
    }

    #[test]
    fn order_is_antisymmetric_and_transitive() {
        let volume = volume_with_data(1, b"");
        let a = BlobDescriptor::in_ntfs_volume(volume.clone(), 1, AttrType::Data, None, 0, 10);
        let b = BlobDescriptor::in_ntfs_volume(volume.clone(), 2, AttrType::Data, None, 0, 20);
        let c = BlobDescriptor::in_ntfs_volume(volume, 3, AttrType::Data, None, 0, 30);

        assert_eq!(BlobDescriptor::order(&a, &b), Ordering::Less);
        assert_eq!(BlobDescriptor::order(&b, &a), Ordering::Greater);
        assert_eq!(BlobDescriptor::order(&a, &a), Ordering::Equal);
        assert_eq!(BlobDescriptor::order(&a, &c), Ordering::Less);
        assert_eq!(BlobDescriptor::order(&b, &c), Ordering::Less);
    }

    #[test]
    fn equality_is_identity_based_not_content_based() {
        let volume = volume_with_data(1, b"hello");
        let a = BlobDescriptor::in_ntfs_volume(volume.clone(), 1, AttrType::Data, None, 5, 0);
        let same = BlobDescriptor::in_ntfs_volume(volume.clone(), 1, AttrType::Data, None, 5, 0);
        let different_attr = BlobDescriptor::in_ntfs_volume(
            volume.clone(),
            1,
            AttrType::Data,
            Some("stream".into()),
            5,
            0,
        );
        let other_volume = volume_with_data(1, b"hello");
        let different_volume =
            BlobDescriptor::in_ntfs_volume(other_volume, 1, AttrType::Data, None, 5, 0);

        assert_eq!(a, same);
        assert_ne!(a, different_attr);
        assert_ne!(a, different_volume);
    }

    #[test]
    fn read_prefix_delivers_bytes_in_chunks() {
        let volume = volume_with_data(1, b"hello world");
        let blob = BlobDescriptor::in_ntfs_volume(volume, 1, AttrType::Data, None, 11, 0);

        let mut collected = Vec::new();
        blob.read_prefix(11, &mut |chunk| {
            collected.extend_from_slice(chunk);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(collected, b"hello world");
    }
}
