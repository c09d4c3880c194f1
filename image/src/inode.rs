//! Inode and inode table (C5) — the dedup layer that realizes hard links.

use crate::blob::BlobDescriptor;
use crate::security::NO_SECURITY_ID;

/// Bit in `Inode::reparse_flags` meaning the reparse target's path has not
/// been fixed up for the destination volume layout. Full-volume capture
/// clears it (spec C6 step 9, the "RPFIX" policy) since the image's paths
/// are self-consistent by construction.
pub const REPARSE_FLAG_NOT_FIXED: u32 = 0x1;

pub const FILE_ATTRIBUTE_REPARSE_POINT: u32 = 0x0400;
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10000000;
pub const FILE_ATTRIBUTE_ENCRYPTED: u32 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Data,
    ReparsePoint,
    Unknown,
}

/// A (type, optional-name, optional-blob) stream on an inode.
#[derive(Debug, Clone)]
pub struct Stream {
    pub stream_type: StreamType,
    /// `None` for the default unnamed data stream.
    pub name: Option<String>,
    pub blob: Option<BlobDescriptor>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileTimes {
    pub creation_time: u64,
    pub last_write_time: u64,
    pub last_access_time: u64,
}

#[derive(Debug, Clone)]
pub struct Inode {
    pub mft_no: u64,
    pub times: FileTimes,
    pub attributes: u32,
    pub reparse_tag: Option<u32>,
    pub reparse_flags: u32,
    pub security_id: i64,
    pub link_count: u32,
    pub streams: Vec<Stream>,
}

impl Inode {
    pub fn new(mft_no: u64) -> Self {
        Inode {
            mft_no,
            times: FileTimes::default(),
            attributes: 0,
            reparse_tag: None,
            reparse_flags: 0,
            security_id: NO_SECURITY_ID,
            link_count: 0,
            streams: Vec::new(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_DIRECTORY != 0
    }

    pub fn is_reparse_point(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.attributes & FILE_ATTRIBUTE_ENCRYPTED != 0
    }

    /// Checks the two structural invariants from spec §3: a reparse-point
    /// inode carries exactly one reparse stream, and a directory inode
    /// carries no unnamed data stream.
    pub fn check_invariants(&self) -> Result<(), wim_core::WimError> {
        let reparse_streams = self
            .streams
            .iter()
            .filter(|s| s.stream_type == StreamType::ReparsePoint)
            .count();
        if self.is_reparse_point() && reparse_streams != 1 {
            return Err(wim_core::WimError::ntfs(
                format!("mft:{}", self.mft_no),
                format!("reparse-point inode has {reparse_streams} reparse streams, expected 1"),
            ));
        }
        if self.is_directory()
            && self
                .streams
                .iter()
                .any(|s| s.stream_type == StreamType::Data && s.name.is_none())
        {
            return Err(wim_core::WimError::ntfs(
                format!("mft:{}", self.mft_no),
                "directory inode carries an unnamed data stream",
            ));
        }
        Ok(())
    }
}

/// Index into the image's inode arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId(pub usize);

/// Deduplicating {volume-inode-number → inode} map (C5). Realizes hard
/// links: a second dentry for an already-seen `mft_no` shares the existing
/// inode and bumps its link count instead of allocating a new one.
#[derive(Default)]
pub struct InodeTable {
    inodes: Vec<Inode>,
    by_mft_no: std::collections::HashMap<u64, InodeId>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the inode bound to `volume_inode_no`, allocating a fresh one
    /// on first sight. `is_new` tells the caller whether to keep scanning
    /// this inode's attributes (false means it's a hard link to one already
    /// fully populated).
    pub fn new_dentry(&mut self, volume_inode_no: u64) -> (InodeId, bool) {
        if let Some(&id) = self.by_mft_no.get(&volume_inode_no) {
            self.inodes[id.0].link_count += 1;
            return (id, false);
        }
        let id = InodeId(self.inodes.len());
        let mut inode = Inode::new(volume_inode_no);
        inode.link_count = 1;
        self.inodes.push(inode);
        self.by_mft_no.insert(volume_inode_no, id);
        (id, true)
    }

    pub fn get(&self, id: InodeId) -> &Inode {
        &self.inodes[id.0]
    }

    pub fn get_mut(&mut self, id: InodeId) -> &mut Inode {
        &mut self.inodes[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Inode> {
        self.inodes.iter()
    }

    /// Consumes the table, returning its inodes in allocation order.
    pub fn into_inodes(self) -> Vec<Inode> {
        self.inodes
    }
}
