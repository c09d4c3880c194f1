//! DOS-name index (C3) — one per directory, live only during its readdir.

use std::collections::BTreeMap;

/// NTFS guarantees a single DOS short name per inode, so a plain map keyed
/// by inode number is enough; order doesn't matter, `BTreeMap` just gives
/// deterministic iteration for debugging.
#[derive(Default)]
pub struct DosNameIndex {
    by_inode: BTreeMap<u64, String>,
}

impl DosNameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` as the DOS short name for `inode_no`. A second insert
    /// for the same inode is a protocol violation by the platform library
    /// (NTFS allows only one DOS name per inode) — it's logged and the
    /// duplicate is discarded rather than overwriting the first.
    pub fn insert(&mut self, inode_no: u64, name: String) {
        debug_assert!(
            name.encode_utf16().count() * 2 <= 24,
            "DOS name exceeds 24 bytes: {name:?}"
        );
        if self.by_inode.contains_key(&inode_no) {
            log::warn!("duplicate DOS name for inode {inode_no}: {name:?}");
            return;
        }
        self.by_inode.insert(inode_no, name);
    }

    pub fn lookup(&self, inode_no: u64) -> Option<&str> {
        self.by_inode.get(&inode_no).map(String::as_str)
    }

    /// Frees all entries. Called once per directory after its children have
    /// been paired with their short names.
    pub fn drain(&mut self) {
        self.by_inode.clear();
    }
}
