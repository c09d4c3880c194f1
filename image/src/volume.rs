//! Volume handle (C1) and the abstract NTFS platform interface (spec §6.1).
//!
//! The real platform library — mount/unmount, MFT access, readdir — lives
//! outside this crate. `NtfsVolumeDriver` is the seam: any type that
//! implements it can be wrapped in a [`Volume`] and fed to the scanner or to
//! a [`crate::blob::BlobDescriptor`].

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use wim_core::WimError;

/// (inode_number, sequence) pair identifying a file on NTFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MftReference {
    pub mft_number: u64,
    pub sequence: u16,
}

impl MftReference {
    pub fn new(mft_number: u64, sequence: u16) -> Self {
        Self {
            mft_number,
            sequence,
        }
    }
}

/// Opaque per-driver handle to an open inode. Must be closed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeHandle(pub u64);

/// Attribute types the scanner enumerates directly. `$STANDARD_INFORMATION`
/// and `$SECURITY_DESCRIPTOR` are fetched through their own trait methods
/// rather than through `enumerate_attributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrType {
    Data,
    ReparsePoint,
}

/// Raw `$STANDARD_INFORMATION` timestamps, FILETIME units (spec §3).
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTimes {
    pub creation_time: u64,
    pub last_write_time: u64,
    pub last_access_time: u64,
}

/// One enumerated attribute, as handed back by `enumerate_attributes`.
#[derive(Debug, Clone)]
pub struct AttrInfo {
    pub attr_type: AttrType,
    /// `None` for the default unnamed stream.
    pub name: Option<String>,
    /// The attribute's payload length, resident or not — this is always the
    /// value `attr_get_attribute_value_length` would report, never the
    /// allocated or compressed size.
    pub value_len: u64,
}

impl Default for AttrInfo {
    fn default() -> Self {
        AttrInfo {
            attr_type: AttrType::Data,
            name: None,
            value_len: 0,
        }
    }
}

/// Win32/DOS/POSIX naming of one `readdir` entry, per NTFS `$FILE_NAME`
/// namespace rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameType {
    Posix,
    Win32,
    Dos,
    Win32AndDos,
}

/// One entry yielded by `readdir`, already transcoded to the host's
/// multibyte encoding.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub mft_reference: MftReference,
    pub file_name: String,
    pub name_type: NameType,
    pub is_directory: bool,
}

/// The NTFS platform operations the scanner depends on (spec §6.1). All
/// methods are fallible; no caching is assumed — callers that want caching
/// (e.g. an MFT record cache) layer it on top.
pub trait NtfsVolumeDriver: Send + Sync {
    fn unmount(&self);

    fn open_inode(&self, reference: MftReference) -> Result<InodeHandle, WimError>;
    fn close_inode(&self, handle: InodeHandle);

    /// Windows `FILE_ATTRIBUTE_*` flags from `$STANDARD_INFORMATION`.
    fn file_attributes(&self, handle: InodeHandle) -> Result<u32, WimError>;

    /// Creation/last-write/last-access timestamps from `$STANDARD_INFORMATION`.
    fn file_times(&self, handle: InodeHandle) -> Result<RawTimes, WimError>;

    /// Fetches the raw `SECURITY_DESCRIPTOR` bytes into `buf`, growing it to
    /// fit if the caller's buffer is too small. Returns the descriptor's
    /// true length.
    fn security_descriptor(&self, handle: InodeHandle, buf: &mut Vec<u8>) -> Result<usize, WimError>;

    fn enumerate_attributes(
        &self,
        handle: InodeHandle,
        attr_type: AttrType,
    ) -> Result<Vec<AttrInfo>, WimError>;

    /// Reads `buf.len()` bytes of `attr`'s value starting at `offset`.
    /// Returns the number of bytes actually read; a short read that isn't
    /// at end-of-attribute is the caller's problem to detect.
    fn read_attribute_at(
        &self,
        handle: InodeHandle,
        attr: &AttrInfo,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, WimError>;

    /// The LCN of the first allocated extent of `attr`, or `None` if the
    /// attribute is resident or its first run is a hole.
    fn first_run_lcn(&self, handle: InodeHandle, attr: &AttrInfo) -> Result<Option<u64>, WimError>;

    /// Walks directory entries in on-disk order, invoking `sink` for each.
    /// `sink` returning `ControlFlow::Break` stops the walk early.
    fn readdir(
        &self,
        handle: InodeHandle,
        sink: &mut dyn FnMut(DirEntry) -> ControlFlow<()>,
    ) -> Result<(), WimError>;
}

struct Inner {
    driver: Box<dyn NtfsVolumeDriver>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.driver.unmount();
    }
}

/// A reference-counted, read-only NTFS volume handle (C1).
///
/// Cloning increments the share count; the last clone dropped unmounts the
/// volume. `Arc`'s strong count is already atomic, so sharing a `Volume`
/// across the hashing/writing threads described in spec §5 needs no extra
/// synchronization here.
#[derive(Clone)]
pub struct Volume(Arc<Inner>);

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("refs", &Arc::strong_count(&self.0))
            .finish()
    }
}

impl Volume {
    /// Wraps an already-mounted driver. The platform-specific mount call
    /// itself is the caller's responsibility (it lives outside this crate);
    /// a failure there should be reported as a `WimError::Ntfs` before this
    /// is ever called.
    pub fn new(driver: impl NtfsVolumeDriver + 'static) -> Self {
        Volume(Arc::new(Inner {
            driver: Box::new(driver),
        }))
    }

    /// Attempts to mount via `open`, wrapping the result. Exists mainly so
    /// `open`'s error can be folded into the `MountFailed` condition spec'd
    /// for C1 without requiring callers to match on it themselves.
    pub fn mount_readonly<D, F>(open: F) -> Result<Self, WimError>
    where
        D: NtfsVolumeDriver + 'static,
        F: FnOnce() -> Result<D, WimError>,
    {
        let driver = open().map_err(|e| WimError::ntfs("<volume>", format!("mount failed: {e}")))?;
        Ok(Self::new(driver))
    }

    pub(crate) fn driver(&self) -> &dyn NtfsVolumeDriver {
        &*self.0.driver
    }

    /// Identity used by blob-location equality (spec §6.3): two volumes are
    /// the same volume iff they share the underlying `Arc`.
    pub fn is_same_volume(&self, other: &Volume) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
pub mod mock {
    //! A deterministic in-memory `NtfsVolumeDriver`, standing in for a real
    //! platform library in tests. Not part of the public API.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockAttr {
        pub info: AttrInfo,
        pub data: Vec<u8>,
        pub lcn: Option<u64>,
    }

    #[derive(Default)]
    pub struct MockInode {
        pub file_attributes: u32,
        pub times: RawTimes,
        pub security_descriptor: Option<Vec<u8>>,
        pub attrs: Vec<MockAttr>,
        pub children: Vec<DirEntry>,
    }

    pub struct MockVolume {
        inodes: Mutex<HashMap<u64, MockInode>>,
        pub unmounted: Mutex<bool>,
    }

    impl MockVolume {
        pub fn new() -> Self {
            MockVolume {
                inodes: Mutex::new(HashMap::new()),
                unmounted: Mutex::new(false),
            }
        }

        pub fn insert(&self, mft_no: u64, inode: MockInode) {
            self.inodes.lock().unwrap().insert(mft_no, inode);
        }
    }

    impl NtfsVolumeDriver for MockVolume {
        fn unmount(&self) {
            *self.unmounted.lock().unwrap() = true;
        }

        fn open_inode(&self, reference: MftReference) -> Result<InodeHandle, WimError> {
            if self.inodes.lock().unwrap().contains_key(&reference.mft_number) {
                Ok(InodeHandle(reference.mft_number))
            } else {
                Err(WimError::ntfs(
                    format!("mft:{}", reference.mft_number),
                    "no such inode",
                ))
            }
        }

        fn close_inode(&self, _handle: InodeHandle) {}

        fn file_attributes(&self, handle: InodeHandle) -> Result<u32, WimError> {
            let inodes = self.inodes.lock().unwrap();
            Ok(inodes[&handle.0].file_attributes)
        }

        fn file_times(&self, handle: InodeHandle) -> Result<RawTimes, WimError> {
            let inodes = self.inodes.lock().unwrap();
            Ok(inodes[&handle.0].times)
        }

        fn security_descriptor(
            &self,
            handle: InodeHandle,
            buf: &mut Vec<u8>,
        ) -> Result<usize, WimError> {
            let inodes = self.inodes.lock().unwrap();
            match &inodes[&handle.0].security_descriptor {
                Some(sd) => {
                    buf.clear();
                    buf.extend_from_slice(sd);
                    Ok(sd.len())
                }
                None => Ok(0),
            }
        }

        fn enumerate_attributes(
            &self,
            handle: InodeHandle,
            attr_type: AttrType,
        ) -> Result<Vec<AttrInfo>, WimError> {
            let inodes = self.inodes.lock().unwrap();
            Ok(inodes[&handle.0]
                .attrs
                .iter()
                .filter(|a| a.info.attr_type == attr_type)
                .map(|a| a.info.clone())
                .collect())
        }

        fn read_attribute_at(
            &self,
            handle: InodeHandle,
            attr: &AttrInfo,
            offset: u64,
            buf: &mut [u8],
        ) -> Result<usize, WimError> {
            let inodes = self.inodes.lock().unwrap();
            let found = inodes[&handle.0]
                .attrs
                .iter()
                .find(|a| a.info.attr_type == attr.attr_type && a.info.name == attr.name)
                .ok_or_else(|| WimError::ntfs("<mock>", "attribute not found"))?;
            let offset = offset as usize;
            if offset >= found.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(found.data.len() - offset);
            buf[..n].copy_from_slice(&found.data[offset..offset + n]);
            Ok(n)
        }

        fn first_run_lcn(&self, handle: InodeHandle, attr: &AttrInfo) -> Result<Option<u64>, WimError> {
            let inodes = self.inodes.lock().unwrap();
            let found = inodes[&handle.0]
                .attrs
                .iter()
                .find(|a| a.info.attr_type == attr.attr_type && a.info.name == attr.name)
                .ok_or_else(|| WimError::ntfs("<mock>", "attribute not found"))?;
            Ok(found.lcn)
        }

        fn readdir(
            &self,
            handle: InodeHandle,
            sink: &mut dyn FnMut(DirEntry) -> ControlFlow<()>,
        ) -> Result<(), WimError> {
            let inodes = self.inodes.lock().unwrap();
            for entry in &inodes[&handle.0].children {
                if sink(entry.clone()).is_break() {
                    break;
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockVolume;
    use super::*;
    use std::sync::Arc;

    #[test]
    fn clone_shares_the_same_underlying_handle() {
        let volume = Volume::new(MockVolume::new());
        let clone = volume.clone();
        assert!(volume.is_same_volume(&clone));

        let other = Volume::new(MockVolume::new());
        assert!(!volume.is_same_volume(&other));
    }

    #[test]
    fn unmount_happens_once_on_last_drop() {
        let mock = Arc::new(MockVolume::new());

        struct Forwarding(Arc<MockVolume>);
        impl NtfsVolumeDriver for Forwarding {
            fn unmount(&self) {
                self.0.unmount();
            }
            fn open_inode(&self, r: MftReference) -> Result<InodeHandle, WimError> {
                self.0.open_inode(r)
            }
            fn close_inode(&self, h: InodeHandle) {
                self.0.close_inode(h)
            }
            fn file_attributes(&self, h: InodeHandle) -> Result<u32, WimError> {
                self.0.file_attributes(h)
            }
            fn file_times(&self, h: InodeHandle) -> Result<RawTimes, WimError> {
                self.0.file_times(h)
            }
            fn security_descriptor(&self, h: InodeHandle, buf: &mut Vec<u8>) -> Result<usize, WimError> {
                self.0.security_descriptor(h, buf)
            }
            fn enumerate_attributes(
                &self,
                h: InodeHandle,
                t: AttrType,
            ) -> Result<Vec<AttrInfo>, WimError> {
                self.0.enumerate_attributes(h, t)
            }
            fn read_attribute_at(
                &self,
                h: InodeHandle,
                attr: &AttrInfo,
                offset: u64,
                buf: &mut [u8],
            ) -> Result<usize, WimError> {
                self.0.read_attribute_at(h, attr, offset, buf)
            }
            fn first_run_lcn(&self, h: InodeHandle, attr: &AttrInfo) -> Result<Option<u64>, WimError> {
                self.0.first_run_lcn(h, attr)
            }
            fn readdir(
                &self,
                h: InodeHandle,
                sink: &mut dyn FnMut(DirEntry) -> ControlFlow<()>,
            ) -> Result<(), WimError> {
                self.0.readdir(h, sink)
            }
        }

        let volume = Volume::new(Forwarding(mock.clone()));
        let clone = volume.clone();
        assert!(!*mock.unmounted.lock().unwrap());

        drop(volume);
        assert!(!*mock.unmounted.lock().unwrap());

        drop(clone);
        assert!(*mock.unmounted.lock().unwrap());
    }
}
