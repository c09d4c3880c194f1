//! Directory tree builder (C6) — walks a mounted volume into a dentry tree.

use std::ops::ControlFlow;

use wim_core::WimError;

use crate::blob::BlobDescriptor;
use crate::dentry::{Dentry, DentryArena, DentryId};
use crate::dosname::DosNameIndex;
use crate::inode::{
    FileTimes, InodeId, InodeTable, Stream, StreamType, FILE_ATTRIBUTE_ENCRYPTED,
    FILE_ATTRIBUTE_REPARSE_POINT, REPARSE_FLAG_NOT_FIXED,
};
use crate::security::SecurityDescriptorSet;
use crate::volume::{AttrInfo, AttrType, DirEntry, InodeHandle, MftReference, NameType, Volume};

/// `IO_REPARSE_TAG_SYMLINK`, the only reparse tag the RPFIX policy cares
/// about: a full-volume capture rewrites nothing, so a symlink's target is
/// already consistent with the captured image and its `NOT_FIXED` bit can
/// be cleared.
pub const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Per-call capture policy (spec C6): the knobs that would otherwise be
/// global configuration, scoped down to one `build_tree` invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureParams {
    /// Clear the reparse `NOT_FIXED` bit on symlinks (full-volume capture
    /// makes paths self-consistent).
    pub rpfix: bool,
    /// Skip fetching security descriptors entirely.
    pub no_acls: bool,
    /// Fail capture outright on an encrypted file instead of skipping it.
    pub strict_unsupported_exclusion: bool,
}

/// Decides whether a path is excluded from capture. Supplied by the caller;
/// out of scope here is the matcher's own rule language.
pub trait PathMatcher {
    fn is_excluded(&self, path: &str) -> Result<bool, WimError>;
}

/// A matcher that never excludes anything.
pub struct NoExclusions;

impl PathMatcher for NoExclusions {
    fn is_excluded(&self, _path: &str) -> Result<bool, WimError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Ok,
    Excluded,
    Unsupported,
}

pub trait CaptureProgress {
    fn report(&mut self, path: &str, event: ProgressEvent);
}

/// A progress sink that does nothing.
pub struct NoProgress;

impl CaptureProgress for NoProgress {
    fn report(&mut self, _path: &str, _event: ProgressEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Propagate,
}

/// Lets the caller downgrade a per-entry capture error to "skip and keep
/// going" instead of aborting the whole walk.
pub trait CaptureErrorHook {
    fn on_error(&mut self, path: &str, error: &WimError) -> ErrorAction;
}

/// A hook that always propagates.
pub struct AbortOnError;

impl CaptureErrorHook for AbortOnError {
    fn on_error(&mut self, _path: &str, _error: &WimError) -> ErrorAction {
        ErrorAction::Propagate
    }
}

/// The in-memory result of a capture or a metadata-resource read (spec §3,
/// "Image Metadata").
pub struct ImageMetadata {
    pub security_data: SecurityDescriptorSet,
    pub dentries: DentryArena,
    pub inodes: InodeTable,
    pub unhashed_blobs: Vec<BlobDescriptor>,
}

/// Walks `volume` from `root_mft_ref`, producing a populated [`ImageMetadata`].
pub fn build_tree(
    volume: &Volume,
    root_mft_ref: MftReference,
    params: &CaptureParams,
    path_matcher: &dyn PathMatcher,
    progress: &mut dyn CaptureProgress,
    error_hook: &mut dyn CaptureErrorHook,
) -> Result<ImageMetadata, WimError> {
    let mut builder = Builder {
        volume,
        params,
        path_matcher,
        progress,
        error_hook,
        inodes: InodeTable::new(),
        dentries: DentryArena::new(),
        security: SecurityDescriptorSet::new(),
        unhashed_blobs: Vec::new(),
    };

    if let Some(root_id) = builder.scan_inode("", "", root_mft_ref)? {
        builder.dentries.set_root(root_id);
    }

    Ok(ImageMetadata {
        security_data: builder.security,
        dentries: builder.dentries,
        inodes: builder.inodes,
        unhashed_blobs: builder.unhashed_blobs,
    })
}

struct Builder<'a> {
    volume: &'a Volume,
    params: &'a CaptureParams,
    path_matcher: &'a dyn PathMatcher,
    progress: &'a mut dyn CaptureProgress,
    error_hook: &'a mut dyn CaptureErrorHook,
    inodes: InodeTable,
    dentries: DentryArena,
    security: SecurityDescriptorSet,
    unhashed_blobs: Vec<BlobDescriptor>,
}

impl<'a> Builder<'a> {
    /// Steps 1–12 of the capture algorithm for one inode, reached via
    /// `path`/`basename` from its parent (or the empty path, for the root).
    fn scan_inode(
        &mut self,
        path: &str,
        basename: &str,
        mft_ref: MftReference,
    ) -> Result<Option<DentryId>, WimError> {
        // 1. Exclusion check.
        if self.path_matcher.is_excluded(path)? {
            self.progress.report(path, ProgressEvent::Excluded);
            return Ok(None);
        }

        // 2. Open inode.
        let handle = self
            .volume
            .driver()
            .open_inode(mft_ref)
            .map_err(|e| WimError::ntfs(path, format!("open failed: {e}")))?;

        let result = self.scan_opened_inode(path, basename, mft_ref, handle);
        self.volume.driver().close_inode(handle);
        result
    }

    fn scan_opened_inode(
        &mut self,
        path: &str,
        basename: &str,
        mft_ref: MftReference,
        handle: InodeHandle,
    ) -> Result<Option<DentryId>, WimError> {
        // 3. Read $FILE_ATTRIBUTES.
        let attributes = self
            .volume
            .driver()
            .file_attributes(handle)
            .map_err(|e| WimError::ntfs(path, format!("read attributes failed: {e}")))?;

        // 4. Encrypted check.
        if attributes & FILE_ATTRIBUTE_ENCRYPTED != 0 {
            if self.params.strict_unsupported_exclusion {
                return Err(WimError::UnsupportedFile {
                    path: path.to_string(),
                    reason: "encrypted file".to_string(),
                });
            }
            self.progress.report(path, ProgressEvent::Unsupported);
            return Ok(None);
        }

        // 5. Allocate or share the dentry's inode.
        let (inode_id, is_new) = self.inodes.new_dentry(mft_ref.mft_number);
        let dentry_id = self
            .dentries
            .alloc(Dentry::new(basename.to_string(), inode_id));

        if is_new {
            self.populate_inode(path, handle, mft_ref.mft_number, inode_id, attributes)?;
        }

        // 11. Recurse.
        if self.inodes.get(inode_id).is_directory() {
            self.recurse_directory(path, handle, dentry_id)?;
        }

        // 12. Progress.
        self.progress.report(path, ProgressEvent::Ok);
        Ok(Some(dentry_id))
    }

    /// Steps 6–10: fills in a freshly allocated inode's timestamps,
    /// attributes, streams, reparse tag, and security descriptor.
    fn populate_inode(
        &mut self,
        path: &str,
        handle: InodeHandle,
        mft_no: u64,
        inode_id: InodeId,
        attributes: u32,
    ) -> Result<(), WimError> {
        // 6. Timestamps and attributes.
        let times = self
            .volume
            .driver()
            .file_times(handle)
            .map_err(|e| WimError::ntfs(path, format!("read timestamps failed: {e}")))?;
        let inode = self.inodes.get_mut(inode_id);
        inode.attributes = attributes;
        inode.times = FileTimes {
            creation_time: times.creation_time,
            last_write_time: times.last_write_time,
            last_access_time: times.last_access_time,
        };

        // 7. Reparse-point streams.
        if attributes & FILE_ATTRIBUTE_REPARSE_POINT != 0 {
            self.inodes.get_mut(inode_id).reparse_flags = REPARSE_FLAG_NOT_FIXED;
            let reparse_attrs = self
                .volume
                .driver()
                .enumerate_attributes(handle, AttrType::ReparsePoint)
                .map_err(|e| WimError::ntfs(path, format!("enumerate reparse point failed: {e}")))?;
            for attr in reparse_attrs {
                let stream =
                    self.scan_attribute(path, handle, mft_no, StreamType::ReparsePoint, &attr)?;
                let mut tag_bytes = [0u8; 4];
                let n = self
                    .volume
                    .driver()
                    .read_attribute_at(handle, &attr, 0, &mut tag_bytes)
                    .map_err(|e| WimError::ntfs(path, format!("read reparse tag failed: {e}")))?;
                if n < 4 {
                    return Err(WimError::InvalidReparseData {
                        path: path.to_string(),
                        size: attr.value_len as usize,
                    });
                }
                let reparse_tag = u32::from_le_bytes(tag_bytes);
                let inode = self.inodes.get_mut(inode_id);
                inode.reparse_tag = Some(reparse_tag);
                inode.streams.push(stream);
            }
        }

        // 8. Data streams.
        let data_attrs = self
            .volume
            .driver()
            .enumerate_attributes(handle, AttrType::Data)
            .map_err(|e| WimError::ntfs(path, format!("enumerate data streams failed: {e}")))?;
        for attr in data_attrs {
            let stream = self.scan_attribute(path, handle, mft_no, StreamType::Data, &attr)?;
            self.inodes.get_mut(inode_id).streams.push(stream);
        }

        // 9. Reparse fixup flag.
        if self.params.rpfix {
            let inode = self.inodes.get_mut(inode_id);
            if inode.reparse_tag == Some(IO_REPARSE_TAG_SYMLINK) {
                inode.reparse_flags &= !REPARSE_FLAG_NOT_FIXED;
            }
        }

        // 10. Security descriptor.
        if !self.params.no_acls {
            let sd = self.fetch_security_descriptor(path, handle)?;
            if !sd.is_empty() {
                let id = self.security.add(&sd);
                self.inodes.get_mut(inode_id).security_id = id;
            }
        }

        self.inodes.get(inode_id).check_invariants()?;

        Ok(())
    }

    /// Shared per-attribute scan for steps 7 and 8.
    fn scan_attribute(
        &mut self,
        path: &str,
        handle: InodeHandle,
        mft_no: u64,
        stream_type: StreamType,
        attr: &AttrInfo,
    ) -> Result<Stream, WimError> {
        let mut size = attr.value_len;
        if stream_type == StreamType::ReparsePoint {
            if size < 8 {
                return Err(WimError::InvalidReparseData {
                    path: path.to_string(),
                    size: size as usize,
                });
            }
            size -= 8;
        }

        let blob = if size > 0 {
            let lcn = self
                .volume
                .driver()
                .first_run_lcn(handle, attr)
                .map_err(|e| WimError::ntfs(path, format!("resolve first run failed: {e}")))?;
            let blob = BlobDescriptor::in_ntfs_volume(
                self.volume.clone(),
                mft_no,
                attr.attr_type,
                attr.name.clone(),
                size,
                lcn.unwrap_or(0),
            );
            self.unhashed_blobs.push(blob.clone());
            Some(blob)
        } else {
            None
        };

        Ok(Stream {
            stream_type,
            name: attr.name.clone(),
            blob,
        })
    }

    fn fetch_security_descriptor(
        &self,
        path: &str,
        handle: InodeHandle,
    ) -> Result<Vec<u8>, WimError> {
        let mut buf = vec![0u8; 4096];
        let needed = self
            .volume
            .driver()
            .security_descriptor(handle, &mut buf)
            .map_err(|e| WimError::ntfs(path, format!("read security descriptor failed: {e}")))?;
        if needed > buf.len() {
            buf.resize(needed, 0);
            let needed = self
                .volume
                .driver()
                .security_descriptor(handle, &mut buf)
                .map_err(|e| WimError::ntfs(path, format!("read security descriptor failed: {e}")))?;
            buf.truncate(needed);
        } else {
            buf.truncate(needed);
        }
        Ok(buf)
    }

    fn recurse_directory(
        &mut self,
        path: &str,
        parent_handle: InodeHandle,
        parent_dentry: DentryId,
    ) -> Result<(), WimError> {
        let mut dos_names = DosNameIndex::new();
        let mut propagate: Option<WimError> = None;

        self.volume
            .driver()
            .readdir(parent_handle, &mut |entry: DirEntry| {
                if entry.file_name == "." || entry.file_name == ".." {
                    return ControlFlow::Continue(());
                }

                if entry.name_type == NameType::Dos {
                    dos_names.insert(entry.mft_reference.mft_number, entry.file_name.clone());
                    return ControlFlow::Continue(());
                }

                let win32_and_dos = entry.name_type == NameType::Win32AndDos;
                if win32_and_dos {
                    dos_names.insert(entry.mft_reference.mft_number, entry.file_name.clone());
                }

                let child_path = if path.is_empty() {
                    format!("/{}", entry.file_name)
                } else {
                    format!("{path}/{}", entry.file_name)
                };

                match self.scan_inode(&child_path, &entry.file_name, entry.mft_reference) {
                    Ok(Some(child_id)) => {
                        self.dentries.get_mut(child_id).flags.is_win32_name = win32_and_dos;
                        self.dentries.attach_child(parent_dentry, child_id);
                        ControlFlow::Continue(())
                    }
                    Ok(None) => ControlFlow::Continue(()),
                    Err(e) => match self.error_hook.on_error(&child_path, &e) {
                        ErrorAction::Continue => ControlFlow::Continue(()),
                        ErrorAction::Propagate => {
                            propagate = Some(e);
                            ControlFlow::Break(())
                        }
                    },
                }
            })
            .map_err(|e| WimError::ntfs(path, format!("readdir failed: {e}")))?;

        if let Some(e) = propagate {
            return Err(e);
        }

        let children = self.dentries.get(parent_dentry).children.clone();
        for child in children {
            if !self.dentries.get(child).flags.is_win32_name {
                continue;
            }
            let mft_no = self.inodes.get(self.dentries.get(child).inode).mft_no;
            match dos_names.lookup(mft_no) {
                Some(name) => self.dentries.get_mut(child).short_name = name.to_string(),
                None => log::warn!(
                    "Win32-named dentry '{}' has no DOS pair",
                    self.dentries.get(child).long_name
                ),
            }
        }
        dos_names.drain();

        Ok(())
    }
}
