//! In-memory NTFS image metadata: capture (volume → dentry tree) and the
//! metadata resource codec (dentry tree ↔ bytes).

pub mod blob;
pub mod dentry;
pub mod dosname;
pub mod inode;
pub mod metadata;
pub mod scanner;
pub mod security;
pub mod volume;

pub use blob::BlobDescriptor;
pub use dentry::{Dentry, DentryArena, DentryId};
pub use inode::{Inode, InodeId, InodeTable, Stream, StreamType};
pub use scanner::{build_tree, CaptureParams, ImageMetadata};
pub use security::SecurityDescriptorSet;
pub use volume::{MftReference, NtfsVolumeDriver, Volume};
