use thiserror::Error;

/// Error kinds shared by the volume scanner and the metadata resource codec.
///
/// Variants carry the context spec'd for user-visible diagnostics: an
/// offending path for capture-side errors, a byte offset for metadata decode
/// errors.
#[derive(Debug, Error)]
pub enum WimError {
    #[error("NTFS error at '{path}': {message}")]
    Ntfs { path: String, message: String },

    #[error("invalid reparse point data at '{path}': {size} bytes (minimum 8)")]
    InvalidReparseData { path: String, size: usize },

    #[error("invalid metadata resource at offset {offset}: {message}")]
    InvalidMetadataResource { offset: usize, message: String },

    #[error("unsupported file at '{path}': {reason}")]
    UnsupportedFile { path: String, reason: String },

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ReadError {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("unexpected end of file")]
    UnexpectedEndOfFile,

    #[error("decompression error: {0}")]
    DecompressionError(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WimError {
    pub fn ntfs(path: impl Into<String>, message: impl Into<String>) -> Self {
        WimError::Ntfs {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_metadata(offset: usize, message: impl Into<String>) -> Self {
        WimError::InvalidMetadataResource {
            offset,
            message: message.into(),
        }
    }
}
