use thiserror::Error;

#[derive(Debug, Error)]
pub enum FirmctlError {
    #[error("Format error at offset {offset}: {reason}")]
    Format { offset: u64, reason: String },

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Out of bounds: {what} needs {length} bytes at offset {offset}, only {available} available")]
    OutOfBounds {
        what: String,
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("Ambiguous partition table: {0}")]
    AmbiguousPartition(String),

    #[error("Corrupt structure at offset {offset}: {reason}")]
    CorruptStructure { offset: u64, reason: String },

    #[error("{0}: No such file or directory")]
    PathNotFound(String),

    #[error("{0}: Not a directory")]
    NotADirectory(String),

    #[error("{0}: Not a regular file")]
    NotAFile(String),

    #[error("{0}: Too many levels of symbolic links")]
    TooManySymlinks(String),

    #[error("Verification failed: expected digest {expected}, got {actual}")]
    Verification { expected: String, actual: String },

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl FirmctlError {
    pub fn format(offset: u64, reason: impl Into<String>) -> Self {
        FirmctlError::Format {
            offset,
            reason: reason.into(),
        }
    }

    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        FirmctlError::CorruptStructure {
            offset,
            reason: reason.into(),
        }
    }

    pub fn out_of_bounds(what: impl Into<String>, offset: u64, length: u64, available: u64) -> Self {
        FirmctlError::OutOfBounds {
            what: what.into(),
            offset,
            length,
            available,
        }
    }

    /// Recover an error that crossed a `std::io::Read` boundary.
    pub fn from_io(err: std::io::Error) -> Self {
        match err.downcast::<FirmctlError>() {
            Ok(original) => original,
            Err(err) => FirmctlError::IoError(err),
        }
    }

    /// Distinct process exit status per error kind, for front ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            FirmctlError::Format { .. } => 10,
            FirmctlError::Signature(_) => 11,
            FirmctlError::OutOfBounds { .. } => 12,
            FirmctlError::AmbiguousPartition(_) => 13,
            FirmctlError::CorruptStructure { .. } => 14,
            FirmctlError::PathNotFound(_) => 2,
            FirmctlError::NotADirectory(_) => 20,
            FirmctlError::NotAFile(_) => 21,
            FirmctlError::TooManySymlinks(_) => 40,
            FirmctlError::Verification { .. } => 15,
            FirmctlError::NotSupported(_) => 16,
            FirmctlError::Configuration(_) => 78,
            FirmctlError::Io { .. } | FirmctlError::IoError(_) => 74,
        }
    }
}
