use thiserror::Error;

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors that can occur when working with archives, disk images and filesystems
#[derive(Debug, Error)]
pub enum ContainerError {
    /// I/O error occurred while reading or writing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or damaged container structure
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Operation not supported by this container
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Parse error at specific offset
    #[error("Parse error at offset {offset}: {message}")]
    ParseError {
        /// Byte offset where error occurred
        offset: u64,
        /// Error message
        message: String,
    },

    /// Archive-related error
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// Filesystem-related error
    #[error("Filesystem error: {0}")]
    FileSystemError(String),

    /// Stream is not a container that can be opened
    #[error(transparent)]
    Identify(#[from] IdentifyError),

    /// Error reported by the ZIP library
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// File or entry not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// File or entry already exists
    #[error("File exists: {0}")]
    FileExists(String),

    /// Disk is full, no free space
    #[error("Disk full: no free space available")]
    DiskFull,

    /// Invalid filename
    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    /// Write attempted on a read-only container
    #[error("Container is read-only: {0}")]
    ReadOnly(String),

    /// A transfer job already holds the container
    #[error("Container is busy: {0}")]
    Busy(String),

    /// Node handle no longer refers to a live node
    #[error("Stale node handle")]
    StaleNode,

    /// Node was closed while holding unsaved changes
    #[error("Unsaved changes in {0}")]
    UnsavedChanges(String),

    /// Internal invariant was violated; data may be at risk
    #[error("Invariant violation: {0}")]
    Invariant(String),
}

impl ContainerError {
    /// Create a parse error with context
    pub fn parse<S: Into<String>>(offset: u64, message: S) -> Self {
        ContainerError::ParseError {
            offset,
            message: message.into(),
        }
    }

    /// Create an invalid format error
    pub fn invalid_format<S: Into<String>>(message: S) -> Self {
        ContainerError::InvalidFormat(message.into())
    }

    /// Create an archive error
    pub fn archive<S: Into<String>>(message: S) -> Self {
        ContainerError::ArchiveError(message.into())
    }

    /// Create a filesystem error
    pub fn filesystem<S: Into<String>>(message: S) -> Self {
        ContainerError::FileSystemError(message.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        ContainerError::Unsupported(message.into())
    }

    /// Create an invariant violation error
    pub fn invariant<S: Into<String>>(message: S) -> Self {
        ContainerError::Invariant(message.into())
    }
}

/// Reasons a stream could not be turned into an opened container
///
/// None of these are fatal to the caller: the stream is simply treated as an
/// ordinary opaque file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentifyError {
    /// Stream has no data and the extension does not allow an empty container
    #[error("Stream is empty")]
    Empty,

    /// Structure did not match any supported format
    #[error("Unrecognized format")]
    Unrecognized,

    /// Format was recognized, but the container could not be opened
    #[error("Unable to open {kind}: {reason}")]
    OpenFailed {
        /// Name of the recognized format
        kind: String,
        /// Why opening failed
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ContainerError::FileNotFound("GAMES/LODE.RUNNER".to_string());
        assert_eq!(err.to_string(), "File not found: GAMES/LODE.RUNNER");
    }

    #[test]
    fn test_parse_error() {
        let err = ContainerError::parse(48, "Bad record signature");
        assert_eq!(
            err.to_string(),
            "Parse error at offset 48: Bad record signature"
        );
    }

    #[test]
    fn test_identify_error_display() {
        let err = IdentifyError::OpenFailed {
            kind: "ZIP".to_string(),
            reason: "truncated central directory".to_string(),
        };
        assert_eq!(err.to_string(), "Unable to open ZIP: truncated central directory");
    }
}
