//! Error types for incache operations

use thiserror::Error;

/// Source resolution and resource I/O errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Source not found: {uri}")]
    NotFound { uri: String },

    #[error("Failed to resolve {uri}: {reason}")]
    ResolutionFailed { uri: String, reason: String },

    #[error("Failed to read {uri}: {reason}")]
    ReadFailed { uri: String, reason: String },

    #[error("Failed to write {uri}: {reason}")]
    WriteFailed { uri: String, reason: String },

    #[error("Failed to delete {uri}: {reason}")]
    DeleteFailed { uri: String, reason: String },
}

/// Cache storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Cache target for {uri} is not writable")]
    NotWritable { uri: String },

    #[error("Corrupt cached entry: {reason}")]
    Corrupt { reason: String },

    #[error("Serialization failed: {reason}")]
    SerializationFailed { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors raised while fetching a fragment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Fetch of {uri} failed: {reason}")]
    Failed { uri: String, reason: String },

    #[error("Malformed content at {uri}: {reason}")]
    Malformed { uri: String, reason: String },

    #[error("Background load of {uri} ended without a result")]
    LoadAborted { uri: String },
}

/// Fragment byte stream decoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Missing or invalid stream header")]
    BadHeader,

    #[error("Unsupported stream version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown event tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("Stream truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("Invalid UTF-8 at offset {offset}")]
    InvalidUtf8 { offset: usize },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Caller misuse of the include protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("stream() called for {uri} without a prior load() in parallel mode")]
    StreamWithoutLoad { uri: String },
}

/// Master error type for all incache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IncludeError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A fetch failure on the synchronous include path, wrapping its cause.
    #[error("Including {uri} failed: {cause}")]
    Cascading { uri: String, cause: Box<IncludeError> },
}

impl IncludeError {
    /// Wrap an error raised while including `uri`.
    pub fn cascading(uri: impl Into<String>, cause: IncludeError) -> Self {
        Self::Cascading {
            uri: uri.into(),
            cause: Box::new(cause),
        }
    }

    /// The innermost error, looking through any `Cascading` wrappers.
    pub fn root_cause(&self) -> &IncludeError {
        match self {
            Self::Cascading { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Returns true for caller misuse that must never be tolerated.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self.root_cause(), Self::Protocol(_))
    }
}

/// Result type alias for incache operations.
pub type IncludeResult<T> = Result<T, IncludeError>;

// =============================================================================
// TESTS
// =============================================================================
