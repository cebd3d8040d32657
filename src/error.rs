use thiserror::Error;

use crate::blob::Mechanism;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure surfaced by the wrapping core.
///
/// Backend failures are classified once, at the HTTP edge, and then
/// travel to the caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("wrapper is not configured")]
    NotConfigured,
    #[error("wrapper is closed")]
    AlreadyClosed,
    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("backend is throttling requests: {0}")]
    RateLimited(String),
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("permanent backend failure: {0}")]
    Permanent(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend failed to decrypt: {0}")]
    DecryptionFailure(String),
    #[error("message authentication failed")]
    AuthTagMismatch,
    #[error("unsupported mechanism: {0}")]
    UnsupportedMechanism(String),
    #[error("operation canceled")]
    Canceled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("secure randomness unavailable: {0}")]
    RandomnessUnavailable(String),
    #[error("cipher failure: {0}")]
    CipherFailure(String),
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },
    #[error("invalid iv size: expected {expected} bytes, got {actual}")]
    InvalidIvSize { expected: usize, actual: usize },
    #[error("malformed blob: {0}")]
    MalformedBlob(String),
}

/// Payload-free classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingConfig,
    InvalidConfig,
    NotConfigured,
    AlreadyClosed,
    Unauthorized,
    KeyNotFound,
    RateLimited,
    Transient,
    Permanent,
    BackendUnavailable,
    DecryptionFailure,
    AuthTagMismatch,
    UnsupportedMechanism,
    Canceled,
    Internal,
    RandomnessUnavailable,
    CipherFailure,
    InvalidKeySize,
    InvalidIvSize,
    MalformedBlob,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingConfig(_) => ErrorKind::MissingConfig,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::NotConfigured => ErrorKind::NotConfigured,
            Error::AlreadyClosed => ErrorKind::AlreadyClosed,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::KeyNotFound(_) => ErrorKind::KeyNotFound,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Permanent(_) => ErrorKind::Permanent,
            Error::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Error::DecryptionFailure(_) => ErrorKind::DecryptionFailure,
            Error::AuthTagMismatch => ErrorKind::AuthTagMismatch,
            Error::UnsupportedMechanism(_) => ErrorKind::UnsupportedMechanism,
            Error::Canceled => ErrorKind::Canceled,
            Error::Internal(_) => ErrorKind::Internal,
            Error::RandomnessUnavailable(_) => ErrorKind::RandomnessUnavailable,
            Error::CipherFailure(_) => ErrorKind::CipherFailure,
            Error::InvalidKeySize { .. } => ErrorKind::InvalidKeySize,
            Error::InvalidIvSize { .. } => ErrorKind::InvalidIvSize,
            Error::MalformedBlob(_) => ErrorKind::MalformedBlob,
        }
    }

    /// Whether the host may reasonably retry (after backoff). The core
    /// itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::Transient | ErrorKind::BackendUnavailable
        )
    }

    pub(crate) fn unsupported(mechanism: Mechanism, backend: &str) -> Self {
        Error::UnsupportedMechanism(format!("{mechanism} is not supported by the {backend} backend"))
    }
}
