//! # Error Handling
//!
//! One error type for every Kumora operation. All failure modes are explicit
//! returns; nothing raises out-of-band. Validation failures (key length,
//! value size, quotas, admission) are ordinary errors the dispatcher turns
//! into protocol replies; only startup-time inability to open the data
//! directory or the active segment is fatal to the process.

use thiserror::Error;

/// Result type alias for Kumora operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Kumora
#[derive(Error, Debug)]
pub enum Error {
    // Engine validation
    #[error("invalid key length")]
    InvalidKey,

    #[error("value too large")]
    ValueTooLarge,

    #[error("owner quota exceeded")]
    OwnerQuotaExceeded,

    #[error("admission rejected")]
    AdmissionRejected,

    // SSD tier
    #[error("ssd write rate limited")]
    SsdRateLimited,

    #[error("ssd tier full")]
    SsdFull,

    #[error("ssd io: {message}")]
    SsdIo { message: String },

    // Policy parameters
    #[error("params file not found")]
    ParamsNotFound,

    #[error("invalid schema")]
    ParamsInvalidSchema,

    // Artifact layer
    #[error("artifact error: {message}")]
    Artifact { message: String },

    // System
    #[error("io error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    /// Stable code for monitoring and log correlation.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidKey => "INVALID_KEY",
            Error::ValueTooLarge => "VALUE_TOO_LARGE",
            Error::OwnerQuotaExceeded => "OWNER_QUOTA_EXCEEDED",
            Error::AdmissionRejected => "ADMISSION_REJECTED",
            Error::SsdRateLimited => "SSD_RATE_LIMITED",
            Error::SsdFull => "SSD_FULL",
            Error::SsdIo { .. } => "SSD_IO",
            Error::ParamsNotFound => "PARAMS_NOT_FOUND",
            Error::ParamsInvalidSchema => "PARAMS_INVALID_SCHEMA",
            Error::Artifact { .. } => "ARTIFACT_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
        }
    }

    /// Whether retrying the same request later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::SsdRateLimited => true,
            Error::AdmissionRejected => true,
            Error::Io { .. } => false,
            Error::SsdIo { .. } => false,
            _ => true,
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}
