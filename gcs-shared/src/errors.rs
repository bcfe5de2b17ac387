//! Error taxonomy shared by every crate in the workspace.
//!
//! Errors cross the wire as 32-bit signed "hresults". The host matches on
//! these codes, so the mapping from error kind to hresult is part of the
//! protocol contract, not an implementation detail.

use thiserror::Error;

/// Result alias used throughout the workspace.
pub type GcsResult<T> = std::result::Result<T, GcsError>;

/// Catch-all failure.
pub const HR_UNEXPECTED: i32 = 0x8000_FFFF_u32 as i32;
/// Unknown message type or protocol version.
pub const HR_NOT_IMPLEMENTED: i32 = 0x8000_4001_u32 as i32;
/// Malformed payload or invalid identifier.
pub const HR_INVALID_ARGUMENT: i32 = 0x8007_0057_u32 as i32;
/// Container id not present in the registry.
pub const HR_SYSTEM_NOT_FOUND: i32 = 0xC037_010E_u32 as i32;
/// Container id already present in the registry.
pub const HR_SYSTEM_ALREADY_EXISTS: i32 = 0xC037_010F_u32 as i32;
/// Operation requires a stopped container.
pub const HR_SYSTEM_NOT_STOPPED: i32 = 0xC037_0109_u32 as i32;
/// Operation requires a running container.
pub const HR_SYSTEM_ALREADY_STOPPED: i32 = 0xC037_0110_u32 as i32;
/// Protocol negotiation failed.
pub const HR_UNSUPPORTED_PROTOCOL_VERSION: i32 = 0xC037_0121_u32 as i32;
/// Request body failed to decode.
pub const HR_INVALID_JSON: i32 = 0xC037_010D_u32 as i32;
/// Wait expired before the process exited.
pub const HR_TIMEOUT: i32 = 0xC037_0111_u32 as i32;

/// Error type for all agent and image-tooling operations.
///
/// Variants map 1:1 onto the wire taxonomy; anything without a dedicated
/// code surfaces as `Unexpected`.
#[derive(Error, Debug)]
pub enum GcsError {
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("container {0} does not exist")]
    ContainerNotFound(String),

    #[error("container {0} already exists")]
    ContainerAlreadyExists(String),

    #[error("container {0} is not stopped")]
    ContainerNotStopped(String),

    #[error("container {0} is already stopped")]
    ContainerAlreadyStopped(String),

    #[error("unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u32),

    #[error("invalid JSON payload: {context}")]
    InvalidJson {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Unexpected(String),
}

impl GcsError {
    /// Attach filesystem or socket context to an `io::Error`.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        GcsError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap a JSON decode failure with the payload it came from.
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        GcsError::InvalidJson {
            context: context.into(),
            source,
        }
    }

    /// The 32-bit signed code transmitted on the wire for this error.
    pub fn hresult(&self) -> i32 {
        match self {
            GcsError::NotImplemented(_) => HR_NOT_IMPLEMENTED,
            GcsError::InvalidArgument(_) => HR_INVALID_ARGUMENT,
            GcsError::ContainerNotFound(_) => HR_SYSTEM_NOT_FOUND,
            GcsError::ContainerAlreadyExists(_) => HR_SYSTEM_ALREADY_EXISTS,
            GcsError::ContainerNotStopped(_) => HR_SYSTEM_NOT_STOPPED,
            GcsError::ContainerAlreadyStopped(_) => HR_SYSTEM_ALREADY_STOPPED,
            GcsError::UnsupportedProtocolVersion(_) => HR_UNSUPPORTED_PROTOCOL_VERSION,
            GcsError::InvalidJson { .. } => HR_INVALID_JSON,
            GcsError::Timeout => HR_TIMEOUT,
            GcsError::Runtime(_) => HR_UNEXPECTED,
            GcsError::Io { .. } => HR_UNEXPECTED,
            GcsError::Unexpected(_) => HR_UNEXPECTED,
        }
    }
}

impl From<std::io::Error> for GcsError {
    fn from(e: std::io::Error) -> Self {
        GcsError::Io {
            context: "I/O error".to_string(),
            source: e,
        }
    }
}

/// Walk an error's cause chain and return the first hresult found.
///
/// The outermost `GcsError` wins; wrapping shadows inner codes on purpose.
/// Errors without a `GcsError` anywhere in the chain report `HR_UNEXPECTED`.
pub fn hresult_of(err: &(dyn std::error::Error + 'static)) -> i32 {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(gcs) = e.downcast_ref::<GcsError>() {
            return gcs.hresult();
        }
        cur = e.source();
    }
    HR_UNEXPECTED
}
