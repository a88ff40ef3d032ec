//! Unified error handling for LoRaGent.
//!
//! Every crate in the workspace converts its local failures into this type so
//! that the dispatcher can classify a dropped frame with a single match.

use crate::event::DropReason;

/// Unified error type for LoRaGent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors. Fatal during startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage/database errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Validation errors on provisioning input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A store lookup missed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A provisioning write would violate a uniqueness invariant.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The codec identifier is not known to the codec registry.
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The payload could not be decoded by the selected codec.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The uplink topic does not match a live group.
    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    /// The device is not provisioned and its group forbids auto-provisioning.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Connection-level transport failures.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The context broker could not be reached or rejected the update.
    #[error("Downstream unavailable: {0}")]
    DownstreamUnavailable(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify this error as the reason an uplink frame was dropped.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            Error::UnknownApplication(_) => DropReason::UnknownApplication,
            Error::UnknownDevice(_) => DropReason::UnknownDevice,
            Error::UnsupportedCodec(_) => DropReason::UnsupportedCodec,
            Error::MalformedPayload(_) | Error::Serialization(_) => DropReason::MalformedPayload,
            Error::DownstreamUnavailable(_) => DropReason::DownstreamUnavailable,
            _ => DropReason::Internal,
        }
    }

    /// Whether the error is a store lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Convenience macros for creating errors.
#[macro_export]
macro_rules! config_err {
    ($msg:expr) => {
        $crate::error::Error::Config($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! malformed_err {
    ($msg:expr) => {
        $crate::error::Error::MalformedPayload($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::MalformedPayload(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_reason_classification() {
        assert_eq!(
            Error::UnknownApplication("app9".into()).drop_reason(),
            DropReason::UnknownApplication
        );
        assert_eq!(
            Error::Serialization("bad json".into()).drop_reason(),
            DropReason::MalformedPayload
        );
        assert_eq!(
            Error::Storage("disk".into()).drop_reason(),
            DropReason::Internal
        );
    }

    #[test]
    fn test_macros() {
        let e = malformed_err!("record {} truncated", 3);
        assert_eq!(e, Error::MalformedPayload("record 3 truncated".to_string()));
        let e = config_err!("missing url");
        assert!(matches!(e, Error::Config(_)));
    }
}
