//! Custom error types for the relay.
//!
//! This module defines the primary error type, `RelayError`, used across the crate.
//! Using the `thiserror` crate, it provides one place to classify what can go wrong
//! while ingesting the two sensor streams and shipping the combined record.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: file/env parsing failures from `figment`, and
//!   semantic problems caught by [`crate::config::RelayConfig::validate`].
//! - **`Io`**: plain I/O failures on an attached stream endpoint.
//! - **`EndpointSetup`**: a stream listener could not be created or bound. Fatal.
//! - **`Decode`**: the row decoder could not consume a chunk. Fatal, since the
//!   decoder's in-progress row can no longer be trusted.
//! - **`PayloadTooLong`**, **`Radio`**, **`Network`**: a cycle's send failed. These are
//!   absorbed by the relay loop; the cycle still resets.
//!
//! Soft field-parse failures never surface here; the field mapper turns them into `0`.

use crate::decoder::DecodeError;
use crate::mapper::StreamKind;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the relay error type.
pub type RelayResult<T> = std::result::Result<T, RelayError>;

/// Every failure the relay can report.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Layered configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stream listener could not be created or bound.
    #[error("Could not set up stream endpoint '{}': {source}", path.display())]
    EndpointSetup {
        /// Socket path that failed.
        path: PathBuf,
        /// Underlying bind or connect error.
        #[source]
        source: std::io::Error,
    },

    /// The row decoder lost sync with a stream.
    #[error("Error while parsing {stream} stream: {source}")]
    Decode {
        /// Stream whose decoder failed.
        stream: StreamKind,
        /// Decoder failure.
        #[source]
        source: DecodeError,
    },

    /// Formatted payload is longer than the sink accepts.
    #[error("Payload of {len} bytes exceeds transport limit of {max} bytes")]
    PayloadTooLong {
        /// Formatted length.
        len: usize,
        /// Sink limit.
        max: usize,
    },

    /// Modem command failed, timed out or was rejected.
    #[error("Radio transmit failed: {0}")]
    Radio(String),

    /// HTTP request failed or returned a non-success status.
    #[error("Network egress failed: {0}")]
    Network(String),

    /// Radio transport selected in a build without `radio_serial`.
    #[error("Serial support not enabled. Rebuild with --features radio_serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for RelayError {
    fn from(err: figment::Error) -> Self {
        RelayError::Config(Box::new(err))
    }
}

impl RelayError {
    /// Whether the poll loop must terminate the process on this error.
    ///
    /// Send errors are only fatal when the configuration says so, which is decided
    /// by the relay loop, not here.
    pub fn is_fatal(&self) -> bool {
        match self {
            RelayError::Config(_)
            | RelayError::Configuration(_)
            | RelayError::EndpointSetup { .. }
            | RelayError::Decode { .. }
            | RelayError::SerialFeatureDisabled => true,
            RelayError::Io(_)
            | RelayError::PayloadTooLong { .. }
            | RelayError::Radio(_)
            | RelayError::Network(_) => false,
        }
    }

    /// Whether this error came out of the transport dispatcher.
    pub fn is_send_error(&self) -> bool {
        matches!(
            self,
            RelayError::PayloadTooLong { .. } | RelayError::Radio(_) | RelayError::Network(_)
        )
    }
}
