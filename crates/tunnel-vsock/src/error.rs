//! Error types for the vsock bridge.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error type used for error chaining across crate boundaries.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Context wrapper that preserves an optional underlying source error.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ErrorContext {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl ErrorContext {
    /// Create context-only error (no underlying source).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create context error with an underlying source.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Errors raised while establishing or running a bridge session.
///
/// None of these are fatal to the process: the supervisor logs them, tears
/// the session down and tries again.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// Opening the vsock channel to the host proxy failed.
    #[error("Connect error: {0}")]
    Connect(#[source] ErrorContext),

    /// Writing the announce request to the host proxy failed.
    #[error("Handshake error: {0}")]
    Handshake(#[source] ErrorContext),

    /// Creating the TAP device failed.
    #[error("Device creation error: {0}")]
    DeviceCreate(#[source] ErrorContext),

    /// Configuring the interface or resolver failed, or the configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(#[source] ErrorContext),

    /// Frame exceeds what the 16-bit length field can describe.
    #[error("Frame too large: {0} bytes (max {max})", max = crate::codec::MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    /// The stream ended before a complete wire record was received.
    #[error("Short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    /// A write accepted fewer bytes than the frame length.
    #[error("Short write: wrote {written} instead of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    /// Generic I/O failure (closed handle, broken pipe, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a connect error with preserved source.
    pub fn connect_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Connect(ErrorContext::with_source(message, source))
    }

    /// Create a handshake error with preserved source.
    pub fn handshake_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Handshake(ErrorContext::with_source(message, source))
    }

    /// Create a device creation error with preserved source.
    pub fn device_create_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::DeviceCreate(ErrorContext::with_source(message, source))
    }

    /// Create a configuration error with context only.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(ErrorContext::new(message))
    }

    /// Create a configuration error with preserved source.
    pub fn config_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Config(ErrorContext::with_source(message, source))
    }
}

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;
