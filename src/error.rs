//! Custom error types for the retrieval client.
//!
//! `RetrievalError` is the single error type returned by every read, decode and
//! persistence step. Using `thiserror`, it keeps transport failures, protocol
//! desynchronisation and sanity-bound rejections in one enum so that callers can
//! match on them or simply propagate with `?`.
//!
//! ## Error Hierarchy
//!
//! - **Fatal**: `Transport` (the serial port cannot be opened) and `Storage`
//!   (the session directory cannot be created). A session cannot continue.
//! - **Desync**: `SyncTimeout`, `SyncNotFound`, `FooterMismatch`, `ShortRead`.
//!   The frame is discarded and the caller moves on to the next command.
//! - **Bounds**: `SizeBound`, `EmptyFrame`, `RasterSizeMismatch`. A declared
//!   length is rejected before it can drive an unbounded read.
//! - **Timeout**: `TransferTimeout`, raised when a payload stops arriving.
//!
//! See [`RetrievalError::is_recoverable`] for the fatal/non-fatal split.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the retrieval error type.
pub type AppResult<T> = std::result::Result<T, RetrievalError>;

/// Errors raised while opening, reading from or persisting a retrieval session.
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// The serial port could not be opened.
    #[error("Failed to open serial port '{port}': {source}")]
    Transport {
        /// Port path as given by the caller.
        port: String,
        /// Underlying serialport error.
        #[source]
        source: serialport::Error,
    },

    /// The output directory could not be prepared.
    #[error("Failed to prepare output directory {path:?}: {source}")]
    Storage {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A read timed out while searching for the sync header.
    #[error("Timed out waiting for sync header after skipping {skipped} bytes")]
    SyncTimeout {
        /// Bytes discarded before the timeout.
        skipped: usize,
    },

    /// The sync search limit was exhausted without finding a header.
    #[error("Sync header not found within {limit} bytes")]
    SyncNotFound {
        /// Configured search limit.
        limit: usize,
    },

    /// The two bytes after a payload were not the sync footer.
    #[error("Invalid sync footer: expected 0x{expected:04X}, got 0x{found:04X}")]
    FooterMismatch {
        /// Configured footer constant.
        expected: u16,
        /// Value actually read.
        found: u16,
    },

    /// Fewer bytes than required arrived for a fixed-size field.
    #[error("Short read on {what}: expected {expected} bytes, got {received}")]
    ShortRead {
        /// Name of the field being read.
        what: &'static str,
        /// Bytes required.
        expected: usize,
        /// Bytes received before the timeout.
        received: usize,
    },

    /// The declared payload length exceeds the sanity ceiling.
    #[error("Suspiciously large size received: {declared} bytes (limit {limit})")]
    SizeBound {
        /// Length announced by the device.
        declared: u32,
        /// Configured ceiling.
        limit: u32,
    },

    /// The device announced a zero-length payload.
    #[error("Device announced an empty payload")]
    EmptyFrame,

    /// An image-typed payload does not match the configured raster.
    #[error("Payload of {received} bytes does not match {width}x{height} raster ({expected} bytes)")]
    RasterSizeMismatch {
        /// Raster width.
        width: u32,
        /// Raster height.
        height: u32,
        /// `width * height`.
        expected: usize,
        /// Payload length received.
        received: usize,
    },

    /// No payload bytes arrived for longer than the inactivity timeout.
    #[error("Timeout while reading payload: expected {expected} bytes, got {received} (idle {idle:?})")]
    TransferTimeout {
        /// Declared payload length.
        expected: usize,
        /// Bytes received before the stall.
        received: usize,
        /// Inactivity window that elapsed.
        idle: Duration,
    },

    /// Generic I/O failure on the transport or filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding failed.
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),

    /// Metrics serialisation failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for RetrievalError {
    fn from(value: figment::Error) -> Self {
        RetrievalError::Config(Box::new(value))
    }
}

impl RetrievalError {
    /// Whether the session may continue with the next command after this error.
    ///
    /// Only failures to acquire the port or the output directory, and broken
    /// configuration, end a session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            RetrievalError::Transport { .. }
                | RetrievalError::Storage { .. }
                | RetrievalError::Config(_)
                | RetrievalError::Configuration(_)
        )
    }
}
