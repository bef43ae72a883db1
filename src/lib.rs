//! # ESP32-CAM Retrieval Client
//!
//! This crate talks to an ESP32-CAM over a serial link using a small framed
//! binary protocol. It requests the original, histogram-equalised and Sobel
//! images stored on the device, plus a performance record, and writes them to
//! a timestamped session directory.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Opcodes, sync markers, the immutable `ProtocolConfig`, the
//!   `Command` enum and `PerformanceMetrics` decoding with sanity bounds.
//! - **`transport`**: The `Transport` trait and the 8N1 `SerialTransport`.
//! - **`reader`**: `FrameReader::read_exactly`, the timeout-aware primitive used
//!   for every fixed-size read.
//! - **`client`**: `RetrievalClient`, the command/response state machine.
//! - **`storage`**: `SessionStore`, which writes grayscale images, the
//!   performance chart and its JSON.
//! - **`session`**: `RetrievalSession`, which owns the connection for a run and
//!   aggregates failures into a `RetrievalReport`.
//! - **`mock`**: A simulated camera and a scripted transport for running
//!   without hardware.
//! - **`config`**: Layered configuration (defaults, TOML, `ESP_CAM_*` env).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: The `RetrievalError` enum.
//!
//! ## Example
//!
//! ```no_run
//! use esp_cam_retriever::config::RetrieverConfig;
//! use esp_cam_retriever::session::RetrievalSession;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetrieverConfig::load(None)?;
//! let mut session = RetrievalSession::open(&config)?;
//! let report = session.run(config.image.count)?;
//! println!("saved {} images to {:?}", report.saved.len(), session.output_dir());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod mock;
pub mod protocol;
pub mod reader;
pub mod session;
pub mod storage;
pub mod transport;

pub use client::RetrievalClient;
pub use error::{AppResult, RetrievalError};
pub use protocol::{Command, ImageCategory, PerformanceMetrics, ProtocolConfig};
pub use session::{RetrievalReport, RetrievalSession};
