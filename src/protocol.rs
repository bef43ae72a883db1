//! Wire protocol definitions for the ESP32-CAM retrieval link.
//!
//! The device answers single-byte commands with length-delimited frames:
//!
//! ```text
//! [u16 header LE][u32 length LE][length bytes payload][u16 footer LE]
//! ```
//!
//! The performance command replaces the length-delimited payload with a fixed
//! 36-byte record:
//!
//! ```text
//! [u16 header][f32 fps][u64 capture_us][u64 histogram_us][u64 sobel_us][u64 save_us][u16 footer]
//! ```
//!
//! All markers, opcodes, limits and timeouts live in [`ProtocolConfig`], which is
//! built once and handed to the client at construction.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Size of the performance record between header and footer.
pub const METRICS_PAYLOAD_LEN: usize = 4 + 4 * 8;

/// Opcode table for the four supported commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opcodes {
    /// Request the original grayscale capture.
    #[serde(default = "default_op_image")]
    pub get_image: u8,
    /// Request the histogram-equalised capture.
    #[serde(default = "default_op_histogram")]
    pub get_histogram: u8,
    /// Request the Sobel edge image.
    #[serde(default = "default_op_sobel")]
    pub get_sobel: u8,
    /// Request the performance record.
    #[serde(default = "default_op_performance")]
    pub get_performance: u8,
}

impl Default for Opcodes {
    fn default() -> Self {
        Self {
            get_image: default_op_image(),
            get_histogram: default_op_histogram(),
            get_sobel: default_op_sobel(),
            get_performance: default_op_performance(),
        }
    }
}

impl Opcodes {
    /// Whether all four opcodes are distinct.
    pub fn are_distinct(&self) -> bool {
        let ops = [
            self.get_image,
            self.get_histogram,
            self.get_sobel,
            self.get_performance,
        ];
        ops.iter()
            .enumerate()
            .all(|(i, op)| !ops[i + 1..].contains(op))
    }
}

/// Immutable protocol configuration shared by the client and the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Sync marker preceding every response.
    #[serde(default = "default_header")]
    pub header: u16,
    /// Sync marker closing every response.
    #[serde(default = "default_footer")]
    pub footer: u16,
    /// Command opcodes.
    #[serde(default)]
    pub opcodes: Opcodes,
    /// Largest payload length accepted from the device.
    #[serde(default = "default_max_payload")]
    pub max_payload: u32,
    /// Largest single read issued against the transport.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Timeout for fixed-size fields (markers, length, metrics).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Inactivity timeout while a payload is streaming in.
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Pause after a command so the device can prepare its response.
    #[serde(default = "default_command_settle_ms")]
    pub command_settle_ms: u64,
    /// Bytes scanned for a header before giving up.
    #[serde(default = "default_sync_search_limit")]
    pub sync_search_limit: usize,
    /// Largest plausible frame rate.
    #[serde(default = "default_max_fps")]
    pub max_fps: f32,
    /// Largest plausible timing value in microseconds.
    #[serde(default = "default_max_timing_us")]
    pub max_timing_us: u64,
}

fn default_op_image() -> u8 {
    0x01
}

fn default_op_histogram() -> u8 {
    0x02
}

fn default_op_sobel() -> u8 {
    0x03
}

fn default_op_performance() -> u8 {
    0x04
}

fn default_header() -> u16 {
    0xAA55
}

fn default_footer() -> u16 {
    0x55AA
}

fn default_max_payload() -> u32 {
    1_000_000
}

fn default_chunk_size() -> usize {
    1024
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_transfer_timeout_ms() -> u64 {
    5000
}

fn default_command_settle_ms() -> u64 {
    100
}

fn default_sync_search_limit() -> usize {
    1 << 20
}

fn default_max_fps() -> f32 {
    1000.0
}

fn default_max_timing_us() -> u64 {
    1_000_000_000
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            header: default_header(),
            footer: default_footer(),
            opcodes: Opcodes::default(),
            max_payload: default_max_payload(),
            chunk_size: default_chunk_size(),
            read_timeout_ms: default_read_timeout_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            command_settle_ms: default_command_settle_ms(),
            sync_search_limit: default_sync_search_limit(),
            max_fps: default_max_fps(),
            max_timing_us: default_max_timing_us(),
        }
    }
}

impl ProtocolConfig {
    /// Timeout applied to fixed-size field reads.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Inactivity timeout applied to payload transfers.
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Delay after writing a command.
    pub fn command_settle(&self) -> Duration {
        Duration::from_millis(self.command_settle_ms)
    }

    /// Wrap `payload` in header, length prefix and footer.
    pub fn encode_frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&self.header.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&self.footer.to_le_bytes());
        frame
    }

    /// Wrap a performance record in header and footer.
    pub fn encode_metrics_frame(&self, metrics: &PerformanceMetrics) -> Vec<u8> {
        let mut frame = Vec::with_capacity(METRICS_PAYLOAD_LEN + 4);
        frame.extend_from_slice(&self.header.to_le_bytes());
        frame.extend_from_slice(&metrics.to_le_bytes());
        frame.extend_from_slice(&self.footer.to_le_bytes());
        frame
    }
}

/// Kind of processed image held by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageCategory {
    /// Raw grayscale capture.
    Original,
    /// Histogram-equalised capture.
    Histogram,
    /// Sobel edge magnitude.
    Sobel,
}

impl ImageCategory {
    /// Retrieval order used for each index.
    pub const ALL: [ImageCategory; 3] = [
        ImageCategory::Original,
        ImageCategory::Histogram,
        ImageCategory::Sobel,
    ];

    /// Subdirectory name used when persisting this category.
    pub fn dir_name(self) -> &'static str {
        match self {
            ImageCategory::Original => "original",
            ImageCategory::Histogram => "histogram",
            ImageCategory::Sobel => "sobel",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A command sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Original image at the given index.
    GetImage(u8),
    /// Histogram-equalised image at the given index.
    GetHistogram(u8),
    /// Sobel image at the given index.
    GetSobel(u8),
    /// Latest performance record.
    GetPerformance,
}

impl Command {
    /// Image command for `category` at `index`.
    pub fn for_category(category: ImageCategory, index: u8) -> Self {
        match category {
            ImageCategory::Original => Command::GetImage(index),
            ImageCategory::Histogram => Command::GetHistogram(index),
            ImageCategory::Sobel => Command::GetSobel(index),
        }
    }

    /// Opcode byte for this command.
    pub fn opcode(&self, opcodes: &Opcodes) -> u8 {
        match self {
            Command::GetImage(_) => opcodes.get_image,
            Command::GetHistogram(_) => opcodes.get_histogram,
            Command::GetSobel(_) => opcodes.get_sobel,
            Command::GetPerformance => opcodes.get_performance,
        }
    }

    /// Index parameter, if the command carries one.
    pub fn param(&self) -> Option<u8> {
        match *self {
            Command::GetImage(i) | Command::GetHistogram(i) | Command::GetSobel(i) => Some(i),
            Command::GetPerformance => None,
        }
    }

    /// Bytes written to the wire.
    pub fn encode(&self, opcodes: &Opcodes) -> Vec<u8> {
        let mut bytes = vec![self.opcode(opcodes)];
        bytes.extend(self.param());
        bytes
    }

    /// Parse an opcode (and its parameter, when required) from the head of `bytes`.
    ///
    /// Returns the command and the number of bytes consumed, or `None` if the
    /// opcode is unknown or the parameter has not arrived yet.
    pub fn decode(bytes: &[u8], opcodes: &Opcodes) -> Option<(Self, usize)> {
        let (&op, rest) = bytes.split_first()?;
        if op == opcodes.get_performance {
            return Some((Command::GetPerformance, 1));
        }
        let make: fn(u8) -> Command = if op == opcodes.get_image {
            Command::GetImage
        } else if op == opcodes.get_histogram {
            Command::GetHistogram
        } else if op == opcodes.get_sobel {
            Command::GetSobel
        } else {
            return None;
        };
        rest.first().map(|&index| (make(index), 2))
    }
}

/// Timing field of a performance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingField {
    /// Frame capture.
    Capture,
    /// Histogram equalisation.
    Histogram,
    /// Sobel filter.
    Sobel,
    /// Saving to PSRAM.
    Save,
}

impl TimingField {
    /// Fields in wire order.
    pub const ALL: [TimingField; 4] = [
        TimingField::Capture,
        TimingField::Histogram,
        TimingField::Sobel,
        TimingField::Save,
    ];

    /// Human label used in logs and charts.
    pub fn label(self) -> &'static str {
        match self {
            TimingField::Capture => "Capture",
            TimingField::Histogram => "Histogram",
            TimingField::Sobel => "Sobel",
            TimingField::Save => "Save",
        }
    }
}

/// A sanity-bound rejection that zeroed a metrics field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum BoundViolation {
    /// FPS outside `[0, max_fps]` or not finite.
    Fps {
        /// Value as received.
        value: f32,
    },
    /// Timing above `max_timing_us`.
    Timing {
        /// Offending field.
        timing: TimingField,
        /// Value as received, in microseconds.
        value_us: u64,
    },
}

impl fmt::Display for BoundViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundViolation::Fps { value } => write!(f, "suspicious FPS value {value}"),
            BoundViolation::Timing { timing, value_us } => {
                write!(f, "suspicious {} time {value_us} us", timing.label())
            }
        }
    }
}

/// Device-side performance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Frames per second.
    pub fps: f32,
    /// Capture time in microseconds.
    pub capture_us: u64,
    /// Histogram equalisation time in microseconds.
    pub histogram_us: u64,
    /// Sobel filter time in microseconds.
    pub sobel_us: u64,
    /// Save time in microseconds.
    pub save_us: u64,
    /// Fields zeroed by the sanity bounds.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<BoundViolation>,
}

impl PerformanceMetrics {
    /// Record with the given values and no violations.
    pub fn new(fps: f32, capture_us: u64, histogram_us: u64, sobel_us: u64, save_us: u64) -> Self {
        Self {
            fps,
            capture_us,
            histogram_us,
            sobel_us,
            save_us,
            violations: Vec::new(),
        }
    }

    /// Decode the 36-byte little-endian record. No bounds are applied.
    pub fn from_le_bytes(raw: &[u8; METRICS_PAYLOAD_LEN]) -> Self {
        let mut fps = [0u8; 4];
        fps.copy_from_slice(&raw[..4]);
        let timing = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[4 + i * 8..12 + i * 8]);
            u64::from_le_bytes(b)
        };
        Self::new(
            f32::from_le_bytes(fps),
            timing(0),
            timing(1),
            timing(2),
            timing(3),
        )
    }

    /// Encode as the 36-byte little-endian record.
    pub fn to_le_bytes(&self) -> [u8; METRICS_PAYLOAD_LEN] {
        let mut raw = [0u8; METRICS_PAYLOAD_LEN];
        raw[..4].copy_from_slice(&self.fps.to_le_bytes());
        for (i, field) in TimingField::ALL.into_iter().enumerate() {
            raw[4 + i * 8..12 + i * 8].copy_from_slice(&self.timing_us(field).to_le_bytes());
        }
        raw
    }

    /// Value of a timing field in microseconds.
    pub fn timing_us(&self, field: TimingField) -> u64 {
        match field {
            TimingField::Capture => self.capture_us,
            TimingField::Histogram => self.histogram_us,
            TimingField::Sobel => self.sobel_us,
            TimingField::Save => self.save_us,
        }
    }

    fn timing_mut(&mut self, field: TimingField) -> &mut u64 {
        match field {
            TimingField::Capture => &mut self.capture_us,
            TimingField::Histogram => &mut self.histogram_us,
            TimingField::Sobel => &mut self.sobel_us,
            TimingField::Save => &mut self.save_us,
        }
    }

    /// Zero every field outside the configured bounds and record why.
    pub fn apply_bounds(mut self, config: &ProtocolConfig) -> Self {
        if !self.fps.is_finite() || self.fps < 0.0 || self.fps > config.max_fps {
            self.violations.push(BoundViolation::Fps { value: self.fps });
            self.fps = 0.0;
        }
        for field in TimingField::ALL {
            let value_us = self.timing_us(field);
            if value_us > config.max_timing_us {
                self.violations.push(BoundViolation::Timing {
                    timing: field,
                    value_us,
                });
                *self.timing_mut(field) = 0;
            }
        }
        self
    }

    /// Timings in milliseconds, labelled, in wire order.
    pub fn timings_ms(&self) -> [(&'static str, f64); 4] {
        TimingField::ALL.map(|field| (field.label(), self.timing_us(field) as f64 / 1000.0))
    }
}
