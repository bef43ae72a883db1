//! Mock Transports
//!
//! Simulated devices for exercising the retrieval client without hardware.
//!
//! # Available Mocks
//!
//! - `SimulatedCamera` - answers the four protocol commands the way the camera
//!   firmware does, with synthetic original/histogram/Sobel rasters and a fixed
//!   performance record. Individual commands can be given faults (corrupt
//!   markers, oversized length, stalled transfer, silence).
//! - `ScriptedTransport` - replays caller-supplied bytes and records writes, for
//!   byte-exact protocol tests.
//!
//! Both report "no data" the way a serial port does: they wait for their read
//! timeout and then fail with `ErrorKind::TimedOut`.

use crate::protocol::{Command, ImageCategory, PerformanceMetrics, ProtocolConfig};
use crate::transport::Transport;
use std::collections::{HashMap, VecDeque};
use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;
use tracing::debug;

// =============================================================================
// SimulatedCamera
// =============================================================================

/// Misbehaviour injected into the response to one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Replace the header marker with zeros.
    CorruptHeader,
    /// Replace the footer marker with zeros.
    CorruptFooter,
    /// Announce this length instead of the real one. The payload is unchanged.
    AnnounceLength(u32),
    /// Send only the first `n` bytes of the response, then go quiet.
    StallAfter(usize),
    /// Send nothing.
    Silent,
}

/// A simulated camera that speaks the retrieval protocol.
///
/// # Example
///
/// ```rust,ignore
/// let camera = SimulatedCamera::new(ProtocolConfig::default(), 640, 480)
///     .with_fault(Command::GetSobel(2), Fault::StallAfter(1000));
/// let client = RetrievalClient::new(camera, ProtocolConfig::default());
/// ```
pub struct SimulatedCamera {
    protocol: ProtocolConfig,
    width: u32,
    height: u32,
    frame_count: u8,
    metrics: PerformanceMetrics,
    faults: HashMap<Command, Fault>,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    read_timeout: Duration,
    received: Vec<Command>,
}

impl SimulatedCamera {
    /// Camera holding 20 frames of `width` x `height`.
    pub fn new(protocol: ProtocolConfig, width: u32, height: u32) -> Self {
        Self {
            protocol,
            width,
            height,
            frame_count: 20,
            metrics: PerformanceMetrics::new(12.5, 190, 2730, 5260, 300),
            faults: HashMap::new(),
            rx: Vec::new(),
            tx: VecDeque::new(),
            read_timeout: Duration::from_millis(5),
            received: Vec::new(),
        }
    }

    /// Number of stored frames; image requests at or past this index go unanswered.
    pub fn with_frame_count(mut self, frame_count: u8) -> Self {
        self.frame_count = frame_count;
        self
    }

    /// Performance record sent in reply to the performance command.
    pub fn with_metrics(mut self, metrics: PerformanceMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Inject `fault` into every response to `command`.
    pub fn with_fault(mut self, command: Command, fault: Fault) -> Self {
        self.faults.insert(command, fault);
        self
    }

    /// How long a read blocks before reporting a timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Commands received so far, in order.
    pub fn received_commands(&self) -> &[Command] {
        &self.received
    }

    /// Raster the camera would send for `category` at `index`.
    pub fn raster(&self, category: ImageCategory, index: u8) -> Vec<u8> {
        let original = synthetic_frame(self.width, self.height, index);
        match category {
            ImageCategory::Original => original,
            ImageCategory::Histogram => equalize_histogram(&original),
            ImageCategory::Sobel => sobel(&original, self.width, self.height),
        }
    }

    fn respond(&mut self, command: Command) {
        self.received.push(command);

        let mut frame = match command {
            Command::GetPerformance => self.protocol.encode_metrics_frame(&self.metrics),
            Command::GetImage(i) | Command::GetHistogram(i) | Command::GetSobel(i) => {
                if i >= self.frame_count {
                    debug!(index = i, "No stored frame, not responding");
                    return;
                }
                let category = match command {
                    Command::GetHistogram(_) => ImageCategory::Histogram,
                    Command::GetSobel(_) => ImageCategory::Sobel,
                    _ => ImageCategory::Original,
                };
                self.protocol.encode_frame(&self.raster(category, i))
            }
        };

        match self.faults.get(&command).copied() {
            None => {}
            Some(Fault::CorruptHeader) => frame[..2].fill(0),
            Some(Fault::CorruptFooter) => {
                let n = frame.len();
                frame[n - 2..].fill(0);
            }
            Some(Fault::AnnounceLength(len)) => {
                if !matches!(command, Command::GetPerformance) {
                    frame[2..6].copy_from_slice(&len.to_le_bytes());
                }
            }
            Some(Fault::StallAfter(n)) => frame.truncate(n),
            Some(Fault::Silent) => return,
        }

        debug!(?command, bytes = frame.len(), "Queued response");
        self.tx.extend(frame);
    }
}

impl Read for SimulatedCamera {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.tx.is_empty() {
            thread::sleep(self.read_timeout);
            return Err(io::Error::new(ErrorKind::TimedOut, "simulated read timeout"));
        }
        let n = buf.len().min(self.tx.len());
        for (dst, src) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for SimulatedCamera {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rx.extend_from_slice(buf);
        loop {
            if self.rx.is_empty() {
                break;
            }
            match Command::decode(&self.rx, &self.protocol.opcodes) {
                Some((command, used)) => {
                    self.rx.drain(..used);
                    self.respond(command);
                }
                None if self.rx.len() >= 2 || !is_opcode(&self.protocol, self.rx[0]) => {
                    debug!(byte = self.rx[0], "Ignoring unknown command byte");
                    self.rx.remove(0);
                }
                // Opcode waiting for its parameter
                None => break,
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for SimulatedCamera {
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.rx.clear();
        self.tx.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("simulated-camera:{}x{}", self.width, self.height)
    }
}

fn is_opcode(protocol: &ProtocolConfig, byte: u8) -> bool {
    let ops = &protocol.opcodes;
    [ops.get_image, ops.get_histogram, ops.get_sobel, ops.get_performance].contains(&byte)
}

/// Low-contrast diagonal gradient, shifted per index.
fn synthetic_frame(width: u32, height: u32, index: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = (x / 4 + y / 4 + u32::from(index) * 16) % 160 + 48;
            data.push(v as u8);
        }
    }
    data
}

fn equalize_histogram(pixels: &[u8]) -> Vec<u8> {
    let mut hist = [0usize; 256];
    for &p in pixels {
        hist[p as usize] += 1;
    }
    let mut cdf = [0usize; 256];
    let mut acc = 0;
    for (c, h) in cdf.iter_mut().zip(hist) {
        acc += h;
        *c = acc;
    }
    let total = pixels.len();
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == cdf_min {
        return pixels.to_vec();
    }
    pixels
        .iter()
        .map(|&p| (((cdf[p as usize] - cdf_min) * 255) / (total - cdf_min)) as u8)
        .collect()
}

fn sobel(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; w * h];
    if w < 3 || h < 3 {
        return out;
    }
    let at = |x: usize, y: usize| i32::from(pixels[y * w + x]);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = -at(x - 1, y - 1) - 2 * at(x - 1, y) - at(x - 1, y + 1)
                + at(x + 1, y - 1)
                + 2 * at(x + 1, y)
                + at(x + 1, y + 1);
            let gy = -at(x - 1, y - 1) - 2 * at(x, y - 1) - at(x + 1, y - 1)
                + at(x - 1, y + 1)
                + 2 * at(x, y + 1)
                + at(x + 1, y + 1);
            let mag = f64::from(gx * gx + gy * gy).sqrt();
            out[y * w + x] = mag.min(255.0) as u8;
        }
    }
    out
}

// =============================================================================
// ScriptedTransport
// =============================================================================

/// Transport that serves pre-loaded bytes and records what was written.
///
/// Bytes given to [`with_incoming`](Self::with_incoming) are readable
/// immediately. Each reply given to [`with_reply`](Self::with_reply) becomes
/// readable after the next write, so command/response exchanges survive the
/// buffer clear that precedes every command.
pub struct ScriptedTransport {
    incoming: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    max_read: usize,
    largest_read: usize,
    read_timeout: Duration,
    clears: usize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Empty transport.
    pub fn new() -> Self {
        Self {
            incoming: VecDeque::new(),
            replies: VecDeque::new(),
            written: Vec::new(),
            max_read: usize::MAX,
            largest_read: 0,
            read_timeout: Duration::from_millis(1),
            clears: 0,
        }
    }

    /// Append bytes readable right away.
    pub fn with_incoming(mut self, bytes: &[u8]) -> Self {
        self.incoming.extend(bytes.iter().copied());
        self
    }

    /// Queue a reply released by the next write.
    pub fn with_reply(mut self, bytes: Vec<u8>) -> Self {
        self.replies.push_back(bytes);
        self
    }

    /// Cap the bytes returned by a single read.
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read.max(1);
        self
    }

    /// How long a read blocks before reporting a timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Everything written so far.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Largest buffer passed to a single read.
    pub fn largest_read(&self) -> usize {
        self.largest_read
    }

    /// Number of buffer clears requested.
    pub fn clear_count(&self) -> usize {
        self.clears
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.incoming.len()
    }
}

impl Read for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.largest_read = self.largest_read.max(buf.len());
        if self.incoming.is_empty() {
            thread::sleep(self.read_timeout);
            return Err(io::Error::new(ErrorKind::TimedOut, "scripted read timeout"));
        }
        let n = buf.len().min(self.incoming.len()).min(self.max_read);
        for (dst, src) in buf.iter_mut().zip(self.incoming.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.extend_from_slice(buf);
        if let Some(reply) = self.replies.pop_front() {
            self.incoming.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for ScriptedTransport {
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.clears += 1;
        self.incoming.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
