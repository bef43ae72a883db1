//! Framed retrieval client.
//!
//! [`RetrievalClient`] sends one command at a time and parses the framed reply.
//! Every step returns a [`RetrievalError`] on failure and logs it with the byte
//! counts needed to diagnose a desync. None of these errors poison the client:
//! the next [`send_command`](RetrievalClient::send_command) clears the link and
//! starts over.

use crate::error::{AppResult, RetrievalError};
use crate::protocol::{
    Command, ImageCategory, PerformanceMetrics, ProtocolConfig, TimingField, METRICS_PAYLOAD_LEN,
};
use crate::reader::FrameReader;
use crate::transport::Transport;
use bytes::Bytes;
use std::thread;
use tracing::{debug, instrument, trace, warn};

/// Client for the ESP32-CAM retrieval protocol.
pub struct RetrievalClient<T> {
    reader: FrameReader<T>,
    config: ProtocolConfig,
}

impl<T: Transport> RetrievalClient<T> {
    /// Wrap `transport`, speaking the protocol described by `config`.
    pub fn new(transport: T, config: ProtocolConfig) -> Self {
        Self {
            reader: FrameReader::new(transport, config.chunk_size),
            config,
        }
    }

    /// Protocol configuration in use.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        self.reader.get_ref()
    }

    /// Underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        self.reader.get_mut()
    }

    /// Release the transport.
    pub fn into_transport(self) -> T {
        self.reader.into_inner()
    }

    /// Clear pending bytes, write `command`, flush, then give the device time to
    /// prepare its reply.
    #[instrument(skip(self), level = "debug", err)]
    pub fn send_command(&mut self, command: Command) -> AppResult<()> {
        self.reader.clear()?;
        let bytes = command.encode(&self.config.opcodes);
        if let Err(e) = self.reader.send(&bytes) {
            warn!(?command, error = %e, "Error sending command");
            return Err(e.into());
        }
        trace!(?bytes, "Command written");
        thread::sleep(self.config.command_settle());
        Ok(())
    }

    /// Consume bytes until the header marker has been read.
    ///
    /// The search slides one byte at a time, so a header at any offset is found.
    /// It gives up when a read times out or after `sync_search_limit` bytes.
    pub fn wait_for_sync(&mut self) -> AppResult<()> {
        let header = self.config.header;
        let timeout = self.config.read_timeout();
        let mut previous: Option<u8> = None;
        let mut skipped = 0usize;

        loop {
            let byte = match self.reader.read_exactly(1, timeout) {
                Ok(b) => b[0],
                Err(RetrievalError::TransferTimeout { .. }) => {
                    warn!(skipped, "Could not read sync header");
                    return Err(RetrievalError::SyncTimeout { skipped });
                }
                Err(e) => return Err(e),
            };

            if let Some(prev) = previous {
                let candidate = u16::from_le_bytes([prev, byte]);
                if candidate == header {
                    if skipped > 0 {
                        warn!(skipped, "Resynchronised after discarding bytes");
                    }
                    return Ok(());
                }
                trace!(candidate = format_args!("0x{candidate:04X}"), "Invalid sync header");
                skipped += 1;
                if skipped >= self.config.sync_search_limit {
                    warn!(skipped, "Giving up on sync header");
                    return Err(RetrievalError::SyncNotFound {
                        limit: self.config.sync_search_limit,
                    });
                }
            }
            previous = Some(byte);
        }
    }

    /// Read two bytes and check them against the footer marker.
    pub fn verify_footer(&mut self) -> AppResult<()> {
        let raw = self.read_field(2, "sync footer")?;
        let found = u16::from_le_bytes([raw[0], raw[1]]);
        if found != self.config.footer {
            warn!(found = format_args!("0x{found:04X}"), "Invalid sync footer");
            return Err(RetrievalError::FooterMismatch {
                expected: self.config.footer,
                found,
            });
        }
        Ok(())
    }

    /// Synchronise, then read the little-endian length prefix.
    ///
    /// The returned size is always in `1..=max_payload`.
    pub fn read_size(&mut self) -> AppResult<u32> {
        self.wait_for_sync()?;
        let raw = self.read_field(4, "length prefix")?;
        let size = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

        if size > self.config.max_payload {
            warn!(
                declared = size,
                limit = self.config.max_payload,
                "Suspiciously large size received"
            );
            return Err(RetrievalError::SizeBound {
                declared: size,
                limit: self.config.max_payload,
            });
        }
        if size == 0 {
            warn!("Invalid size received");
            return Err(RetrievalError::EmptyFrame);
        }

        debug!(size, "Received size");
        Ok(size)
    }

    /// Read one length-delimited frame and return its payload.
    ///
    /// The payload is returned only when the size is valid, every byte arrived
    /// within the inactivity timeout and the footer matches.
    pub fn read_image(&mut self) -> AppResult<Bytes> {
        let size = self.read_size()? as usize;

        let payload = match self.reader.read_exactly(size, self.config.transfer_timeout()) {
            Ok(payload) => payload,
            Err(e) => {
                if let RetrievalError::TransferTimeout { received, .. } = &e {
                    warn!(
                        expected = size,
                        received = *received,
                        timeout_ms = self.config.transfer_timeout_ms,
                        "Timeout while reading image data"
                    );
                }
                return Err(e);
            }
        };

        if let Err(e) = self.verify_footer() {
            warn!("Invalid footer after image data");
            return Err(e);
        }

        Ok(payload)
    }

    /// Request and read the image of `category` at `index`.
    #[instrument(skip(self), level = "debug", err)]
    pub fn request_image(&mut self, category: ImageCategory, index: u8) -> AppResult<Bytes> {
        self.send_command(Command::for_category(category, index))?;
        self.read_image()
    }

    /// Request the performance record.
    ///
    /// Structural failures (sync, short field, footer) are errors. Values outside
    /// the sanity bounds are zeroed and listed in
    /// [`PerformanceMetrics::violations`].
    #[instrument(skip(self), level = "debug", err)]
    pub fn get_performance_metrics(&mut self) -> AppResult<PerformanceMetrics> {
        self.send_command(Command::GetPerformance)?;
        debug!("Requested performance metrics");
        self.wait_for_sync()?;

        let mut raw = [0u8; METRICS_PAYLOAD_LEN];
        raw[..4].copy_from_slice(&self.read_field(4, "fps")?);
        for (i, field) in TimingField::ALL.into_iter().enumerate() {
            let what = match field {
                TimingField::Capture => "capture time",
                TimingField::Histogram => "histogram time",
                TimingField::Sobel => "sobel time",
                TimingField::Save => "save time",
            };
            raw[4 + i * 8..12 + i * 8].copy_from_slice(&self.read_field(8, what)?);
        }

        self.verify_footer()?;

        let metrics = PerformanceMetrics::from_le_bytes(&raw).apply_bounds(&self.config);
        for violation in &metrics.violations {
            warn!(%violation, "Zeroed out-of-range metric");
        }
        Ok(metrics)
    }

    /// Fixed-size read that reports a stall as a short read of `what`.
    fn read_field(&mut self, n: usize, what: &'static str) -> AppResult<Bytes> {
        match self.reader.read_exactly(n, self.config.read_timeout()) {
            Err(RetrievalError::TransferTimeout {
                expected, received, ..
            }) => {
                warn!(what, expected, received, "Could not read field");
                Err(RetrievalError::ShortRead {
                    what,
                    expected,
                    received,
                })
            }
            other => other,
        }
    }
}
