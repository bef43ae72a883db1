//! Buffered, timeout-aware reads over a [`Transport`].
//!
//! Every fixed-size read in the protocol (markers, length prefix, payload,
//! metrics fields) goes through [`FrameReader::read_exactly`]. It pulls data in
//! chunks of at most `chunk_size` bytes and gives up once no byte has arrived
//! for the given inactivity window.

use crate::error::{AppResult, RetrievalError};
use crate::transport::Transport;
use bytes::{Bytes, BytesMut};
use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};
use tracing::trace;

const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// Accumulating reader over a transport.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    scratch: Vec<u8>,
}

impl<T: Transport> FrameReader<T> {
    /// Wrap `inner`, reading at most `chunk_size` bytes per transport call.
    pub fn new(inner: T, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            inner,
            buf: BytesMut::with_capacity(chunk_size),
            scratch: vec![0; chunk_size],
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// The inactivity timer restarts whenever bytes arrive. On a stall the
    /// partial data is discarded and [`RetrievalError::TransferTimeout`] reports
    /// how far the transfer got.
    pub fn read_exactly(&mut self, n: usize, timeout: Duration) -> AppResult<Bytes> {
        let mut last_progress = Instant::now();

        while self.buf.len() < n {
            let want = (n - self.buf.len()).min(self.scratch.len());
            match self.inner.read(&mut self.scratch[..want]) {
                Ok(0) => {}
                Ok(k) => {
                    self.buf.extend_from_slice(&self.scratch[..k]);
                    last_progress = Instant::now();
                    trace!(received = self.buf.len(), expected = n, "Read chunk");
                    continue;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    self.buf.clear();
                    return Err(e.into());
                }
            }

            let idle = last_progress.elapsed();
            if idle >= timeout {
                let received = self.buf.len();
                self.buf.clear();
                return Err(RetrievalError::TransferTimeout {
                    expected: n,
                    received,
                    idle,
                });
            }
            thread::sleep(IDLE_BACKOFF);
        }

        Ok(self.buf.split_to(n).freeze())
    }

    /// Write `bytes` and flush.
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)?;
        self.inner.flush()
    }

    /// Drop buffered bytes and clear the transport's buffers.
    pub fn clear(&mut self) -> io::Result<()> {
        self.buf.clear();
        self.inner.clear_buffers()
    }

    /// Underlying transport.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Underlying transport, mutably.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Unwrap the transport, dropping any buffered bytes.
    pub fn into_inner(self) -> T {
        self.inner
    }
}
