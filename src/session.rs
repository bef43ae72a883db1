//! Retrieval sessions.
//!
//! A [`RetrievalSession`] owns the open connection and the output directory for
//! the duration of a run. Dropping the session drops the transport, which closes
//! the serial port on every exit path.
//!
//! Failures of individual commands are collected into a [`RetrievalReport`]
//! instead of stopping the run; only fatal errors (see
//! [`RetrievalError::is_recoverable`]) end it early.

use crate::client::RetrievalClient;
use crate::config::{ImageConfig, RetrieverConfig};
use crate::error::{AppResult, RetrievalError};
use crate::protocol::{ImageCategory, PerformanceMetrics};
use crate::storage::{ImageRecord, SessionStore};
use crate::transport::{SerialTransport, Transport};
use std::path::{Path, PathBuf};
use tracing::{info, info_span, warn};

/// A successfully persisted image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedImage {
    /// Image category.
    pub category: ImageCategory,
    /// Device index.
    pub index: u8,
    /// File written.
    pub path: PathBuf,
}

/// Step of a run that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalStep {
    /// Fetching the performance record.
    Metrics,
    /// Fetching or saving one image.
    Image {
        /// Image category.
        category: ImageCategory,
        /// Device index.
        index: u8,
    },
    /// Writing the performance chart.
    Chart,
}

/// A non-fatal failure recorded during a run.
#[derive(Debug)]
pub struct RetrievalFailure {
    /// Where it happened.
    pub step: RetrievalStep,
    /// Why.
    pub error: RetrievalError,
}

/// Outcome of a run.
#[derive(Debug, Default)]
pub struct RetrievalReport {
    /// Images written, in retrieval order.
    pub saved: Vec<SavedImage>,
    /// Failures, in the order they happened.
    pub failures: Vec<RetrievalFailure>,
    /// Performance record fetched at the start of the run, if any.
    pub metrics: Option<PerformanceMetrics>,
    /// Chart written at the end of the run, if any.
    pub chart: Option<PathBuf>,
}

impl RetrievalReport {
    /// Whether every step succeeded.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: RetrievalStep, error: RetrievalError) -> AppResult<()> {
        if !error.is_recoverable() {
            return Err(error);
        }
        self.failures.push(RetrievalFailure { step, error });
        Ok(())
    }
}

/// An open connection plus its output directory.
pub struct RetrievalSession<T: Transport> {
    client: RetrievalClient<T>,
    store: SessionStore,
    image: ImageConfig,
}

impl RetrievalSession<SerialTransport> {
    /// Open the configured serial port and create a timestamped session directory.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Transport`] if the port cannot be opened,
    /// [`RetrievalError::Storage`] if the directory cannot be created.
    pub fn open(config: &RetrieverConfig) -> AppResult<Self> {
        let transport = SerialTransport::open(&config.serial)?;
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> RetrievalSession<T> {
    /// Start a session over an already-open transport.
    pub fn with_transport(transport: T, config: &RetrieverConfig) -> AppResult<Self> {
        let store = SessionStore::create(&config.output, &config.image)?;
        Ok(Self::with_store(transport, config, store))
    }

    /// Start a session writing into an existing store.
    pub fn with_store(transport: T, config: &RetrieverConfig, store: SessionStore) -> Self {
        info!(transport = %transport.describe(), "Session started");
        Self {
            client: RetrievalClient::new(transport, config.protocol.clone()),
            store,
            image: config.image.clone(),
        }
    }

    /// Session output directory.
    pub fn output_dir(&self) -> &Path {
        self.store.root()
    }

    /// The protocol client.
    pub fn client(&self) -> &RetrievalClient<T> {
        &self.client
    }

    /// The protocol client, mutably.
    pub fn client_mut(&mut self) -> &mut RetrievalClient<T> {
        &mut self.client
    }

    /// Fetch the performance record and log it in milliseconds.
    pub fn fetch_metrics(&mut self) -> AppResult<PerformanceMetrics> {
        let metrics = self.client.get_performance_metrics()?;
        let [capture, histogram, sobel, save] = metrics.timings_ms().map(|(_, ms)| ms);
        info!(
            fps = format_args!("{:.2}", metrics.fps),
            capture_ms = format_args!("{capture:.2}"),
            histogram_ms = format_args!("{histogram:.2}"),
            sobel_ms = format_args!("{sobel:.2}"),
            save_ms = format_args!("{save:.2}"),
            "Performance metrics"
        );
        Ok(metrics)
    }

    /// Request, validate and persist one image.
    pub fn retrieve_image(&mut self, category: ImageCategory, index: u8) -> AppResult<SavedImage> {
        let data = self.client.request_image(category, index)?;

        if self.image.enforce_dimensions && data.len() != self.image.raster_len() {
            warn!(
                %category,
                index,
                expected = self.image.raster_len(),
                received = data.len(),
                "Payload does not match raster size"
            );
            return Err(RetrievalError::RasterSizeMismatch {
                width: self.image.width,
                height: self.image.height,
                expected: self.image.raster_len(),
                received: data.len(),
            });
        }

        let record = ImageRecord {
            category,
            index,
            data,
        };
        let path = self.store.save_image(&record).map_err(|e| {
            warn!(%category, index, error = %e, "Error saving image");
            e
        })?;
        info!(%category, index, path = ?path, "Saved image");

        Ok(SavedImage {
            category,
            index,
            path,
        })
    }

    /// Retrieve original, histogram and Sobel images for indices `0..count`.
    ///
    /// Missing or invalid responses are logged, recorded and skipped.
    ///
    /// # Errors
    ///
    /// Only fatal errors are returned; everything else lands in the report.
    pub fn retrieve_all_images(&mut self, count: usize) -> AppResult<RetrievalReport> {
        let mut report = RetrievalReport::default();
        self.retrieve_into(count, &mut report)?;
        Ok(report)
    }

    fn retrieve_into(&mut self, count: usize, report: &mut RetrievalReport) -> AppResult<()> {
        info!(count, "Retrieving images");
        for i in 0..count {
            let Ok(index) = u8::try_from(i) else {
                warn!(count, "Index range exhausted at 256 images");
                break;
            };
            let _span = info_span!("image", index).entered();
            info!("Retrieving image {}/{}", i + 1, count);

            for category in ImageCategory::ALL {
                match self.retrieve_image(category, index) {
                    Ok(saved) => report.saved.push(saved),
                    Err(error) => {
                        warn!(%category, index, %error, "Skipping image");
                        report.record(RetrievalStep::Image { category, index }, error)?;
                    }
                }
            }
        }
        info!(path = ?self.store.root(), saved = report.saved.len(), "Images saved");
        Ok(())
    }

    /// Fetch a fresh performance record and write the chart and JSON.
    pub fn plot_performance(&mut self) -> AppResult<PathBuf> {
        let metrics = self.fetch_metrics()?;
        self.store.save_performance(&metrics)
    }

    /// Metrics, then `count` image triples, then the performance chart.
    pub fn run(&mut self, count: usize) -> AppResult<RetrievalReport> {
        let mut report = RetrievalReport::default();

        match self.fetch_metrics() {
            Ok(metrics) => report.metrics = Some(metrics),
            Err(error) => {
                warn!(%error, "Could not get performance metrics");
                report.record(RetrievalStep::Metrics, error)?;
            }
        }

        self.retrieve_into(count, &mut report)?;

        match self.plot_performance() {
            Ok(path) => report.chart = Some(path),
            Err(error) => {
                warn!(%error, "Could not get performance metrics for plotting");
                report.record(RetrievalStep::Chart, error)?;
            }
        }

        Ok(report)
    }

    /// Close the connection.
    pub fn close(self) -> T {
        info!(path = ?self.store.root(), "Session closed");
        self.client.into_transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Fault, ScriptedTransport, SimulatedCamera};
    use crate::protocol::{Command, ProtocolConfig};
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn test_config(width: u32, height: u32) -> RetrieverConfig {
        let mut config = RetrieverConfig::default();
        config.protocol = ProtocolConfig {
            read_timeout_ms: 20,
            transfer_timeout_ms: 60,
            command_settle_ms: 0,
            ..ProtocolConfig::default()
        };
        config.image.width = width;
        config.image.height = height;
        config.image.extension = "png".into();
        config
    }

    fn session<T: Transport>(
        transport: T,
        config: &RetrieverConfig,
        dir: &Path,
    ) -> RetrievalSession<T> {
        let store = SessionStore::at(dir, &config.image).unwrap();
        RetrievalSession::with_store(transport, config, store)
    }

    #[test]
    fn test_retrieve_all_images_layout() {
        let tmp = tempdir().unwrap();
        let config = test_config(32, 24);
        let camera = SimulatedCamera::new(config.protocol.clone(), 32, 24);
        let mut s = session(camera, &config, tmp.path());

        let report = s.retrieve_all_images(2).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.saved.len(), 6);
        for sub in ["original", "histogram", "sobel"] {
            for i in 0..2 {
                assert!(tmp.path().join(sub).join(format!("image_{i:02}.png")).is_file());
            }
        }

        let camera = s.close();
        assert_eq!(
            camera.received_commands(),
            &[
                Command::GetImage(0),
                Command::GetHistogram(0),
                Command::GetSobel(0),
                Command::GetImage(1),
                Command::GetHistogram(1),
                Command::GetSobel(1),
            ]
        );
    }

    #[test]
    #[traced_test]
    fn test_stalled_transfer_does_not_stop_loop() {
        let tmp = tempdir().unwrap();
        let config = test_config(32, 24);
        // Header + length + half of the raster
        let stall_at = 6 + (32 * 24) / 2;
        let camera = SimulatedCamera::new(config.protocol.clone(), 32, 24)
            .with_fault(Command::GetImage(0), Fault::StallAfter(stall_at));
        let mut s = session(camera, &config, tmp.path());

        let report = s.retrieve_all_images(2).unwrap();
        assert_eq!(report.saved.len(), 5);
        assert_eq!(report.failures.len(), 1);
        let failure = &report.failures[0];
        assert_eq!(
            failure.step,
            RetrievalStep::Image {
                category: ImageCategory::Original,
                index: 0
            }
        );
        assert!(matches!(
            failure.error,
            RetrievalError::TransferTimeout {
                expected: 768,
                received: 384,
                ..
            }
        ));
        assert!(!tmp.path().join("original").join("image_00.png").exists());
        assert!(tmp.path().join("histogram").join("image_00.png").exists());
        assert!(logs_contain("Timeout while reading image data"));
    }

    #[test]
    fn test_raster_size_enforced() {
        let tmp = tempdir().unwrap();
        let config = test_config(32, 24);
        // Camera produces 16x12 frames while 32x24 is expected
        let camera = SimulatedCamera::new(config.protocol.clone(), 16, 12);
        let mut s = session(camera, &config, tmp.path());

        let err = s.retrieve_image(ImageCategory::Sobel, 0).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::RasterSizeMismatch {
                expected: 768,
                received: 192,
                ..
            }
        ));
    }

    #[test]
    fn test_raster_size_not_enforced_still_needs_valid_raster() {
        let tmp = tempdir().unwrap();
        let mut config = test_config(32, 24);
        config.image.enforce_dimensions = false;
        let camera = SimulatedCamera::new(config.protocol.clone(), 16, 12);
        let mut s = session(camera, &config, tmp.path());

        // Skips the protocol-level check but the encoder still refuses it
        let err = s.retrieve_image(ImageCategory::Original, 0).unwrap_err();
        assert!(matches!(err, RetrievalError::RasterSizeMismatch { .. }));
    }

    #[test]
    fn test_run_writes_metrics_and_chart() {
        let tmp = tempdir().unwrap();
        let config = test_config(16, 12);
        let camera = SimulatedCamera::new(config.protocol.clone(), 16, 12);
        let mut s = session(camera, &config, tmp.path());

        let report = s.run(1).unwrap();
        assert!(report.is_complete());
        assert_eq!(
            report.metrics,
            Some(PerformanceMetrics::new(12.5, 190, 2730, 5260, 300))
        );
        assert_eq!(report.chart, Some(tmp.path().join("performance.png")));
        assert!(tmp.path().join("performance.json").is_file());

        let camera = s.close();
        let commands = camera.received_commands();
        assert_eq!(commands.first(), Some(&Command::GetPerformance));
        assert_eq!(commands.last(), Some(&Command::GetPerformance));
        assert_eq!(commands.len(), 5);
    }

    #[test]
    fn test_run_survives_silent_device() {
        let tmp = tempdir().unwrap();
        let config = test_config(16, 12);
        let mut s = session(ScriptedTransport::new(), &config, tmp.path());

        let report = s.run(1).unwrap();
        assert!(report.saved.is_empty());
        assert!(report.metrics.is_none());
        assert!(report.chart.is_none());
        // metrics + three images + chart
        assert_eq!(report.failures.len(), 5);
        assert!(report
            .failures
            .iter()
            .all(|f| matches!(f.error, RetrievalError::SyncTimeout { .. })));
    }
}
