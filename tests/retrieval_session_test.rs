//! Integration tests for the retrieval flow
//!
//! These drive the public API end to end against scripted and simulated
//! transports and check what lands on disk.

use esp_cam_retriever::config::RetrieverConfig;
use esp_cam_retriever::mock::{Fault, ScriptedTransport, SimulatedCamera};
use esp_cam_retriever::protocol::{Command, ImageCategory, PerformanceMetrics, ProtocolConfig};
use esp_cam_retriever::session::{RetrievalSession, RetrievalStep};
use esp_cam_retriever::storage::SessionStore;
use esp_cam_retriever::RetrievalError;
use std::path::Path;
use tempfile::tempdir;

fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        read_timeout_ms: 20,
        transfer_timeout_ms: 50,
        command_settle_ms: 0,
        ..ProtocolConfig::default()
    }
}

fn small_config() -> RetrieverConfig {
    let mut config = RetrieverConfig::default();
    config.protocol = fast_protocol();
    config.image.width = 24;
    config.image.height = 16;
    config.image.extension = "png".into();
    config
}

fn session_in<T: esp_cam_retriever::transport::Transport>(
    transport: T,
    config: &RetrieverConfig,
    dir: &Path,
) -> RetrievalSession<T> {
    let store = SessionStore::at(dir, &config.image).unwrap();
    RetrievalSession::with_store(transport, config, store)
}

// =============================================================================
// Full-size frames
// =============================================================================

#[test]
fn test_full_vga_frame_saved_as_original_jpg() {
    let tmp = tempdir().unwrap();
    let mut config = RetrieverConfig::default();
    config.protocol.command_settle_ms = 0;

    let pixels: Vec<u8> = (0..640 * 480).map(|i| (i % 251) as u8).collect();
    let frame = config.protocol.encode_frame(&pixels);
    assert_eq!(frame.len(), 2 + 4 + 307_200 + 2);

    let transport = ScriptedTransport::new().with_reply(frame);
    let mut session = session_in(transport, &config, tmp.path());

    let saved = session.retrieve_image(ImageCategory::Original, 3).unwrap();
    assert_eq!(saved.path, tmp.path().join("original").join("image_03.jpg"));
    assert_eq!(image::image_dimensions(&saved.path).unwrap(), (640, 480));

    let transport = session.close();
    assert_eq!(transport.written(), &[0x01, 0x03]);
    assert_eq!(transport.remaining(), 0);
}

// =============================================================================
// Frame validation
// =============================================================================

#[test]
fn test_wrong_footer_rejected() {
    let tmp = tempdir().unwrap();
    let config = small_config();
    let camera = SimulatedCamera::new(config.protocol.clone(), 24, 16)
        .with_fault(Command::GetHistogram(0), Fault::CorruptFooter);
    let mut session = session_in(camera, &config, tmp.path());

    let err = session
        .retrieve_image(ImageCategory::Histogram, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::FooterMismatch {
            expected: 0x55AA,
            found: 0
        }
    ));
    assert!(!tmp.path().join("histogram").join("image_00.png").exists());
}

#[test]
fn test_oversized_length_rejected_without_reading_payload() {
    let tmp = tempdir().unwrap();
    let config = small_config();
    let camera = SimulatedCamera::new(config.protocol.clone(), 24, 16)
        .with_fault(Command::GetSobel(1), Fault::AnnounceLength(1_000_001));
    let mut session = session_in(camera, &config, tmp.path());

    let err = session.retrieve_image(ImageCategory::Sobel, 1).unwrap_err();
    assert!(matches!(
        err,
        RetrievalError::SizeBound {
            declared: 1_000_001,
            limit: 1_000_000
        }
    ));

    // The next command still works
    let saved = session.retrieve_image(ImageCategory::Sobel, 2).unwrap();
    assert!(saved.path.is_file());
}

#[test]
fn test_size_at_limit_accepted() {
    let mut protocol = fast_protocol();
    protocol.max_payload = 64;
    let payload = vec![7u8; 64];
    let transport = ScriptedTransport::new().with_reply(protocol.encode_frame(&payload));
    let mut client = esp_cam_retriever::RetrievalClient::new(transport, protocol);

    let data = client.request_image(ImageCategory::Original, 0).unwrap();
    assert_eq!(data.len(), 64);
}

#[test]
fn test_missing_index_is_skipped() {
    let tmp = tempdir().unwrap();
    let config = small_config();
    let camera = SimulatedCamera::new(config.protocol.clone(), 24, 16).with_frame_count(1);
    let mut session = session_in(camera, &config, tmp.path());

    let report = session.retrieve_all_images(2).unwrap();
    assert_eq!(report.saved.len(), 3);
    assert_eq!(report.failures.len(), 3);
    assert!(report.failures.iter().all(|f| matches!(
        f.step,
        RetrievalStep::Image { index: 1, .. }
    )));
}

// =============================================================================
// Performance metrics
// =============================================================================

#[test]
fn test_metrics_out_of_bounds_zeroed() {
    let tmp = tempdir().unwrap();
    let config = small_config();
    let camera = SimulatedCamera::new(config.protocol.clone(), 24, 16)
        .with_metrics(PerformanceMetrics::new(5000.0, 190, 2_000_000_000, 5260, 300));
    let mut session = session_in(camera, &config, tmp.path());

    let metrics = session.fetch_metrics().unwrap();
    assert_eq!(metrics.fps, 0.0);
    assert_eq!(metrics.histogram_us, 0);
    assert_eq!(metrics.capture_us, 190);
    assert_eq!(metrics.violations.len(), 2);
}

#[test]
fn test_run_produces_complete_session() {
    let tmp = tempdir().unwrap();
    let config = small_config();
    let camera = SimulatedCamera::new(config.protocol.clone(), 24, 16);
    let mut session = session_in(camera, &config, tmp.path());

    let report = session.run(3).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.saved.len(), 9);
    assert!(tmp.path().join("performance.png").is_file());
    assert!(tmp.path().join("performance.json").is_file());

    let loaded = image::open(tmp.path().join("sobel").join("image_02.png"))
        .unwrap()
        .to_luma8();
    let camera = session.close();
    assert_eq!(loaded.into_raw(), camera.raster(ImageCategory::Sobel, 2));
}
