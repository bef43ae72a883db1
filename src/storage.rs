//! Session directory and image persistence.
//!
//! A [`SessionStore`] owns one timestamped output directory:
//!
//! ```text
//! captured_images_20241018_153000/
//! ├── original/image_00.jpg ...
//! ├── histogram/image_00.jpg ...
//! ├── sobel/image_00.jpg ...
//! ├── performance.png
//! └── performance.json
//! ```
//!
//! Payloads are written as 8-bit grayscale rasters through the `image` crate;
//! the encoder is chosen from the configured file extension.

use crate::config::{ImageConfig, OutputConfig};
use crate::error::{AppResult, RetrievalError};
use crate::protocol::{ImageCategory, PerformanceMetrics};
use bytes::Bytes;
use chrono::Local;
use image::{GrayImage, ImageBuffer, Rgb, RgbImage};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHART_WIDTH: u32 = 800;
const CHART_HEIGHT: u32 = 480;
const CHART_MARGIN: u32 = 40;
const BAR_COLORS: [[u8; 3]; 4] = [
    [31, 119, 180],
    [255, 127, 14],
    [44, 160, 44],
    [214, 39, 40],
];

/// One retrieved image payload.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Which processed image this is.
    pub category: ImageCategory,
    /// Sequence index on the device.
    pub index: u8,
    /// Raw 8-bit grayscale pixels, row-major.
    pub data: Bytes,
}

/// Output directory for one retrieval session.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    width: u32,
    height: u32,
    extension: String,
}

impl SessionStore {
    /// Create `<base_dir>/<prefix>_YYYYmmdd_HHMMSS` and its category subfolders.
    ///
    /// # Errors
    ///
    /// [`RetrievalError::Storage`] if a directory cannot be created.
    pub fn create(output: &OutputConfig, image: &ImageConfig) -> AppResult<Self> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let root = output
            .base_dir
            .join(format!("{}_{}", output.session_prefix, stamp));
        Self::at(root, image)
    }

    /// Use `root` as the session directory, creating it and its subfolders.
    pub fn at(root: impl Into<PathBuf>, image: &ImageConfig) -> AppResult<Self> {
        let root = root.into();
        for category in ImageCategory::ALL {
            let dir = root.join(category.dir_name());
            fs::create_dir_all(&dir).map_err(|source| RetrievalError::Storage {
                path: dir.clone(),
                source,
            })?;
        }
        info!(path = ?root, "Created session directory");

        Ok(Self {
            root,
            width: image.width,
            height: image.height,
            extension: image.extension.clone(),
        })
    }

    /// Session directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination of `category` image `index` (`<category>/image_NN.<ext>`).
    pub fn image_path(&self, category: ImageCategory, index: u8) -> PathBuf {
        self.root
            .join(category.dir_name())
            .join(format!("image_{:02}.{}", index, self.extension))
    }

    /// Persist `record` as a grayscale image.
    ///
    /// # Errors
    ///
    /// - [`RetrievalError::RasterSizeMismatch`] if the payload cannot form the
    ///   configured raster
    /// - [`RetrievalError::Image`] if encoding or writing fails
    pub fn save_image(&self, record: &ImageRecord) -> AppResult<PathBuf> {
        let expected = self.width as usize * self.height as usize;
        let img: GrayImage = ImageBuffer::from_raw(self.width, self.height, record.data.to_vec())
            .ok_or(RetrievalError::RasterSizeMismatch {
                width: self.width,
                height: self.height,
                expected,
                received: record.data.len(),
            })?;

        let path = self.image_path(record.category, record.index);
        img.save(&path)?;

        debug!(
            path = ?path,
            category = %record.category,
            index = record.index,
            dimensions = format!("{}x{}", self.width, self.height),
            "Wrote grayscale image"
        );
        Ok(path)
    }

    /// Write `performance.png` (bar chart of the four timings) and
    /// `performance.json`. Returns the chart path.
    pub fn save_performance(&self, metrics: &PerformanceMetrics) -> AppResult<PathBuf> {
        let chart_path = self.root.join("performance.png");
        render_chart(metrics).save(&chart_path)?;

        let json_path = self.root.join("performance.json");
        let writer = BufWriter::new(File::create(&json_path)?);
        serde_json::to_writer_pretty(writer, metrics)?;

        info!(path = ?chart_path, "Wrote performance chart");
        Ok(chart_path)
    }
}

/// Bar chart of the timing fields in milliseconds, tallest bar scaled to the
/// plot height. Bars keep wire order: capture, histogram, sobel, save.
pub(crate) fn render_chart(metrics: &PerformanceMetrics) -> RgbImage {
    let mut img = RgbImage::from_pixel(CHART_WIDTH, CHART_HEIGHT, Rgb([255, 255, 255]));
    let timings = metrics.timings_ms();
    let max_ms = timings.iter().map(|(_, ms)| *ms).fold(0.0f64, f64::max);

    let plot_height = CHART_HEIGHT - 2 * CHART_MARGIN;
    let baseline = CHART_HEIGHT - CHART_MARGIN;
    let slot = (CHART_WIDTH - 2 * CHART_MARGIN) / timings.len() as u32;
    let bar_width = slot * 3 / 5;

    for (i, (_, ms)) in timings.iter().enumerate() {
        let height = if max_ms > 0.0 {
            ((ms / max_ms) * f64::from(plot_height)).round() as u32
        } else {
            0
        };
        let x0 = CHART_MARGIN + i as u32 * slot + (slot - bar_width) / 2;
        for x in x0..x0 + bar_width {
            for y in baseline - height..baseline {
                img.put_pixel(x, y, Rgb(BAR_COLORS[i]));
            }
        }
    }

    // Axes
    for x in CHART_MARGIN..CHART_WIDTH - CHART_MARGIN {
        img.put_pixel(x, baseline, Rgb([0, 0, 0]));
    }
    for y in CHART_MARGIN..=baseline {
        img.put_pixel(CHART_MARGIN, y, Rgb([0, 0, 0]));
    }
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_image() -> ImageConfig {
        ImageConfig {
            width: 8,
            height: 4,
            extension: "png".into(),
            ..ImageConfig::default()
        }
    }

    #[test]
    fn test_create_session_layout() {
        let tmp = tempdir().unwrap();
        let output = OutputConfig {
            base_dir: tmp.path().to_path_buf(),
            session_prefix: "captured_images".into(),
        };
        let store = SessionStore::create(&output, &ImageConfig::default()).unwrap();

        let name = store.root().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("captured_images_"));
        // captured_images_YYYYmmdd_HHMMSS
        assert_eq!(name.len(), "captured_images_".len() + 15);
        for sub in ["original", "histogram", "sobel"] {
            assert!(store.root().join(sub).is_dir());
        }
    }

    #[test]
    fn test_image_path_zero_pads_index() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::at(tmp.path(), &ImageConfig::default()).unwrap();
        assert_eq!(
            store.image_path(ImageCategory::Original, 3),
            tmp.path().join("original").join("image_03.jpg")
        );
        assert_eq!(
            store.image_path(ImageCategory::Sobel, 17),
            tmp.path().join("sobel").join("image_17.jpg")
        );
    }

    #[test]
    fn test_save_image_round_trip() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::at(tmp.path(), &small_image()).unwrap();
        let pixels: Vec<u8> = (0..32).map(|i| i * 8).collect();
        let record = ImageRecord {
            category: ImageCategory::Histogram,
            index: 1,
            data: Bytes::from(pixels.clone()),
        };

        let path = store.save_image(&record).unwrap();
        assert_eq!(path, tmp.path().join("histogram").join("image_01.png"));

        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.dimensions(), (8, 4));
        assert_eq!(loaded.into_raw(), pixels);
    }

    #[test]
    fn test_save_image_rejects_wrong_size() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::at(tmp.path(), &small_image()).unwrap();
        let record = ImageRecord {
            category: ImageCategory::Original,
            index: 0,
            data: Bytes::from(vec![0u8; 31]),
        };
        let err = store.save_image(&record).unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::RasterSizeMismatch {
                expected: 32,
                received: 31,
                ..
            }
        ));
        assert!(!store.image_path(ImageCategory::Original, 0).exists());
    }

    #[test]
    fn test_save_performance_outputs() {
        let tmp = tempdir().unwrap();
        let store = SessionStore::at(tmp.path(), &small_image()).unwrap();
        let metrics = PerformanceMetrics::new(12.5, 190, 2730, 5260, 300);

        let chart = store.save_performance(&metrics).unwrap();
        assert_eq!(chart, tmp.path().join("performance.png"));
        assert_eq!(image::image_dimensions(&chart).unwrap(), (800, 480));

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(tmp.path().join("performance.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(json["fps"], 12.5);
        assert_eq!(json["sobel_us"], 5260);
        assert!(json.get("violations").is_none());
    }

    #[test]
    fn test_chart_tallest_bar_is_sobel() {
        let metrics = PerformanceMetrics::new(12.5, 190, 2730, 5260, 300);
        let img = render_chart(&metrics);
        let slot = (CHART_WIDTH - 2 * CHART_MARGIN) / 4;
        let center = |i: u32| CHART_MARGIN + i * slot + slot / 2;

        // Top of the plot area is only reached by the largest bar
        let top = CHART_MARGIN + 1;
        assert_eq!(*img.get_pixel(center(2), top), Rgb(BAR_COLORS[2]));
        assert_eq!(*img.get_pixel(center(0), top), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_chart_all_zero_has_no_bars() {
        let metrics = PerformanceMetrics::new(0.0, 0, 0, 0, 0);
        let img = render_chart(&metrics);
        let slot = (CHART_WIDTH - 2 * CHART_MARGIN) / 4;
        let x = CHART_MARGIN + slot / 2;
        assert_eq!(
            *img.get_pixel(x, CHART_HEIGHT - CHART_MARGIN - 1),
            Rgb([255, 255, 255])
        );
    }
}
