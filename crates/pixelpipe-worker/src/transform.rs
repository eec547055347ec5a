//! Image transformation capability
//!
//! Resize, optional watermark composite, re-encode. The worker treats
//! this as an opaque capability behind the [`Transform`] trait; what it
//! does care about is the error classification: a retriable failure
//! (disk pressure, timeout) is worth redelivering, a terminal one
//! (missing or corrupt source) never self-heals.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::imageops::FilterType;
use image::ImageFormat;
use thiserror::Error;

/// Width the watermark overlay is scaled down to before compositing.
const WATERMARK_WIDTH: u32 = 150;

/// Transformation failure, classified for the retry policy.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Source file missing: {0}")]
    SourceMissing(PathBuf),

    #[error("Decode error for {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Encode error for {path}: {message}")]
    Encode { path: PathBuf, message: String },

    #[error("IO error for {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Transform timed out after {timeout_ms}ms for {path}")]
    Timeout { path: PathBuf, timeout_ms: u64 },
}

impl TransformError {
    /// Whether redelivering the task could plausibly succeed. Missing or
    /// corrupt sources fail deterministically; I/O pressure and timeouts
    /// do not.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransformError::Io { .. } | TransformError::Timeout { .. }
        )
    }
}

/// The transformation capability invoked by the worker for each task.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Produce the derived artifact at `dest` from the file at
    /// `original`. Writing to an existing `dest` overwrites it, so a
    /// duplicate delivery with deterministic naming is safe.
    async fn transform(&self, original: &Path, dest: &Path) -> Result<(), TransformError>;
}

/// Resize to a maximum width, composite a watermark bottom-right, encode
/// as WebP.
#[derive(Clone)]
pub struct WatermarkTransform {
    max_width: u32,
    watermark_path: Option<PathBuf>,
}

impl WatermarkTransform {
    pub fn new(max_width: u32, watermark_path: Option<PathBuf>) -> Self {
        Self {
            max_width,
            watermark_path,
        }
    }

    fn run(&self, original: &Path, dest: &Path) -> Result<(), TransformError> {
        if !original.exists() {
            return Err(TransformError::SourceMissing(original.to_path_buf()));
        }

        let mut img = image::open(original).map_err(|e| classify_open(original, e))?;

        if img.width() > self.max_width {
            img = img.resize(self.max_width, u32::MAX, FilterType::Lanczos3);
        }

        if let Some(ref watermark_path) = self.watermark_path {
            let watermark = image::open(watermark_path)
                .map_err(|e| classify_open(watermark_path, e))?
                .resize(WATERMARK_WIDTH, u32::MAX, FilterType::Triangle);

            // Bottom-right corner
            let x = i64::from(img.width().saturating_sub(watermark.width()));
            let y = i64::from(img.height().saturating_sub(watermark.height()));
            image::imageops::overlay(&mut img, &watermark, x, y);
        }

        img.save_with_format(dest, ImageFormat::WebP)
            .map_err(|e| classify_save(dest, e))
    }
}

#[async_trait]
impl Transform for WatermarkTransform {
    async fn transform(&self, original: &Path, dest: &Path) -> Result<(), TransformError> {
        let original = original.to_path_buf();
        let dest = dest.to_path_buf();
        let err_path = original.clone();
        let this = self.clone();

        tokio::task::spawn_blocking(move || this.run(&original, &dest))
            .await
            .map_err(|e| TransformError::Io {
                path: err_path,
                message: format!("transform task failed: {}", e),
            })?
    }
}

fn classify_open(path: &Path, err: image::ImageError) -> TransformError {
    match err {
        image::ImageError::IoError(io) if io.kind() == std::io::ErrorKind::NotFound => {
            TransformError::SourceMissing(path.to_path_buf())
        },
        image::ImageError::IoError(io) => TransformError::Io {
            path: path.to_path_buf(),
            message: io.to_string(),
        },
        other => TransformError::Decode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

fn classify_save(path: &Path, err: image::ImageError) -> TransformError {
    match err {
        image::ImageError::IoError(io) => TransformError::Io {
            path: path.to_path_buf(),
            message: io.to_string(),
        },
        other => TransformError::Encode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;

    /// Decode by content: the transform encodes WebP regardless of the
    /// destination extension, so extension-based `image::open` cannot
    /// read it back.
    fn read_output(path: &Path) -> DynamicImage {
        image::ImageReader::open(path)
            .unwrap()
            .with_guessed_format()
            .unwrap()
            .decode()
            .unwrap()
    }

    fn write_test_image(path: &Path, width: u32, height: u32) {
        DynamicImage::new_rgb8(width, height)
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    #[tokio::test]
    async fn resizes_wide_images_down_to_max_width() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("u1.png");
        let dest = dir.path().join("processed-u1.png");
        write_test_image(&original, 1000, 500);

        let transform = WatermarkTransform::new(800, None);
        transform.transform(&original, &dest).await.unwrap();

        let out = read_output(&dest);
        assert_eq!(out.width(), 800);
        assert_eq!(out.height(), 400);
    }

    #[tokio::test]
    async fn never_upscales_small_images() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("small.png");
        let dest = dir.path().join("processed-small.png");
        write_test_image(&original, 100, 50);

        let transform = WatermarkTransform::new(800, None);
        transform.transform(&original, &dest).await.unwrap();

        let out = read_output(&dest);
        assert_eq!(out.width(), 100);
    }

    #[tokio::test]
    async fn composites_watermark_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("u1.png");
        let watermark = dir.path().join("watermark.png");
        let dest = dir.path().join("processed-u1.png");
        write_test_image(&original, 600, 400);
        write_test_image(&watermark, 300, 300);

        let transform = WatermarkTransform::new(800, Some(watermark));
        transform.transform(&original, &dest).await.unwrap();
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn missing_source_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("nope.png");
        let dest = dir.path().join("processed-nope.png");

        let transform = WatermarkTransform::new(800, None);
        let err = transform.transform(&original, &dest).await.unwrap_err();
        assert!(matches!(err, TransformError::SourceMissing(_)));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn corrupt_source_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("garbage.jpg");
        let dest = dir.path().join("processed-garbage.jpg");
        std::fs::write(&original, b"this is not an image").unwrap();

        let transform = WatermarkTransform::new(800, None);
        let err = transform.transform(&original, &dest).await.unwrap_err();
        assert!(matches!(err, TransformError::Decode { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn io_and_timeout_are_retriable() {
        let io = TransformError::Io {
            path: PathBuf::from("/x"),
            message: "disk full".to_string(),
        };
        let timeout = TransformError::Timeout {
            path: PathBuf::from("/x"),
            timeout_ms: 1000,
        };
        assert!(io.is_retriable());
        assert!(timeout.is_retriable());
    }
}
