//! `image-resize`: normalise an uploaded image to a 400x400 JPEG.

use conveyor_jobs::{ArgType, Handler, HandlerError, JobArguments, KindDefinition};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageReader;
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const KIND: &str = "image-resize";

/// Built-in deadline.
pub const DEADLINE: Duration = Duration::from_secs(40);

pub const TARGET_WIDTH: u32 = 400;
pub const TARGET_HEIGHT: u32 = 400;
pub const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone)]
pub struct ImageResize {
    processed_dir: PathBuf,
}

impl ImageResize {
    pub fn new(processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            processed_dir: processed_dir.into(),
        }
    }

    pub fn definition(self, deadline: Duration) -> KindDefinition {
        KindDefinition::new(KIND, self)
            .deadline(deadline)
            .param("file_id", ArgType::Integer)
            .param("original_path", ArgType::String)
    }

    /// Output path for a file id.
    pub fn output_path(&self, file_id: i64) -> PathBuf {
        self.processed_dir.join(format!("processed_{}.jpg", file_id))
    }

    fn resize(&self, file_id: i64, original: &Path) -> Result<PathBuf, HandlerError> {
        // Format comes from the file contents; the extension is only a fallback.
        let source = ImageReader::open(original)
            .and_then(ImageReader::with_guessed_format)
            .map_err(|e| io_error(file_id, "read", e))?
            .decode()
            .map_err(|e| {
                HandlerError::new(e.to_string())
                    .with_detail(json!({ "file_id": file_id, "stage": "decode" }))
            })?;

        let resized = source
            .resize_exact(TARGET_WIDTH, TARGET_HEIGHT, FilterType::Lanczos3)
            .to_rgb8();

        fs::create_dir_all(&self.processed_dir).map_err(|e| io_error(file_id, "write", e))?;
        let output = self.output_path(file_id);
        let file = File::create(&output).map_err(|e| io_error(file_id, "write", e))?;

        let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
        encoder.encode_image(&resized).map_err(|e| {
            HandlerError::new(e.to_string())
                .with_detail(json!({ "file_id": file_id, "stage": "encode" }))
        })?;

        Ok(output)
    }
}

fn io_error(file_id: i64, stage: &str, err: std::io::Error) -> HandlerError {
    HandlerError::new(err.to_string()).with_detail(json!({ "file_id": file_id, "stage": stage }))
}

impl Handler for ImageResize {
    fn call(&self, args: &JobArguments) -> Result<Value, HandlerError> {
        let file_id = args.require_i64("file_id")?;
        let original = args.require_str("original_path")?;
        debug!(file_id, original_path = %original, "Resizing image");

        let output = self.resize(file_id, Path::new(original))?;

        Ok(json!({
            "file_id": file_id,
            "is_processed": true,
            "processed_path": output.to_string_lossy(),
            "width": TARGET_WIDTH,
            "height": TARGET_HEIGHT,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn write_png(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("source.png");
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
        });
        img.save(&path).unwrap();
        path
    }

    fn resize_args(file_id: i64, path: &Path) -> JobArguments {
        JobArguments::new()
            .with("file_id", file_id)
            .with("original_path", path.to_string_lossy().to_string())
    }

    #[test]
    fn test_resizes_to_400_square() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_png(dir.path(), 640, 120);
        let handler = ImageResize::new(dir.path().join("processed"));

        let out = handler
            .call(
                &JobArguments::new()
                    .with("file_id", 3)
                    .with("original_path", source.to_string_lossy().to_string()),
            )
            .unwrap();

        assert_eq!(out["is_processed"], true);
        assert_eq!(out["width"], 400);
        assert_eq!(out["height"], 400);

        let written = PathBuf::from(out["processed_path"].as_str().unwrap());
        assert!(written.ends_with("processed_3.jpg"));
        let decoded = image::open(&written).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 400));
    }

    #[test]
    fn test_upload_without_extension_is_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let png = write_png(dir.path(), 50, 80);
        let upload = dir.path().join("upload_7");
        fs::rename(&png, &upload).unwrap();
        let handler = ImageResize::new(dir.path().join("processed"));

        let out = handler.call(&resize_args(7, &upload)).unwrap();
        assert_eq!(out["is_processed"], true);
        assert!(handler.output_path(7).exists());
    }

    #[test]
    fn test_misnamed_upload_is_sniffed() {
        let dir = tempfile::tempdir().unwrap();
        let png = write_png(dir.path(), 30, 30);
        let upload = dir.path().join("photo.jpg");
        fs::rename(&png, &upload).unwrap();
        let handler = ImageResize::new(dir.path().join("processed"));

        assert!(handler.call(&resize_args(8, &upload)).is_ok());
    }

    #[test]
    fn test_corrupt_input_reports_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.png");
        fs::write(&bogus, b"definitely not a png").unwrap();
        let handler = ImageResize::new(dir.path().join("processed"));

        let err = handler
            .call(
                &JobArguments::new()
                    .with("file_id", 9)
                    .with("original_path", bogus.to_string_lossy().to_string()),
            )
            .unwrap_err();

        assert!(!err.message.is_empty());
        assert_eq!(err.detail.unwrap()["stage"], "decode");
        assert!(!handler.output_path(9).exists());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ImageResize::new(dir.path());
        let err = handler
            .call(
                &JobArguments::new()
                    .with("file_id", 1)
                    .with("original_path", dir.path().join("nope.png").to_string_lossy().to_string()),
            )
            .unwrap_err();
        assert!(!err.message.is_empty());
        assert_eq!(err.detail.unwrap()["stage"], "read");
    }
}
