//! Text recovery from captured page images.
//!
//! The engine is a black box behind [`TextRecognizer`]. The bundled adapter
//! drives the `tesseract` command-line engine: image bytes go in on stdin,
//! plain text comes back on stdout. No text cleanup happens here.

use crate::{OcrSettings, PipelineError};
use async_trait::async_trait;
use std::io::Cursor;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Turns image bytes into raw text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, image: &[u8]) -> Result<String, PipelineError>;

    /// Whether the engine can be run at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// [`TextRecognizer`] backed by a `tesseract` child process per call.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    binary: PathBuf,
    language: String,
    page_segmentation_mode: Option<u8>,
    timeout: Duration,
}

impl TesseractRecognizer {
    pub fn new(settings: &OcrSettings, timeout: Duration) -> Self {
        let binary = settings
            .binary
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| which::which("tesseract").ok())
            .unwrap_or_else(|| PathBuf::from("tesseract"));

        Self {
            binary,
            language: settings.language.clone(),
            page_segmentation_mode: settings.page_segmentation_mode,
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(&self.language);

        if let Some(psm) = self.page_segmentation_mode {
            command.arg("--psm").arg(psm.to_string());
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command
    }

    async fn run_engine(&self, image: &[u8]) -> Result<String, PipelineError> {
        let mut child = self.command().spawn().map_err(|e| {
            PipelineError::RecognitionFailure(format!(
                "failed to start {}: {e}",
                self.binary.display()
            ))
        })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            PipelineError::RecognitionFailure("engine stdin unavailable".to_string())
        })?;

        let feed = async move {
            let result = stdin.write_all(image).await;
            drop(stdin);
            result
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| PipelineError::RecognitionFailure(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::RecognitionFailure(format!(
                "engine exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if let Err(e) = fed {
            warn!("Engine closed its input early: {}", e);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    async fn recognize(&self, image: &[u8]) -> Result<String, PipelineError> {
        let (width, height) = inspect_image(image)?;
        debug!(
            "Recognizing {}x{} image ({})",
            width,
            height,
            crate::format_bytes(image.len())
        );

        let start = Instant::now();
        let text = tokio::time::timeout(self.timeout, self.run_engine(image))
            .await
            .map_err(|_| {
                PipelineError::RecognitionFailure(format!(
                    "engine did not finish within {:?}",
                    self.timeout
                ))
            })??;

        debug!(
            "Recognized {} characters in {}",
            text.len(),
            crate::format_duration(start.elapsed())
        );
        Ok(text)
    }

    fn is_available(&self) -> bool {
        if self.binary.components().count() > 1 {
            self.binary.exists()
        } else {
            which::which(&self.binary).is_ok()
        }
    }
}

/// Check that `image` is a decodable bitmap and return its dimensions.
///
/// Only the header is read, so this stays cheap for tall full-page captures.
pub fn inspect_image(image: &[u8]) -> Result<(u32, u32), PipelineError> {
    if image.is_empty() {
        return Err(PipelineError::RecognitionFailure("empty image".to_string()));
    }

    let reader = image::io::Reader::new(Cursor::new(image))
        .with_guessed_format()
        .map_err(|e| PipelineError::RecognitionFailure(e.to_string()))?;

    if reader.format().is_none() {
        return Err(PipelineError::RecognitionFailure(
            "unsupported image format".to_string(),
        ));
    }

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| PipelineError::RecognitionFailure(e.to_string()))?;

    if width == 0 || height == 0 {
        return Err(PipelineError::RecognitionFailure(format!(
            "image has no pixels ({width}x{height})"
        )));
    }

    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([255, 255, 255]));
        let mut data = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut data), image::ImageOutputFormat::Png)
            .unwrap();
        data
    }

    #[test]
    fn test_inspect_png() {
        assert_eq!(inspect_image(&png_bytes(64, 200)).unwrap(), (64, 200));
    }

    #[test]
    fn test_inspect_rejects_garbage() {
        assert!(matches!(
            inspect_image(&[]),
            Err(PipelineError::RecognitionFailure(_))
        ));
        assert!(matches!(
            inspect_image(b"definitely not an image"),
            Err(PipelineError::RecognitionFailure(_))
        ));

        let mut truncated = png_bytes(8, 8);
        truncated.truncate(12);
        assert!(inspect_image(&truncated).is_err());
    }

    #[test]
    fn test_command_arguments() {
        let settings = OcrSettings {
            binary: Some("/usr/bin/tesseract".to_string()),
            language: "eng+afr".to_string(),
            page_segmentation_mode: Some(11),
        };
        let recognizer = TesseractRecognizer::new(&settings, Duration::from_secs(5));
        let command = recognizer.command();
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.as_std().get_program(), "/usr/bin/tesseract");
        assert_eq!(args, vec!["stdin", "stdout", "-l", "eng+afr", "--psm", "11"]);
    }

    #[tokio::test]
    async fn test_missing_engine_is_recognition_failure() {
        let settings = OcrSettings {
            binary: Some("/nonexistent/price-lens/tesseract".to_string()),
            ..Default::default()
        };
        let recognizer = TesseractRecognizer::new(&settings, Duration::from_secs(5));
        assert!(!recognizer.is_available());

        let result = recognizer.recognize(&png_bytes(4, 4)).await;
        assert!(matches!(result, Err(PipelineError::RecognitionFailure(_))));
    }

    #[tokio::test]
    async fn test_corrupt_image_never_reaches_engine() {
        let settings = OcrSettings {
            binary: Some("/nonexistent/price-lens/tesseract".to_string()),
            ..Default::default()
        };
        let recognizer = TesseractRecognizer::new(&settings, Duration::from_secs(5));
        let err = recognizer
            .recognize(b"\x89PNG\r\n\x1a\n")
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("failed to start"));
    }
}
