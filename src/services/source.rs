use image::imageops::FilterType;
use image::ImageFormat;
use reqwest::Client;
use std::io::Cursor;
use std::time::Duration;

use crate::models::job::{ErrorKind, ImageRef};

/// Loads source images for jobs and prepares them for inference.
pub struct SourceLoader {
    http: Client,
}

impl SourceLoader {
    pub fn new(fetch_timeout: Duration) -> Result<Self, SourceError> {
        let http = Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(SourceError::Fetch)?;
        Ok(Self { http })
    }

    /// Fetch the raw bytes behind an image reference.
    pub async fn load(&self, image: &ImageRef) -> Result<Vec<u8>, SourceError> {
        match image {
            ImageRef::Url(url) => {
                let response = self.http.get(url).send().await.map_err(SourceError::Fetch)?;
                let status = response.status();
                if !status.is_success() {
                    return Err(SourceError::Status(status.as_u16()));
                }
                let bytes = response.bytes().await.map_err(SourceError::Fetch)?;
                Ok(bytes.to_vec())
            }
            ImageRef::Upload(path) => tokio::fs::read(path).await.map_err(SourceError::Read),
        }
    }
}

/// Decode, downscale to `long_edge` and re-encode as RGB PNG.
pub async fn prepare(bytes: Vec<u8>, long_edge: u32) -> Result<Vec<u8>, SourceError> {
    tokio::task::spawn_blocking(move || prepare_blocking(&bytes, long_edge))
        .await
        .map_err(|e| SourceError::Task(e.to_string()))?
}

fn prepare_blocking(bytes: &[u8], long_edge: u32) -> Result<Vec<u8>, SourceError> {
    let image = image::load_from_memory(bytes).map_err(SourceError::Decode)?;
    let image = if image.width().max(image.height()) > long_edge {
        image.resize(long_edge, long_edge, FilterType::Lanczos3)
    } else {
        image
    };
    encode_png(&image::DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Make sure editor output is PNG, re-encoding other formats.
pub async fn normalize_png(bytes: Vec<u8>) -> Result<Vec<u8>, SourceError> {
    if matches!(image::guess_format(&bytes), Ok(ImageFormat::Png)) {
        return Ok(bytes);
    }
    tokio::task::spawn_blocking(move || {
        let image = image::load_from_memory(&bytes).map_err(SourceError::Output)?;
        encode_png(&image)
    })
    .await
    .map_err(|e| SourceError::Task(e.to_string()))?
}

fn encode_png(image: &image::DynamicImage) -> Result<Vec<u8>, SourceError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(SourceError::Encode)?;
    Ok(out.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to fetch source image: {0}")]
    Fetch(reqwest::Error),

    #[error("Source image request returned HTTP {0}")]
    Status(u16),

    #[error("Failed to read uploaded image: {0}")]
    Read(std::io::Error),

    #[error("Unsupported or corrupt source image: {0}")]
    Decode(image::ImageError),

    #[error("Editor returned an undecodable image: {0}")]
    Output(image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(image::ImageError),

    #[error("Image task failed: {0}")]
    Task(String),
}

impl SourceError {
    /// Network trouble and server-side errors are transient; everything about
    /// the image itself is permanent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourceError::Fetch(_) => ErrorKind::TransientInference,
            SourceError::Status(code) if *code >= 500 || *code == 429 || *code == 408 => {
                ErrorKind::TransientInference
            }
            SourceError::Status(_) | SourceError::Decode(_) | SourceError::Output(_) => {
                ErrorKind::PermanentInference
            }
            SourceError::Read(_) | SourceError::Encode(_) | SourceError::Task(_) => {
                ErrorKind::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = ImageBuffer::from_pixel(width, height, Rgba([10u8, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_prepare_downscales_long_edge() {
        let out = prepare(png(400, 200), 100).await.unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[tokio::test]
    async fn test_prepare_never_upscales() {
        let out = prepare(png(40, 30), 1024).await.unwrap();
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (40, 30));
    }

    #[tokio::test]
    async fn test_prepare_rejects_garbage_permanently() {
        let err = prepare(b"definitely not an image".to_vec(), 1024)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentInference);
    }

    #[tokio::test]
    async fn test_normalize_keeps_png() {
        let input = png(8, 8);
        let out = normalize_png(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn test_status_kinds() {
        assert_eq!(SourceError::Status(503).kind(), ErrorKind::TransientInference);
        assert_eq!(SourceError::Status(404).kind(), ErrorKind::PermanentInference);
    }

    #[tokio::test]
    async fn test_load_upload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload");
        std::fs::write(&path, b"abc").unwrap();
        let loader = SourceLoader::new(Duration::from_secs(1)).unwrap();
        let bytes = loader.load(&ImageRef::Upload(path)).await.unwrap();
        assert_eq!(bytes, b"abc");
    }
}
