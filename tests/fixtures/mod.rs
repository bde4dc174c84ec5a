//! Test fixtures: generated images and scripted editors.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Rgba};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image_edit_queue::models::job::JobOptions;
use image_edit_queue::services::editor::{ImageEditor, InferenceError};

/// A solid-colour PNG of the given size.
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = ImageBuffer::from_pixel(width, height, Rgba([32u8, 64, 128, 255]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode fixture png");
    out.into_inner()
}

/// Returns its input after `delay`, tracking how many calls overlap.
pub struct RecordingEditor {
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl RecordingEditor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageEditor for RecordingEditor {
    async fn warm_up(&self) -> Result<(), InferenceError> {
        Ok(())
    }

    async fn edit(
        &self,
        image_png: &[u8],
        _prompt: &str,
        _options: &JobOptions,
    ) -> Result<Vec<u8>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(image_png.to_vec())
    }
}
