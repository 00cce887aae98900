use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use image::{DynamicImage, ImageBuffer, Rgb};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DetectionError;
use crate::faces::{FaceAnalyzer, FaceObservation};
use crate::scene::Viewport;

/// Decoded RGB frame handed over by the capture layer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        let size = (width * height * channels) as usize;
        Self {
            data: vec![0u8; size],
            width,
            height,
            channels,
        }
    }

    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            data,
            width,
            height,
            channels: 3,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.data.is_empty()
    }

    pub fn to_image(&self) -> Result<DynamicImage> {
        if self.channels == 3 {
            let img_buffer = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(
                self.width,
                self.height,
                self.data.clone(),
            )
            .ok_or_else(|| anyhow!("Frame buffer does not match {}x{}", self.width, self.height))?;
            Ok(DynamicImage::ImageRgb8(img_buffer))
        } else {
            Err(anyhow!("Unsupported channel count: {}", self.channels))
        }
    }

    /// JPEG-encodes the frame, downscaled to fit `max_dimension`, as base64.
    pub fn encode_base64_jpeg(&self, max_dimension: u32) -> Result<String> {
        use std::io::Cursor;

        if self.is_empty() {
            return Err(anyhow!("Cannot encode an empty frame"));
        }

        let image = self.to_image()?;
        let image = if self.width > max_dimension || self.height > max_dimension {
            image.resize(max_dimension, max_dimension, image::imageops::FilterType::Triangle)
        } else {
            image
        };

        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Jpeg)
            .map_err(|e| anyhow!("Failed to encode frame as JPEG: {}", e))?;

        Ok(general_purpose::STANDARD.encode(&buffer))
    }
}

/// Axis-aligned box in viewport pixels, `[x, y, width, height]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height <= 0.0 {
            return f32::INFINITY;
        }
        self.width / self.height
    }

    pub fn contains_point(&self, px: f32, py: f32) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }

    /// Grows the box by `fraction` of its size on every side.
    pub fn expanded(&self, fraction: f32) -> Self {
        let dx = self.width * fraction;
        let dy = self.height * fraction;
        Self {
            x: self.x - dx,
            y: self.y - dy,
            width: self.width + 2.0 * dx,
            height: self.height + 2.0 * dy,
        }
    }

    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }

    fn clamped_to(&self, viewport: &Viewport) -> Self {
        let x = self.x.clamp(0.0, viewport.width);
        let y = self.y.clamp(0.0, viewport.height);
        let right = (self.x + self.width.max(0.0)).clamp(0.0, viewport.width);
        let bottom = (self.y + self.height.max(0.0)).clamp(0.0, viewport.height);
        Self {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

impl From<[f32; 4]> for BoundingBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    #[serde(alias = "class")]
    pub label: String,
    pub score: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BoundingBox, score: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            score,
        }
    }

    pub fn is_person(&self) -> bool {
        self.label == "person"
    }
}

/// Black-box object detector (COCO-SSD, YOLO, ...).
#[async_trait]
pub trait ObjectDetector: Send {
    async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError>;
}

/// Wraps a detector and normalizes whatever it returns.
pub struct DetectionAdapter {
    detector: Box<dyn ObjectDetector>,
    confidence_threshold: f32,
    max_detections: usize,
    viewport: Viewport,
}

impl DetectionAdapter {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        confidence_threshold: f32,
        max_detections: usize,
        viewport: Viewport,
    ) -> Self {
        info!(
            "Detection adapter ready (threshold {:.2}, max {} detections, viewport {}x{})",
            confidence_threshold, max_detections, viewport.width, viewport.height
        );
        Self {
            detector,
            confidence_threshold,
            max_detections,
            viewport,
        }
    }

    pub async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        if frame.is_empty() {
            return Err(DetectionError::EmptyFrame);
        }
        let raw = self.detector.detect(frame).await?;
        Ok(self.normalize(raw))
    }

    /// Lowercases labels, clamps scores and boxes, drops low-confidence and
    /// degenerate detections, and keeps the strongest `max_detections`.
    pub fn normalize(&self, raw: Vec<Detection>) -> Vec<Detection> {
        let raw_count = raw.len();
        let mut detections: Vec<Detection> = raw
            .into_iter()
            .map(|d| Detection {
                bbox: d.bbox.clamped_to(&self.viewport),
                label: d.label.trim().to_lowercase(),
                score: d.score.clamp(0.0, 1.0),
            })
            .filter(|d| d.score >= self.confidence_threshold)
            .filter(|d| d.bbox.width > 0.0 && d.bbox.height > 0.0 && !d.label.is_empty())
            .collect();

        detections.sort_by(|a, b| b.score.total_cmp(&a.score));
        detections.truncate(self.max_detections);

        debug!("Normalized {} raw detections into {}", raw_count, detections.len());
        detections
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }
}

/// One recorded frame's worth of detector output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayRecord {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub faces: Vec<FaceObservation>,
}

/// Serves detections recorded as JSON lines, one record per frame.
///
/// The faces of the record most recently served by `detect` are handed to
/// the [`ReplayFaces`] analyzers obtained from [`ReplaySource::faces`].
#[derive(Debug, Default)]
pub struct ReplaySource {
    records: Vec<ReplayRecord>,
    cursor: usize,
    repeat: bool,
    current_faces: Arc<Mutex<Vec<FaceObservation>>>,
}

impl ReplaySource {
    pub fn parse(content: &str) -> Result<Self, DetectionError> {
        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(line)
                .map_err(|source| DetectionError::Parse { line: index + 1, source })?;
            records.push(record);
        }
        Ok(Self {
            records,
            ..Default::default()
        })
    }

    /// Starts over from the first record instead of running dry.
    pub fn repeating(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, DetectionError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let source = Self::parse(&content)?;
        info!("Loaded {} recorded frames from {}", source.len(), path.as_ref().display());
        Ok(source)
    }

    pub fn next_record(&mut self) -> Option<ReplayRecord> {
        if self.cursor >= self.records.len() {
            if !self.repeat || self.records.is_empty() {
                return None;
            }
            debug!("Replay reached the end, starting over");
            self.cursor = 0;
        }
        let record = self.records[self.cursor].clone();
        self.cursor += 1;
        Some(record)
    }

    pub fn faces(&self) -> ReplayFaces {
        ReplayFaces {
            current: Arc::clone(&self.current_faces),
        }
    }

    /// Records in the file, served or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ObjectDetector for ReplaySource {
    async fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let record = self.next_record().ok_or(DetectionError::Exhausted)?;
        *self.current_faces.lock() = record.faces;
        Ok(record.detections)
    }
}

/// Face feed paired with a [`ReplaySource`].
#[derive(Debug, Clone)]
pub struct ReplayFaces {
    current: Arc<Mutex<Vec<FaceObservation>>>,
}

#[async_trait]
impl FaceAnalyzer for ReplayFaces {
    async fn analyze(&mut self, _frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError> {
        Ok(std::mem::take(&mut *self.current.lock()))
    }
}
