use serde::Serialize;

use crate::detection::{BoundingBox, Detection, Frame};

pub const PERSON_COLOR: [u8; 3] = [0, 255, 0];
pub const VEHICLE_COLOR: [u8; 3] = [255, 0, 0];
pub const OBJECT_COLOR: [u8; 3] = [0, 0, 255];

/// A labelled box for the renderer, in viewport coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overlay {
    pub bbox: BoundingBox,
    pub label: String,
    pub color: [u8; 3],
}

pub fn overlay_color(label: &str) -> [u8; 3] {
    match label {
        "person" | "face" => PERSON_COLOR,
        "car" | "truck" | "bus" | "motorcycle" | "bicycle" => VEHICLE_COLOR,
        _ => OBJECT_COLOR,
    }
}

pub fn build_overlays(detections: &[Detection]) -> Vec<Overlay> {
    detections
        .iter()
        .map(|d| Overlay {
            bbox: d.bbox,
            label: format!("{} {:.0}%", d.label, d.score * 100.0),
            color: overlay_color(&d.label),
        })
        .collect()
}

/// Draws each overlay as a one-pixel rectangle outline into an RGB frame.
pub fn draw_overlays(frame: &mut Frame, overlays: &[Overlay]) {
    for overlay in overlays {
        draw_rectangle(frame, &overlay.bbox, overlay.color);
    }
}

fn draw_rectangle(frame: &mut Frame, bbox: &BoundingBox, color: [u8; 3]) {
    if frame.is_empty() {
        return;
    }
    let max_x = frame.width as i64 - 1;
    let max_y = frame.height as i64 - 1;

    let x1 = (bbox.x as i64).clamp(0, max_x);
    let y1 = (bbox.y as i64).clamp(0, max_y);
    let x2 = ((bbox.x + bbox.width) as i64).clamp(0, max_x);
    let y2 = ((bbox.y + bbox.height) as i64).clamp(0, max_y);

    for x in x1..=x2 {
        set_pixel(frame, x, y1, color);
        set_pixel(frame, x, y2, color);
    }
    for y in y1..=y2 {
        set_pixel(frame, x1, y, color);
        set_pixel(frame, x2, y, color);
    }
}

fn set_pixel(frame: &mut Frame, x: i64, y: i64, color: [u8; 3]) {
    if frame.channels < 3 {
        return;
    }
    let index = ((y as u64 * frame.width as u64 + x as u64) * frame.channels as u64) as usize;
    if let Some(pixel) = frame.data.get_mut(index..index + 3) {
        pixel.copy_from_slice(&color);
    }
}
