//! Scene snapshot types shared by the analyzer, formatter and queue.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detection::BoundingBox;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseLabel {
    Upright,
    LyingDown,
    Sitting,
    Far,
    Close,
    Medium,
}

impl fmt::Display for PoseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PoseLabel::Upright => "standing upright",
            PoseLabel::LyingDown => "lying down",
            PoseLabel::Sitting => "sitting",
            PoseLabel::Far => "far from the camera",
            PoseLabel::Close => "close to the camera",
            PoseLabel::Medium => "at a medium distance",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalZone {
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Foreground,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionLabel {
    pub horizontal: HorizontalZone,
    pub depth: Depth,
}

impl fmt::Display for PositionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let horizontal = match self.horizontal {
            HorizontalZone::Left => "on the left",
            HorizontalZone::Center => "in the center",
            HorizontalZone::Right => "on the right",
        };
        let depth = match self.depth {
            Depth::Foreground => "in the foreground",
            Depth::Background => "in the background",
        };
        write!(f, "{} {}", horizontal, depth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalMotion {
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalMotion {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionLabel {
    JustAppeared,
    StandingStill,
    Moving {
        horizontal: Option<HorizontalMotion>,
        vertical: Option<VerticalMotion>,
    },
}

impl MotionLabel {
    /// Clause used after the pose, e.g. "they are moving left".
    pub fn clause(&self) -> String {
        match self {
            MotionLabel::JustAppeared => "they just appeared".to_string(),
            other => format!("they are {}", other),
        }
    }
}

impl fmt::Display for MotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionLabel::JustAppeared => f.write_str("just appeared"),
            MotionLabel::StandingStill => f.write_str("standing still"),
            MotionLabel::Moving { horizontal, vertical } => {
                let h = horizontal.map(|h| match h {
                    HorizontalMotion::Left => "left",
                    HorizontalMotion::Right => "right",
                });
                let v = vertical.map(|v| match v {
                    VerticalMotion::Up => "up",
                    VerticalMotion::Down => "down",
                });
                match (h, v) {
                    (Some(h), Some(v)) => write!(f, "moving {} and {}", h, v),
                    (Some(h), None) => write!(f, "moving {}", h),
                    (None, Some(v)) => write!(f, "moving {}", v),
                    (None, None) => f.write_str("standing still"),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonAnnotation {
    pub age_range: String,
    pub expression: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<String>,
}

impl PersonAnnotation {
    pub fn unknown() -> Self {
        Self {
            age_range: "age unknown".to_string(),
            expression: "expression unclear".to_string(),
            confidence: 0.0,
            alert: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonInfo {
    pub pose: PoseLabel,
    pub position: PositionLabel,
    pub activity: Option<String>,
    pub movement: MotionLabel,
    pub annotation: PersonAnnotation,
    pub bbox: BoundingBox,
}

/// Snapshot of one analyzed frame, consumed once by the description queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub people: Vec<PersonInfo>,
    pub objects: Vec<String>,
    /// Base64 JPEG of the frame, when frames are attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,
    #[serde(default)]
    pub is_scenic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SceneDescriptor {
    pub fn is_empty(&self) -> bool {
        self.people.is_empty() && self.objects.is_empty()
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}
