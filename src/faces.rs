use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::detection::{BoundingBox, Frame};
use crate::error::DetectionError;

/// Face landmark/expression result for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub bbox: BoundingBox,
    pub age_range: String,
    pub expression: String,
    pub confidence: f32,
}

/// Black-box face and expression model.
#[async_trait]
pub trait FaceAnalyzer: Send {
    async fn analyze(&mut self, frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError>;
}

/// Used when no face model is loaded.
pub struct NoFaceAnalyzer;

#[async_trait]
impl FaceAnalyzer for NoFaceAnalyzer {
    async fn analyze(&mut self, _frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError> {
        Ok(Vec::new())
    }
}

/// Picks the most confident face whose centre falls inside the person box.
pub fn match_face<'a>(person: &BoundingBox, faces: &'a [FaceObservation]) -> Option<&'a FaceObservation> {
    faces
        .iter()
        .filter(|face| {
            let (cx, cy) = face.bbox.center();
            person.contains_point(cx, cy)
        })
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, confidence: f32, expression: &str) -> FaceObservation {
        FaceObservation {
            bbox: BoundingBox::new(x, 10.0, 20.0, 20.0),
            age_range: "25-32".to_string(),
            expression: expression.to_string(),
            confidence,
        }
    }

    #[test]
    fn picks_best_face_inside_person() {
        let person = BoundingBox::new(0.0, 0.0, 100.0, 200.0);
        let faces = vec![face(10.0, 0.6, "neutral"), face(40.0, 0.9, "happy"), face(300.0, 0.99, "sad")];
        assert_eq!(match_face(&person, &faces).unwrap().expression, "happy");
    }

    #[test]
    fn no_face_outside_person() {
        let person = BoundingBox::new(0.0, 0.0, 100.0, 200.0);
        assert!(match_face(&person, &[face(300.0, 0.9, "sad")]).is_none());
    }
}
