//! Geometry-only scene heuristics: pose, position, activity, motion and
//! proximity, computed from bounding boxes and a short position history.
//!
//! Person identity is approximate. Boxes are associated with the nearest
//! recently seen position, so two people crossing paths can swap ids.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::HeuristicsConfig;
use crate::detection::{BoundingBox, Detection};
use crate::faces::{FaceObservation, match_face};
use crate::scene::{
    Depth, HorizontalMotion, HorizontalZone, MotionLabel, PersonAnnotation, PersonInfo, PoseLabel,
    PositionLabel, VerticalMotion, Viewport,
};

const UPRIGHT_MAX_ASPECT: f32 = 0.4;
const LYING_MIN_ASPECT: f32 = 1.2;
const SITTING_MIN_ASPECT: f32 = 0.8;
const FAR_MAX_HEIGHT_RATIO: f32 = 0.3;
const CLOSE_MIN_HEIGHT_RATIO: f32 = 0.7;
const FOREGROUND_MIN_HEIGHT_RATIO: f32 = 0.5;
const ACTIVITY_REACH: f32 = 0.1;

pub const SUDDEN_MOVEMENT_ALERT: &str = "sudden movement";
pub const PROXIMITY_ALERT: &str = "very close to another person";

const OBJECT_ACTIVITIES: &[(&str, &str)] = &[
    ("cell phone", "using a phone"),
    ("laptop", "working on a laptop"),
    ("keyboard", "typing"),
    ("book", "reading"),
    ("cup", "having a drink"),
    ("bottle", "having a drink"),
    ("wine glass", "having a drink"),
    ("sports ball", "playing with a ball"),
    ("remote", "holding a remote"),
];

pub fn classify_pose(bbox: &BoundingBox, viewport: &Viewport) -> PoseLabel {
    let aspect = bbox.aspect_ratio();
    if aspect < UPRIGHT_MAX_ASPECT {
        return PoseLabel::Upright;
    }
    if aspect > LYING_MIN_ASPECT {
        return PoseLabel::LyingDown;
    }
    if aspect > SITTING_MIN_ASPECT {
        return PoseLabel::Sitting;
    }

    let height_ratio = bbox.height / viewport.height;
    if height_ratio < FAR_MAX_HEIGHT_RATIO {
        PoseLabel::Far
    } else if height_ratio > CLOSE_MIN_HEIGHT_RATIO {
        PoseLabel::Close
    } else {
        PoseLabel::Medium
    }
}

pub fn classify_position(bbox: &BoundingBox, viewport: &Viewport) -> PositionLabel {
    let (cx, _) = bbox.center();
    let third = viewport.width / 3.0;
    let horizontal = if cx < third {
        HorizontalZone::Left
    } else if cx < 2.0 * third {
        HorizontalZone::Center
    } else {
        HorizontalZone::Right
    };

    let depth = if bbox.height / viewport.height > FOREGROUND_MIN_HEIGHT_RATIO {
        Depth::Foreground
    } else {
        Depth::Background
    };

    PositionLabel { horizontal, depth }
}

/// Infers what a person is doing from objects within reach of their box.
pub fn classify_activity(person: &BoundingBox, objects: &[Detection], sudden: bool) -> Option<String> {
    let reach = person.expanded(ACTIVITY_REACH);
    let interaction = objects
        .iter()
        .filter(|object| {
            let (cx, cy) = object.bbox.center();
            reach.contains_point(cx, cy)
        })
        .find_map(|object| {
            OBJECT_ACTIVITIES
                .iter()
                .find(|(label, _)| *label == object.label)
                .map(|(_, activity)| activity.to_string())
        });

    match interaction {
        Some(activity) => Some(activity),
        None if sudden => Some("moving quickly".to_string()),
        None => None,
    }
}

/// True when any two people are closer than `threshold_px` (centre to centre).
pub fn detect_proximity_conflict(people: &[BoundingBox], threshold_px: f32) -> bool {
    for (i, a) in people.iter().enumerate() {
        for b in &people[i + 1..] {
            if a.center_distance(b) < threshold_px {
                return true;
            }
        }
    }
    false
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPosition {
    pub id: String,
    pub x: f32,
    pub y: f32,
    pub last_seen: Instant,
}

impl TrackedPosition {
    fn at(id: &str, bbox: &BoundingBox, now: Instant) -> Self {
        let (x, y) = bbox.center();
        Self {
            id: id.to_string(),
            x,
            y,
            last_seen: now,
        }
    }
}

fn purge_stale(history: &mut HashMap<String, TrackedPosition>, now: Instant, window: Duration) {
    history.retain(|_, p| now.saturating_duration_since(p.last_seen) <= window);
}

/// Per-id centre history for motion direction and speed.
///
/// Direction and speed keep separate histories so that asking both
/// questions about the same observation does not zero the elapsed time.
#[derive(Debug)]
pub struct MotionTracker {
    motion_history: HashMap<String, TrackedPosition>,
    speed_history: HashMap<String, TrackedPosition>,
    history_window: Duration,
    motion_threshold_px: f32,
    sudden_speed_px_per_sec: f32,
}

impl MotionTracker {
    pub fn new(config: &HeuristicsConfig) -> Self {
        Self {
            motion_history: HashMap::new(),
            speed_history: HashMap::new(),
            history_window: Duration::from_millis(config.history_window_ms),
            motion_threshold_px: config.motion_threshold_px,
            sudden_speed_px_per_sec: config.sudden_speed_px_per_sec,
        }
    }

    pub fn track_motion(&mut self, id: &str, bbox: &BoundingBox, now: Instant) -> MotionLabel {
        purge_stale(&mut self.motion_history, now, self.history_window);

        let current = TrackedPosition::at(id, bbox, now);
        let label = match self.motion_history.get(id) {
            None => MotionLabel::JustAppeared,
            Some(previous) => {
                let dx = current.x - previous.x;
                let dy = current.y - previous.y;
                let horizontal = if dx.abs() > self.motion_threshold_px {
                    Some(if dx < 0.0 { HorizontalMotion::Left } else { HorizontalMotion::Right })
                } else {
                    None
                };
                let vertical = if dy.abs() > self.motion_threshold_px {
                    Some(if dy < 0.0 { VerticalMotion::Up } else { VerticalMotion::Down })
                } else {
                    None
                };
                if horizontal.is_none() && vertical.is_none() {
                    MotionLabel::StandingStill
                } else {
                    MotionLabel::Moving { horizontal, vertical }
                }
            }
        };

        self.motion_history.insert(id.to_string(), current);
        label
    }

    pub fn detect_sudden_movement(&mut self, id: &str, bbox: &BoundingBox, now: Instant) -> bool {
        purge_stale(&mut self.speed_history, now, self.history_window);

        let current = TrackedPosition::at(id, bbox, now);
        let sudden = match self.speed_history.get(id) {
            None => false,
            Some(previous) => {
                let elapsed = now.saturating_duration_since(previous.last_seen).as_secs_f32();
                if elapsed <= 0.0 {
                    false
                } else {
                    let distance = ((current.x - previous.x).powi(2) + (current.y - previous.y).powi(2)).sqrt();
                    let speed = distance / elapsed;
                    if speed > self.sudden_speed_px_per_sec {
                        debug!("Sudden movement for {}: {:.0}px/s", id, speed);
                    }
                    speed > self.sudden_speed_px_per_sec
                }
            }
        };

        self.speed_history.insert(id.to_string(), current);
        sudden
    }

    pub fn tracked_count(&self) -> usize {
        self.motion_history.len()
    }
}

/// Maps this frame's person boxes to identities.
pub trait IdentityAssigner: Send {
    fn assign(&mut self, people: &[BoundingBox], now: Instant) -> Vec<String>;
}

/// Nearest-recent-position association with geometry-derived keys.
#[derive(Debug)]
pub struct ProximityIdentity {
    known: HashMap<String, TrackedPosition>,
    match_radius_px: f32,
    window: Duration,
}

impl ProximityIdentity {
    pub fn new(match_radius_px: f32, window: Duration) -> Self {
        Self {
            known: HashMap::new(),
            match_radius_px,
            window,
        }
    }

    fn geometry_key(&self, x: f32, y: f32) -> String {
        let cell = self.match_radius_px.max(1.0);
        format!("person-{}-{}", (x / cell).round() as i64, (y / cell).round() as i64)
    }
}

impl IdentityAssigner for ProximityIdentity {
    fn assign(&mut self, people: &[BoundingBox], now: Instant) -> Vec<String> {
        purge_stale(&mut self.known, now, self.window);

        let mut claimed: HashSet<String> = HashSet::new();
        let mut ids = Vec::with_capacity(people.len());

        for bbox in people {
            let (x, y) = bbox.center();
            let nearest = self
                .known
                .values()
                .filter(|p| !claimed.contains(&p.id))
                .map(|p| (p, ((p.x - x).powi(2) + (p.y - y).powi(2)).sqrt()))
                .filter(|(_, distance)| *distance <= self.match_radius_px)
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(p, _)| p.id.clone());

            let id = match nearest {
                Some(id) => id,
                None => {
                    let base = self.geometry_key(x, y);
                    let mut candidate = base.clone();
                    let mut suffix = 1;
                    while claimed.contains(&candidate) {
                        suffix += 1;
                        candidate = format!("{}-{}", base, suffix);
                    }
                    candidate
                }
            };

            claimed.insert(id.clone());
            ids.push(id);
        }

        for (id, bbox) in ids.iter().zip(people) {
            self.known.insert(id.clone(), TrackedPosition::at(id, bbox, now));
        }

        ids
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneAnalysis {
    pub people: Vec<PersonInfo>,
    pub objects: Vec<String>,
    pub proximity_conflict: bool,
}

/// Folds one frame of detections into per-person scene facts.
pub struct HeuristicAnalyzer {
    viewport: Viewport,
    proximity_threshold_px: f32,
    tracker: MotionTracker,
    identity: Box<dyn IdentityAssigner>,
}

impl HeuristicAnalyzer {
    pub fn new(config: &HeuristicsConfig, viewport: Viewport) -> Self {
        let identity = ProximityIdentity::new(
            config.identity_match_radius_px,
            Duration::from_millis(config.history_window_ms),
        );
        Self::with_identity(config, viewport, Box::new(identity))
    }

    pub fn with_identity(
        config: &HeuristicsConfig,
        viewport: Viewport,
        identity: Box<dyn IdentityAssigner>,
    ) -> Self {
        Self {
            viewport,
            proximity_threshold_px: config.proximity_threshold_px,
            tracker: MotionTracker::new(config),
            identity,
        }
    }

    pub fn analyze(&mut self, detections: &[Detection], faces: &[FaceObservation], now: Instant) -> SceneAnalysis {
        let (people, things): (Vec<&Detection>, Vec<&Detection>) =
            detections.iter().partition(|d| d.is_person());
        let things: Vec<Detection> = things.into_iter().cloned().collect();

        let boxes: Vec<BoundingBox> = people.iter().map(|d| d.bbox).collect();
        let ids = self.identity.assign(&boxes, now);
        let proximity_conflict = detect_proximity_conflict(&boxes, self.proximity_threshold_px);

        let mut infos = Vec::with_capacity(boxes.len());
        for (id, bbox) in ids.iter().zip(&boxes) {
            let movement = self.tracker.track_motion(id, bbox, now);
            let sudden = self.tracker.detect_sudden_movement(id, bbox, now);

            let mut annotation = match match_face(bbox, faces) {
                Some(face) => PersonAnnotation {
                    age_range: face.age_range.clone(),
                    expression: face.expression.clone(),
                    confidence: face.confidence,
                    alert: None,
                },
                None => PersonAnnotation::unknown(),
            };
            let alerts: Vec<&str> = [
                sudden.then_some(SUDDEN_MOVEMENT_ALERT),
                proximity_conflict.then_some(PROXIMITY_ALERT),
            ]
            .into_iter()
            .flatten()
            .collect();
            annotation.alert = (!alerts.is_empty()).then(|| alerts.join(" and "));

            infos.push(PersonInfo {
                pose: classify_pose(bbox, &self.viewport),
                position: classify_position(bbox, &self.viewport),
                activity: classify_activity(bbox, &things, sudden),
                movement,
                annotation,
                bbox: *bbox,
            });
        }

        let mut objects: Vec<String> = Vec::new();
        for thing in &things {
            if !objects.contains(&thing.label) {
                objects.push(thing.label.clone());
            }
        }

        SceneAnalysis {
            people: infos,
            objects,
            proximity_conflict,
        }
    }

    pub fn tracked_people(&self) -> usize {
        self.tracker.tracked_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewport() -> Viewport {
        Viewport::new(640.0, 480.0)
    }

    fn point(x: f32, y: f32) -> BoundingBox {
        BoundingBox::new(x, y, 0.0, 0.0)
    }

    #[test]
    fn pose_uses_aspect_then_height() {
        let vp = viewport();
        assert_eq!(classify_pose(&BoundingBox::new(0.0, 0.0, 60.0, 300.0), &vp), PoseLabel::Upright);
        assert_eq!(classify_pose(&BoundingBox::new(0.0, 0.0, 300.0, 100.0), &vp), PoseLabel::LyingDown);
        assert_eq!(classify_pose(&BoundingBox::new(0.0, 0.0, 90.0, 100.0), &vp), PoseLabel::Sitting);
        assert_eq!(classify_pose(&BoundingBox::new(0.0, 0.0, 50.0, 100.0), &vp), PoseLabel::Far);
        assert_eq!(classify_pose(&BoundingBox::new(0.0, 0.0, 200.0, 400.0), &vp), PoseLabel::Close);
        assert_eq!(classify_pose(&BoundingBox::new(0.0, 0.0, 120.0, 240.0), &vp), PoseLabel::Medium);
    }

    #[test]
    fn position_combines_thirds_and_depth() {
        let vp = viewport();
        let left_front = classify_position(&BoundingBox::new(0.0, 0.0, 100.0, 300.0), &vp);
        assert_eq!(left_front.horizontal, HorizontalZone::Left);
        assert_eq!(left_front.depth, Depth::Foreground);

        let right_back = classify_position(&BoundingBox::new(500.0, 0.0, 100.0, 100.0), &vp);
        assert_eq!(right_back.to_string(), "on the right in the background");

        let center = classify_position(&BoundingBox::new(270.0, 0.0, 100.0, 100.0), &vp);
        assert_eq!(center.horizontal, HorizontalZone::Center);
    }

    #[test]
    fn motion_reports_first_sight_then_direction() {
        let mut tracker = MotionTracker::new(&HeuristicsConfig::default());
        let t0 = Instant::now();

        assert_eq!(tracker.track_motion("a", &point(100.0, 100.0), t0), MotionLabel::JustAppeared);
        assert_eq!(
            tracker.track_motion("a", &point(105.0, 95.0), t0 + Duration::from_millis(100)),
            MotionLabel::StandingStill
        );
        assert_eq!(
            tracker.track_motion("a", &point(80.0, 95.0), t0 + Duration::from_millis(200)),
            MotionLabel::Moving {
                horizontal: Some(HorizontalMotion::Left),
                vertical: None
            }
        );
        assert_eq!(
            tracker.track_motion("a", &point(100.0, 130.0), t0 + Duration::from_millis(300)),
            MotionLabel::Moving {
                horizontal: Some(HorizontalMotion::Right),
                vertical: Some(VerticalMotion::Down)
            }
        );
    }

    #[test]
    fn stale_history_is_purged() {
        let mut tracker = MotionTracker::new(&HeuristicsConfig::default());
        let t0 = Instant::now();
        tracker.track_motion("a", &point(0.0, 0.0), t0);
        assert_eq!(
            tracker.track_motion("a", &point(300.0, 0.0), t0 + Duration::from_millis(2_500)),
            MotionLabel::JustAppeared
        );
    }

    #[test]
    fn sudden_movement_needs_history_and_speed() {
        let mut tracker = MotionTracker::new(&HeuristicsConfig::default());
        let t0 = Instant::now();

        assert!(!tracker.detect_sudden_movement("a", &point(0.0, 0.0), t0));
        assert!(tracker.detect_sudden_movement("a", &point(200.0, 0.0), t0 + Duration::from_millis(100)));

        assert!(!tracker.detect_sudden_movement("b", &point(0.0, 0.0), t0));
        assert!(!tracker.detect_sudden_movement("b", &point(1.0, 0.0), t0 + Duration::from_secs(1)));
    }

    #[test]
    fn proximity_is_pairwise_and_pure() {
        let people = vec![
            BoundingBox::new(0.0, 0.0, 50.0, 100.0),
            BoundingBox::new(400.0, 0.0, 50.0, 100.0),
            BoundingBox::new(60.0, 0.0, 50.0, 100.0),
        ];
        let first = detect_proximity_conflict(&people, 100.0);
        assert!(first);
        assert_eq!(first, detect_proximity_conflict(&people, 100.0));

        assert!(!detect_proximity_conflict(&people[..2], 100.0));
        assert!(!detect_proximity_conflict(&[], 100.0));
    }

    #[test]
    fn activity_from_nearby_objects() {
        let person = BoundingBox::new(100.0, 100.0, 100.0, 200.0);
        let phone = Detection::new("cell phone", BoundingBox::new(150.0, 150.0, 10.0, 20.0), 0.8);
        let far_cup = Detection::new("cup", BoundingBox::new(500.0, 100.0, 10.0, 10.0), 0.8);

        assert_eq!(classify_activity(&person, &[far_cup.clone(), phone], false).as_deref(), Some("using a phone"));
        assert_eq!(classify_activity(&person, &[far_cup.clone()], false), None);
        assert_eq!(classify_activity(&person, &[far_cup], true).as_deref(), Some("moving quickly"));
    }

    #[test]
    fn identity_follows_nearest_recent_position() {
        let mut identity = ProximityIdentity::new(80.0, Duration::from_millis(2_000));
        let t0 = Instant::now();

        let first = identity.assign(&[point(100.0, 100.0), point(400.0, 100.0)], t0);
        assert_ne!(first[0], first[1]);

        let second = identity.assign(&[point(420.0, 110.0), point(120.0, 90.0)], t0 + Duration::from_millis(150));
        assert_eq!(second[0], first[1]);
        assert_eq!(second[1], first[0]);
    }

    #[test]
    fn identity_keys_stay_unique_within_a_frame() {
        let mut identity = ProximityIdentity::new(80.0, Duration::from_millis(2_000));
        let ids = identity.assign(&[point(100.0, 100.0), point(101.0, 100.0)], Instant::now());
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn analyzer_builds_people_objects_and_alerts() {
        let mut analyzer = HeuristicAnalyzer::new(&HeuristicsConfig::default(), viewport());
        let detections = vec![
            Detection::new("person", BoundingBox::new(50.0, 100.0, 80.0, 300.0), 0.9),
            Detection::new("person", BoundingBox::new(120.0, 100.0, 80.0, 300.0), 0.8),
            Detection::new("laptop", BoundingBox::new(60.0, 200.0, 40.0, 30.0), 0.7),
            Detection::new("chair", BoundingBox::new(500.0, 300.0, 60.0, 90.0), 0.6),
            Detection::new("chair", BoundingBox::new(560.0, 300.0, 60.0, 90.0), 0.6),
        ];
        let faces = vec![FaceObservation {
            bbox: BoundingBox::new(70.0, 110.0, 30.0, 30.0),
            age_range: "30-40".to_string(),
            expression: "focused".to_string(),
            confidence: 0.8,
        }];

        let analysis = analyzer.analyze(&detections, &faces, Instant::now());
        assert_eq!(analysis.people.len(), 2);
        assert_eq!(analysis.objects, vec!["laptop".to_string(), "chair".to_string()]);
        assert!(analysis.proximity_conflict);

        let first = &analysis.people[0];
        assert_eq!(first.annotation.age_range, "30-40");
        assert_eq!(first.activity.as_deref(), Some("working on a laptop"));
        assert_eq!(first.movement, MotionLabel::JustAppeared);
        assert_eq!(first.annotation.alert.as_deref(), Some(PROXIMITY_ALERT));
        assert_eq!(analysis.people[1].annotation, PersonAnnotation {
            alert: Some(PROXIMITY_ALERT.to_string()),
            ..PersonAnnotation::unknown()
        });
    }

    #[test]
    fn sudden_movement_and_proximity_are_both_reported() {
        let mut analyzer = HeuristicAnalyzer::new(&HeuristicsConfig::default(), viewport());
        let t0 = Instant::now();
        let still = Detection::new("person", BoundingBox::new(300.0, 100.0, 80.0, 300.0), 0.9);

        let apart = vec![still.clone(), Detection::new("person", BoundingBox::new(420.0, 100.0, 80.0, 300.0), 0.9)];
        let first = analyzer.analyze(&apart, &[], t0);
        assert!(!first.proximity_conflict);

        // 60px in 100ms, ending 60px from the other person.
        let lunge = vec![still, Detection::new("person", BoundingBox::new(360.0, 100.0, 80.0, 300.0), 0.9)];
        let second = analyzer.analyze(&lunge, &[], t0 + Duration::from_millis(100));
        assert!(second.proximity_conflict);
        assert_eq!(
            second.people[1].annotation.alert.as_deref(),
            Some("sudden movement and very close to another person")
        );
        assert_eq!(second.people[0].annotation.alert.as_deref(), Some(PROXIMITY_ALERT));
    }
}
