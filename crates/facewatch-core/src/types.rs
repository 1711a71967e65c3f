use serde::{Deserialize, Serialize};

/// Name reported for a face that matches nobody in the database.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
///
/// Coordinates are in pixels of the frame the face was detected in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Pixel box as `[top, right, bottom, left]`, clamped to the frame.
    pub fn to_css(&self, frame_width: u32, frame_height: u32) -> [f32; 4] {
        let w = frame_width as f32;
        let h = frame_height as f32;
        [
            self.y.clamp(0.0, h),
            (self.x + self.width).clamp(0.0, w),
            (self.y + self.height).clamp(0.0, h),
            self.x.clamp(0.0, w),
        ]
    }

    /// Box as `[top%, right%, bottom%, left%]` of the frame height/width.
    ///
    /// This ordering is part of the client contract.
    pub fn to_percent(&self, frame_width: u32, frame_height: u32) -> [f32; 4] {
        if frame_width == 0 || frame_height == 0 {
            return [0.0; 4];
        }
        let [top, right, bottom, left] = self.to_css(frame_width, frame_height);
        let w = frame_width as f32;
        let h = frame_height as f32;
        [
            top / h * 100.0,
            right / w * 100.0,
            bottom / h * 100.0,
            left / w * 100.0,
        ]
    }
}

/// Fixed-length face embedding (512-dimensional for ArcFace).
///
/// Serialized as a bare JSON array of floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceVector {
    values: Vec<f32>,
}

impl FaceVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two vectors.
    pub fn distance(&self, other: &FaceVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FaceVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One recognized face in one frame, as sent to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// `"{name}-{index}"`; only unique within a single frame.
    pub id: String,
    pub name: String,
    pub confidence: f32,
    /// `[top%, right%, bottom%, left%]`.
    #[serde(rename = "box")]
    pub bbox: [f32; 4],
}

/// A known face vector together with the person it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct GalleryEntry<'a> {
    pub name: &'a str,
    pub vector: &'a FaceVector,
}

/// Result of matching a probe vector against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest gallery vector (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
    /// Name of the matched person (if any).
    pub name: Option<String>,
}

impl MatchResult {
    /// `1 - distance` for a match, `0.0` otherwise.
    pub fn confidence(&self) -> f32 {
        if self.matched {
            (1.0 - self.distance).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }
}

/// Strategy for comparing a probe vector against a gallery of known faces.
pub trait Matcher {
    fn compare(&self, probe: &FaceVector, gallery: &[GalleryEntry<'_>], tolerance: f32) -> MatchResult;
}

/// Nearest-neighbour matcher on Euclidean distance.
///
/// Visits every gallery entry; on equal distances the earliest entry wins.
pub struct DistanceMatcher;

impl Matcher for DistanceMatcher {
    fn compare(&self, probe: &FaceVector, gallery: &[GalleryEntry<'_>], tolerance: f32) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let dist = probe.distance(entry.vector);
            if dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist <= tolerance => MatchResult {
                matched: true,
                distance: best_dist,
                name: Some(gallery[idx].name.to_string()),
            },
            _ => MatchResult {
                matched: false,
                distance: best_dist,
                name: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(values: &[f32]) -> FaceVector {
        FaceVector::new(values.to_vec())
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9, landmarks: None }
    }

    #[test]
    fn test_distance_identical() {
        let a = vector(&[0.3, -0.2, 0.5]);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_distance_pythagorean() {
        let a = vector(&[0.0, 0.0]);
        let b = vector(&[3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_full_frame_box_to_percent() {
        let face = bbox(0.0, 0.0, 640.0, 480.0);
        assert_eq!(face.to_percent(640, 480), [0.0, 100.0, 100.0, 0.0]);
    }

    #[test]
    fn test_box_to_percent_order() {
        // top=48, right=320, bottom=240, left=64 in a 640x480 frame
        let face = bbox(64.0, 48.0, 256.0, 192.0);
        let pct = face.to_percent(640, 480);
        let expected = [10.0, 50.0, 50.0, 10.0];
        for (got, want) in pct.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4, "got {pct:?}, want {expected:?}");
        }
    }

    #[test]
    fn test_box_clamped_to_frame() {
        let face = bbox(-10.0, -5.0, 700.0, 500.0);
        assert_eq!(face.to_percent(640, 480), [0.0, 100.0, 100.0, 0.0]);
    }

    #[test]
    fn test_box_zero_sized_frame() {
        let face = bbox(1.0, 1.0, 2.0, 2.0);
        assert_eq!(face.to_percent(0, 0), [0.0; 4]);
    }

    #[test]
    fn test_detection_serializes_box_field() {
        let det = Detection {
            id: "Alice-0".into(),
            name: "Alice".into(),
            confidence: 0.5,
            bbox: [1.0, 2.0, 3.0, 4.0],
        };
        let json = serde_json::to_value(&det).unwrap();
        assert_eq!(json["box"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert!(json.get("bbox").is_none());
    }

    #[test]
    fn test_face_vector_is_bare_array() {
        let json = serde_json::to_string(&vector(&[0.5, 1.0])).unwrap();
        assert_eq!(json, "[0.5,1.0]");
    }

    #[test]
    fn test_matcher_picks_nearest() {
        let probe = vector(&[1.0, 0.0]);
        let far = vector(&[0.0, 1.0]);
        let near = vector(&[0.9, 0.0]);
        let gallery = [
            GalleryEntry { name: "bob", vector: &far },
            GalleryEntry { name: "alice", vector: &near },
        ];
        let result = DistanceMatcher.compare(&probe, &gallery, 0.6);
        assert!(result.matched);
        assert_eq!(result.label(), "alice");
        assert!((result.confidence() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_tolerance_boundary_inclusive() {
        let probe = vector(&[0.0]);
        let known = vector(&[0.6]);
        let gallery = [GalleryEntry { name: "alice", vector: &known }];
        let result = DistanceMatcher.compare(&probe, &gallery, 0.6);
        assert!(result.matched);
        assert!((result.confidence() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_just_past_tolerance() {
        let probe = vector(&[0.0]);
        let known = vector(&[0.6001]);
        let gallery = [GalleryEntry { name: "alice", vector: &known }];
        let result = DistanceMatcher.compare(&probe, &gallery, 0.6);
        assert!(!result.matched);
        assert_eq!(result.label(), UNKNOWN_NAME);
        assert_eq!(result.confidence(), 0.0);
    }

    #[test]
    fn test_matcher_tie_first_wins() {
        let probe = vector(&[0.0, 0.0]);
        let a = vector(&[0.1, 0.0]);
        let b = vector(&[0.0, 0.1]);
        let gallery = [
            GalleryEntry { name: "first", vector: &a },
            GalleryEntry { name: "second", vector: &b },
        ];
        let result = DistanceMatcher.compare(&probe, &gallery, 0.6);
        assert_eq!(result.label(), "first");
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = vector(&[1.0]);
        let result = DistanceMatcher.compare(&probe, &[], 0.6);
        assert!(!result.matched);
        assert_eq!(result.confidence(), 0.0);
        assert!(result.distance.is_infinite());
    }
}
