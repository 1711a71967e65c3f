//! Per-frame recognition: detect, encode, classify against the database.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::database::FaceDatabase;
use crate::types::{Detection, DistanceMatcher, Matcher};

/// Maximum distance at which two face vectors belong to the same person.
pub const MATCH_TOLERANCE: f32 = 0.6;

/// Recognize every face in a packed RGB frame.
///
/// An empty database short-circuits to no detections without running the
/// analyzer. Otherwise each face is labelled with its nearest registered
/// person within [`MATCH_TOLERANCE`], or `"Unknown"`.
pub fn recognize(
    analyzer: &mut dyn FaceAnalyzer,
    rgb: &[u8],
    width: u32,
    height: u32,
    db: &FaceDatabase,
) -> Result<Vec<Detection>, AnalyzerError> {
    if db.is_empty() {
        return Ok(Vec::new());
    }

    let gallery = db.gallery();
    let faces = analyzer.analyze(rgb, width, height)?;

    let detections = faces
        .iter()
        .enumerate()
        .map(|(index, face)| {
            let result = DistanceMatcher.compare(&face.vector, &gallery, MATCH_TOLERANCE);
            let name = result.label().to_string();
            Detection {
                id: format!("{name}-{index}"),
                confidence: result.confidence(),
                bbox: face.bbox.to_percent(width, height),
                name,
            }
        })
        .collect();

    Ok(detections)
}
