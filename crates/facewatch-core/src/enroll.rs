//! Turning registration photos into face vectors.

use crate::analyzer::{AnalyzedFace, AnalyzerError, FaceAnalyzer};
use crate::types::FaceVector;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no faces could be detected")]
    NoFaceDetected,
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
}

/// Pick the face a registration photo stands for: the largest box.
///
/// Equal areas keep detector order, which is most confident first.
pub fn primary_face(faces: Vec<AnalyzedFace>) -> Option<AnalyzedFace> {
    faces.into_iter().reduce(|best, face| {
        if face.bbox.area() > best.bbox.area() {
            face
        } else {
            best
        }
    })
}

/// Vector for the primary face of one photo, or `None` if it shows no face.
pub fn photo_vector(
    analyzer: &mut dyn FaceAnalyzer,
    photo: &RgbImage,
) -> Result<Option<FaceVector>, AnalyzerError> {
    let faces = analyzer.analyze(photo.as_raw(), photo.width(), photo.height())?;
    Ok(primary_face(faces).map(|face| face.vector))
}

/// One vector per photo that shows a face; faceless photos are skipped.
///
/// Fails with [`EnrollError::NoFaceDetected`] when no photo yields a vector.
pub fn collect_vectors<'a>(
    analyzer: &mut dyn FaceAnalyzer,
    photos: impl IntoIterator<Item = &'a RgbImage>,
) -> Result<Vec<FaceVector>, EnrollError> {
    let mut vectors = Vec::new();
    for (index, photo) in photos.into_iter().enumerate() {
        match photo_vector(analyzer, photo)? {
            Some(vector) => vectors.push(vector),
            None => tracing::debug!(photo = index, "no face in registration photo, skipping"),
        }
    }

    if vectors.is_empty() {
        return Err(EnrollError::NoFaceDetected);
    }
    Ok(vectors)
}
