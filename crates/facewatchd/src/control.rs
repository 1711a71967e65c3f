//! Registration and reload: everything that changes the face database.

use crate::cache::FaceCache;
use crate::capture::{lock_analyzer, SharedAnalyzer};
use crate::events::ServerEvent;
use crate::publisher::Publisher;
use base64::Engine;
use facewatch_core::database::DatabaseError;
use facewatch_core::enroll::{self, EnrollError};
use facewatch_core::{AnalyzedFace, AnalyzerError, FaceAnalyzer, FaceDatabase, FaceStore, StorageError};
use image::RgbImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Name and photos are required")]
    MissingInput,
    #[error("No faces could be detected")]
    NoFaceDetected,
    #[error("face analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("cannot register: {0}")]
    Database(#[from] DatabaseError),
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<EnrollError> for ControlError {
    fn from(e: EnrollError) -> Self {
        match e {
            EnrollError::NoFaceDetected => Self::NoFaceDetected,
            EnrollError::Analyzer(e) => Self::Analyzer(e),
        }
    }
}

impl From<tokio::task::JoinError> for ControlError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_people: usize,
    pub total_photos: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonSummary {
    /// Position in name order; not stable across registrations.
    pub id: usize,
    pub name: String,
    /// Number of stored face vectors.
    pub photos: usize,
}

#[derive(Debug, Error)]
enum PhotoError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unreadable image: {0}")]
    Image(#[from] image::ImageError),
}

/// Decode a photo sent as base64, with or without a `data:` URL prefix.
fn decode_photo(src: &str) -> Result<RgbImage, PhotoError> {
    let payload = match src.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map_or(rest, |(_, data)| data),
        None => src,
    };
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
    Ok(image::load_from_memory(&bytes)?.to_rgb8())
}

/// Takes the shared analyzer for one photo at a time, so frames keep
/// flowing between the photos of a registration.
struct PerPhotoLock<'a>(&'a SharedAnalyzer);

impl FaceAnalyzer for PerPhotoLock<'_> {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<AnalyzedFace>, AnalyzerError> {
        lock_analyzer(self.0).analyze(rgb, width, height)
    }
}

/// Writes to the face database and keeps the live snapshot in step.
#[derive(Clone)]
pub struct ControlPath {
    store: FaceStore,
    cache: Arc<FaceCache>,
    analyzer: SharedAnalyzer,
    publisher: Publisher,
    /// Serializes every load → swap: registrations and reloads.
    write_lock: Arc<Mutex<()>>,
}

impl ControlPath {
    pub fn new(store: FaceStore, cache: Arc<FaceCache>, analyzer: SharedAnalyzer, publisher: Publisher) -> Self {
        Self {
            store,
            cache,
            analyzer,
            publisher,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Register (or re-register) a person from base64 photos.
    ///
    /// Photos that cannot be decoded or show no face are skipped. Returns the
    /// number of face vectors stored. Broadcasts `reload_faces_event` on
    /// success.
    pub async fn register_person(&self, name: &str, photos: Vec<String>) -> Result<usize, ControlError> {
        let name = name.trim().to_string();
        if name.is_empty() || photos.is_empty() {
            return Err(ControlError::MissingInput);
        }

        let this = self.clone();
        tokio::task::spawn_blocking(move || this.register_blocking(&name, &photos)).await?
    }

    fn register_blocking(&self, name: &str, photos: &[String]) -> Result<usize, ControlError> {
        let images: Vec<RgbImage> = photos
            .iter()
            .enumerate()
            .filter_map(|(index, src)| match decode_photo(src) {
                Ok(image) => Some(image),
                Err(e) => {
                    tracing::warn!(photo = index, error = %e, "skipping undecodable photo");
                    None
                }
            })
            .collect();

        let vectors = enroll::collect_vectors(&mut PerPhotoLock(&self.analyzer), &images)?;
        let stored = vectors.len();

        {
            let _write = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut db = self.store.load()?;
            db.register(name, vectors)?;
            self.store.save(&db)?;
            self.cache.replace(db);
        }

        tracing::info!(name, photos = photos.len(), vectors = stored, "person registered");
        self.publisher.publish(ServerEvent::ReloadFacesEvent);
        Ok(stored)
    }

    /// Re-read the database from disk and swap it into the running loop.
    /// Returns the number of people now registered.
    pub async fn reload(&self) -> Result<usize, ControlError> {
        let this = self.clone();
        let people = tokio::task::spawn_blocking(move || {
            let _write = this.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            this.cache.reload(&this.store)
        })
        .await??;
        Ok(people)
    }

    pub async fn dashboard(&self) -> Result<DashboardStats, ControlError> {
        let db = self.load().await?;
        Ok(DashboardStats {
            total_people: db.len(),
            total_photos: db.total_vectors(),
        })
    }

    pub async fn people(&self) -> Result<Vec<PersonSummary>, ControlError> {
        let db = self.load().await?;
        Ok(db
            .people()
            .enumerate()
            .map(|(id, (name, vectors))| PersonSummary {
                id,
                name: name.to_string(),
                photos: vectors.len(),
            })
            .collect())
    }

    /// Number of people in the live snapshot.
    pub fn cached_people(&self) -> usize {
        self.cache.current().len()
    }

    async fn load(&self) -> Result<FaceDatabase, ControlError> {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || store.load()).await??)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{BoundingBox, FaceVector};
    use image::Rgb;
    use std::io::Cursor;

    /// Finds one face in photos whose top-left pixel is bright red; the
    /// vector is that pixel's green value.
    struct RedPixelAnalyzer;

    impl FaceAnalyzer for RedPixelAnalyzer {
        fn analyze(&mut self, rgb: &[u8], _: u32, _: u32) -> Result<Vec<AnalyzedFace>, AnalyzerError> {
            if rgb[0] < 128 {
                return Ok(Vec::new());
            }
            Ok(vec![AnalyzedFace {
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0, confidence: 0.9, landmarks: None },
                vector: FaceVector::new(vec![rgb[1] as f32, 0.0]),
            }])
        }
    }

    fn photo(red: u8, green: u8, data_url: bool) -> String {
        let mut png = Vec::new();
        RgbImage::from_pixel(4, 4, Rgb([red, green, 0]))
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode(png);
        if data_url {
            format!("data:image/png;base64,{b64}")
        } else {
            b64
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: FaceStore,
        cache: Arc<FaceCache>,
        publisher: Publisher,
        control: ControlPath,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = FaceStore::new(dir.path().join("data/face_encodings.json"));
        let cache = Arc::new(FaceCache::default());
        let publisher = Publisher::new(8, 80);
        let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(RedPixelAnalyzer) as Box<dyn FaceAnalyzer>));
        let control = ControlPath::new(store.clone(), Arc::clone(&cache), analyzer, publisher.clone());
        Fixture {
            _dir: dir,
            store,
            cache,
            publisher,
            control,
        }
    }

    #[test]
    fn test_decode_photo_with_and_without_prefix() {
        assert_eq!(decode_photo(&photo(255, 7, true)).unwrap().dimensions(), (4, 4));
        assert_eq!(decode_photo(&photo(255, 7, false)).unwrap().get_pixel(0, 0), &Rgb([255, 7, 0]));
        assert!(matches!(decode_photo("data:image/png;base64,@@@"), Err(PhotoError::Base64(_))));
        assert!(matches!(decode_photo("aGVsbG8="), Err(PhotoError::Image(_))));
    }

    #[tokio::test]
    async fn test_register_skips_photos_without_faces() {
        let f = fixture();
        let mut rx = f.publisher.subscribe();
        let photos = vec![
            photo(255, 1, true),
            photo(0, 2, true),
            photo(0, 3, false),
            photo(255, 4, false),
            photo(0, 5, true),
        ];

        let stored = f.control.register_person("Alice", photos).await.unwrap();
        assert_eq!(stored, 2);

        let on_disk = f.store.load().unwrap();
        let values: Vec<f32> = on_disk.get("Alice").unwrap().iter().map(|v| v.values()[0]).collect();
        assert_eq!(values, vec![1.0, 4.0]);
        assert_eq!(f.cache.current().get("Alice").map(|v| v.len()), Some(2));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::ReloadFacesEvent);
    }

    #[tokio::test]
    async fn test_register_undecodable_photos_are_skipped() {
        let f = fixture();
        let photos = vec!["not base64!".to_string(), photo(255, 9, true)];
        assert_eq!(f.control.register_person("Bob", photos).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_register_without_faces_changes_nothing() {
        let f = fixture();
        f.control.register_person("Alice", vec![photo(255, 1, true)]).await.unwrap();
        let mut rx = f.publisher.subscribe();

        let err = f
            .control
            .register_person("Alice", vec![photo(0, 1, true), photo(0, 2, true)])
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NoFaceDetected));
        assert_eq!(err.to_string(), "No faces could be detected");

        assert_eq!(f.store.load().unwrap().get("Alice").unwrap().len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_register_requires_name_and_photos() {
        let f = fixture();
        let no_name = f.control.register_person("  ", vec![photo(255, 1, true)]).await;
        assert!(matches!(no_name, Err(ControlError::MissingInput)));

        let no_photos = f.control.register_person("Alice", Vec::new()).await;
        assert!(matches!(no_photos, Err(ControlError::MissingInput)));
        assert!(!f.store.path().exists());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_vectors() {
        let f = fixture();
        f.control
            .register_person("Alice", vec![photo(255, 1, true), photo(255, 2, true)])
            .await
            .unwrap();
        f.control.register_person("Alice", vec![photo(255, 3, true)]).await.unwrap();

        let db = f.store.load().unwrap();
        assert_eq!(db.get("Alice").unwrap().len(), 1);
        assert_eq!(db.get("Alice").unwrap()[0].values()[0], 3.0);
    }

    #[tokio::test]
    async fn test_reload_picks_up_external_changes() {
        let f = fixture();
        let mut db = FaceDatabase::new();
        db.register("Carol", vec![FaceVector::new(vec![0.5, 0.5])]).unwrap();
        db.register("Dave", vec![FaceVector::new(vec![0.1, 0.9])]).unwrap();
        f.store.save(&db).unwrap();

        assert_eq!(f.control.cached_people(), 0);
        assert_eq!(f.control.reload().await.unwrap(), 2);
        assert_eq!(f.control.cached_people(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reload_never_rolls_back_a_registration() {
        let f = fixture();
        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let control = f.control.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let name = format!("person{i}");
                    control.register_person(&name, vec![photo(255, i, true)]).await.map(|_| ())
                } else {
                    control.reload().await.map(|_| ())
                }
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let on_disk = f.store.load().unwrap();
        assert_eq!(on_disk.len(), 8);
        assert_eq!(*f.cache.current(), on_disk);
        assert_eq!(f.control.reload().await.unwrap(), 8);
    }

    #[test]
    fn test_analyzer_is_released_after_each_photo() {
        let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(RedPixelAnalyzer) as Box<dyn FaceAnalyzer>));
        let photos = vec![
            RgbImage::from_pixel(4, 4, Rgb([255, 1, 0])),
            RgbImage::from_pixel(4, 4, Rgb([255, 2, 0])),
        ];

        let mut per_photo = PerPhotoLock(&analyzer);
        let faces = per_photo.analyze(photos[0].as_raw(), 4, 4).unwrap();
        assert_eq!(faces.len(), 1);
        assert!(analyzer.try_lock().is_ok());

        let vectors = enroll::collect_vectors(&mut PerPhotoLock(&analyzer), &photos).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(analyzer.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_dashboard_and_people() {
        let f = fixture();
        f.control
            .register_person("bob", vec![photo(255, 1, true), photo(255, 2, true)])
            .await
            .unwrap();
        f.control.register_person("alice", vec![photo(255, 3, true)]).await.unwrap();

        assert_eq!(
            f.control.dashboard().await.unwrap(),
            DashboardStats { total_people: 2, total_photos: 3 }
        );

        let people = f.control.people().await.unwrap();
        assert_eq!(
            people,
            vec![
                PersonSummary { id: 0, name: "alice".into(), photos: 1 },
                PersonSummary { id: 1, name: "bob".into(), photos: 2 },
            ]
        );
        assert_eq!(
            serde_json::to_value(&f.control.dashboard().await.unwrap()).unwrap(),
            serde_json::json!({"totalPeople": 2, "totalPhotos": 3})
        );
    }

    #[tokio::test]
    async fn test_corrupt_database_is_a_storage_error() {
        let f = fixture();
        std::fs::create_dir_all(f.store.path().parent().unwrap()).unwrap();
        std::fs::write(f.store.path(), "[1, 2").unwrap();

        assert!(matches!(f.control.dashboard().await, Err(ControlError::Storage(_))));
        assert!(matches!(
            f.control.register_person("Eve", vec![photo(255, 1, true)]).await,
            Err(ControlError::Storage(_))
        ));
    }
}
