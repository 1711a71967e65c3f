use facewatch_core::{FaceDatabase, FaceStore, StorageError};
use std::sync::{Arc, RwLock};

/// The face database snapshot shared by the capture loop and the control path.
///
/// Readers clone the current `Arc` and keep using it for as long as they
/// like; writers build a complete database and swap the reference.
#[derive(Default)]
pub struct FaceCache {
    current: RwLock<Arc<FaceDatabase>>,
}

impl FaceCache {
    pub fn new(db: FaceDatabase) -> Self {
        Self {
            current: RwLock::new(Arc::new(db)),
        }
    }

    /// Load the initial snapshot from disk.
    pub fn load(store: &FaceStore) -> Result<Self, StorageError> {
        Ok(Self::new(store.load()?))
    }

    pub fn current(&self) -> Arc<FaceDatabase> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn replace(&self, db: FaceDatabase) {
        let db = Arc::new(db);
        match self.current.write() {
            Ok(mut guard) => *guard = db,
            Err(poisoned) => *poisoned.into_inner() = db,
        }
    }

    /// Re-read the snapshot from disk and swap it in. Returns the number of
    /// people now registered. On error the current snapshot is kept.
    pub fn reload(&self, store: &FaceStore) -> Result<usize, StorageError> {
        let db = store.load()?;
        let people = db.len();
        self.replace(db);
        tracing::info!(people, "face database reloaded");
        Ok(people)
    }
}
