//! Registered faces: the in-memory database and its on-disk snapshot.
//!
//! The snapshot is a single JSON object mapping each person's name to the
//! list of their face vectors. There is no schema version; changing the
//! layout is a breaking change for existing files.

use crate::types::{FaceVector, GalleryEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default snapshot location, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "data/face_encodings.json";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to access face database {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("face database {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug, PartialEq)]
pub enum DatabaseError {
    #[error("a person needs at least one face vector")]
    EmptyVectorSet,
    #[error("face vectors disagree on dimension ({expected} vs {actual})")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Person name → face vectors, iterated in name order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceDatabase {
    people: BTreeMap<String, Vec<FaceVector>>,
}

impl FaceDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered people.
    pub fn len(&self) -> usize {
        self.people.len()
    }

    pub fn is_empty(&self) -> bool {
        self.people.is_empty()
    }

    /// Sum of vector counts across all people.
    pub fn total_vectors(&self) -> usize {
        self.people.values().map(Vec::len).sum()
    }

    pub fn get(&self, name: &str) -> Option<&[FaceVector]> {
        self.people.get(name).map(Vec::as_slice)
    }

    pub fn people(&self) -> impl Iterator<Item = (&str, &[FaceVector])> {
        self.people.iter().map(|(name, vectors)| (name.as_str(), vectors.as_slice()))
    }

    /// Replace whatever is stored for `name` with `vectors`.
    pub fn register(&mut self, name: &str, vectors: Vec<FaceVector>) -> Result<(), DatabaseError> {
        let expected = vectors.first().ok_or(DatabaseError::EmptyVectorSet)?.dim();
        if let Some(odd) = vectors.iter().find(|v| v.dim() != expected) {
            return Err(DatabaseError::DimensionMismatch {
                expected,
                actual: odd.dim(),
            });
        }
        self.people.insert(name.to_string(), vectors);
        Ok(())
    }

    /// Every known vector paired with its owner, in name order.
    pub fn gallery(&self) -> Vec<GalleryEntry<'_>> {
        self.people
            .iter()
            .flat_map(|(name, vectors)| {
                vectors.iter().map(move |vector| GalleryEntry {
                    name: name.as_str(),
                    vector,
                })
            })
            .collect()
    }
}

/// File-backed persistence for [`FaceDatabase`].
#[derive(Debug, Clone)]
pub struct FaceStore {
    path: PathBuf,
}

impl FaceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty database.
    pub fn load(&self) -> Result<FaceDatabase, StorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no face database yet, starting empty");
                return Ok(FaceDatabase::new());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        let db: FaceDatabase = serde_json::from_reader(BufReader::new(file)).map_err(|source| {
            StorageError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;

        tracing::debug!(
            path = %self.path.display(),
            people = db.len(),
            vectors = db.total_vectors(),
            "face database loaded"
        );
        Ok(db)
    }

    /// Write the whole snapshot.
    ///
    /// Data goes to a sibling temp file which is then renamed over the
    /// snapshot, so readers see either the old or the new file.
    pub fn save(&self, db: &FaceDatabase) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        }

        let tmp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, db)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            fs::rename(&tmp, &self.path)
        };

        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(self.io_error(e));
        }

        tracing::debug!(
            path = %self.path.display(),
            people = db.len(),
            "face database saved"
        );
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
