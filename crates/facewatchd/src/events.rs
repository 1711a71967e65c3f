//! Live channel messages.
//!
//! Every message is a JSON envelope `{"event": <name>, "data": <payload>}`;
//! events without a payload omit `data`.

use facewatch_core::Detection;
use serde::{Deserialize, Serialize};

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// One processed frame as a JPEG data URL, plus what was recognized in it.
    VideoFrame {
        image: String,
        detections: Vec<Detection>,
    },
    /// The video source could not be opened. Sent once; the loop stops.
    StreamError { message: String },
    /// Reply to a client's `reload_faces`.
    FacesReloaded { count: usize },
    /// Someone was registered; clients may refresh their people views.
    ReloadFacesEvent,
    /// Reply to a client's `reload_faces` when the database could not be read.
    ReloadFailed { message: String },
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Sent by some clients right after connecting; the upgrade itself
    /// already counts as the connect.
    Connect,
    ReloadFaces,
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
