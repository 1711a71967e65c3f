//! Video sources: anything that can be opened and then read frame by frame.

use crate::camera::{self, Camera};
use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cannot open video source {source_name}: {reason}")]
    Unavailable { source_name: String, reason: String },
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// An open video source. Dropping it releases the underlying handle.
pub trait VideoSource: Send {
    fn read_frame(&mut self) -> Result<Frame, SourceError>;
}

/// Opens (and re-opens) one configured video source.
pub trait SourceOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn VideoSource>, SourceError>;

    /// Human-readable source name for logs and client error messages.
    fn describe(&self) -> String;
}

/// Where frames come from, parsed from a configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// Local V4L2 device path.
    Device(String),
    /// Network stream URL (`rtsp://`, `rtsps://`, `http://`, `https://`).
    Stream(String),
}

impl SourceSpec {
    /// A bare number is a webcam index, a URL is a network stream, anything
    /// else is a device path.
    pub fn parse(source: &str) -> Self {
        let source = source.trim();
        let is_url = ["rtsp://", "rtsps://", "http://", "https://"]
            .iter()
            .any(|scheme| source.to_ascii_lowercase().starts_with(scheme));
        if is_url {
            Self::Stream(source.to_string())
        } else {
            Self::Device(camera::device_path(source))
        }
    }
}

impl std::fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(path) => f.write_str(path),
            Self::Stream(url) => f.write_str(&redact_credentials(url)),
        }
    }
}

/// Hide `user:password@` in a stream URL.
fn redact_credentials(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}***@{}", &url[..scheme_end + 3], &rest[at + 1..]),
        None => url.to_string(),
    }
}

/// Opens V4L2 devices directly and network streams through FFmpeg when the
/// `rtsp` feature is enabled.
pub struct DefaultOpener {
    spec: SourceSpec,
}

impl DefaultOpener {
    pub fn new(spec: SourceSpec) -> Self {
        Self { spec }
    }

    fn unavailable(&self, reason: impl ToString) -> SourceError {
        SourceError::Unavailable {
            source_name: self.spec.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl SourceOpener for DefaultOpener {
    fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        match &self.spec {
            SourceSpec::Device(path) => {
                let camera = Camera::open(path).map_err(|e| self.unavailable(e))?;
                Ok(Box::new(camera))
            }
            #[cfg(feature = "rtsp")]
            SourceSpec::Stream(url) => {
                let stream = crate::rtsp::RtspSource::open(url).map_err(|e| self.unavailable(e))?;
                Ok(Box::new(stream))
            }
            #[cfg(not(feature = "rtsp"))]
            SourceSpec::Stream(_) => Err(self.unavailable(
                "network streams need facewatch built with the `rtsp` feature",
            )),
        }
    }

    fn describe(&self) -> String {
        self.spec.to_string()
    }
}
