//! facewatch-hw: video input for facewatch.
//!
//! V4L2 webcams through `v4l`, network streams through FFmpeg (behind the
//! `rtsp` feature), RGB frame conversion and JPEG encoding.

pub mod camera;
pub mod frame;
#[cfg(feature = "rtsp")]
pub mod rtsp;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError, DEFAULT_JPEG_QUALITY};
pub use source::{DefaultOpener, SourceError, SourceOpener, SourceSpec, VideoSource};
