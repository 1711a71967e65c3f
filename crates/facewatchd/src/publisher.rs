use crate::events::ServerEvent;
use base64::Engine;
use facewatch_core::Detection;
use facewatch_hw::{Frame, FrameError};
use tokio::sync::broadcast;

/// Fans live channel events out to every connected viewer.
///
/// Sending never blocks: a viewer that falls more than the channel capacity
/// behind loses its oldest messages.
#[derive(Clone)]
pub struct Publisher {
    tx: broadcast::Sender<ServerEvent>,
    jpeg_quality: u8,
}

impl Publisher {
    pub fn new(capacity: usize, jpeg_quality: u8) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, jpeg_quality }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Broadcast to everyone currently subscribed. Nobody listening is fine.
    pub fn publish(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }

    /// JPEG-encode a frame and broadcast it with its detections.
    pub fn publish_frame(&self, frame: &Frame, detections: Vec<Detection>) -> Result<(), FrameError> {
        let jpeg = frame.encode_jpeg(self.jpeg_quality)?;
        self.publish(ServerEvent::VideoFrame {
            image: jpeg_data_url(&jpeg),
            detections,
        });
        Ok(())
    }

    pub fn publish_stream_error(&self, message: impl Into<String>) {
        self.publish(ServerEvent::StreamError {
            message: message.into(),
        });
    }
}

pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}
