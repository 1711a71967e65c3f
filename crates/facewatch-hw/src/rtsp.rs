//! Network camera streams decoded with FFmpeg.

use crate::frame::Frame;
use crate::source::{SourceError, VideoSource};
use ffmpeg_next::format::context::Input;
use ffmpeg_next::software::scaling::{self, Context as Scaler};
use ffmpeg_next::util::frame::video::Video as VideoFrame;
use ffmpeg_next::Packet;
use std::time::Duration;

/// How long a socket read may stall before the stream counts as lost.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A live RTSP/HTTP stream, decoded and converted to RGB24 frame by frame.
pub struct RtspSource {
    input: Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: Scaler,
    stream_index: usize,
    width: u32,
    height: u32,
    sequence: u32,
}

// Safety: an RtspSource is owned and driven by one thread at a time; the
// FFmpeg contexts it wraps are never shared.
unsafe impl Send for RtspSource {}

impl RtspSource {
    pub fn open(url: &str) -> Result<Self, ffmpeg_next::Error> {
        ffmpeg_next::init()?;

        let timeout = READ_TIMEOUT.as_micros().to_string();
        let mut options = ffmpeg_next::Dictionary::new();
        options.set("rtsp_transport", "tcp");
        // Socket timeout for rtsp and http, and the generic protocol I/O timeout.
        options.set("timeout", &timeout);
        options.set("rw_timeout", &timeout);
        let input = ffmpeg_next::format::input_with_dictionary(&url, options)?;

        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or(ffmpeg_next::Error::StreamNotFound)?;
        let stream_index = stream.index();
        let codec_ctx = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())?;
        let decoder = codec_ctx.decoder().video()?;

        let (width, height) = (decoder.width(), decoder.height());
        let scaler = Scaler::get(
            decoder.format(),
            width,
            height,
            ffmpeg_next::format::Pixel::RGB24,
            width,
            height,
            scaling::Flags::BILINEAR,
        )?;

        tracing::info!(width, height, codec = ?decoder.id(), "network stream opened");

        Ok(Self {
            input,
            decoder,
            scaler,
            stream_index,
            width,
            height,
            sequence: 0,
        })
    }

    fn receive(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut decoded = VideoFrame::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }

        let mut rgb = VideoFrame::empty();
        self.scaler
            .run(&decoded, &mut rgb)
            .map_err(|e| SourceError::ReadFailed(format!("scaling failed: {e}")))?;

        let pixels = packed_rgb(&rgb, self.width, self.height);
        let frame = Frame::from_rgb(pixels, self.width, self.height, self.sequence)
            .map_err(|e| SourceError::ReadFailed(e.to_string()))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}

impl VideoSource for RtspSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        if let Some(frame) = self.receive()? {
            return Ok(frame);
        }

        loop {
            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Other { errno: ffmpeg_next::util::error::EAGAIN }) => continue,
                Err(ffmpeg_next::Error::Eof) => return Err(SourceError::ReadFailed("end of stream".into())),
                Err(e) => return Err(SourceError::ReadFailed(format!("stream read failed: {e}"))),
            }
            if packet.stream() != self.stream_index {
                continue;
            }
            if let Err(e) = self.decoder.send_packet(&packet) {
                tracing::debug!(error = %e, "dropping undecodable packet");
                continue;
            }
            if let Some(frame) = self.receive()? {
                return Ok(frame);
            }
        }
    }
}

/// Copy the RGB plane row by row, dropping FFmpeg's line padding.
fn packed_rgb(frame: &VideoFrame, width: u32, height: u32) -> Vec<u8> {
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_len = width as usize * 3;

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(&data[start..start + row_len]);
    }
    pixels
}
