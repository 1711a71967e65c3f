//! The capture loop: read, recognize, encode, publish, on its own OS thread.

use crate::cache::FaceCache;
use crate::publisher::Publisher;
use facewatch_core::FaceAnalyzer;
use facewatch_hw::{Frame, SourceError, SourceOpener, VideoSource};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Fixed pause before every frame read.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(50);
/// Fixed wait between a failed read and the reopen attempt.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// The ONNX analyzer, shared by the capture loop and registrations.
pub type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;

pub fn lock_analyzer(analyzer: &SharedAnalyzer) -> MutexGuard<'_, Box<dyn FaceAnalyzer>> {
    analyzer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Disconnected,
    Connecting,
    Streaming,
}

pub struct CaptureLoop {
    opener: Box<dyn SourceOpener>,
    analyzer: SharedAnalyzer,
    cache: Arc<FaceCache>,
    publisher: Publisher,
    cancel: CancellationToken,
    runtime: Handle,
    frame_interval: Duration,
    backoff: Duration,
    state: LoopState,
}

impl CaptureLoop {
    pub fn new(
        opener: Box<dyn SourceOpener>,
        analyzer: SharedAnalyzer,
        cache: Arc<FaceCache>,
        publisher: Publisher,
        cancel: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            opener,
            analyzer,
            cache,
            publisher,
            cancel,
            runtime,
            frame_interval: FRAME_INTERVAL,
            backoff: RECONNECT_BACKOFF,
            state: LoopState::Disconnected,
        }
    }

    pub fn with_timing(mut self, frame_interval: Duration, backoff: Duration) -> Self {
        self.frame_interval = frame_interval;
        self.backoff = backoff;
        self
    }

    /// Run until cancelled, or until the initial open fails.
    ///
    /// Blocks the calling thread; the runtime handle only drives the
    /// cancellable waits.
    pub fn run(mut self) {
        let source_name = self.opener.describe();
        tracing::info!(source = %source_name, "capture loop starting");

        self.set_state(LoopState::Connecting);
        let mut source: Option<Box<dyn VideoSource>> = match self.opener.open() {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::error!(source = %source_name, error = %e, "video source unavailable");
                self.publisher.publish_stream_error(e.to_string());
                self.set_state(LoopState::Disconnected);
                return;
            }
        };
        self.set_state(LoopState::Streaming);

        while self.pause(self.frame_interval) {
            let read = match source.as_mut() {
                Some(active) => active.read_frame(),
                None => Err(SourceError::ReadFailed("source not open".into())),
            };

            match read {
                Ok(frame) => self.process(&frame),
                Err(e) => {
                    tracing::warn!(
                        source = %source_name,
                        error = %e,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "frame read failed, reconnecting"
                    );
                    drop(source.take());
                    self.set_state(LoopState::Disconnected);

                    if !self.pause(self.backoff) {
                        break;
                    }

                    self.set_state(LoopState::Connecting);
                    source = match self.opener.open() {
                        Ok(reopened) => {
                            tracing::info!(source = %source_name, "video source reopened");
                            self.set_state(LoopState::Streaming);
                            Some(reopened)
                        }
                        Err(e) => {
                            tracing::warn!(source = %source_name, error = %e, "reopen failed");
                            None
                        }
                    };
                }
            }
        }

        tracing::info!(source = %source_name, "capture loop stopped");
    }

    fn process(&self, frame: &Frame) {
        let db = self.cache.current();
        let result = {
            let mut analyzer = lock_analyzer(&self.analyzer);
            facewatch_core::recognize(&mut **analyzer, &frame.data, frame.width, frame.height, &db)
        };

        let detections = result.unwrap_or_else(|e| {
            tracing::warn!(sequence = frame.sequence, error = %e, "recognition failed");
            Vec::new()
        });

        if let Err(e) = self.publisher.publish_frame(frame, detections) {
            tracing::warn!(sequence = frame.sequence, error = %e, "dropping frame");
        }
    }

    /// Sleep for `duration`; false if cancelled first.
    fn pause(&self, duration: Duration) -> bool {
        self.runtime.block_on(async {
            tokio::select! {
                _ = self.cancel.cancelled() => false,
                _ = tokio::time::sleep(duration) => true,
            }
        })
    }

    fn set_state(&mut self, state: LoopState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "capture state");
            self.state = state;
        }
    }
}

/// Starts the capture loop at most once, on the first viewer.
pub struct CaptureSupervisor {
    pending: Mutex<Option<CaptureLoop>>,
}

impl CaptureSupervisor {
    pub fn new(capture: CaptureLoop) -> Self {
        Self {
            pending: Mutex::new(Some(capture)),
        }
    }

    /// Spawn the capture thread if this is the first call. Returns whether
    /// this call started it.
    pub fn ensure_started(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(capture) = pending.take() else {
            return false;
        };

        std::thread::Builder::new()
            .name("facewatch-capture".into())
            .spawn(move || capture.run())
            .expect("failed to spawn capture thread");
        tracing::info!("capture thread spawned");
        true
    }

    pub fn is_started(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use facewatch_core::{AnalyzedFace, AnalyzerError, BoundingBox, FaceDatabase, FaceVector};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    const FAST: Duration = Duration::from_millis(5);
    const WAIT: Duration = Duration::from_secs(5);

    /// Counts opens. Optionally refuses to open, and optionally makes the
    /// first source it hands out fail on a given read.
    struct FakeOpener {
        opens: Arc<AtomicUsize>,
        refuse: bool,
        first_fails_at: Option<usize>,
    }

    impl SourceOpener for FakeOpener {
        fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
            let previous = self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(SourceError::Unavailable {
                    source_name: "fake".into(),
                    reason: "no such camera".into(),
                });
            }
            let fail_at = if previous == 0 { self.first_fails_at } else { None };
            Ok(Box::new(FakeSource { reads: 0, fail_at }))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    struct FakeSource {
        reads: usize,
        fail_at: Option<usize>,
    }

    impl VideoSource for FakeSource {
        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            self.reads += 1;
            if self.fail_at == Some(self.reads) {
                return Err(SourceError::ReadFailed("cable pulled".into()));
            }
            Ok(Frame::from_image(
                RgbImage::from_pixel(4, 4, Rgb([90, 90, 90])),
                self.reads as u32,
            ))
        }
    }

    /// Sees one face covering the whole frame, always with the same vector.
    struct OneFace;

    impl FaceAnalyzer for OneFace {
        fn analyze(&mut self, _: &[u8], width: u32, height: u32) -> Result<Vec<AnalyzedFace>, AnalyzerError> {
            Ok(vec![AnalyzedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: width as f32,
                    height: height as f32,
                    confidence: 0.9,
                    landmarks: None,
                },
                vector: FaceVector::new(vec![1.0, 0.0]),
            }])
        }
    }

    struct Harness {
        opens: Arc<AtomicUsize>,
        cache: Arc<FaceCache>,
        publisher: Publisher,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                opens: Arc::new(AtomicUsize::new(0)),
                cache: Arc::new(FaceCache::default()),
                publisher: Publisher::new(64, 80),
                cancel: CancellationToken::new(),
            }
        }

        fn capture(&self, refuse: bool, first_fails_at: Option<usize>) -> CaptureLoop {
            let opener = FakeOpener {
                opens: Arc::clone(&self.opens),
                refuse,
                first_fails_at,
            };
            let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(OneFace) as Box<dyn FaceAnalyzer>));
            CaptureLoop::new(
                Box::new(opener),
                analyzer,
                Arc::clone(&self.cache),
                self.publisher.clone(),
                self.cancel.clone(),
                Handle::current(),
            )
            .with_timing(FAST, FAST)
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn join(handle: std::thread::JoinHandle<()>) {
        tokio::task::spawn_blocking(move || handle.join().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unopenable_source_reports_once_and_stops() {
        let h = Harness::new();
        let mut rx = h.publisher.subscribe();
        let capture = h.capture(true, None);

        join(std::thread::spawn(move || capture.run())).await;

        match next_event(&mut rx).await {
            ServerEvent::StreamError { message } => assert!(message.contains("no such camera")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "nothing may follow the stream error");
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_read_failure_reopens_and_resumes() {
        let h = Harness::new();
        let mut rx = h.publisher.subscribe();
        let capture = h.capture(false, Some(3));
        let thread = std::thread::spawn(move || capture.run());

        let mut frames = 0;
        while frames < 5 {
            match next_event(&mut rx).await {
                ServerEvent::VideoFrame { .. } => frames += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        h.cancel.cancel();
        join(thread).await;

        assert_eq!(h.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_database_publishes_no_detections() {
        let h = Harness::new();
        let mut rx = h.publisher.subscribe();
        let capture = h.capture(false, None);
        let thread = std::thread::spawn(move || capture.run());

        match next_event(&mut rx).await {
            ServerEvent::VideoFrame { image, detections } => {
                assert!(image.starts_with("data:image/jpeg;base64,"));
                assert!(detections.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
        h.cancel.cancel();
        join(thread).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_swapped_snapshot_is_picked_up() {
        let h = Harness::new();
        let mut rx = h.publisher.subscribe();
        let capture = h.capture(false, None);
        let thread = std::thread::spawn(move || capture.run());

        // Wait for the loop to be streaming before registering anyone.
        next_event(&mut rx).await;

        let mut db = FaceDatabase::new();
        db.register("alice", vec![FaceVector::new(vec![1.0, 0.0])]).unwrap();
        h.cache.replace(db);

        let recognized = loop {
            if let ServerEvent::VideoFrame { detections, .. } = next_event(&mut rx).await {
                if let Some(first) = detections.into_iter().next() {
                    break first;
                }
            }
        };
        assert_eq!(recognized.name, "alice");
        assert_eq!(recognized.id, "alice-0");
        assert!((recognized.confidence - 1.0).abs() < 1e-6);
        assert_eq!(recognized.bbox, [0.0, 100.0, 100.0, 0.0]);

        h.cancel.cancel();
        join(thread).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_backoff() {
        let h = Harness::new();
        let capture = CaptureLoop {
            backoff: Duration::from_secs(3600),
            ..h.capture(false, Some(1))
        };
        let thread = std::thread::spawn(move || capture.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.cancel.cancel();
        tokio::time::timeout(WAIT, join(thread)).await.unwrap();
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_ensure_started_starts_once() {
        let h = Harness::new();
        let supervisor = Arc::new(CaptureSupervisor::new(h.capture(false, None)));
        assert!(!supervisor.is_started());

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let supervisor = Arc::clone(&supervisor);
                std::thread::spawn(move || supervisor.ensure_started())
            })
            .collect();
        let started = tokio::task::spawn_blocking(move || {
            callers
                .into_iter()
                .map(|caller| caller.join().unwrap())
                .filter(|&started| started)
                .count()
        })
        .await
        .unwrap();
        assert_eq!(started, 1);
        assert!(supervisor.is_started());
        assert!(!supervisor.ensure_started());

        let mut rx = h.publisher.subscribe();
        next_event(&mut rx).await;
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);
        h.cancel.cancel();
    }
}
