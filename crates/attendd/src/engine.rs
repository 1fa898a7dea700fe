use crate::config::Config;
use attend_core::{AttendanceCore, FrameResult};
use attend_hw::{Camera, CameraError, CameraSettings, Frame, FrameSource, ImageDirSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Read failures tolerated in a row before the worker gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 30;
const EVENT_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Open the configured frame source: an image directory when set, else the camera.
pub fn open_source(config: &Config) -> Result<Box<dyn FrameSource>, CameraError> {
    match &config.image_dir {
        Some(dir) => Ok(Box::new(ImageDirSource::open(dir, config.image_loop)?)),
        None => {
            let settings = CameraSettings {
                width: config.camera_width,
                height: config.camera_height,
                ..CameraSettings::default()
            };
            Ok(Box::new(Camera::open(&config.camera_device, &settings)?))
        }
    }
}

#[derive(Default)]
struct Latest {
    frame: Option<Frame>,
    result: Option<FrameResult>,
}

/// A running capture thread. Stopping or dropping it joins the thread, and
/// the thread drops its source on every exit path.
struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owns the capture session: at most one worker thread feeding frames
/// through the core and publishing results.
pub struct Capture {
    core: Arc<AttendanceCore>,
    interval: Duration,
    latest: Arc<Mutex<Latest>>,
    events: broadcast::Sender<FrameResult>,
    worker: Mutex<Option<Worker>>,
}

impl Capture {
    pub fn new(core: Arc<AttendanceCore>, interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core,
            interval,
            latest: Arc::new(Mutex::new(Latest::default())),
            events,
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> std::sync::MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn latest(&self) -> std::sync::MutexGuard<'_, Latest> {
        self.latest.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Results of every processed frame.
    pub fn subscribe(&self) -> broadcast::Receiver<FrameResult> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.worker().as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start a worker over `source`. Returns `false` if one is already running;
    /// the new source is dropped in that case.
    pub fn start(&self, source: Box<dyn FrameSource>) -> Result<bool, EngineError> {
        let mut slot = self.worker();
        if slot.as_ref().is_some_and(|w| !w.is_finished()) {
            return Ok(false);
        }
        // Reap a worker that ended on its own.
        slot.take();

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = LoopContext {
            core: self.core.clone(),
            latest: self.latest.clone(),
            events: self.events.clone(),
            stop: stop.clone(),
            interval: self.interval,
        };
        let name = source.describe();
        let handle = std::thread::Builder::new()
            .name("attend-capture".into())
            .spawn(move || run_loop(source, ctx))?;
        tracing::info!(source = %name, "capture session started");

        *slot = Some(Worker {
            stop,
            handle: Some(handle),
        });
        Ok(true)
    }

    /// Stop the worker and wait for it to release its source.
    pub fn stop(&self) -> bool {
        let worker = self.worker().take();
        match worker {
            Some(mut w) => {
                w.shutdown();
                tracing::info!("capture session stopped");
                true
            }
            None => false,
        }
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.latest().frame.clone()
    }

    pub fn latest_result(&self) -> Option<FrameResult> {
        self.latest().result.clone()
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopContext {
    core: Arc<AttendanceCore>,
    latest: Arc<Mutex<Latest>>,
    events: broadcast::Sender<FrameResult>,
    stop: Arc<AtomicBool>,
    interval: Duration,
}

fn run_loop(mut source: Box<dyn FrameSource>, ctx: LoopContext) {
    let mut errors = 0u32;
    let mut processed = 0u64;

    while !ctx.stop.load(Ordering::SeqCst) {
        match source.read() {
            Ok(Some(frame)) => {
                errors = 0;
                if frame.is_dark {
                    tracing::debug!(seq = frame.sequence, "skipping dark frame");
                } else {
                    let result = ctx.core.process_frame(frame.sequence, &frame.image);
                    {
                        let mut latest = ctx.latest.lock().unwrap_or_else(|p| p.into_inner());
                        latest.frame = Some(frame);
                        latest.result = Some(result.clone());
                    }
                    // No subscribers is fine.
                    let _ = ctx.events.send(result);
                    processed += 1;
                }
            }
            Ok(None) => {
                tracing::info!("frame source exhausted");
                break;
            }
            Err(e) => {
                errors += 1;
                tracing::warn!(error = %e, errors, "frame read failed");
                if errors >= MAX_CONSECUTIVE_ERRORS {
                    tracing::error!("too many consecutive read failures; stopping capture");
                    break;
                }
            }
        }
        if !ctx.interval.is_zero() {
            std::thread::sleep(ctx.interval);
        }
    }

    drop(source);
    tracing::info!(processed, "capture thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::detector::{DetectParams, DetectorBackend, DetectorError};
    use attend_core::eyes::ContrastEyeDetector;
    use attend_core::{BoundingBox, CoreConfig, SystemClock};
    use image::{GrayImage, Luma};

    struct NoFaces;

    impl DetectorBackend for NoFaces {
        fn detect(
            &mut self,
            _: &GrayImage,
            _: &DetectParams,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(Vec::new())
        }
    }

    /// Yields `limit` frames (or forever), flags its own drop.
    struct FakeSource {
        produced: u64,
        limit: Option<u64>,
        dropped: Arc<AtomicBool>,
    }

    impl FrameSource for FakeSource {
        fn read(&mut self) -> Result<Option<Frame>, CameraError> {
            if self.limit.is_some_and(|l| self.produced >= l) {
                return Ok(None);
            }
            self.produced += 1;
            Ok(Some(Frame::new(
                GrayImage::from_pixel(32, 24, Luma([120])),
                self.produced,
            )))
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn capture(interval_ms: u64) -> Capture {
        let core = AttendanceCore::open(
            CoreConfig::default(),
            Arc::new(SystemClock),
            Box::new(NoFaces),
            Box::new(ContrastEyeDetector::default()),
        )
        .unwrap();
        Capture::new(Arc::new(core), Duration::from_millis(interval_ms))
    }

    fn source(limit: Option<u64>) -> (Box<dyn FrameSource>, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let src = FakeSource {
            produced: 0,
            limit,
            dropped: dropped.clone(),
        };
        (Box::new(src), dropped)
    }

    #[test]
    fn test_stop_releases_source() {
        let cap = capture(1);
        let (src, dropped) = source(None);
        assert!(cap.start(src).unwrap());
        assert!(cap.is_running());

        let (second, second_dropped) = source(None);
        assert!(!cap.start(second).unwrap());
        assert!(second_dropped.load(Ordering::SeqCst));

        assert!(cap.stop());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!cap.is_running());
        assert!(!cap.stop());
    }

    #[test]
    fn test_exhausted_source_ends_session() {
        let cap = capture(0);
        let mut rx = cap.subscribe();
        let (src, dropped) = source(Some(3));
        cap.start(src).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.blocking_recv().unwrap().sequence);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        // Wait for the thread to notice exhaustion.
        for _ in 0..200 {
            if !cap.is_running() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!cap.is_running());
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(cap.latest_result().unwrap().sequence, 3);
        assert_eq!(cap.latest_frame().unwrap().sequence, 3);

        // A finished session can be restarted.
        let (again, _) = source(Some(1));
        assert!(cap.start(again).unwrap());
    }
}
