//! Fakes and fixtures shared by the unit tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{CaptureObserver, CaptureState, CaptureStats};
use crate::frame::DecodedFrame;
use crate::scheduler::{SessionController, SessionPlan};
use crate::source::{FrameStream, Interrupter, StreamError, StreamSource};
use crate::LogLevel;

/// A flat-colored JPEG.
pub fn jpeg_fixture(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let pixels = rgb
        .iter()
        .copied()
        .cycle()
        .take(width as usize * height as usize * 3)
        .collect();
    DecodedFrame::from_rgb(width, height, pixels)
        .unwrap()
        .to_jpeg(90)
        .unwrap()
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub struct FakeStream {
    jpeg: Vec<u8>,
    /// Frames left before the stream goes quiet (or ends); `None` is unlimited.
    remaining: Option<u64>,
    interval: Duration,
    end_when_drained: bool,
    interrupted: Arc<AtomicBool>,
}

impl FakeStream {
    /// Delivers `frames` frames immediately and then blocks.
    pub fn burst(frames: u64) -> Self {
        Self {
            jpeg: jpeg_fixture(8, 8, [30, 30, 90]),
            remaining: Some(frames),
            interval: Duration::ZERO,
            end_when_drained: false,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delivers a frame every `interval` forever.
    pub fn steady(interval: Duration) -> Self {
        Self {
            remaining: None,
            interval,
            ..Self::burst(0)
        }
    }

    pub fn limited(mut self, frames: Option<u64>) -> Self {
        self.remaining = frames;
        self
    }

    /// Report the stream as ended once the frames run out instead of blocking.
    pub fn then_end(mut self) -> Self {
        self.end_when_drained = true;
        self
    }

    pub fn boxed(self) -> Box<dyn FrameStream> {
        Box::new(self)
    }
}

impl FrameStream for FakeStream {
    fn next_frame(&mut self) -> Result<Vec<u8>, StreamError> {
        if self.remaining == Some(0) {
            if self.end_when_drained {
                return Err(StreamError::Ended);
            }
            while !self.interrupted.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        if self.interrupted.load(Ordering::Acquire) {
            return Err(StreamError::Ended);
        }

        std::thread::sleep(self.interval);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Ok(self.jpeg.clone())
    }

    fn interrupter(&self) -> Interrupter {
        let interrupted = self.interrupted.clone();
        Arc::new(move || interrupted.store(true, Ordering::Release))
    }
}

/// A camera whose connections can be scripted to fail or die.
pub struct FakeSource {
    opens: AtomicU32,
    interval: Duration,
    silent: bool,
    frames_per_stream: Option<u64>,
    fail_first: u32,
    fail_after: Option<u32>,
}

impl FakeSource {
    pub fn live(interval: Duration) -> Self {
        Self {
            opens: AtomicU32::new(0),
            interval,
            silent: false,
            frames_per_stream: None,
            fail_first: 0,
            fail_after: None,
        }
    }

    /// Connects but never delivers a frame.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::live(Duration::ZERO)
        }
    }

    /// Every open fails.
    pub fn unreachable() -> Self {
        Self {
            fail_first: u32::MAX,
            ..Self::live(Duration::ZERO)
        }
    }

    /// Each connection ends after `frames` frames.
    pub fn ending_after(mut self, frames: u64) -> Self {
        self.frames_per_stream = Some(frames);
        self
    }

    pub fn failing_first(mut self, opens: u32) -> Self {
        self.fail_first = opens;
        self
    }

    /// Opens after the first `opens` successful ones fail.
    pub fn failing_after(mut self, opens: u32) -> Self {
        self.fail_after = Some(opens);
        self
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl StreamSource for FakeSource {
    fn open(&self) -> Result<Box<dyn FrameStream>, StreamError> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;

        let refused = attempt <= self.fail_first
            || self
                .fail_after
                .is_some_and(|limit| attempt > limit.saturating_add(self.fail_first));
        if refused {
            return Err(StreamError::CouldNotOpen(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        if self.silent {
            return Ok(FakeStream::burst(0).boxed());
        }

        let stream = FakeStream::steady(self.interval).limited(self.frames_per_stream);
        Ok(match self.frames_per_stream {
            Some(_) => stream.then_end().boxed(),
            None => stream.boxed(),
        })
    }

    fn describe(&self) -> String {
        "fake://camera".into()
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    states: Mutex<Vec<CaptureState>>,
    logs: Mutex<Vec<(LogLevel, String)>>,
    frames: AtomicU64,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<CaptureState> {
        self.states.lock().clone()
    }

    pub fn logs(&self) -> Vec<(LogLevel, String)> {
        self.logs.lock().clone()
    }

    pub fn logged(&self, level: LogLevel, needle: &str) -> bool {
        self.logs
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl CaptureObserver for RecordingObserver {
    fn on_status(&self, state: CaptureState, _stats: &CaptureStats) {
        let mut states = self.states.lock();
        if states.last() != Some(&state) {
            states.push(state);
        }
    }

    fn on_frame(&self, _frame: &DecodedFrame) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        self.logs.lock().push((level, message.to_string()));
    }
}

/// Records controller calls as `start <key>`, `stop` and `complete <key>`.
#[derive(Default)]
pub struct RecordingController {
    events: Mutex<Vec<String>>,
    plans: Mutex<Vec<SessionPlan>>,
    logs: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingController {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn plans(&self) -> Vec<SessionPlan> {
        self.plans.lock().clone()
    }

    pub fn logged(&self, level: LogLevel, needle: &str) -> bool {
        self.logs
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }

    pub fn log_count(&self) -> usize {
        self.logs.lock().len()
    }
}

impl SessionController for RecordingController {
    fn start_capture(&self, plan: &SessionPlan) {
        self.events.lock().push(format!("start {}", plan.date_key));
        self.plans.lock().push(plan.clone());
    }

    fn stop_capture(&self) {
        self.events.lock().push("stop".into());
    }

    fn session_complete(&self, date_key: &str) {
        self.events.lock().push(format!("complete {date_key}"));
    }

    fn log(&self, level: LogLevel, message: &str) {
        self.logs.lock().push((level, message.to_string()));
    }
}
