use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::frame::{DecodedFrame, FrameError};
use crate::reader::{StreamReader, READ_TIMEOUT};
use crate::signal::{join_within, StopSignal};
use crate::source::{StreamError, StreamSource};
use crate::window::{date_key, snapshot_file_name, ScheduleWindow};
use crate::{describe_error, panic_message, LogLevel};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Reconnects closer together than this are reported as churn.
const RAPID_RECONNECT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture window is empty (start time equals end time)")]
    EmptyWindow,
    #[error("Could not connect after {attempts} attempts")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: StreamError,
    },
    #[error("Reconnect failed after {attempts} attempts")]
    ReconnectFailed {
        attempts: u32,
        #[source]
        source: StreamError,
    },
    #[error("Session reconnect limit of {0} reached")]
    ReconnectLimit(u32),
    #[error("Frame capture failed")]
    Stream(#[from] StreamError),
    #[error("Snapshot could not be processed")]
    Frame(#[from] FrameError),
    #[error("Failed to write snapshot")]
    Io(#[from] std::io::Error),
    #[error("Failed to spawn capture thread")]
    ThreadSpawn(#[source] std::io::Error),
    #[error("Capture loop panicked: {0}")]
    Panicked(String),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Error = 4,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Error,
            _ => Self::Stopped,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting...",
            Self::Running => "Running",
            Self::Stopping => "Stopping...",
            Self::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frame_count: u64,
    pub failed_frame_count: u64,
    pub uptime_seconds: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub disconnect_count: u32,
    pub last_disconnect_time: Option<NaiveDateTime>,
    pub connection_start_time: Option<NaiveDateTime>,
}

/// How a session captures, independent of when it runs.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub output_root: PathBuf,
    pub interval: Duration,
    /// JPEG quality of the written snapshots, 1-100.
    pub jpeg_quality: u8,
    /// Connection attempts when a session starts.
    pub max_retries: u32,
    /// Reconnect before the camera drops a connection of this age. `None` disables it.
    pub proactive_reconnect: Option<Duration>,
    /// Extra frames read and thrown away before each snapshot.
    pub flush_frames: u32,
    pub retry_backoff: Duration,
    /// Connection attempts per reconnect.
    pub reconnect_retries: u32,
    /// How long a fresh connection gets to deliver its first frame.
    pub open_timeout: Duration,
    pub read_timeout: Duration,
    /// Failure-driven reconnects allowed per session. `None` is unlimited.
    pub max_session_reconnects: Option<u32>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("snapshots"),
            interval: Duration::from_secs(30),
            jpeg_quality: 95,
            max_retries: 3,
            proactive_reconnect: Some(Duration::from_secs(300)),
            flush_frames: 0,
            retry_backoff: Duration::from_secs(2),
            reconnect_retries: 3,
            open_timeout: Duration::from_secs(10),
            read_timeout: READ_TIMEOUT,
            max_session_reconnects: None,
        }
    }
}

/// When one session may capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub window: ScheduleWindow,
    pub label: Option<String>,
}

impl SessionSpec {
    pub fn new(window: ScheduleWindow) -> Self {
        Self {
            window,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Receives engine events. Called from the capture thread; implementations must not block for
/// long.
pub trait CaptureObserver: Send + Sync {
    fn on_status(&self, _state: CaptureState, _stats: &CaptureStats) {}

    fn on_frame(&self, _frame: &DecodedFrame) {}

    fn on_log(&self, _level: LogLevel, _message: &str) {}
}

impl CaptureObserver for () {}

/// Timelapse capture over one camera, one session at a time.
pub struct CaptureEngine {
    source: Arc<dyn StreamSource>,
    settings: CaptureSettings,
    observer: Arc<dyn CaptureObserver>,
    shared: Arc<Shared>,
    session: Mutex<Option<(StopSignal, JoinHandle<()>)>>,
}

struct Shared {
    state: AtomicU8,
    failed: AtomicBool,
    stats: Mutex<StatsCell>,
    health: Mutex<ConnectionHealth>,
}

#[derive(Default)]
struct StatsCell {
    stats: CaptureStats,
    started: Option<Instant>,
}

impl Shared {
    fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: CaptureState, to: CaptureState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stats(&self) -> CaptureStats {
        let cell = self.stats.lock();
        let mut stats = cell.stats.clone();
        stats.uptime_seconds = cell.started.map_or(0, |started| started.elapsed().as_secs());
        stats
    }
}

impl CaptureEngine {
    pub fn new(source: Arc<dyn StreamSource>, settings: CaptureSettings) -> Self {
        Self {
            source,
            settings,
            observer: Arc::new(()),
            shared: Arc::new(Shared {
                state: AtomicU8::new(CaptureState::Stopped as u8),
                failed: AtomicBool::new(false),
                stats: Mutex::new(StatsCell::default()),
                health: Mutex::new(ConnectionHealth::default()),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn CaptureObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Starts a session in the background.
    ///
    /// Returns false without doing anything unless the engine is stopped.
    pub fn start_capture(&self, spec: SessionSpec) -> bool {
        if !self
            .shared
            .transition(CaptureState::Stopped, CaptureState::Starting)
        {
            return false;
        }

        *self.shared.stats.lock() = StatsCell {
            stats: CaptureStats::default(),
            started: Some(Instant::now()),
        };
        *self.shared.health.lock() = ConnectionHealth::default();
        self.shared.failed.store(false, Ordering::Release);

        let stop = StopSignal::new();
        let mut session = Session {
            source: self.source.clone(),
            settings: self.settings.clone(),
            observer: self.observer.clone(),
            shared: self.shared.clone(),
            stop: stop.clone(),
            spec,
            reader: None,
            connected_at: Instant::now(),
            started: Instant::now(),
            last_disconnect: None,
            failure_reconnects: 0,
        };

        let spawned = std::thread::Builder::new()
            .name("capture-loop".into())
            .spawn(move || session.run_to_completion());

        match spawned {
            Ok(handle) => {
                *self.session.lock() = Some((stop, handle));
                true
            }
            Err(err) => {
                let err = CaptureError::ThreadSpawn(err);
                self.shared.stats.lock().stats.last_error = Some(describe_error(&err));
                self.shared.set_state(CaptureState::Stopped);
                LogLevel::Error.trace(&describe_error(&err));
                self.observer.on_log(LogLevel::Error, &describe_error(&err));
                false
            }
        }
    }

    /// Asks the running session to end and waits up to 5s for it to finish.
    pub fn stop_capture(&self) {
        let Some((stop, handle)) = self.session.lock().take() else {
            return;
        };

        let stopping = self
            .shared
            .transition(CaptureState::Starting, CaptureState::Stopping)
            || self
                .shared
                .transition(CaptureState::Running, CaptureState::Stopping);
        if stopping {
            self.observer
                .on_status(CaptureState::Stopping, &self.shared.stats());
        }

        stop.trigger();

        if !join_within(handle, STOP_JOIN_TIMEOUT) {
            warn!(
                "Capture loop did not stop within {:?}; leaving it detached",
                STOP_JOIN_TIMEOUT
            );
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() != CaptureState::Stopped
    }

    pub fn stats(&self) -> CaptureStats {
        self.shared.stats()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.shared.health.lock().clone()
    }

    /// Whether the most recent session went through the Error state.
    pub fn last_session_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Connects, grabs and decodes one frame, then disconnects.
    pub fn test_connection(&self) -> Result<String, CaptureError> {
        let reader = StreamReader::connect(self.source.as_ref(), self.settings.open_timeout)?
            .with_read_timeout(self.settings.read_timeout);
        let frame = reader.read()?;
        reader.release();

        let decoded = DecodedFrame::decode(&frame.jpeg)?;
        Ok(format!(
            "Connected successfully! Frame size: {}x{}",
            decoded.width, decoded.height
        ))
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop_capture();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectReason {
    Scheduled,
    Failure,
}

/// Everything the capture thread owns for one session.
struct Session {
    source: Arc<dyn StreamSource>,
    settings: CaptureSettings,
    observer: Arc<dyn CaptureObserver>,
    shared: Arc<Shared>,
    stop: StopSignal,
    spec: SessionSpec,
    reader: Option<StreamReader>,
    connected_at: Instant,
    started: Instant,
    last_disconnect: Option<Instant>,
    failure_reconnects: u32,
}

impl Session {
    fn run_to_completion(&mut self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run()));

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(CaptureError::Panicked(panic_message(payload.as_ref()))),
        };

        if let Some(err) = failure {
            let message = describe_error(&err);
            self.shared.stats.lock().stats.last_error = Some(message.clone());
            self.log(LogLevel::Error, &format!("Capture stopped: {message}"));
            self.shared.failed.store(true, Ordering::Release);
            self.set_state(CaptureState::Error);
        }

        self.log_connection_summary();

        if let Some(reader) = self.reader.take() {
            reader.release();
        }

        self.set_state(CaptureState::Stopped);
    }

    fn run(&mut self) -> Result<(), CaptureError> {
        self.notify_status();

        let window = self.spec.window;
        if window.is_empty() {
            return Err(CaptureError::EmptyWindow);
        }

        if let Some(label) = &self.spec.label {
            self.log(LogLevel::Info, &format!("Starting capture session {label}"));
        }

        if let Some(wait) = window.time_until_start(Local::now().naive_local()) {
            self.log(
                LogLevel::Info,
                &format!(
                    "Waiting {} until the capture window opens at {}",
                    format_wait(wait),
                    window.start.format("%H:%M")
                ),
            );
            if self.stop.wait_timeout(wait.to_std().unwrap_or_default()) {
                self.log(LogLevel::Info, "Capture cancelled before the window opened");
                return Ok(());
            }
        }

        self.log(
            LogLevel::Info,
            &format!("Connecting to {}", self.source.describe()),
        );
        let attempts = self.settings.max_retries.max(1);
        match self.open_with_retries(attempts) {
            Ok(Some(reader)) => self.attach(reader),
            Ok(None) => return Ok(()),
            Err(source) => return Err(CaptureError::ConnectFailed { attempts, source }),
        }

        if !self
            .shared
            .transition(CaptureState::Starting, CaptureState::Running)
        {
            return Ok(());
        }
        self.notify_status();

        let end = window.session_end(Local::now().naive_local());
        self.log(
            LogLevel::Info,
            &format!("Capturing every {:?} until {}", self.settings.interval, end),
        );

        loop {
            if self.stop.is_triggered() {
                break;
            }
            if Local::now().naive_local() >= end {
                self.log(LogLevel::Info, "Capture window ended");
                break;
            }

            let cycle = Instant::now();

            if self.proactive_reconnect_due() {
                self.reconnect(ReconnectReason::Scheduled)?;
            } else if let Err(err) = self.capture_frame() {
                self.record_failure(&err);
                self.reconnect(ReconnectReason::Failure)?;
                continue;
            }

            let until_end = (end - Local::now().naive_local())
                .to_std()
                .unwrap_or_default();
            let pause = self
                .settings
                .interval
                .saturating_sub(cycle.elapsed())
                .min(until_end);
            if self.stop.wait_timeout(pause) {
                break;
            }
        }

        Ok(())
    }

    fn capture_frame(&mut self) -> Result<(), CaptureError> {
        let reader = self.reader.as_ref().ok_or(StreamError::NotOpen)?;

        for _ in 0..self.settings.flush_frames {
            if reader.read().is_err() {
                break;
            }
        }
        let frame = reader.read()?;
        let decoded = DecodedFrame::decode(&frame.jpeg)?;

        let folder = self
            .settings
            .output_root
            .join(date_key(self.spec.window.bucket_date(frame.received_at)));
        std::fs::create_dir_all(&folder)?;
        decoded.write_jpeg(
            &folder.join(snapshot_file_name(frame.received_at)),
            self.settings.jpeg_quality,
        )?;

        self.shared.stats.lock().stats.frame_count += 1;
        self.observer.on_frame(&decoded);
        self.notify_status();

        Ok(())
    }

    fn record_failure(&self, err: &CaptureError) {
        let message = describe_error(err);
        {
            let mut cell = self.shared.stats.lock();
            cell.stats.failed_frame_count += 1;
            cell.stats.last_error = Some(message.clone());
        }
        self.log(LogLevel::Warning, &format!("Capture failed: {message}"));
        self.notify_status();
    }

    fn proactive_reconnect_due(&self) -> bool {
        self.settings
            .proactive_reconnect
            .is_some_and(|max_age| self.connected_at.elapsed() >= max_age)
    }

    /// Drops the current connection and opens a new one.
    ///
    /// Returns `Ok` without a connection if the session was stopped meanwhile.
    fn reconnect(&mut self, reason: ReconnectReason) -> Result<(), CaptureError> {
        match reason {
            ReconnectReason::Scheduled => self.log(
                LogLevel::Info,
                &format!(
                    "Scheduled reconnect after {}s connected",
                    self.connected_at.elapsed().as_secs()
                ),
            ),
            ReconnectReason::Failure => {
                self.failure_reconnects += 1;
                if let Some(limit) = self.settings.max_session_reconnects {
                    if self.failure_reconnects > limit {
                        return Err(CaptureError::ReconnectLimit(limit));
                    }
                }
                self.log(LogLevel::Warning, "Connection lost, reconnecting...");
            }
        }

        let now = Instant::now();
        {
            let mut health = self.shared.health.lock();
            health.disconnect_count += 1;
            health.last_disconnect_time = Some(Local::now().naive_local());
        }
        if let Some(previous) = self.last_disconnect {
            let since = now.duration_since(previous);
            if since < RAPID_RECONNECT {
                self.log(
                    LogLevel::Warning,
                    &format!(
                        "Rapid reconnect: only {}s since the previous disconnect",
                        since.as_secs()
                    ),
                );
            }
        }
        self.last_disconnect = Some(now);

        if let Some(reader) = self.reader.take() {
            reader.release();
        }

        let attempts = self.settings.reconnect_retries.max(1);
        match self.open_with_retries(attempts) {
            Ok(Some(reader)) => {
                self.attach(reader);
                self.log(LogLevel::Info, "Reconnected");
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(source) => Err(CaptureError::ReconnectFailed { attempts, source }),
        }
    }

    /// `Ok(None)` means the session was stopped between attempts.
    fn open_with_retries(&self, attempts: u32) -> Result<Option<StreamReader>, StreamError> {
        let mut last_error = StreamError::NotOpen;

        for attempt in 1..=attempts {
            if self.stop.is_triggered() {
                return Ok(None);
            }

            self.log(
                LogLevel::Info,
                &format!("Connection attempt {attempt}/{attempts}..."),
            );
            match StreamReader::connect(self.source.as_ref(), self.settings.open_timeout) {
                Ok(reader) => return Ok(Some(reader.with_read_timeout(self.settings.read_timeout))),
                Err(err) => {
                    self.log(
                        LogLevel::Warning,
                        &format!(
                            "Connection attempt {attempt}/{attempts} failed: {}",
                            describe_error(&err)
                        ),
                    );
                    last_error = err;
                }
            }

            if attempt < attempts && self.stop.wait_timeout(self.settings.retry_backoff) {
                return Ok(None);
            }
        }

        Err(last_error)
    }

    fn attach(&mut self, reader: StreamReader) {
        self.reader = Some(reader);
        self.connected_at = Instant::now();
        self.shared.health.lock().connection_start_time = Some(Local::now().naive_local());
    }

    fn log_connection_summary(&self) {
        let disconnects = self.shared.health.lock().disconnect_count;
        let average = self.started.elapsed().as_secs() / (u64::from(disconnects) + 1);
        self.log(
            LogLevel::Info,
            &format!(
                "Connection summary: {disconnects} disconnects, avg uptime {average}s between disconnects"
            ),
        );
    }

    fn set_state(&self, state: CaptureState) {
        self.shared.set_state(state);
        self.notify_status();
    }

    fn notify_status(&self) {
        self.observer
            .on_status(self.shared.state(), &self.shared.stats());
    }

    fn log(&self, level: LogLevel, message: &str) {
        level.trace(message);
        self.observer.on_log(level, message);
    }
}

fn format_wait(wait: chrono::Duration) -> String {
    let minutes = wait.num_minutes();
    if minutes >= 60 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{}s", wait.num_seconds().max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakeSource, RecordingObserver};
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn fast_settings(output_root: PathBuf) -> CaptureSettings {
        CaptureSettings {
            output_root,
            interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(10),
            open_timeout: Duration::from_millis(500),
            read_timeout: Duration::from_millis(500),
            proactive_reconnect: None,
            ..CaptureSettings::default()
        }
    }

    /// A window that is open right now.
    fn open_window() -> SessionSpec {
        let now = Local::now().naive_local().time();
        SessionSpec::new(ScheduleWindow::new(
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
            0,
        ))
    }

    fn engine(source: Arc<FakeSource>, settings: CaptureSettings) -> (CaptureEngine, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        let engine = CaptureEngine::new(source, settings).with_observer(observer.clone());
        (engine, observer)
    }

    fn wait_stopped(engine: &CaptureEngine) -> bool {
        wait_until(Duration::from_secs(5), || engine.state() == CaptureState::Stopped)
    }

    #[test]
    fn captures_snapshots_into_date_folders() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)));
        let (engine, observer) = engine(source, fast_settings(output.path().to_path_buf()));

        assert!(engine.start_capture(open_window()));
        assert!(wait_until(Duration::from_secs(5), || engine.stats().frame_count >= 3));
        assert_eq!(engine.state(), CaptureState::Running);

        engine.stop_capture();
        assert_eq!(engine.state(), CaptureState::Stopped);
        assert_eq!(engine.stats().failed_frame_count, 0);
        assert!(!engine.last_session_failed());
        assert!(observer.frames() >= 3);
        let states = observer.states();
        assert_eq!(&states[..2], &[CaptureState::Starting, CaptureState::Running]);
        assert!(states.contains(&CaptureState::Stopping));
        assert_eq!(states.last(), Some(&CaptureState::Stopped));

        let snapshots: Vec<_> = std::fs::read_dir(output.path())
            .unwrap()
            .flat_map(|folder| {
                let folder = folder.unwrap().path();
                assert!(crate::window::parse_date_key(
                    folder.file_name().unwrap().to_str().unwrap()
                )
                .is_some());
                std::fs::read_dir(folder).unwrap()
            })
            .map(|file| file.unwrap().path())
            .collect();
        assert!(!snapshots.is_empty());
        assert!(snapshots
            .iter()
            .all(|path| path.extension().is_some_and(|ext| ext == "jpg")));
    }

    #[test]
    fn flushing_stale_frames_still_captures() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)));
        let settings = CaptureSettings {
            flush_frames: 3,
            ..fast_settings(output.path().to_path_buf())
        };
        let (engine, observer) = engine(source.clone(), settings);

        assert!(engine.start_capture(open_window()));
        assert!(wait_until(Duration::from_secs(5), || engine.stats().frame_count >= 3));
        engine.stop_capture();

        let stats = engine.stats();
        assert_eq!(stats.failed_frame_count, 0);
        assert_eq!(source.opens(), 1);
        assert!(observer.frames() >= 3);
        let written = std::fs::read_dir(output.path())
            .unwrap()
            .map(|folder| std::fs::read_dir(folder.unwrap().path()).unwrap().count())
            .sum::<usize>();
        assert!(written >= 1);
    }

    #[test]
    fn start_is_rejected_unless_stopped() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)));
        let (engine, _) = engine(source, fast_settings(output.path().to_path_buf()));

        assert!(engine.start_capture(open_window()));
        assert!(!engine.start_capture(open_window()));

        engine.stop_capture();
        assert!(engine.start_capture(open_window()));
        engine.stop_capture();
    }

    #[test]
    fn exhausted_connect_retries_end_in_error() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::unreachable());
        let (engine, observer) = engine(source.clone(), fast_settings(output.path().to_path_buf()));

        assert!(engine.start_capture(open_window()));
        assert!(wait_stopped(&engine));

        assert_eq!(source.opens(), 3);
        assert!(engine.last_session_failed());
        assert!(observer.states().contains(&CaptureState::Error));
        assert_eq!(observer.states().last(), Some(&CaptureState::Stopped));
        assert!(observer.logged(LogLevel::Info, "Connection attempt 3/3..."));
        assert!(engine
            .stats()
            .last_error
            .is_some_and(|e| e.contains("Could not connect after 3 attempts")));
    }

    #[test]
    fn proactive_reconnect_skips_capture_without_counting_failures() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)));
        let settings = CaptureSettings {
            proactive_reconnect: Some(Duration::from_millis(100)),
            ..fast_settings(output.path().to_path_buf())
        };
        let (engine, observer) = engine(source.clone(), settings);

        assert!(engine.start_capture(open_window()));
        assert!(wait_until(Duration::from_secs(5), || source.opens() >= 3));
        engine.stop_capture();

        let stats = engine.stats();
        assert_eq!(stats.failed_frame_count, 0);
        assert!(stats.frame_count > 0);
        assert!(engine.health().disconnect_count >= 2);
        assert!(observer.logged(LogLevel::Info, "Scheduled reconnect"));
    }

    #[test]
    fn lost_connection_is_reconnected() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)).ending_after(2));
        let (engine, observer) = engine(source.clone(), fast_settings(output.path().to_path_buf()));

        assert!(engine.start_capture(open_window()));
        assert!(wait_until(Duration::from_secs(5), || source.opens() >= 3));
        engine.stop_capture();

        assert!(engine.stats().failed_frame_count >= 1);
        assert!(engine.health().disconnect_count >= 1);
        assert!(observer.logged(LogLevel::Warning, "Connection lost, reconnecting..."));
        assert!(observer.logged(LogLevel::Warning, "Rapid reconnect"));
    }

    #[test]
    fn failed_reconnect_uses_its_own_retry_budget() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(
            FakeSource::live(Duration::from_millis(5))
                .ending_after(1)
                .failing_after(1),
        );
        let settings = CaptureSettings {
            max_retries: 5,
            ..fast_settings(output.path().to_path_buf())
        };
        let (engine, observer) = engine(source.clone(), settings);

        assert!(engine.start_capture(open_window()));
        assert!(wait_stopped(&engine));

        assert_eq!(source.opens(), 1 + 3);
        assert!(observer.states().contains(&CaptureState::Error));
        assert!(engine
            .stats()
            .last_error
            .is_some_and(|e| e.contains("Reconnect failed after 3 attempts")));
    }

    #[test]
    fn session_reconnect_ceiling_is_fatal() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)).ending_after(1));
        let settings = CaptureSettings {
            max_session_reconnects: Some(2),
            ..fast_settings(output.path().to_path_buf())
        };
        let (engine, observer) = engine(source.clone(), settings);

        assert!(engine.start_capture(open_window()));
        assert!(wait_stopped(&engine));

        assert_eq!(source.opens(), 3);
        assert!(observer.states().contains(&CaptureState::Error));
        assert!(engine
            .stats()
            .last_error
            .is_some_and(|e| e.contains("reconnect limit of 2")));
    }

    #[test]
    fn stop_interrupts_the_wait_for_the_window() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)));
        let (engine, observer) = engine(source.clone(), fast_settings(output.path().to_path_buf()));

        let now = Local::now().naive_local().time();
        let later = ScheduleWindow::new(
            now + ChronoDuration::hours(2),
            now + ChronoDuration::hours(3),
            12,
        );
        assert!(engine.start_capture(SessionSpec::new(later)));
        assert!(wait_until(Duration::from_secs(2), || {
            observer.logged(LogLevel::Info, "until the capture window opens")
        }));

        let started = Instant::now();
        engine.stop_capture();
        assert!(started.elapsed() < STOP_JOIN_TIMEOUT);
        assert_eq!(engine.state(), CaptureState::Stopped);
        assert_eq!(source.opens(), 0);
    }

    #[test]
    fn empty_window_is_an_error() {
        let output = TempDir::new().unwrap();
        let source = Arc::new(FakeSource::live(Duration::from_millis(5)));
        let (engine, observer) = engine(source.clone(), fast_settings(output.path().to_path_buf()));

        let at_six = crate::window::parse_hhmm("06:00").unwrap();
        assert!(engine.start_capture(SessionSpec::new(ScheduleWindow::new(at_six, at_six, 12))));
        assert!(wait_stopped(&engine));

        assert!(observer.states().contains(&CaptureState::Error));
        assert_eq!(source.opens(), 0);
    }

    #[test]
    fn connection_test_reports_frame_size() {
        let output = TempDir::new().unwrap();
        let (live, _) = engine(
            Arc::new(FakeSource::live(Duration::from_millis(5))),
            fast_settings(output.path().to_path_buf()),
        );
        assert_eq!(
            live.test_connection().unwrap(),
            "Connected successfully! Frame size: 8x8"
        );

        let (dead, _) = engine(
            Arc::new(FakeSource::unreachable()),
            fast_settings(output.path().to_path_buf()),
        );
        assert!(dead.test_connection().is_err());
    }

    #[test]
    fn waits_are_formatted_compactly() {
        assert_eq!(format_wait(ChronoDuration::minutes(135)), "2h 15m");
        assert_eq!(format_wait(ChronoDuration::minutes(5)), "5m");
        assert_eq!(format_wait(ChronoDuration::seconds(42)), "42s");
    }
}
