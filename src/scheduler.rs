use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AstroScheduleConfig;
use crate::darkness::{compute_window_on, evening_date_for, DarknessWindow, WallClock};
use crate::signal::{join_within, StopSignal};
use crate::window::{date_key, WindowError};
use crate::{describe_error, panic_message, LogLevel};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid manual schedule")]
    Window(#[from] WindowError),
    #[error("Failed to spawn scheduler thread")]
    ThreadSpawn(#[source] std::io::Error),
}

/// One session the scheduler wants running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPlan {
    /// `YYYYMMDD` of the evening the session belongs to.
    pub date_key: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

/// Whatever owns the capture engine. The scheduler only ever talks to it through this trait.
pub trait SessionController: Send + Sync {
    fn start_capture(&self, plan: &SessionPlan);

    fn stop_capture(&self);

    /// The session for `date_key` has ended and its snapshots can be post-processed.
    fn session_complete(&self, date_key: &str);

    fn log(&self, _level: LogLevel, _message: &str) {}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStatus {
    pub running: bool,
    pub capture_active: bool,
    pub session_date: Option<String>,
    pub darkness_window: Option<DarknessWindow>,
}

/// Polls the astro schedule and starts or stops capture sessions.
pub struct Scheduler {
    inner: Arc<Inner>,
    check_interval: Duration,
    worker: Mutex<Option<(StopSignal, JoinHandle<()>)>>,
}

struct Inner {
    config: Arc<RwLock<AstroScheduleConfig>>,
    controller: Arc<dyn SessionController>,
    clock: WallClock,
    tracking: Mutex<Tracking>,
}

#[derive(Default)]
struct Tracking {
    active: bool,
    session_date: Option<String>,
    window: Option<DarknessWindow>,
}

/// What the current tick decided about the window.
enum Verdict {
    /// Inside the window; the plan says which session this is.
    Inside(SessionPlan),
    Outside,
    /// Nothing can be decided this tick.
    Skip,
}

impl Scheduler {
    pub fn new(
        config: Arc<RwLock<AstroScheduleConfig>>,
        controller: Arc<dyn SessionController>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                controller,
                clock: WallClock::Local,
                tracking: Mutex::new(Tracking::default()),
            }),
            check_interval: CHECK_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Evaluates times on `clock` instead of the local wall clock.
    ///
    /// Only possible before the scheduler is started.
    pub fn with_wall_clock(mut self, clock: WallClock) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.clock = clock;
        }
        self
    }

    /// Starts polling in the background. The first check runs immediately.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let stop = StopSignal::new();
        let handle = std::thread::Builder::new()
            .name("scheduler".into())
            .spawn({
                let inner = self.inner.clone();
                let stop = stop.clone();
                let check_interval = self.check_interval;
                move || poll(inner, stop, check_interval)
            })
            .map_err(SchedulerError::ThreadSpawn)?;

        self.inner.log(LogLevel::Info, "Scheduler started");
        *worker = Some((stop, handle));
        Ok(())
    }

    /// Stops polling. A session that is running keeps running.
    pub fn stop(&self) {
        let Some((stop, handle)) = self.worker.lock().take() else {
            return;
        };

        stop.trigger();
        if !join_within(handle, STOP_JOIN_TIMEOUT) {
            warn!("Scheduler thread did not stop within {:?}", STOP_JOIN_TIMEOUT);
        }
        self.inner.log(LogLevel::Info, "Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn status(&self) -> SchedulerStatus {
        let tracking = self.inner.tracking.lock();
        SchedulerStatus {
            running: self.is_running(),
            capture_active: tracking.active,
            session_date: tracking.session_date.clone(),
            darkness_window: tracking.window.clone(),
        }
    }

    /// Darkness window of the current night, or `None` without a location or darkness.
    pub fn tonight_window(&self) -> Option<DarknessWindow> {
        let config = self.inner.config.read().clone();
        if !config.has_location() {
            return None;
        }
        let now = self.inner.clock.now();
        compute_window_on(
            self.inner.clock,
            config.latitude,
            config.longitude,
            evening_date_for(now),
            config.twilight_type,
            config.start_offset_minutes,
            config.end_offset_minutes,
        )
    }

    pub fn tick(&self) -> Result<(), SchedulerError> {
        self.inner.tick_at(self.inner.clock.now())
    }

    /// Runs one scheduling decision as if the wall clock showed `now`.
    pub fn tick_at(&self, now: NaiveDateTime) -> Result<(), SchedulerError> {
        self.inner.tick_at(now)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll(inner: Arc<Inner>, stop: StopSignal, check_interval: Duration) {
    loop {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| inner.tick_at(inner.clock.now())));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => inner.log(
                LogLevel::Error,
                &format!("Scheduler error: {}", describe_error(&err)),
            ),
            Err(payload) => inner.log(
                LogLevel::Error,
                &format!("Scheduler error: {}", panic_message(payload.as_ref())),
            ),
        }

        if stop.wait_timeout(check_interval) {
            break;
        }
    }
}

impl Inner {
    fn tick_at(&self, now: NaiveDateTime) -> Result<(), SchedulerError> {
        let config = self.config.read().clone();
        if config.scheduled_dates.is_empty() {
            return Ok(());
        }

        let active = self.tracking.lock().active;
        let today = now.date();
        let today_scheduled = config.is_scheduled(today);
        let yesterday_scheduled = today
            .pred_opt()
            .is_some_and(|yesterday| config.is_scheduled(yesterday));

        if !today_scheduled && !yesterday_scheduled {
            if active {
                self.end_session("its date is no longer scheduled");
            }
            return Ok(());
        }
        if !today_scheduled && !active {
            return Ok(());
        }

        let verdict = if config.use_manual_times {
            self.manual_verdict(&config, now)?
        } else {
            self.twilight_verdict(&config, now)
        };

        match verdict {
            Verdict::Inside(plan) if !active => {
                let scheduled = crate::window::parse_date_key(&plan.date_key)
                    .is_some_and(|date| config.is_scheduled(date));
                if scheduled {
                    self.begin_session(plan);
                } else {
                    debug!("Window for {} is open but that date is not scheduled", plan.date_key);
                }
            }
            Verdict::Outside if active => self.end_session("the capture window closed"),
            _ => {}
        }

        Ok(())
    }

    fn manual_verdict(
        &self,
        config: &AstroScheduleConfig,
        now: NaiveDateTime,
    ) -> Result<Verdict, SchedulerError> {
        let window = config.manual_window()?;
        if !window.contains(now.time()) {
            return Ok(Verdict::Outside);
        }

        // After midnight an overnight window still belongs to the previous evening
        let session_date = if window.is_overnight() && now.time() < window.end {
            previous_day(now.date())
        } else {
            now.date()
        };

        Ok(Verdict::Inside(SessionPlan {
            date_key: date_key(session_date),
            start: session_date.and_time(window.start),
            end: window.session_end(now),
        }))
    }

    fn twilight_verdict(&self, config: &AstroScheduleConfig, now: NaiveDateTime) -> Verdict {
        if !config.has_location() {
            return Verdict::Skip;
        }

        let evening = evening_date_for(now);
        let Some(window) = compute_window_on(
            self.clock,
            config.latitude,
            config.longitude,
            evening,
            config.twilight_type,
            config.start_offset_minutes,
            config.end_offset_minutes,
        ) else {
            self.tracking.lock().window = None;
            self.log(
                LogLevel::Warning,
                &format!(
                    "No {} darkness on the night of {} at {:.4}, {:.4}; skipping",
                    config.twilight_type, evening, config.latitude, config.longitude
                ),
            );
            return Verdict::Skip;
        };

        let verdict = if window.contains(now) {
            Verdict::Inside(SessionPlan {
                date_key: date_key(window.date),
                start: window.darkness_start,
                end: window.darkness_end,
            })
        } else {
            Verdict::Outside
        };
        self.tracking.lock().window = Some(window);

        verdict
    }

    fn begin_session(&self, plan: SessionPlan) {
        {
            let mut tracking = self.tracking.lock();
            tracking.active = true;
            tracking.session_date = Some(plan.date_key.clone());
        }

        self.log(
            LogLevel::Info,
            &format!(
                "Starting capture session {} ({} - {})",
                plan.date_key,
                plan.start.format("%Y-%m-%d %H:%M"),
                plan.end.format("%Y-%m-%d %H:%M")
            ),
        );
        self.controller.start_capture(&plan);
    }

    fn end_session(&self, reason: &str) {
        let session_date = self.tracking.lock().session_date.clone();
        let label = session_date.as_deref().unwrap_or("(unknown)");

        self.log(
            LogLevel::Info,
            &format!("Stopping capture session {label}: {reason}"),
        );
        self.controller.stop_capture();
        if let Some(date_key) = &session_date {
            self.controller.session_complete(date_key);
        }

        let mut tracking = self.tracking.lock();
        tracking.active = false;
        tracking.session_date = None;
        tracking.window = None;
    }

    fn log(&self, level: LogLevel, message: &str) {
        level.trace(message);
        self.controller.log(level, message);
    }
}

fn previous_day(date: NaiveDate) -> NaiveDate {
    date.pred_opt().unwrap_or(date)
}
