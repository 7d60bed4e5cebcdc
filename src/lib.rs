//! Unattended RTSP timelapse capture.
//!
//! A [`CaptureEngine`] pulls frames from a network camera on a fixed interval and writes them as
//! dated JPEG snapshots. A [`Scheduler`] decides when sessions run, either from fixed clock times
//! or from the darkness window computed by [`darkness`].

pub mod config;
pub mod darkness;
pub mod engine;
pub mod export;
pub mod frame;
pub mod history;
pub mod reader;
pub mod scheduler;
pub mod session;
pub mod signal;
pub mod source;
pub mod window;

#[cfg(test)]
pub(crate) mod testing;

pub use openh264;

pub use config::{AppConfig, AstroScheduleConfig, ConfigError};
pub use darkness::{DarknessWindow, TwilightClass, WallClock};
pub use engine::{
    CaptureEngine, CaptureError, CaptureObserver, CaptureSettings, CaptureState, CaptureStats,
    ConnectionHealth, SessionSpec,
};
pub use export::{ExportError, ExportOutcome, ExportProgress, ExportSettings, VideoEncoder};
pub use frame::{DecodedFrame, Frame, FrameError};
pub use history::{HistoryStore, SessionRecord, SessionStatus};
pub use reader::StreamReader;
pub use scheduler::{Scheduler, SchedulerError, SchedulerStatus, SessionController, SessionPlan};
pub use session::SessionRunner;
pub use signal::StopSignal;
pub use source::{CameraEndpoint, FfmpegSource, StreamError, StreamSource, Transport};
pub use window::ScheduleWindow;

use std::any::Any;
use std::error::Error;
use std::fmt;
use tracing::{error, info, warn};

/// Severity of an operator-facing log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        }
    }

    /// Emits `message` as a tracing event at this level.
    pub(crate) fn trace(&self, message: &str) {
        match self {
            Self::Info => info!("{}", message),
            Self::Warning => warn!("{}", message),
            Self::Error => error!("{}", message),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `error: cause: cause` for the whole source chain.
pub(crate) fn describe_error(err: &dyn Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
