use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::darkness::TwilightClass;
use crate::engine::CaptureSettings;
use crate::export::ExportSettings;
use crate::source::{CameraEndpoint, Transport};
use crate::window::{parse_hhmm, ScheduleWindow, WindowError};

/// Largest shift, in minutes, allowed on either end of the darkness window.
pub const MAX_OFFSET_MINUTES: i64 = 720;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Config file is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub ip_address: String,
    pub username: String,
    pub password: String,
    pub stream_path: String,
    pub transport: Transport,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            ip_address: "192.168.0.101".into(),
            username: "admin".into(),
            password: String::new(),
            stream_path: "/stream1".into(),
            transport: Transport::Tcp,
        }
    }
}

impl std::fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraConfig")
            .field("ip_address", &self.ip_address)
            .field("username", &self.username)
            .field("password", &"****")
            .field("stream_path", &self.stream_path)
            .field("transport", &self.transport)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `HH:MM`
    pub start_time: String,
    /// `HH:MM`; earlier than `start_time` means the window runs past midnight.
    pub end_time: String,
    pub folder_rollover_hour: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_time: "22:40".into(),
            end_time: "07:00".into(),
            folder_rollover_hour: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub interval_seconds: u64,
    pub jpeg_quality: u8,
    pub output_folder: PathBuf,
    pub max_retries: u32,
    /// 0 disables proactive reconnects.
    pub proactive_reconnect_seconds: u64,
    pub flush_frames: u32,
    /// 0 is unlimited.
    pub max_session_reconnects: u32,
    pub ffmpeg_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            jpeg_quality: 95,
            output_folder: PathBuf::from("snapshots"),
            max_retries: 3,
            proactive_reconnect_seconds: 300,
            flush_frames: 0,
            max_session_reconnects: 0,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

/// Which nights to capture and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AstroScheduleConfig {
    pub latitude: f64,
    pub longitude: f64,
    pub twilight_type: TwilightClass,
    pub start_offset_minutes: i64,
    pub end_offset_minutes: i64,
    pub use_manual_times: bool,
    pub manual_start_time: String,
    pub manual_end_time: String,
    pub scheduled_dates: BTreeSet<NaiveDate>,
    pub auto_create_video: bool,
    pub delete_snapshots_after_video: bool,
}

impl Default for AstroScheduleConfig {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            twilight_type: TwilightClass::Astronomical,
            start_offset_minutes: 0,
            end_offset_minutes: 0,
            use_manual_times: false,
            manual_start_time: "22:00".into(),
            manual_end_time: "06:00".into(),
            scheduled_dates: BTreeSet::new(),
            auto_create_video: true,
            delete_snapshots_after_video: false,
        }
    }
}

impl AstroScheduleConfig {
    /// 0,0 is the "not configured" marker.
    pub fn has_location(&self) -> bool {
        self.latitude != 0.0 || self.longitude != 0.0
    }

    pub fn is_scheduled(&self, date: NaiveDate) -> bool {
        self.scheduled_dates.contains(&date)
    }

    pub fn manual_window(&self) -> Result<ScheduleWindow, WindowError> {
        ScheduleWindow::parse(&self.manual_start_time, &self.manual_end_time, 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub camera: CameraConfig,
    pub schedule: ScheduleConfig,
    pub capture: CaptureConfig,
    pub astro_schedule: AstroScheduleConfig,
    pub export: ExportSettings,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Loads `path`, falling back to the defaults when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Like [`AppConfig::load_or_default`], but also rejects settings that fail validation.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load_or_default(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(io_error)
    }

    /// Checks every setting and reports all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.camera.ip_address.trim().is_empty() {
            problems.push("Camera IP address is required".to_string());
        }
        if self.camera.username.trim().is_empty() {
            problems.push("Camera username is required".to_string());
        }

        let start = parse_hhmm(&self.schedule.start_time);
        let end = parse_hhmm(&self.schedule.end_time);
        if let Err(err) = &start {
            problems.push(format!("Schedule start: {err}"));
        }
        if let Err(err) = &end {
            problems.push(format!("Schedule end: {err}"));
        }
        if let (Ok(start), Ok(end)) = (start, end) {
            if start == end {
                problems.push("Schedule start and end times must differ".to_string());
            }
        }
        if self.schedule.folder_rollover_hour > 23 {
            problems.push("Folder rollover hour must be between 0 and 23".to_string());
        }

        let capture = &self.capture;
        if !(1..=3600).contains(&capture.interval_seconds) {
            problems.push("Capture interval must be between 1 and 3600 seconds".to_string());
        }
        if !(1..=100).contains(&capture.jpeg_quality) {
            problems.push("JPEG quality must be between 1 and 100".to_string());
        }
        if capture.output_folder.as_os_str().is_empty() {
            problems.push("Output folder is required".to_string());
        }
        if !(1..=20).contains(&capture.max_retries) {
            problems.push("Max retries must be between 1 and 20".to_string());
        }
        if capture.proactive_reconnect_seconds > 3600 {
            problems.push("Proactive reconnect must be between 0 and 3600 seconds".to_string());
        }
        if capture.flush_frames > 50 {
            problems.push("Flush frames must be between 0 and 50".to_string());
        }

        let astro = &self.astro_schedule;
        if !(-90.0..=90.0).contains(&astro.latitude) {
            problems.push("Latitude must be between -90 and 90".to_string());
        }
        if !(-180.0..=180.0).contains(&astro.longitude) {
            problems.push("Longitude must be between -180 and 180".to_string());
        }
        for (name, minutes) in [
            ("start", astro.start_offset_minutes),
            ("end", astro.end_offset_minutes),
        ] {
            if !(-MAX_OFFSET_MINUTES..=MAX_OFFSET_MINUTES).contains(&minutes) {
                problems.push(format!(
                    "Darkness {name} offset must be between -{MAX_OFFSET_MINUTES} and {MAX_OFFSET_MINUTES} minutes"
                ));
            }
        }
        if let Err(err) = parse_hhmm(&astro.manual_start_time) {
            problems.push(format!("Manual start: {err}"));
        }
        if let Err(err) = parse_hhmm(&astro.manual_end_time) {
            problems.push(format!("Manual end: {err}"));
        }

        problems.extend(self.export.problems());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn schedule_window(&self) -> Result<ScheduleWindow, WindowError> {
        ScheduleWindow::parse(
            &self.schedule.start_time,
            &self.schedule.end_time,
            self.schedule.folder_rollover_hour,
        )
    }

    pub fn camera_endpoint(&self) -> CameraEndpoint {
        CameraEndpoint {
            ip_address: self.camera.ip_address.trim().to_string(),
            username: self.camera.username.trim().to_string(),
            password: self.camera.password.clone(),
            stream_path: self.camera.stream_path.trim().to_string(),
            transport: self.camera.transport,
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        let capture = &self.capture;
        CaptureSettings {
            output_root: capture.output_folder.clone(),
            interval: Duration::from_secs(capture.interval_seconds),
            jpeg_quality: capture.jpeg_quality,
            max_retries: capture.max_retries,
            proactive_reconnect: (capture.proactive_reconnect_seconds > 0)
                .then(|| Duration::from_secs(capture.proactive_reconnect_seconds)),
            flush_frames: capture.flush_frames,
            max_session_reconnects: (capture.max_session_reconnects > 0)
                .then_some(capture.max_session_reconnects),
            ..CaptureSettings::default()
        }
    }

    /// Human-readable overview; the password is never included.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let astro = &self.astro_schedule;

        let _ = writeln!(out, "Camera:    {}", self.camera_endpoint().sanitized_url());
        let _ = writeln!(out, "Transport: {}", self.camera.transport.as_str());
        let _ = writeln!(
            out,
            "Window:    {} - {} (folders roll over at {:02}:00)",
            self.schedule.start_time, self.schedule.end_time, self.schedule.folder_rollover_hour
        );
        let _ = writeln!(
            out,
            "Capture:   every {}s, quality {}, into {}",
            self.capture.interval_seconds,
            self.capture.jpeg_quality,
            self.capture.output_folder.display()
        );
        match self.capture.proactive_reconnect_seconds {
            0 => {
                let _ = writeln!(out, "Reconnect: on failure only");
            }
            seconds => {
                let _ = writeln!(out, "Reconnect: every {seconds}s");
            }
        }
        if astro.use_manual_times {
            let _ = writeln!(
                out,
                "Nights:    manual {} - {}",
                astro.manual_start_time, astro.manual_end_time
            );
        } else {
            let _ = writeln!(
                out,
                "Nights:    {} darkness at {:.4}, {:.4} (offsets {:+}m / {:+}m)",
                astro.twilight_type,
                astro.latitude,
                astro.longitude,
                astro.start_offset_minutes,
                astro.end_offset_minutes
            );
        }
        let _ = write!(
            out,
            "Scheduled: {} date(s)",
            astro.scheduled_dates.len()
        );

        out
    }
}
