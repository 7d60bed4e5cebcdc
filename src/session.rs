use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::AstroScheduleConfig;
use crate::engine::{CaptureEngine, SessionSpec};
use crate::export::{
    encoder_for, ExportError, ExportOutcome, ExportProgress, ExportSettings, ImageCollection,
};
use crate::history::{HistoryError, HistoryStore};
use crate::scheduler::{SessionController, SessionPlan};
use crate::window::{parse_date_key, ScheduleWindow};
use crate::describe_error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("`{0}` is not a YYYYMMDD date")]
    InvalidDateKey(String),
    #[error("Failed to update session history")]
    History(#[from] HistoryError),
    #[error("Video export failed")]
    Export(#[from] ExportError),
    #[error("Failed to remove snapshots")]
    Io(#[from] std::io::Error),
    #[error("Failed to spawn post-processing thread")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Exports the snapshots of `date_key` under `output_root` to a video next to them.
pub fn export_session(
    output_root: &Path,
    date_key: &str,
    settings: &ExportSettings,
    ffmpeg_path: &Path,
    progress: &mut dyn FnMut(ExportProgress),
) -> Result<ExportOutcome, ExportError> {
    let images = ImageCollection::scan(&output_root.join(date_key))?;
    let output = output_root.join(settings.output_file_name(date_key));

    info!(
        "Exporting {} snapshots ({}) to {}",
        images.len(),
        images.duration_label().unwrap_or_else(|| "unknown span".into()),
        output.display()
    );
    encoder_for(settings, ffmpeg_path).export(&images, &output, settings, progress)
}

/// Owns the capture engine on behalf of the scheduler and handles what happens after a session.
pub struct SessionRunner {
    engine: Arc<CaptureEngine>,
    folder_rollover_hour: u32,
    astro: Arc<RwLock<AstroScheduleConfig>>,
    history: Arc<Mutex<HistoryStore>>,
    export: ExportSettings,
    ffmpeg_path: PathBuf,
    current: Mutex<Option<SessionPlan>>,
    post_processing: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRunner {
    pub fn new(
        engine: Arc<CaptureEngine>,
        folder_rollover_hour: u32,
        astro: Arc<RwLock<AstroScheduleConfig>>,
        history: Arc<Mutex<HistoryStore>>,
    ) -> Self {
        Self {
            engine,
            folder_rollover_hour,
            astro,
            history,
            export: ExportSettings::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            current: Mutex::new(None),
            post_processing: Mutex::new(Vec::new()),
        }
    }

    pub fn with_export(mut self, export: ExportSettings, ffmpeg_path: impl Into<PathBuf>) -> Self {
        self.export = export;
        self.ffmpeg_path = ffmpeg_path.into();
        self
    }

    pub fn engine(&self) -> &Arc<CaptureEngine> {
        &self.engine
    }

    /// Blocks until every background export has finished.
    pub fn wait_for_post_processing(&self) {
        let handles: Vec<_> = self.post_processing.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn finish_session(&self, date_key: &str) -> Result<(), SessionError> {
        let date = parse_date_key(date_key)
            .ok_or_else(|| SessionError::InvalidDateKey(date_key.to_string()))?;
        let plan = self.current.lock().take();

        let output_root = self.engine.settings().output_root.clone();
        let image_count = match ImageCollection::scan(&output_root.join(date_key)) {
            Ok(images) => images.len() as u64,
            Err(_) => 0,
        };

        let now = Local::now().naive_local();
        let record = self.history.lock().record_session(
            date,
            plan.as_ref().map_or(now, |plan| plan.start),
            now,
            image_count,
            self.engine.last_session_failed(),
        )?;
        info!(
            "Session {} finished with {} images ({:?})",
            record.date, record.image_count, record.status
        );

        let (auto_create_video, delete_snapshots) = {
            let astro = self.astro.read();
            (astro.auto_create_video, astro.delete_snapshots_after_video)
        };
        if !auto_create_video || image_count == 0 {
            return Ok(());
        }

        let job = ExportJob {
            output_root,
            date_key: date_key.to_string(),
            settings: self.export.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
            history: self.history.clone(),
            delete_snapshots,
        };
        let handle = std::thread::Builder::new()
            .name("session-export".into())
            .spawn(move || job.run())
            .map_err(SessionError::ThreadSpawn)?;
        let mut post_processing = self.post_processing.lock();
        post_processing.retain(|handle| !handle.is_finished());
        post_processing.push(handle);

        Ok(())
    }
}

impl SessionController for SessionRunner {
    fn start_capture(&self, plan: &SessionPlan) {
        let window = ScheduleWindow::new(
            plan.start.time(),
            plan.end.time(),
            self.folder_rollover_hour,
        );
        let spec = SessionSpec::new(window).with_label(plan.date_key.clone());

        if self.engine.start_capture(spec) {
            *self.current.lock() = Some(plan.clone());
        } else {
            warn!(
                "Capture for {} not started: a session is already running",
                plan.date_key
            );
        }
    }

    fn stop_capture(&self) {
        self.engine.stop_capture();
    }

    fn session_complete(&self, date_key: &str) {
        if let Err(err) = self.finish_session(date_key) {
            error!("Post-processing for {} failed: {}", date_key, describe_error(&err));
        }
    }
}

impl Drop for SessionRunner {
    fn drop(&mut self) {
        self.wait_for_post_processing();
    }
}

struct ExportJob {
    output_root: PathBuf,
    date_key: String,
    settings: ExportSettings,
    ffmpeg_path: PathBuf,
    history: Arc<Mutex<HistoryStore>>,
    delete_snapshots: bool,
}

impl ExportJob {
    fn run(self) {
        let date_key = self.date_key.clone();
        match self.export() {
            Ok(outcome) => info!("{}", outcome.message),
            Err(err) => error!("Video for {} failed: {}", date_key, describe_error(&err)),
        }
    }

    fn export(self) -> Result<ExportOutcome, SessionError> {
        let mut last_logged = -10.0;
        let outcome = export_session(
            &self.output_root,
            &self.date_key,
            &self.settings,
            &self.ffmpeg_path,
            &mut |progress| {
                if progress.percent - last_logged >= 10.0 {
                    last_logged = progress.percent;
                    info!("{} ({:.0}%)", progress.status, progress.percent);
                }
            },
        )?;

        if let Some(date) = parse_date_key(&self.date_key) {
            self.history.lock().mark_video_created(date)?;
        }

        if self.delete_snapshots {
            let folder = self.output_root.join(&self.date_key);
            std::fs::remove_dir_all(&folder)?;
            info!("Removed snapshots in {}", folder.display());
        }

        Ok(outcome)
    }
}
