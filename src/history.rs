use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::window::{date_key, parse_date_key};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to write history file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize history")]
    Json(#[from] serde_json::Error),
    #[error("No session recorded for {0}")]
    UnknownSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Partial,
    Failed,
}

impl SessionStatus {
    /// `completed` when images were taken and the session ended cleanly, `partial` when images
    /// were taken before a fatal error, `failed` when nothing was captured.
    pub fn classify(image_count: u64, ended_in_error: bool) -> Self {
        match (image_count, ended_in_error) {
            (0, _) => Self::Failed,
            (_, true) => Self::Partial,
            (_, false) => Self::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// `YYYYMMDD`
    pub date: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub image_count: u64,
    pub video_created: bool,
    pub status: SessionStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    sessions: Vec<SessionRecord>,
}

/// Past capture sessions, one per date, kept in a JSON file.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    sessions: BTreeMap<String, SessionRecord>,
}

impl HistoryStore {
    /// Loads the store at `path`. A missing file is an empty history; an unreadable one is
    /// reported and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sessions = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<HistoryFile>(&text) {
                Ok(file) => file
                    .sessions
                    .into_iter()
                    .map(|record| (record.date.clone(), record))
                    .collect(),
                Err(err) => {
                    warn!("Ignoring corrupt history file {}: {}", path.display(), err);
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("Could not read history file {}: {}", path.display(), err);
                BTreeMap::new()
            }
        };

        Self { path, sessions }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds or replaces the record for its date.
    pub fn add(&mut self, record: SessionRecord) -> Result<(), HistoryError> {
        self.sessions.insert(record.date.clone(), record);
        self.save()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&SessionRecord> {
        self.sessions.get(&date_key(date))
    }

    pub fn has_capture(&self, date: NaiveDate) -> bool {
        self.get(date).is_some_and(|record| record.image_count > 0)
    }

    /// Dates with at least one image, oldest first.
    pub fn captured_dates(&self) -> Vec<NaiveDate> {
        self.sessions
            .values()
            .filter(|record| record.image_count > 0)
            .filter_map(|record| parse_date_key(&record.date))
            .collect()
    }

    pub fn mark_video_created(&mut self, date: NaiveDate) -> Result<(), HistoryError> {
        let key = date_key(date);
        let record = self
            .sessions
            .get_mut(&key)
            .ok_or(HistoryError::UnknownSession(key))?;
        record.video_created = true;
        self.save()
    }

    /// Records a finished session and returns the stored record.
    pub fn record_session(
        &mut self,
        date: NaiveDate,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        image_count: u64,
        ended_in_error: bool,
    ) -> Result<SessionRecord, HistoryError> {
        let record = SessionRecord {
            date: date_key(date),
            start_time,
            end_time,
            image_count,
            video_created: false,
            status: SessionStatus::classify(image_count, ended_in_error),
        };
        self.add(record.clone())?;
        Ok(record)
    }

    fn save(&self) -> Result<(), HistoryError> {
        let io_error = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };

        let file = HistoryFile {
            sessions: self.sessions.values().cloned().collect(),
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?).map_err(io_error)
    }
}
