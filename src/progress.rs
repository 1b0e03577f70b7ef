// =============================================================================
// progress.rs - REMEMBERING WHERE WE STOPPED
// =============================================================================
//
// Each tribunal has one checkpoint file, `progress_{slug}.json`. Only the
// coordinator writes it; workers report finished pages over a channel and the
// coordinator's PageTracker decides how far the checkpoint may advance.
//
// Pages finish out of order. The checkpoint only ever moves to the highest
// page below which *every* page is done, so resuming from
// `last_completed_page + 1` can never skip a page that was still in flight
// when the process died.
//
// Writes go to a temp file first and are renamed into place.
// =============================================================================

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StateError;
use crate::models::Tribunal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    NotStarted,
    Running,
    Paused,
    Completed,
    Failed,
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CrawlStatus::NotStarted => "PENDING",
            CrawlStatus::Running => "RUNNING",
            CrawlStatus::Paused => "PAUSED",
            CrawlStatus::Completed => "COMPLETED",
            CrawlStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub tribunal: Tribunal,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub last_completed_page: u32,
    pub total_records_ingested: u64,
    pub status: CrawlStatus,
    /// Pages skipped after a permanent upstream error.
    #[serde(default)]
    pub skipped_pages: Vec<u32>,
    pub updated_at: DateTime<Utc>,
}

impl CrawlProgress {
    pub fn new(tribunal: Tribunal, date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Self {
        Self {
            tribunal,
            date_from,
            date_to,
            last_completed_page: 0,
            total_records_ingested: 0,
            status: CrawlStatus::NotStarted,
            skipped_pages: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn covers(&self, date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> bool {
        self.date_from == date_from && self.date_to == date_to
    }

    pub fn next_page(&self) -> u32 {
        self.last_completed_page + 1
    }
}

/// Tracks out-of-order page completions and exposes the contiguous prefix.
#[derive(Debug, Clone, Default)]
pub struct PageTracker {
    last_contiguous: u32,
    done_ahead: BTreeSet<u32>,
}

impl PageTracker {
    pub fn new(last_completed_page: u32) -> Self {
        Self {
            last_contiguous: last_completed_page,
            done_ahead: BTreeSet::new(),
        }
    }

    /// Mark a page done. Returns true when the contiguous prefix moved.
    pub fn complete(&mut self, page: u32) -> bool {
        if page <= self.last_contiguous {
            return false;
        }
        self.done_ahead.insert(page);
        let before = self.last_contiguous;
        while self.done_ahead.remove(&(self.last_contiguous + 1)) {
            self.last_contiguous += 1;
        }
        self.last_contiguous != before
    }

    pub fn last_contiguous(&self) -> u32 {
        self.last_contiguous
    }

    /// Pages finished beyond a gap, waiting for the gap to close.
    pub fn pending_ahead(&self) -> usize {
        self.done_ahead.len()
    }
}

pub struct ProgressStore {
    dir: PathBuf,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, tribunal: Tribunal) -> PathBuf {
        self.dir.join(format!("progress_{}.json", tribunal.slug()))
    }

    pub async fn load(&self, tribunal: Tribunal) -> Result<Option<CrawlProgress>, StateError> {
        let path = self.path_for(tribunal);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_err(&path, source)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StateError::Json {
                path: path.display().to_string(),
                source,
            })
    }

    /// The checkpoint to start from for this range. A checkpoint for a
    /// different date range, or one that can't be read, means a fresh start.
    pub async fn resume(
        &self,
        tribunal: Tribunal,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> CrawlProgress {
        match self.load(tribunal).await {
            Ok(Some(progress)) if progress.covers(date_from, date_to) => {
                info!(
                    tribunal = %tribunal,
                    last_completed_page = progress.last_completed_page,
                    status = %progress.status,
                    "Resuming from checkpoint"
                );
                progress
            }
            Ok(Some(progress)) => {
                info!(
                    tribunal = %tribunal,
                    previous_from = ?progress.date_from,
                    previous_to = ?progress.date_to,
                    "Checkpoint is for another date range, starting fresh"
                );
                CrawlProgress::new(tribunal, date_from, date_to)
            }
            Ok(None) => CrawlProgress::new(tribunal, date_from, date_to),
            Err(e) => {
                warn!(tribunal = %tribunal, error = %e, "Unreadable checkpoint, starting fresh");
                CrawlProgress::new(tribunal, date_from, date_to)
            }
        }
    }

    pub async fn save(&self, progress: &mut CrawlProgress) -> Result<(), StateError> {
        progress.updated_at = Utc::now();
        let path = self.path_for(progress.tribunal);
        let body = serde_json::to_string_pretty(progress).map_err(|source| StateError::Json {
            path: path.display().to_string(),
            source,
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| io_err(&path, e))?;

        debug!(
            tribunal = %progress.tribunal,
            page = progress.last_completed_page,
            status = %progress.status,
            "Checkpoint written"
        );
        Ok(())
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StateError {
    StateError::Io {
        path: path.display().to_string(),
        source,
    }
}
