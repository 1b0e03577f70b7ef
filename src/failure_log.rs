// =============================================================================
// failure_log.rs - WHERE BATCHES GO WHEN THE STORE SAYS NO
// =============================================================================
//
// One JSON object per line. Each line is a batch (or the leftovers of one)
// that could not be written, together with the reason and the tribunal it
// belongs to. Appending is serialized behind an async mutex so two workers
// never interleave half lines. Rewriting (after a replay) goes through a temp
// file and a rename, so a crash mid-rewrite leaves the old log intact.
//
// A line that does not parse (usually one cut short by a crash during an
// append) is carried verbatim through every rewrite. Only an operator deletes
// it.
// =============================================================================

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StateError;
use crate::models::{SentenceRecord, Tribunal};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedBatch {
    pub id: Uuid,
    pub logged_at: DateTime<Utc>,
    pub tribunal: Tribunal,
    pub reason: String,
    pub records: Vec<SentenceRecord>,
}

impl FailedBatch {
    pub fn new(tribunal: Tribunal, reason: impl Into<String>, records: Vec<SentenceRecord>) -> Self {
        Self {
            id: Uuid::new_v4(),
            logged_at: Utc::now(),
            tribunal,
            reason: reason.into(),
            records,
        }
    }
}

/// What reading the log turned up.
#[derive(Debug, Default)]
pub struct LogContents {
    pub entries: Vec<FailedBatch>,
    /// Lines that did not parse, as found.
    pub unreadable: Vec<String>,
}

pub struct FailureLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &FailedBatch) -> Result<(), StateError> {
        let mut line = serde_json::to_string(entry).map_err(|e| self.json_err(e))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        self.ensure_parent().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        // A torn last line must not swallow this entry.
        if missing_final_newline(&mut file).await.map_err(|e| self.io_err(e))? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes()).await.map_err(|e| self.io_err(e))?;
        file.flush().await.map_err(|e| self.io_err(e))?;

        warn!(
            id = %entry.id,
            tribunal = %entry.tribunal,
            records = entry.records.len(),
            reason = %entry.reason,
            "Batch written to failure log"
        );
        Ok(())
    }

    /// Every entry in the log. A missing file is an empty log. Unreadable
    /// lines are set aside with a warning rather than poisoning the rest.
    pub async fn read_all(&self) -> Result<LogContents, StateError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogContents::default()),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut read = LogContents::default();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FailedBatch>(line) {
                Ok(entry) => read.entries.push(entry),
                Err(e) => {
                    warn!(path = %self.path.display(), line = n + 1, error = %e, "Unreadable failure log line kept aside");
                    read.unreadable.push(line.to_string());
                }
            }
        }
        Ok(read)
    }

    /// Replace the log with these entries, followed by the unreadable lines
    /// exactly as they were read. Nothing left removes the file.
    pub async fn rewrite(&self, entries: &[FailedBatch], unreadable: &[String]) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().await;

        if entries.is_empty() && unreadable.is_empty() {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => info!(path = %self.path.display(), "Failure log emptied"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_err(e)),
            }
            return Ok(());
        }

        let mut body = String::new();
        for entry in entries {
            body.push_str(&serde_json::to_string(entry).map_err(|e| self.json_err(e))?);
            body.push('\n');
        }
        for line in unreadable {
            body.push_str(line);
            body.push('\n');
        }

        self.ensure_parent().await?;
        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, body).await.map_err(|e| self.io_err(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_err(e))?;
        Ok(())
    }

    async fn ensure_parent(&self) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| self.io_err(e))?;
        }
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn json_err(&self, source: serde_json::Error) -> StateError {
        StateError::Json {
            path: self.path.display().to_string(),
            source,
        }
    }
}

async fn missing_final_newline(file: &mut tokio::fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    Ok(file.read_u8().await? != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NaturalKey;

    fn record(docket: &str) -> SentenceRecord {
        SentenceRecord {
            key: NaturalKey::from_docket(Tribunal::Civiles, docket),
            docket: docket.to_string(),
            caption: "A CON B".to_string(),
            court: String::new(),
            chamber: String::new(),
            decision_date: None,
            full_text: None,
            access_url: String::new(),
            subjects: vec![],
            descriptors: vec![],
            justices: vec![],
            drafter: None,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::new(dir.path().join("nested").join("failed.jsonl"));

        let first = FailedBatch::new(Tribunal::Civiles, "HTTP 400", vec![record("1-2020")]);
        let second = FailedBatch::new(Tribunal::Civiles, "timeout", vec![record("2-2020"), record("3-2020")]);
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let entries = log.read_all().await.unwrap().entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first.id);
        assert_eq!(entries[1].records.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_and_bad_lines_are_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let log = FailureLog::new(&path);
        let empty = log.read_all().await.unwrap();
        assert!(empty.entries.is_empty() && empty.unreadable.is_empty());

        let good = serde_json::to_string(&FailedBatch::new(Tribunal::Civiles, "x", vec![record("9-2019")])).unwrap();
        std::fs::write(&path, format!("{{not json\n{}\n", good)).unwrap();
        let read = log.read_all().await.unwrap();
        assert_eq!(read.entries.len(), 1);
        assert_eq!(read.unreadable, vec!["{not json".to_string()]);
    }

    #[tokio::test]
    async fn test_rewrite_keeps_unreadable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let log = FailureLog::new(&path);
        std::fs::write(&path, "{\"id\":\"trunc\n").unwrap();

        let read = log.read_all().await.unwrap();
        log.rewrite(&[], &read.unreadable).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"id\":\"trunc\n");
    }

    #[tokio::test]
    async fn test_append_after_torn_line_starts_a_new_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        std::fs::write(&path, "{\"id\":\"tor").unwrap();
        let log = FailureLog::new(&path);

        let entry = FailedBatch::new(Tribunal::Civiles, "x", vec![record("4-2020")]);
        log.append(&entry).await.unwrap();

        let read = log.read_all().await.unwrap();
        assert_eq!(read.entries, vec![entry]);
        assert_eq!(read.unreadable, vec!["{\"id\":\"tor".to_string()]);
    }

    #[tokio::test]
    async fn test_rewrite_replaces_and_empty_removes() {
        let dir = tempfile::tempdir().unwrap();
        let log = FailureLog::new(dir.path().join("failed.jsonl"));
        for docket in ["1-2020", "2-2020"] {
            log.append(&FailedBatch::new(Tribunal::Civiles, "x", vec![record(docket)])).await.unwrap();
        }

        let mut entries = log.read_all().await.unwrap().entries;
        entries.truncate(1);
        log.rewrite(&entries, &[]).await.unwrap();
        assert_eq!(log.read_all().await.unwrap().entries, entries);

        log.rewrite(&[], &[]).await.unwrap();
        assert!(!log.path().exists());
    }
}
