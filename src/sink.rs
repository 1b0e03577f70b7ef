// =============================================================================
// sink.rs - GETTING RECORDS INTO THE STORE, AT MOST ONCE PER KEY
// =============================================================================
//
// Two layers:
//
// 1. RecordStore - the seam to the remote table. RestStore speaks PostgREST:
//    bulk upserts with `on_conflict=tribunal,rol,era` and merge-duplicates,
//    batched `in.(...)` existence checks, and exact counts read from the
//    Content-Range header. Repeating an upsert overwrites, never duplicates.
//
// 2. BatchSink - cuts records into small batches and gets each one written
//    or written down:
//
//      transport failure / 5xx  -> retry the whole batch, bounded
//      rejection (4xx)          -> retry record by record to isolate the
//                                  bad ones
//      still failing            -> append to the failure log for replay
//
//    A circuit breaker in front of the store stops a dead store from eating
//    every worker's retry budget at full speed.
// =============================================================================

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::config::Config;
use crate::error::{ConfigError, SinkError, StateError};
use crate::failure_log::{FailedBatch, FailureLog, LogContents};
use crate::metrics::MetricsCollector;
use crate::models::{NaturalKey, SentenceRecord, Tribunal};

/// Columns of the natural key, in the order PostgREST expects for
/// `on_conflict`.
pub const CONFLICT_COLUMNS: &str = "tribunal,rol,era";

/// The remote table.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite by natural key. All or nothing.
    async fn upsert(&self, records: &[SentenceRecord]) -> Result<(), SinkError>;

    /// Which of these keys (all of one tribunal) already exist.
    async fn existing_keys(&self, tribunal: Tribunal, keys: &[NaturalKey]) -> Result<HashSet<NaturalKey>, SinkError>;

    /// Number of rows stored for a tribunal.
    async fn count(&self, tribunal: Tribunal) -> Result<u64, SinkError>;
}

// =============================================================================
// PostgREST store
// =============================================================================

pub struct RestStore {
    client: reqwest::Client,
    endpoint: Url,
}

#[derive(Deserialize)]
struct KeyRow {
    rol: String,
    #[serde(default)]
    era: Option<String>,
}

impl RestStore {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let base = config.sink_url.as_deref().ok_or(ConfigError::Missing("JURIS_SINK_URL"))?;
        let key = config.sink_api_key.as_deref().ok_or(ConfigError::Missing("JURIS_SINK_API_KEY"))?;

        let endpoint = Url::parse(&format!("{}/rest/v1/{}", base, config.sink_table)).map_err(|_| {
            ConfigError::Invalid {
                key: "JURIS_SINK_URL",
                value: base.to_string(),
            }
        })?;

        let invalid_key = || ConfigError::Invalid {
            key: "JURIS_SINK_API_KEY",
            value: "<redacted>".to_string(),
        };
        let mut headers = HeaderMap::new();
        headers.insert("apikey", HeaderValue::from_str(key).map_err(|_| invalid_key())?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key)).map_err(|_| invalid_key())?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "JURIS_SINK_URL",
                value: e.to_string(),
            })?;

        Ok(Self { client, endpoint })
    }

    async fn rejected(response: reqwest::Response) -> SinkError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        SinkError::Rejected {
            status,
            body: body.chars().take(300).collect(),
        }
    }
}

/// `in.("a","b")` list for a PostgREST filter.
fn in_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = values
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// Total from `Content-Range: 0-9/1234` or `*/1234`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
impl RecordStore for RestStore {
    async fn upsert(&self, records: &[SentenceRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .query(&[("on_conflict", CONFLICT_COLUMNS)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(records)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejected(response).await)
        }
    }

    async fn existing_keys(&self, tribunal: Tribunal, keys: &[NaturalKey]) -> Result<HashSet<NaturalKey>, SinkError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let rols: BTreeSet<&str> = keys.iter().map(|k| k.rol.as_str()).collect();
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[
                ("select", "rol,era".to_string()),
                ("tribunal", format!("eq.{}", tribunal.slug())),
                ("rol", in_list(rols.into_iter())),
            ])
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }

        let rows: Vec<KeyRow> = response.json().await.map_err(|e| SinkError::Decode(e.to_string()))?;
        let found: HashSet<(String, String)> = rows
            .into_iter()
            .map(|r| (r.rol, r.era.unwrap_or_default()))
            .collect();

        Ok(keys
            .iter()
            .filter(|k| found.contains(&(k.rol.clone(), k.era.clone())))
            .cloned()
            .collect())
    }

    async fn count(&self, tribunal: Tribunal) -> Result<u64, SinkError> {
        let response = self
            .client
            .head(self.endpoint.clone())
            .query(&[("select", "rol".to_string()), ("tribunal", format!("eq.{}", tribunal.slug()))])
            .header("Prefer", "count=exact")
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SinkError::Rejected {
                status: response.status().as_u16(),
                body: String::new(),
            });
        }

        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| SinkError::Decode("missing or unreadable Content-Range".to_string()))
    }
}

// =============================================================================
// Batch sink
// =============================================================================

/// Outcome of writing a set of records.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub inserted: usize,
    pub failed: Vec<(SentenceRecord, String)>,
}

impl BatchResult {
    fn absorb(&mut self, other: BatchResult) {
        self.inserted += other.inserted;
        self.failed.extend(other.failed);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub entries: usize,
    pub recovered_records: usize,
    pub remaining_entries: usize,
    /// Lines of the log that could not be parsed. They stay in the log.
    pub unreadable_lines: usize,
}

pub struct BatchSink {
    store: Arc<dyn RecordStore>,
    breaker: CircuitBreaker,
    failure_log: FailureLog,
    batch_size: usize,
    max_attempts: u32,
    retry_delay: Duration,
    metrics: Arc<MetricsCollector>,
}

impl BatchSink {
    pub fn new(store: Arc<dyn RecordStore>, config: &Config, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            store,
            breaker: CircuitBreaker::new(
                "store",
                config.circuit_breaker_failure_threshold,
                config.circuit_breaker_reset_timeout,
                config.circuit_breaker_success_threshold,
            ),
            failure_log: FailureLog::new(&config.failure_log_path),
            batch_size: config.sink_batch_size.max(1),
            max_attempts: config.sink_max_attempts.max(1),
            retry_delay: config.sink_retry_delay,
            metrics,
        }
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Upsert one batch. Retryable failures are retried as a whole; a
    /// rejected batch is retried record by record so one bad record doesn't
    /// take the rest down. Nothing is logged here; see `write`.
    pub async fn upsert(&self, batch: &[SentenceRecord]) -> BatchResult {
        if batch.is_empty() {
            return BatchResult::default();
        }

        match self.attempt(batch).await {
            Ok(()) => BatchResult {
                inserted: batch.len(),
                failed: Vec::new(),
            },
            Err(SinkError::Rejected { status, body }) if status < 500 && batch.len() > 1 => {
                debug!(status, records = batch.len(), body = %body, "Batch rejected, isolating records");
                let mut result = BatchResult::default();
                for record in batch {
                    match self.attempt(std::slice::from_ref(record)).await {
                        Ok(()) => result.inserted += 1,
                        Err(e) => result.failed.push((record.clone(), e.to_string())),
                    }
                }
                result
            }
            Err(e) => {
                let reason = e.to_string();
                BatchResult {
                    inserted: 0,
                    failed: batch.iter().map(|r| (r.clone(), reason.clone())).collect(),
                }
            }
        }
    }

    /// Write records in bounded batches. Anything that still fails goes to
    /// the failure log, one entry per batch.
    pub async fn write(&self, tribunal: Tribunal, records: &[SentenceRecord]) -> BatchResult {
        let mut total = BatchResult::default();
        for chunk in records.chunks(self.batch_size) {
            let result = self.upsert(chunk).await;
            self.metrics.add_records_inserted(result.inserted);

            if !result.failed.is_empty() {
                self.metrics.add_records_failed(result.failed.len());
                let reason = result
                    .failed
                    .first()
                    .map(|(_, r)| r.clone())
                    .unwrap_or_default();
                let entry = FailedBatch::new(tribunal, reason, result.failed.iter().map(|(r, _)| r.clone()).collect());
                match self.failure_log.append(&entry).await {
                    Ok(()) => self.metrics.increment_batches_logged(),
                    Err(e) => error!(
                        tribunal = %tribunal,
                        records = entry.records.len(),
                        error = %e,
                        "Could not persist failed batch, records are lost for this run"
                    ),
                }
            }
            total.absorb(result);
        }
        total
    }

    /// Re-upsert every failure-log entry. Entries (or the parts of them)
    /// that still fail stay in the log, and so do lines that could not be
    /// read; everything else is removed.
    pub async fn replay(&self) -> Result<ReplayReport, StateError> {
        let LogContents { entries, unreadable } = self.failure_log.read_all().await?;
        info!(
            path = %self.failure_log.path().display(),
            entries = entries.len(),
            unreadable = unreadable.len(),
            "Replaying failure log"
        );
        let mut report = ReplayReport {
            entries: entries.len(),
            unreadable_lines: unreadable.len(),
            ..ReplayReport::default()
        };

        let mut remaining = Vec::new();
        for entry in entries {
            let mut result = BatchResult::default();
            for chunk in entry.records.chunks(self.batch_size) {
                result.absorb(self.upsert(chunk).await);
            }
            report.recovered_records += result.inserted;
            self.metrics.add_records_inserted(result.inserted);

            if result.failed.is_empty() {
                info!(id = %entry.id, tribunal = %entry.tribunal, records = result.inserted, "Failed batch replayed");
                continue;
            }
            let reason = result.failed[0].1.clone();
            warn!(id = %entry.id, tribunal = %entry.tribunal, still_failing = result.failed.len(), reason = %reason, "Replay incomplete");
            remaining.push(FailedBatch {
                reason,
                records: result.failed.into_iter().map(|(r, _)| r).collect(),
                ..entry
            });
        }

        report.remaining_entries = remaining.len();
        self.failure_log.rewrite(&remaining, &unreadable).await?;
        Ok(report)
    }

    /// One batch, retried while the error is retryable and attempts remain.
    async fn attempt(&self, batch: &[SentenceRecord]) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = if self.breaker.allow_request() {
                let r = self.store.upsert(batch).await;
                match &r {
                    Ok(()) => self.breaker.record_success(),
                    Err(e) if e.is_retryable() => self.breaker.record_failure(),
                    Err(_) => self.breaker.record_success(),
                }
                r
            } else {
                Err(SinkError::Unavailable)
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if (e.is_retryable() || e == SinkError::Unavailable) && attempt < self.max_attempts => {
                    warn!(attempt, max = self.max_attempts, records = batch.len(), error = %e, "Upsert failed, retrying batch");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{record, MemoryStore};
    use super::*;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sink_config(dir: &std::path::Path) -> Config {
        Config {
            sink_batch_size: 2,
            sink_max_attempts: 3,
            sink_retry_delay: Duration::from_millis(1),
            failure_log_path: dir.join("failed.jsonl"),
            ..Config::default()
        }
    }

    fn sink(store: Arc<MemoryStore>, dir: &std::path::Path) -> BatchSink {
        BatchSink::new(store, &sink_config(dir), Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn test_repeated_upsert_does_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let sink = sink(store.clone(), dir.path());
        let page: Vec<_> = ["1-2020", "2-2020", "3-2020"]
            .iter()
            .map(|d| record(Tribunal::CorteSuprema, d))
            .collect();

        assert_eq!(sink.write(Tribunal::CorteSuprema, &page).await.inserted, 3);
        let before = store.count(Tribunal::CorteSuprema).await.unwrap();
        assert_eq!(sink.write(Tribunal::CorteSuprema, &page).await.inserted, 3);
        assert_eq!(store.count(Tribunal::CorteSuprema).await.unwrap(), before);
        assert_eq!(before, 3);
    }

    #[tokio::test]
    async fn test_transport_failure_is_retried_as_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.transport_failures.store(2, Ordering::SeqCst);
        let sink = sink(store.clone(), dir.path());

        let result = sink.upsert(&[record(Tribunal::Familia, "5-2021")]).await;
        assert_eq!(result.inserted, 1);
        assert!(result.failed.is_empty());
        assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_batch_goes_to_failure_log_and_replays() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.transport_failures.store(3, Ordering::SeqCst);
        let sink = sink(store.clone(), dir.path());

        let records = vec![record(Tribunal::Penales, "10-2022"), record(Tribunal::Penales, "11-2022")];
        let result = sink.write(Tribunal::Penales, &records).await;
        assert_eq!(result.inserted, 0);
        assert_eq!(result.failed.len(), 2);
        assert_eq!(store.len(), 0);

        let report = sink.replay().await.unwrap();
        assert_eq!(
            report,
            ReplayReport {
                entries: 1,
                recovered_records: 2,
                remaining_entries: 0,
                unreadable_lines: 0,
            }
        );
        assert_eq!(store.len(), 2);
        assert!(!dir.path().join("failed.jsonl").exists());
    }

    #[tokio::test]
    async fn test_rejected_batch_isolates_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store.poison_rols.lock().insert("13".to_string());
        let sink = sink(store.clone(), dir.path());

        let records = vec![record(Tribunal::Civiles, "12-2020"), record(Tribunal::Civiles, "13-2020")];
        let result = sink.write(Tribunal::Civiles, &records).await;
        assert_eq!(result.inserted, 1);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0.key.rol, "13");

        let logged = FailureLog::new(dir.path().join("failed.jsonl")).read_all().await.unwrap().entries;
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].records.len(), 1);

        // Still poisoned: replay keeps the entry.
        let report = sink.replay().await.unwrap();
        assert_eq!(report.remaining_entries, 1);
    }

    #[tokio::test]
    async fn test_replay_keeps_a_truncated_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed.jsonl");
        let store = Arc::new(MemoryStore::default());
        let sink = sink(store.clone(), dir.path());

        let valid = FailedBatch::new(Tribunal::Civiles, "timeout", vec![record(Tribunal::Civiles, "20-2023")]);
        let torn = r#"{"id":"7f1c","logged_at":"2024-01-0"#;
        std::fs::write(&path, format!("{}\n{}\n", torn, serde_json::to_string(&valid).unwrap())).unwrap();

        let report = sink.replay().await.unwrap();
        assert_eq!(report.entries, 1);
        assert_eq!(report.recovered_records, 1);
        assert_eq!(report.remaining_entries, 0);
        assert_eq!(report.unreadable_lines, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), format!("{}\n", torn));
    }

    #[test]
    fn test_content_range_total() {
        assert_eq!(parse_content_range_total("0-9/1234"), Some(1234));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
    }

    fn rest_store(server: &MockServer) -> RestStore {
        let config = Config {
            sink_url: Some(server.uri()),
            sink_api_key: Some("test-key".to_string()),
            ..Config::default()
        };
        RestStore::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_rest_upsert_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/sentencias"))
            .and(query_param("on_conflict", "tribunal,rol,era"))
            .and(header("apikey", "test-key"))
            .and(header("Authorization", "Bearer test-key"))
            .and(header("Prefer", "resolution=merge-duplicates,return=minimal"))
            .and(body_string_contains("\"rol_completo\":\"44-2020\""))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        rest_store(&server)
            .upsert(&[record(Tribunal::Laborales, "44-2020")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rest_rejection_and_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/sentencias"))
            .and(query_param("tribunal", "eq.Laborales"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"rol": "44", "era": "2020"}])))
            .mount(&server)
            .await;

        let store = rest_store(&server);
        let err = store.upsert(&[record(Tribunal::Laborales, "44-2020")]).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected { status: 409, .. }));

        let keys = vec![
            NaturalKey::from_docket(Tribunal::Laborales, "44-2020"),
            NaturalKey::from_docket(Tribunal::Laborales, "44-2021"),
        ];
        let existing = store.existing_keys(Tribunal::Laborales, &keys).await.unwrap();
        assert_eq!(existing.len(), 1);
        assert!(existing.contains(&keys[0]));
    }

    #[tokio::test]
    async fn test_rest_count_reads_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/rest/v1/sentencias"))
            .and(header("Prefer", "count=exact"))
            .respond_with(ResponseTemplate::new(200).insert_header("Content-Range", "0-0/2615"))
            .mount(&server)
            .await;

        assert_eq!(rest_store(&server).count(Tribunal::CorteSuprema).await.unwrap(), 2615);
    }

    #[test]
    fn test_rest_store_requires_secrets() {
        assert!(matches!(
            RestStore::from_config(&Config::default()),
            Err(ConfigError::Missing("JURIS_SINK_URL"))
        ));
    }
}
