// =============================================================================
// config.rs - ALL THE KNOBS, NONE OF THE SECRETS
// =============================================================================
//
// Every tunable in the engine lives here and every one of them can be
// overridden from the environment with a JURIS_ prefix. A .env file is picked
// up if present, because nobody enjoys exporting twenty variables by hand.
//
// The defaults are polite on purpose. The upstream is a public judiciary site
// with an implicit abuse threshold that nobody will tell us the value of, and
// the only signal we get when we cross it is an HTTP 419. Slow and steady.
//
// The store URL and key have no defaults. Secrets belong in the environment,
// never in the source tree.
// =============================================================================

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// The engine configuration. Built once at startup, shared behind an Arc,
/// never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // UPSTREAM SEARCH SITE
    // =========================================================================

    /// Base URL of the judiciary search site.
    /// Default: https://juris.pjud.cl
    pub upstream_base_url: String,

    /// User agent sent with every upstream request.
    pub user_agent: String,

    /// Timeout for a single upstream HTTP request.
    pub request_timeout: Duration,

    /// Upper bound for the whole token + context sequence of one session.
    pub session_timeout: Duration,

    /// Searches a session may issue before the broker swaps it for a fresh one.
    pub session_max_requests: u32,

    /// Rows per page (`numero_filas_paginacion`).
    pub rows_per_page: u32,

    /// Result ordering (`orden`). The site knows "recientes" and "rel".
    pub search_order: String,

    // =========================================================================
    // CRAWL SCHEDULING
    // =========================================================================

    /// Workers per tribunal. Each one owns its own session.
    pub workers_per_tribunal: usize,

    /// How many tribunals are crawled at the same time.
    pub max_parallel_tribunals: usize,

    /// Capacity of the page work queue, and the ceiling on fetched-but-unsunk
    /// pages per tribunal.
    pub queue_capacity: usize,

    /// Sleep between two consecutive requests of the same worker.
    pub request_pause: Duration,

    /// Upstream requests per page before giving up, first attempt included.
    pub fetch_max_attempts: u32,

    /// First backoff delay; doubles on every retry.
    pub fetch_backoff_base: Duration,

    /// Backoff ceiling.
    pub fetch_backoff_max: Duration,

    /// Consecutive failed pages before a tribunal is marked FAILED.
    pub max_consecutive_page_failures: u32,

    /// Persist progress every this many contiguous pages.
    pub checkpoint_interval: u32,

    // =========================================================================
    // REMOTE STORE
    // =========================================================================

    /// PostgREST base URL, e.g. https://xyz.supabase.co. No default.
    pub sink_url: Option<String>,

    /// API key for the store. No default.
    pub sink_api_key: Option<String>,

    /// Target table.
    pub sink_table: String,

    /// Records per upsert request. Small on purpose: a bad batch takes fewer
    /// good records down with it.
    pub sink_batch_size: usize,

    /// Attempts per batch before it goes to the failure log.
    pub sink_max_attempts: u32,

    /// Pause between batch attempts.
    pub sink_retry_delay: Duration,

    // =========================================================================
    // CIRCUIT BREAKER (in front of the store)
    // =========================================================================

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout: Duration,
    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // DEDUPLICATION
    // =========================================================================

    /// Expected reservations per run, sizes the Bloom filter.
    pub bloom_expected_items: u64,

    /// Bloom filter false positive rate. A false positive only costs an
    /// exact-set lookup, never a dropped record.
    pub bloom_false_positive_rate: f64,

    /// Keys known to exist in the store, remembered to skip repeat lookups.
    pub dedup_cache_size: usize,

    // =========================================================================
    // LOCAL STATE
    // =========================================================================

    /// Directory for per-tribunal progress files.
    pub state_dir: PathBuf,

    /// JSON-lines file holding batches that could not be written.
    pub failure_log_path: PathBuf,

    // =========================================================================
    // METRICS
    // =========================================================================

    /// Port of the JSON metrics endpoint. 0 disables it.
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from the environment (and `.env`) on top of the
    /// defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup. Unparseable values fall
    /// back to the default for that key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| Duration::from_secs(get(key, "").parse().unwrap_or(default));
        let millis = |key: &str, default: u64| Duration::from_millis(get(key, "").parse().unwrap_or(default));

        let state_dir = PathBuf::from(get("JURIS_STATE_DIR", "state"));
        let failure_log_path = lookup("JURIS_FAILURE_LOG")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("failed_batches.jsonl"));

        Config {
            upstream_base_url: get("JURIS_UPSTREAM_URL", "https://juris.pjud.cl")
                .trim_end_matches('/')
                .to_string(),
            user_agent: get(
                "JURIS_USER_AGENT",
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
            ),
            request_timeout: secs("JURIS_REQUEST_TIMEOUT_SECS", 30),
            session_timeout: secs("JURIS_SESSION_TIMEOUT_SECS", 20),
            session_max_requests: get("JURIS_SESSION_MAX_REQUESTS", "").parse().unwrap_or(200),
            rows_per_page: get("JURIS_ROWS_PER_PAGE", "").parse().unwrap_or(50),
            search_order: get("JURIS_SEARCH_ORDER", "recientes"),

            workers_per_tribunal: get("JURIS_WORKERS", "").parse().unwrap_or(3),
            max_parallel_tribunals: get("JURIS_PARALLEL_TRIBUNALS", "").parse().unwrap_or(1),
            queue_capacity: get("JURIS_QUEUE_CAPACITY", "").parse().unwrap_or(6),
            request_pause: millis("JURIS_REQUEST_PAUSE_MS", 1_000),
            fetch_max_attempts: get("JURIS_FETCH_MAX_ATTEMPTS", "").parse().unwrap_or(3),
            fetch_backoff_base: millis("JURIS_FETCH_BACKOFF_BASE_MS", 2_000),
            fetch_backoff_max: millis("JURIS_FETCH_BACKOFF_MAX_MS", 60_000),
            max_consecutive_page_failures: get("JURIS_MAX_PAGE_FAILURES", "").parse().unwrap_or(5),
            checkpoint_interval: get("JURIS_CHECKPOINT_INTERVAL", "").parse().unwrap_or(5),

            sink_url: lookup("JURIS_SINK_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            sink_api_key: lookup("JURIS_SINK_API_KEY").filter(|k| !k.is_empty()),
            sink_table: get("JURIS_SINK_TABLE", "sentencias"),
            sink_batch_size: get("JURIS_SINK_BATCH_SIZE", "").parse().unwrap_or(25),
            sink_max_attempts: get("JURIS_SINK_MAX_ATTEMPTS", "").parse().unwrap_or(3),
            sink_retry_delay: millis("JURIS_SINK_RETRY_DELAY_MS", 2_000),

            circuit_breaker_failure_threshold: get("JURIS_CB_FAILURE_THRESHOLD", "").parse().unwrap_or(5),
            circuit_breaker_reset_timeout: secs("JURIS_CB_RESET_TIMEOUT_SECS", 60),
            circuit_breaker_success_threshold: get("JURIS_CB_SUCCESS_THRESHOLD", "").parse().unwrap_or(2),

            bloom_expected_items: get("JURIS_BLOOM_ITEMS", "").parse().unwrap_or(200_000),
            bloom_false_positive_rate: get("JURIS_BLOOM_FP_RATE", "").parse().unwrap_or(0.01),
            dedup_cache_size: get("JURIS_DEDUP_CACHE_SIZE", "").parse().unwrap_or(50_000),

            state_dir,
            failure_log_path,

            metrics_port: get("JURIS_METRICS_PORT", "").parse().unwrap_or(0),
        }
    }

    /// Check the settings a store-backed command can't run without, and the
    /// numeric ones that would make the crawl meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sink_url.is_none() {
            return Err(ConfigError::Missing("JURIS_SINK_URL"));
        }
        if self.sink_api_key.is_none() {
            return Err(ConfigError::Missing("JURIS_SINK_API_KEY"));
        }
        self.validate_crawl()
    }

    /// The checks that don't involve the store.
    pub fn validate_crawl(&self) -> Result<(), ConfigError> {
        let positive = [
            ("JURIS_ROWS_PER_PAGE", self.rows_per_page as u64),
            ("JURIS_WORKERS", self.workers_per_tribunal as u64),
            ("JURIS_QUEUE_CAPACITY", self.queue_capacity as u64),
            ("JURIS_FETCH_MAX_ATTEMPTS", self.fetch_max_attempts as u64),
            ("JURIS_MAX_PAGE_FAILURES", self.max_consecutive_page_failures as u64),
            ("JURIS_SINK_BATCH_SIZE", self.sink_batch_size as u64),
            ("JURIS_SINK_MAX_ATTEMPTS", self.sink_max_attempts as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
