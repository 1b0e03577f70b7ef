// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - Counting every page, row and retry
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters shared by every worker of every tribunal. Nobody takes a
// lock to bump a number. The in-flight gauge also tracks its high-water mark,
// which is how we prove the backpressure actually holds.
//
// When a port is configured, a tiny HTTP endpoint serves the snapshot as
// JSON for the duration of the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub pages_fetched: u64,
    pub pages_skipped: u64,
    pub pages_failed: u64,
    pub rows_fetched: u64,
    pub rows_dropped: u64,
    pub duplicates_filtered: u64,
    pub records_inserted: u64,
    pub records_failed: u64,
    pub batches_logged: u64,
    pub sessions_acquired: u64,
    pub session_refreshes: u64,
    pub fetch_retries: u64,
    pub in_flight_pages: u64,
    pub max_in_flight_pages: u64,
    pub uptime_seconds: u64,
    pub records_per_minute: f64,
}

/// Thread-safe atomic metrics collector
pub struct MetricsCollector {
    pages_fetched: AtomicU64,
    pages_skipped: AtomicU64,
    pages_failed: AtomicU64,
    rows_fetched: AtomicU64,
    rows_dropped: AtomicU64,
    duplicates_filtered: AtomicU64,
    records_inserted: AtomicU64,
    records_failed: AtomicU64,
    batches_logged: AtomicU64,
    sessions_acquired: AtomicU64,
    session_refreshes: AtomicU64,
    fetch_retries: AtomicU64,
    in_flight_pages: AtomicU64,
    max_in_flight_pages: AtomicU64,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            pages_fetched: AtomicU64::new(0),
            pages_skipped: AtomicU64::new(0),
            pages_failed: AtomicU64::new(0),
            rows_fetched: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
            duplicates_filtered: AtomicU64::new(0),
            records_inserted: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            batches_logged: AtomicU64::new(0),
            sessions_acquired: AtomicU64::new(0),
            session_refreshes: AtomicU64::new(0),
            fetch_retries: AtomicU64::new(0),
            in_flight_pages: AtomicU64::new(0),
            max_in_flight_pages: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn add_page_fetched(&self, rows: usize) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
        self.rows_fetched.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn increment_pages_skipped(&self) {
        self.pages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_pages_failed(&self) {
        self.pages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rows_dropped(&self) {
        self.rows_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_duplicates_filtered(&self, n: usize) {
        self.duplicates_filtered.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_records_inserted(&self, n: usize) {
        self.records_inserted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_records_failed(&self, n: usize) {
        self.records_failed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn increment_batches_logged(&self) {
        self.batches_logged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_sessions_acquired(&self) {
        self.sessions_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_session_refreshes(&self) {
        self.session_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fetch_retries(&self) {
        self.fetch_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// A page has been fetched and is now waiting on the store.
    pub fn page_in_flight(&self) {
        let now = self.in_flight_pages.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight_pages.fetch_max(now, Ordering::SeqCst);
    }

    /// A fetched page has been acknowledged by the store (or abandoned).
    pub fn page_landed(&self) {
        self.in_flight_pages.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_in_flight_pages(&self) -> u64 {
        self.max_in_flight_pages.load(Ordering::SeqCst)
    }

    /// Take a snapshot of all metrics (lock-free reads)
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let inserted = self.records_inserted.load(Ordering::Relaxed);
        let records_per_minute = if uptime > 0 {
            (inserted as f64 / uptime as f64) * 60.0
        } else {
            0.0
        };

        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            pages_skipped: self.pages_skipped.load(Ordering::Relaxed),
            pages_failed: self.pages_failed.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            rows_dropped: self.rows_dropped.load(Ordering::Relaxed),
            duplicates_filtered: self.duplicates_filtered.load(Ordering::Relaxed),
            records_inserted: inserted,
            records_failed: self.records_failed.load(Ordering::Relaxed),
            batches_logged: self.batches_logged.load(Ordering::Relaxed),
            sessions_acquired: self.sessions_acquired.load(Ordering::Relaxed),
            session_refreshes: self.session_refreshes.load(Ordering::Relaxed),
            fetch_retries: self.fetch_retries.load(Ordering::Relaxed),
            in_flight_pages: self.in_flight_pages.load(Ordering::SeqCst),
            max_in_flight_pages: self.max_in_flight_pages.load(Ordering::SeqCst),
            uptime_seconds: uptime,
            records_per_minute,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind the metrics endpoint on every interface. Port 0 takes any free port.
pub async fn bind_metrics_listener(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await
}

/// Answer `GET /metrics` (or `GET /`) with the current snapshot until the
/// shutdown flag flips. Every connection gets its own task, so a client that
/// never sends its request line holds up nobody else.
pub async fn serve_metrics(listener: TcpListener, metrics: Arc<MetricsCollector>, mut shutdown: watch::Receiver<bool>) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Metrics endpoint listening");
    }

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let metrics = metrics.clone();
                    tokio::spawn(async move {
                        if let Err(e) = answer(stream, &metrics).await {
                            debug!(%peer, error = %e, "Metrics request dropped");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Metrics endpoint accept failed"),
            },
        }
    }

    info!("Metrics endpoint closed");
}

async fn answer(mut stream: TcpStream, metrics: &MetricsCollector) -> std::io::Result<()> {
    let mut buf = [0u8; 1024];
    let read = tokio::time::timeout(REQUEST_TIMEOUT, stream.read(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no request line"))??;

    let head = String::from_utf8_lossy(&buf[..read]);
    let mut request_line = head.split_whitespace();
    let response = match (request_line.next(), request_line.next()) {
        (Some("GET"), Some("/" | "/metrics")) => {
            let body = serde_json::to_string_pretty(&metrics.snapshot()).unwrap_or_else(|_| "{}".to_string());
            http_response("200 OK", "application/json", &body)
        }
        (Some("GET"), _) => http_response("404 Not Found", "text/plain", "try /metrics\n"),
        _ => http_response("405 Method Not Allowed", "text/plain", "GET only\n"),
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get(port: u16, path: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream
            .write_all(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        raw
    }

    #[tokio::test]
    async fn test_endpoint_serves_snapshot_until_shutdown() {
        let metrics = Arc::new(MetricsCollector::new());
        metrics.add_page_fetched(3);
        let listener = bind_metrics_listener(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve_metrics(listener, metrics.clone(), rx));

        let raw = get(port, "/metrics").await;
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "{}", raw);
        let (_, body) = raw.split_once("\r\n\r\n").unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["pages_fetched"], 1);
        assert_eq!(json["rows_fetched"], 3);

        assert!(get(port, "/nope").await.starts_with("HTTP/1.1 404"));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
    }

    #[test]
    fn test_in_flight_tracks_high_water_mark() {
        let metrics = MetricsCollector::new();
        metrics.page_in_flight();
        metrics.page_in_flight();
        metrics.page_landed();
        metrics.page_in_flight();
        metrics.page_landed();
        metrics.page_landed();

        let snap = metrics.snapshot();
        assert_eq!(snap.in_flight_pages, 0);
        assert_eq!(snap.max_in_flight_pages, 2);
    }

    #[test]
    fn test_page_counts_rows() {
        let metrics = MetricsCollector::new();
        metrics.add_page_fetched(10);
        metrics.add_page_fetched(3);
        metrics.increment_rows_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.pages_fetched, 2);
        assert_eq!(snap.rows_fetched, 13);
        assert_eq!(snap.rows_dropped, 1);
    }
}
