// =============================================================================
// coordinator.rs - ONE TRIBUNAL, MANY WORKERS, ONE CHECKPOINT WRITER
// =============================================================================
//
// Per tribunal:
//
//   dispatcher ──pages──▶ [bounded queue] ──▶ worker 1..N ──outcomes──▶ coordinator
//                                              │                           │
//                          fetch → map → dedup → sink              PageTracker +
//                                                                  progress file
//
// - Every worker owns its own session. Nobody shares a cookie jar.
// - A worker takes a backpressure permit before fetching and gives it back
//   only after the sink has answered, so at most `queue_capacity` pages are
//   ever fetched but not yet written, however slow the store gets.
// - Only the coordinator touches CrawlProgress. It advances the checkpoint
//   over contiguous pages, counts consecutive page failures, and stops
//   dispatch for this tribunal (and only this one) when they pile up.
// - A shutdown request stops dispatch and lets in-flight pages finish; the
//   tribunal is left PAUSED with its last contiguous checkpoint on disk.
//
//   PENDING → RUNNING → COMPLETED
//                     → FAILED   (too many consecutive page failures)
//                     → PAUSED   (operator interrupt, or pages still failing
//                                 after one retry pass) → RUNNING on next run
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::circuit_breaker::CircuitBreakerSnapshot;
use crate::config::Config;
use crate::dedup::{DedupSnapshot, Deduplicator};
use crate::error::{ConfigError, PageError};
use crate::fetcher::PageFetcher;
use crate::mapper::RecordMapper;
use crate::metrics::MetricsCollector;
use crate::models::{PageRequest, Tribunal};
use crate::progress::{CrawlProgress, CrawlStatus, PageTracker, ProgressStore};
use crate::session::{SessionBroker, SessionHandle};
use crate::sink::{BatchSink, RecordStore};

/// What to crawl. Pages are 1-based and inclusive. Without an end page the
/// coordinator asks the upstream how many results there are.
#[derive(Debug, Clone)]
pub struct CrawlPlan {
    pub tribunals: Vec<Tribunal>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub start_page: u32,
    pub end_page: Option<u32>,
}

impl CrawlPlan {
    pub fn for_dates(tribunals: Vec<Tribunal>, date_from: NaiveDate, date_to: NaiveDate) -> Self {
        Self {
            tribunals,
            date_from: Some(date_from),
            date_to: Some(date_to),
            start_page: 1,
            end_page: None,
        }
    }
}

/// How a tribunal's crawl ended, for the summary.
#[derive(Debug, Clone)]
pub struct TribunalReport {
    pub tribunal: Tribunal,
    pub status: CrawlStatus,
    pub last_completed_page: u32,
    pub end_page: Option<u32>,
    pub records_ingested: u64,
    pub total_records_ingested: u64,
    pub records_failed: usize,
    pub pages_done: usize,
    pub pages_skipped: usize,
    pub pages_failed: usize,
    pub reason: Option<String>,
}

impl TribunalReport {
    fn new(tribunal: Tribunal) -> Self {
        Self {
            tribunal,
            status: CrawlStatus::NotStarted,
            last_completed_page: 0,
            end_page: None,
            records_ingested: 0,
            total_records_ingested: 0,
            records_failed: 0,
            pages_done: 0,
            pages_skipped: 0,
            pages_failed: 0,
            reason: None,
        }
    }

    fn close(mut self, progress: &CrawlProgress, reason: Option<String>) -> Self {
        self.status = progress.status;
        self.last_completed_page = progress.last_completed_page;
        self.total_records_ingested = progress.total_records_ingested;
        self.reason = reason;
        self
    }
}

impl std::fmt::Display for TribunalReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self.end_page.map(|e| e.to_string()).unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "{:<22} {:<10} page {}/{}  +{} records ({} total)  skipped {}  failed pages {}  failed records {}",
            self.tribunal.name(),
            self.status.to_string(),
            self.last_completed_page,
            end,
            self.records_ingested,
            self.total_records_ingested,
            self.pages_skipped,
            self.pages_failed,
            self.records_failed,
        )?;
        if let Some(reason) = &self.reason {
            write!(f, "  ({})", reason)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum PageResult {
    Done { inserted: usize, failed: usize },
    Skipped(String),
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct PageOutcome {
    page: u32,
    result: PageResult,
}

pub struct CrawlCoordinator {
    config: Arc<Config>,
    broker: Arc<SessionBroker>,
    fetcher: Arc<PageFetcher>,
    dedup: Arc<Deduplicator>,
    sink: Arc<BatchSink>,
    progress: ProgressStore,
    metrics: Arc<MetricsCollector>,
}

impl CrawlCoordinator {
    pub fn new(config: Arc<Config>, store: Arc<dyn RecordStore>, metrics: Arc<MetricsCollector>) -> Result<Self, ConfigError> {
        config.validate_crawl()?;
        Ok(Self {
            broker: Arc::new(SessionBroker::new(&config, metrics.clone())),
            fetcher: Arc::new(PageFetcher::new(&config, metrics.clone())),
            dedup: Arc::new(Deduplicator::new(store.clone(), &config, metrics.clone())?),
            sink: Arc::new(BatchSink::new(store, &config, metrics.clone())),
            progress: ProgressStore::new(&config.state_dir),
            config,
            metrics,
        })
    }

    pub fn dedup_snapshot(&self) -> DedupSnapshot {
        self.dedup.snapshot()
    }

    pub fn breaker_snapshot(&self) -> CircuitBreakerSnapshot {
        self.sink.breaker_snapshot()
    }

    /// Crawl every tribunal of the plan, `max_parallel_tribunals` at a time.
    /// Reports come back in plan order.
    pub async fn run(&self, plan: &CrawlPlan, shutdown: watch::Receiver<bool>) -> Vec<TribunalReport> {
        let parallel = self.config.max_parallel_tribunals.max(1);
        futures::stream::iter(plan.tribunals.iter().copied())
            .map(|tribunal| {
                let shutdown = shutdown.clone();
                async move { self.crawl_tribunal(tribunal, plan, &shutdown).await }
            })
            .buffered(parallel)
            .collect()
            .await
    }

    pub async fn crawl_tribunal(&self, tribunal: Tribunal, plan: &CrawlPlan, shutdown: &watch::Receiver<bool>) -> TribunalReport {
        let mut report = TribunalReport::new(tribunal);
        let mut progress = self.progress.resume(tribunal, plan.date_from, plan.date_to).await;

        if progress.status == CrawlStatus::Completed {
            println!("✔ {} already completed for this range, skipping", tribunal.name());
            return report.close(&progress, Some("already completed".to_string()));
        }
        if *shutdown.borrow() {
            progress.status = CrawlStatus::Paused;
            return report.close(&progress, Some("interrupted before start".to_string()));
        }

        let first = progress.next_page().max(plan.start_page.max(1));
        let end = match plan.end_page {
            Some(end) => end,
            None => match upstream_total(
                &self.config,
                &self.broker,
                &self.fetcher,
                tribunal,
                plan.date_from,
                plan.date_to,
                shutdown,
            )
            .await
            {
                Ok(total) => {
                    let limit = u64::from(self.config.rows_per_page.max(1));
                    let pages = u32::try_from(total.div_ceil(limit)).unwrap_or(u32::MAX);
                    info!(tribunal = %tribunal, num_found = total, pages, "Result set sized");
                    pages.max(plan.start_page.max(1))
                }
                Err(e) => {
                    progress.status = if matches!(e, PageError::Cancelled) {
                        CrawlStatus::Paused
                    } else {
                        CrawlStatus::Failed
                    };
                    self.checkpoint(&mut progress).await;
                    return report.close(&progress, Some(format!("could not size result set: {}", e)));
                }
            },
        };
        report.end_page = Some(end);

        progress.last_completed_page = first - 1;
        if first > end {
            progress.status = CrawlStatus::Completed;
            self.checkpoint(&mut progress).await;
            return report.close(&progress, None);
        }

        progress.status = CrawlStatus::Running;
        self.checkpoint(&mut progress).await;
        println!("▶ {}: pages {}..={}", tribunal.name(), first, end);

        let worker = Worker {
            tribunal,
            date_from: plan.date_from,
            date_to: plan.date_to,
            limit: self.config.rows_per_page,
            order: self.config.search_order.clone(),
            request_pause: self.config.request_pause,
            broker: self.broker.clone(),
            fetcher: self.fetcher.clone(),
            mapper: Arc::new(RecordMapper::new(tribunal, self.metrics.clone())),
            dedup: self.dedup.clone(),
            sink: self.sink.clone(),
            metrics: self.metrics.clone(),
        };

        let mut state = PassState::new(first - 1);
        self.run_pass(&worker, first..=end, end, shutdown, &mut progress, &mut report, &mut state)
            .await;

        // Isolated failures get exactly one more go before the tribunal stops.
        if state.halted_reason.is_none() && !*shutdown.borrow() && !state.failed_pages.is_empty() {
            let retry: Vec<u32> = state.failed_pages.iter().copied().collect();
            info!(tribunal = %tribunal, pages = ?retry, "Retrying failed pages once");
            state.consecutive_failures = 0;
            self.run_pass(&worker, retry, end, shutdown, &mut progress, &mut report, &mut state)
                .await;
        }

        progress.last_completed_page = state.tracker.last_contiguous();
        progress.skipped_pages.sort_unstable();
        progress.skipped_pages.dedup();
        report.pages_failed = state.failed_pages.len();

        let reason = if let Some(reason) = state.halted_reason {
            progress.status = CrawlStatus::Failed;
            Some(reason)
        } else if progress.last_completed_page >= end {
            progress.status = CrawlStatus::Completed;
            None
        } else if *shutdown.borrow() {
            progress.status = CrawlStatus::Paused;
            Some("interrupted".to_string())
        } else {
            // Below the consecutive-failure threshold: resumable, not blocked.
            progress.status = CrawlStatus::Paused;
            Some(format!(
                "{} page(s) still failing after a retry pass, last: {}",
                state.failed_pages.len(),
                state.last_error.unwrap_or_else(|| "unknown".to_string())
            ))
        };
        self.checkpoint(&mut progress).await;

        if progress.status != CrawlStatus::Completed {
            warn!(
                tribunal = %tribunal,
                status = %progress.status,
                last_completed_page = progress.last_completed_page,
                resume_from = progress.next_page(),
                done_beyond_gap = state.tracker.pending_ahead(),
                "Tribunal stopped before the end of its range"
            );
        }
        report.close(&progress, reason)
    }

    /// Push `pages` through a fresh worker pool and fold every outcome into
    /// the tribunal's bookkeeping. Returns once workers and dispatcher are
    /// gone.
    #[allow(clippy::too_many_arguments)]
    async fn run_pass<I>(
        &self,
        worker: &Worker,
        pages: I,
        end: u32,
        shutdown: &watch::Receiver<bool>,
        progress: &mut CrawlProgress,
        report: &mut TribunalReport,
        state: &mut PassState,
    ) where
        I: IntoIterator<Item = u32>,
        I::IntoIter: Send + 'static,
    {
        let tribunal = worker.tribunal;
        let capacity = self.config.queue_capacity.max(1);
        let (page_tx, page_rx) = mpsc::channel::<u32>(capacity);
        let (result_tx, mut result_rx) = mpsc::channel::<PageOutcome>(capacity);
        let (halt_tx, halt_rx) = watch::channel(false);
        let backpressure = Arc::new(Semaphore::new(capacity));
        let queue = Arc::new(Mutex::new(page_rx));

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers_per_tribunal.max(1) {
            workers.spawn(worker.clone().run(
                id,
                queue.clone(),
                backpressure.clone(),
                result_tx.clone(),
                shutdown.clone(),
                halt_rx.clone(),
            ));
        }
        drop(result_tx);
        drop(queue);

        let dispatcher = tokio::spawn(dispatch(page_tx, pages.into_iter(), shutdown.clone(), halt_rx));
        let checkpoint_every = self.config.checkpoint_interval.max(1);

        while let Some(outcome) = result_rx.recv().await {
            let advanced = match outcome.result {
                PageResult::Done { inserted, failed } => {
                    state.consecutive_failures = 0;
                    state.failed_pages.remove(&outcome.page);
                    report.pages_done += 1;
                    report.records_ingested += inserted as u64;
                    report.records_failed += failed;
                    progress.total_records_ingested += inserted as u64;
                    state.tracker.complete(outcome.page)
                }
                PageResult::Skipped(reason) => {
                    warn!(tribunal = %tribunal, page = outcome.page, reason = %reason, "Page skipped");
                    state.failed_pages.remove(&outcome.page);
                    report.pages_skipped += 1;
                    progress.skipped_pages.push(outcome.page);
                    state.tracker.complete(outcome.page)
                }
                PageResult::Failed(reason) => {
                    state.consecutive_failures += 1;
                    state.failed_pages.insert(outcome.page);
                    warn!(
                        tribunal = %tribunal,
                        page = outcome.page,
                        consecutive = state.consecutive_failures,
                        threshold = self.config.max_consecutive_page_failures,
                        reason = %reason,
                        "Page failed"
                    );
                    if state.consecutive_failures >= self.config.max_consecutive_page_failures
                        && state.halted_reason.is_none()
                    {
                        error!(tribunal = %tribunal, failures = state.consecutive_failures, "Too many consecutive page failures, halting tribunal");
                        state.halted_reason = Some(format!(
                            "{} consecutive page failures, last: {}",
                            state.consecutive_failures, reason
                        ));
                        let _ = halt_tx.send(true);
                    }
                    state.last_error = Some(reason);
                    false
                }
                PageResult::Cancelled => false,
            };

            if advanced && state.tracker.last_contiguous() >= progress.last_completed_page + checkpoint_every {
                progress.last_completed_page = state.tracker.last_contiguous();
                self.checkpoint(progress).await;
                println!(
                    "  {} · page {}/{} · {} records",
                    tribunal.name(),
                    progress.last_completed_page,
                    end,
                    progress.total_records_ingested
                );
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(tribunal = %tribunal, error = %e, "Worker task died");
            }
        }
        if let Err(e) = dispatcher.await {
            error!(tribunal = %tribunal, error = %e, "Dispatcher task died");
        }
    }

    async fn checkpoint(&self, progress: &mut CrawlProgress) {
        if let Err(e) = self.progress.save(progress).await {
            error!(tribunal = %progress.tribunal, error = %e, "Could not write checkpoint");
        }
    }
}

/// Live `numFound` per tribunal. A failed lookup is reported as such;
/// nothing is ever estimated.
pub async fn live_totals(
    config: &Config,
    metrics: Arc<MetricsCollector>,
    tribunals: &[Tribunal],
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<(Tribunal, Result<u64, PageError>)> {
    let broker = SessionBroker::new(config, metrics.clone());
    let fetcher = PageFetcher::new(config, metrics);
    let mut totals = Vec::with_capacity(tribunals.len());
    for &tribunal in tribunals {
        let total = upstream_total(config, &broker, &fetcher, tribunal, date_from, date_to, shutdown).await;
        if let Err(e) = &total {
            warn!(tribunal = %tribunal, error = %e, "Live total unavailable");
        }
        totals.push((tribunal, total));
    }
    totals
}

async fn upstream_total(
    config: &Config,
    broker: &SessionBroker,
    fetcher: &PageFetcher,
    tribunal: Tribunal,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    shutdown: &watch::Receiver<bool>,
) -> Result<u64, PageError> {
    let mut session = broker.acquire(tribunal).await?;
    let request = PageRequest::for_page(tribunal, date_from, date_to, 1, config.rows_per_page, &config.search_order);
    fetcher.fetch_total(broker, &mut session, &request, shutdown).await
}

/// Where one tribunal's passes stand.
struct PassState {
    tracker: PageTracker,
    /// Pages whose last attempt failed. A later success clears them.
    failed_pages: BTreeSet<u32>,
    consecutive_failures: u32,
    halted_reason: Option<String>,
    last_error: Option<String>,
}

impl PassState {
    fn new(last_completed: u32) -> Self {
        Self {
            tracker: PageTracker::new(last_completed),
            failed_pages: BTreeSet::new(),
            consecutive_failures: 0,
            halted_reason: None,
            last_error: None,
        }
    }
}

/// Feed pages into the bounded queue until they run out or someone says
/// stop.
async fn dispatch(
    queue: mpsc::Sender<u32>,
    pages: impl Iterator<Item = u32>,
    mut shutdown: watch::Receiver<bool>,
    mut halt: watch::Receiver<bool>,
) {
    for page in pages {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = halt.wait_for(|stop| *stop) => break,
            sent = queue.send(page) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

#[derive(Clone)]
struct Worker {
    tribunal: Tribunal,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    limit: u32,
    order: String,
    request_pause: Duration,
    broker: Arc<SessionBroker>,
    fetcher: Arc<PageFetcher>,
    mapper: Arc<RecordMapper>,
    dedup: Arc<Deduplicator>,
    sink: Arc<BatchSink>,
    metrics: Arc<MetricsCollector>,
}

impl Worker {
    async fn run(
        self,
        id: usize,
        queue: Arc<Mutex<mpsc::Receiver<u32>>>,
        backpressure: Arc<Semaphore>,
        results: mpsc::Sender<PageOutcome>,
        mut shutdown: watch::Receiver<bool>,
        halt: watch::Receiver<bool>,
    ) {
        let mut session: Option<SessionHandle> = None;

        loop {
            if *shutdown.borrow() || *halt.borrow() {
                break;
            }
            let next = queue.lock().await.recv().await;
            let Some(page) = next else { break };
            // A page pulled after a stop request stays unprocessed for the next run.
            if *shutdown.borrow() || *halt.borrow() {
                break;
            }

            let Ok(permit) = backpressure.clone().acquire_owned().await else { break };
            let result = self.process(page, &mut session, &shutdown).await;
            drop(permit);

            if results.send(PageOutcome { page, result }).await.is_err() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.request_pause) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        info!(tribunal = %self.tribunal, worker = id, "Worker finished");
    }

    async fn process(&self, page: u32, session: &mut Option<SessionHandle>, shutdown: &watch::Receiver<bool>) -> PageResult {
        if session.is_none() {
            match self.broker.acquire(self.tribunal).await {
                Ok(handle) => *session = Some(handle),
                Err(e) => {
                    self.metrics.increment_pages_failed();
                    return PageResult::Failed(format!("session: {}", e));
                }
            }
        }
        let Some(handle) = session.as_mut() else {
            return PageResult::Failed("no session".to_string());
        };

        let request = PageRequest::for_page(self.tribunal, self.date_from, self.date_to, page, self.limit, &self.order);
        let fetched = self.fetcher.fetch_with_retry(&self.broker, handle, &request, shutdown).await;
        match fetched {
            Ok(found) => {
                self.metrics.add_page_fetched(found.rows.len());
                self.metrics.page_in_flight();

                let records = self.mapper.map_page(&found.rows);
                let fresh = self.dedup.filter_new(records).await;
                let written = self.sink.write(self.tribunal, &fresh).await;

                self.metrics.page_landed();
                PageResult::Done {
                    inserted: written.inserted,
                    failed: written.failed.len(),
                }
            }
            Err(PageError::Cancelled) => PageResult::Cancelled,
            Err(e) if e.is_skip() => {
                self.metrics.increment_pages_skipped();
                PageResult::Skipped(e.to_string())
            }
            Err(e) => {
                if matches!(e, PageError::Auth(_)) {
                    *session = None;
                }
                self.metrics.increment_pages_failed();
                PageResult::Failed(e.to_string())
            }
        }
    }
}
