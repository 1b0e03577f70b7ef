//      ██╗██╗   ██╗██████╗ ██╗███████╗
//      ██║██║   ██║██╔══██╗██║██╔════╝
//      ██║██║   ██║██████╔╝██║███████╗
// ██   ██║██║   ██║██╔══██╗██║╚════██║
// ╚█████╔╝╚██████╔╝██║  ██║██║███████║
//  ╚════╝  ╚═════╝ ╚═╝  ╚═╝╚═╝╚══════╝
//
// I N G E S T   E N G I N E
//
// Pages through the Chilean judiciary's jurisprudence search, one tribunal at
// a time, and upserts every sentence it can make sense of into a
// PostgREST-backed table. Resumable, polite, and never writes a key twice.

mod circuit_breaker;
mod config;
mod coordinator;
mod dedup;
mod error;
mod failure_log;
mod fetcher;
mod mapper;
mod metrics;
mod models;
mod progress;
mod session;
mod sink;
mod text_scanner;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::coordinator::{live_totals, CrawlCoordinator, CrawlPlan};
use crate::metrics::MetricsCollector;
use crate::models::Tribunal;
use crate::progress::CrawlStatus;
use crate::sink::{BatchSink, RecordStore, RestStore};

const USAGE: &str = "\
usage:
  juris_ingest_engine crawl <fecha_desde> <fecha_hasta> [tribunal ...]
  juris_ingest_engine totals [<fecha_desde> <fecha_hasta>]
  juris_ingest_engine count
  juris_ingest_engine replay

dates are YYYY-MM-DD; no tribunals means all seven:
  suprema apelaciones laborales penales familia civiles cobranza";

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════════╗
    ║                                                              ║
    ║      ⚖  J U R I S   I N G E S T   E N G I N E  ⚖             ║
    ║                                                              ║
    ║   Source:     juris.pjud.cl (7 tribunals)                    ║
    ║   Sessions:   one cookie jar + CSRF token per worker         ║
    ║   Dedup:      Bloom filter + exact set + LRU                 ║
    ║   Sink:       PostgREST upsert on (tribunal, rol, era)       ║
    ║   Resilience: backoff, circuit breaker, replayable log       ║
    ║                                                              ║
    ╚══════════════════════════════════════════════════════════════╝
    "#;
    println!("{}", banner);
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Crawl {
        date_from: NaiveDate,
        date_to: NaiveDate,
        tribunals: Vec<Tribunal>,
    },
    Totals {
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    },
    Count,
    Replay,
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let Some((name, rest)) = args.split_first() else {
            bail!("missing command\n\n{}", USAGE);
        };
        match (name.as_str(), rest) {
            ("crawl", [from, to, tribunals @ ..]) => {
                let (date_from, date_to) = parse_range(from, to)?;
                let tribunals = if tribunals.is_empty() {
                    Tribunal::ALL.to_vec()
                } else {
                    tribunals
                        .iter()
                        .map(|t| t.parse::<Tribunal>().map_err(anyhow::Error::msg))
                        .collect::<Result<Vec<_>>>()?
                };
                Ok(Command::Crawl {
                    date_from,
                    date_to,
                    tribunals,
                })
            }
            ("totals", []) => Ok(Command::Totals {
                date_from: None,
                date_to: None,
            }),
            ("totals", [from, to]) => {
                let (date_from, date_to) = parse_range(from, to)?;
                Ok(Command::Totals {
                    date_from: Some(date_from),
                    date_to: Some(date_to),
                })
            }
            ("count", []) => Ok(Command::Count),
            ("replay", []) => Ok(Command::Replay),
            _ => bail!("unrecognised arguments: {}\n\n{}", args.join(" "), USAGE),
        }
    }
}

fn parse_range(from: &str, to: &str) -> Result<(NaiveDate, NaiveDate)> {
    let date_from = NaiveDate::parse_from_str(from, "%Y-%m-%d").with_context(|| format!("bad fecha_desde '{}'", from))?;
    let date_to = NaiveDate::parse_from_str(to, "%Y-%m-%d").with_context(|| format!("bad fecha_hasta '{}'", to))?;
    if date_from > date_to {
        bail!("fecha_desde {} is after fecha_hasta {}", date_from, date_to);
    }
    Ok((date_from, date_to))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("JURIS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        fmt().with_env_filter(filter).json().with_target(true).with_thread_names(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let config = Config::from_env();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };

    match run(Arc::new(config), command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("❌ {:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Runs one command. `Ok(false)` means it ran but did not fully succeed.
async fn run(config: Arc<Config>, command: Command) -> Result<bool> {
    let metrics = Arc::new(MetricsCollector::new());

    // The sender lives as long as the run; receivers treat a dropped sender
    // as a stop request.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("🛑 Interrupt received, finishing in-flight pages and pausing");
                let _ = signal_tx.send(true);
            }
            Err(e) => error!("Signal listener error: {}", e),
        }
    });

    let metrics_handle = if config.metrics_port == 0 {
        None
    } else {
        match metrics::bind_metrics_listener(config.metrics_port).await {
            Ok(listener) => Some(tokio::spawn(metrics::serve_metrics(listener, metrics.clone(), shutdown_rx.clone()))),
            Err(e) => {
                error!(port = config.metrics_port, error = %e, "Could not bind metrics endpoint, continuing without it");
                None
            }
        }
    };

    let outcome = match command {
        Command::Crawl {
            date_from,
            date_to,
            tribunals,
        } => crawl(&config, metrics.clone(), CrawlPlan::for_dates(tribunals, date_from, date_to), shutdown_rx).await,
        Command::Totals { date_from, date_to } => totals(&config, metrics.clone(), date_from, date_to, &shutdown_rx).await,
        Command::Count => count(&config).await,
        Command::Replay => replay(&config, metrics.clone()).await,
    };

    let snapshot = metrics.snapshot();
    info!(
        pages_fetched = snapshot.pages_fetched,
        rows_dropped = snapshot.rows_dropped,
        duplicates_filtered = snapshot.duplicates_filtered,
        records_inserted = snapshot.records_inserted,
        records_failed = snapshot.records_failed,
        fetch_retries = snapshot.fetch_retries,
        max_in_flight_pages = snapshot.max_in_flight_pages,
        "Run metrics"
    );

    if let Some(handle) = metrics_handle {
        let _ = shutdown_tx.send(true);
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    outcome
}

async fn crawl(config: &Arc<Config>, metrics: Arc<MetricsCollector>, plan: CrawlPlan, shutdown: watch::Receiver<bool>) -> Result<bool> {
    config.validate().context("crawl needs the store configured")?;
    print_banner();

    let store: Arc<dyn RecordStore> = Arc::new(RestStore::from_config(config)?);
    let coordinator = CrawlCoordinator::new(config.clone(), store, metrics)?;

    info!(
        tribunals = plan.tribunals.len(),
        from = ?plan.date_from,
        to = ?plan.date_to,
        workers = config.workers_per_tribunal,
        queue_capacity = config.queue_capacity,
        "🚀 Crawl starting"
    );

    let reports = coordinator.run(&plan, shutdown).await;

    let dedup = coordinator.dedup_snapshot();
    let breaker = coordinator.breaker_snapshot();
    info!(
        checked = dedup.checked,
        reserved = dedup.reserved,
        already_reserved = dedup.already_reserved,
        known_remote = dedup.known_remote,
        remote_lookups = dedup.remote_lookups,
        breaker_state = %breaker.state,
        breaker_trips = breaker.total_trips,
        "Crawl finished"
    );

    println!();
    println!("══════════════════════════ SUMMARY ══════════════════════════");
    for report in &reports {
        println!("{}", report);
        if report.status != CrawlStatus::Completed {
            println!("    resume from page {}", report.last_completed_page + 1);
        }
    }
    let ingested: u64 = reports.iter().map(|r| r.records_ingested).sum();
    println!("records ingested this run: {}", ingested);

    Ok(reports.iter().all(|r| r.status == CrawlStatus::Completed))
}

async fn totals(
    config: &Config,
    metrics: Arc<MetricsCollector>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    shutdown: &watch::Receiver<bool>,
) -> Result<bool> {
    config.validate_crawl()?;
    let totals = live_totals(config, metrics, &Tribunal::ALL, date_from, date_to, shutdown).await;

    let mut sum = 0u64;
    let mut all_ok = true;
    for (tribunal, total) in &totals {
        match total {
            Ok(n) => {
                sum += n;
                println!("{:<24} {:>10}", tribunal.name(), n);
            }
            Err(e) => {
                all_ok = false;
                println!("{:<24} FAILED ({})", tribunal.name(), e);
            }
        }
    }
    println!("{:<24} {:>10}", "total", sum);
    Ok(all_ok)
}

async fn count(config: &Config) -> Result<bool> {
    config.validate()?;
    let store = RestStore::from_config(config)?;

    let mut all_ok = true;
    for tribunal in Tribunal::ALL {
        match store.count(tribunal).await {
            Ok(n) => println!("{:<24} {:>10}", tribunal.name(), n),
            Err(e) => {
                all_ok = false;
                println!("{:<24} FAILED ({})", tribunal.name(), e);
            }
        }
    }
    Ok(all_ok)
}

async fn replay(config: &Config, metrics: Arc<MetricsCollector>) -> Result<bool> {
    config.validate()?;
    let store: Arc<dyn RecordStore> = Arc::new(RestStore::from_config(config)?);
    let sink = BatchSink::new(store, config, metrics);

    let report = sink
        .replay()
        .await
        .with_context(|| format!("replaying {}", config.failure_log_path.display()))?;
    println!(
        "replayed {} entries: {} records recovered, {} entries still failing, {} unreadable lines kept",
        report.entries, report.recovered_records, report.remaining_entries, report.unreadable_lines
    );
    Ok(report.remaining_entries == 0 && report.unreadable_lines == 0)
}
