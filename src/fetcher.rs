// =============================================================================
// fetcher.rs: ONE PAGE AT A TIME, AND NO MORE ATTEMPTS THAN WE PROMISED
// =============================================================================
//
// The PageFetcher issues the search POST for a single page and turns whatever
// comes back into either rows or a classified FetchError:
//
//   419 / 429          -> RateLimited   (back off, same page)
//   401 / 403          -> AuthRejected  (refresh session, same page)
//   5xx, I/O, bad JSON -> Transient     (exponential backoff, same page)
//   other 4xx          -> Permanent     (skip the page, log it)
//
// `fetch` is a single request and holds no state between calls.
// `fetch_with_retry` wraps it in the bounded retry loop: `max_attempts`
// counts every upstream request for the page, the first one included.
// When the loop runs out, the last error goes back to the caller and the
// coordinator decides what that means for the tribunal.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::REFERER;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{FetchError, PageError};
use crate::metrics::MetricsCollector;
use crate::models::{PageRequest, SearchPage, SearchResponse};
use crate::session::{SessionBroker, SessionHandle};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.fetch_max_attempts.max(1),
            base_delay: config.fetch_backoff_base,
            max_delay: config.fetch_backoff_max,
        }
    }

    /// Delay after the given failed attempt (1-based): base * 2^(attempt-1),
    /// capped at max.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub struct PageFetcher {
    search_url: String,
    base_url: String,
    policy: RetryPolicy,
    metrics: Arc<MetricsCollector>,
}

impl PageFetcher {
    pub fn new(config: &Config, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            search_url: format!("{}/busqueda/buscar_sentencias", config.upstream_base_url),
            base_url: config.upstream_base_url.clone(),
            policy: RetryPolicy::from_config(config),
            metrics,
        }
    }

    /// Issue exactly one search request.
    pub async fn fetch(
        &self,
        session: &mut SessionHandle,
        request: &PageRequest,
    ) -> Result<SearchPage, FetchError> {
        let tribunal = request.tribunal;
        let form = [
            ("_token", session.token().to_string()),
            ("id_buscador", tribunal.search_id().to_string()),
            ("filtros", request.filters_json()),
            ("numero_filas_paginacion", request.limit.to_string()),
            ("offset_paginacion", request.offset.to_string()),
            ("orden", request.order.clone()),
        ];

        session.record_request();
        let response = session
            .client()
            .post(&self.search_url)
            .header("X-CSRF-TOKEN", session.token())
            .header("X-Requested-With", "XMLHttpRequest")
            .header("busqueda", tribunal.search_header_token())
            .header(REFERER, format!("{}/busqueda?{}", self.base_url, tribunal.slug()))
            .form(&form)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(format!("reading body: {}", e)))?;

        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16(), truncate(&body, 200)));
        }

        let parsed: SearchResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Transient(format!("malformed search response: {}", e)))?;

        match parsed.response {
            Some(inner) => match inner.num_found {
                Some(num_found) => Ok(SearchPage {
                    num_found,
                    rows: inner.docs,
                }),
                None => Err(FetchError::Transient("search response without numFound".to_string())),
            },
            None => Err(FetchError::Transient("search response without 'response' object".to_string())),
        }
    }

    /// Fetch a page, retrying retryable failures up to the policy's attempt
    /// budget. Auth rejections refresh the session before the next attempt;
    /// rate limits and transient failures sleep first. A shutdown signal
    /// during a backoff sleep abandons the page.
    pub async fn fetch_with_retry(
        &self,
        broker: &SessionBroker,
        session: &mut SessionHandle,
        request: &PageRequest,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<SearchPage, PageError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            broker.ensure_fresh(session).await?;

            let err = match self.fetch(session, request).await {
                Ok(page) => return Ok(page),
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(
                    tribunal = %request.tribunal,
                    offset = request.offset,
                    error = %err,
                    "Permanent upstream error: page will be skipped"
                );
                return Err(err.into());
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    tribunal = %request.tribunal,
                    offset = request.offset,
                    attempts = attempt,
                    error = %err,
                    "Giving up on page after exhausting retries"
                );
                return Err(err.into());
            }

            self.metrics.increment_fetch_retries();

            match err {
                FetchError::AuthRejected { status } => {
                    debug!(tribunal = %request.tribunal, status, "Session rejected: refreshing before retry");
                    broker.refresh(session).await?;
                }
                _ => {
                    let delay = self.policy.delay_after(attempt);
                    debug!(
                        tribunal = %request.tribunal,
                        offset = request.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying page after backoff"
                    );
                    let mut stop = shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.wait_for(|stopping| *stopping) => return Err(PageError::Cancelled),
                    }
                }
            }
        }
    }

    /// Ask the upstream how many results a tribunal has for the request's
    /// filters, using a one-row page.
    pub async fn fetch_total(
        &self,
        broker: &SessionBroker,
        session: &mut SessionHandle,
        request: &PageRequest,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<u64, PageError> {
        let sizing = PageRequest {
            offset: 0,
            limit: 1,
            ..request.clone()
        };
        self.fetch_with_retry(broker, session, &sizing, shutdown)
            .await
            .map(|page| page.num_found)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
