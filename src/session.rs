// =============================================================================
// session.rs: GETTING PAST THE FRONT DESK
// =============================================================================
//
// The search endpoint won't talk to strangers. Before the first POST we need:
//
// 1. A CSRF token, handed out in a <meta name="csrf-token"> tag on the
//    landing page (older page versions hide it in an <input name="_token">).
// 2. A cookie jar that has visited `/busqueda?{tribunal}`, which is how the
//    site learns which search form we're pretending to have open.
//
// A SessionHandle bundles the token with its own reqwest client and cookie
// jar. Workers never share a handle. When the upstream rejects a session, or
// the handle has been used for too many requests, the broker runs the same
// two steps again and swaps the token and jar in place.
//
// The broker never guesses staleness. It reacts to the request counter and to
// explicit rejections, nothing else.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AuthError;
use crate::metrics::MetricsCollector;
use crate::models::Tribunal;

/// A CSRF token plus the cookie-bearing client it belongs to.
/// Owned by exactly one worker at a time.
pub struct SessionHandle {
    tribunal: Tribunal,
    client: reqwest::Client,
    token: String,
    requests: u32,
    generation: u32,
}

impl SessionHandle {
    pub fn tribunal(&self) -> Tribunal {
        self.tribunal
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Number of searches issued with the current token.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    /// How many times this handle has been (re)established. Starts at 1.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn record_request(&mut self) {
        self.requests += 1;
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("tribunal", &self.tribunal)
            .field("requests", &self.requests)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Acquires and refreshes sessions against the upstream site.
pub struct SessionBroker {
    base_url: String,
    user_agent: String,
    request_timeout: Duration,
    session_timeout: Duration,
    max_requests: u32,
    metrics: Arc<MetricsCollector>,
}

impl SessionBroker {
    pub fn new(config: &Config, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            base_url: config.upstream_base_url.clone(),
            user_agent: config.user_agent.clone(),
            request_timeout: config.request_timeout,
            session_timeout: config.session_timeout,
            max_requests: config.session_max_requests.max(1),
            metrics,
        }
    }

    /// Run the token + context sequence and hand back a fresh session.
    /// Fails with `AuthError` if the token can't be read within the session
    /// timeout.
    pub async fn acquire(&self, tribunal: Tribunal) -> Result<SessionHandle, AuthError> {
        let (client, token) = self.establish(tribunal).await?;
        self.metrics.increment_sessions_acquired();
        info!(tribunal = %tribunal, "Session established");
        Ok(SessionHandle {
            tribunal,
            client,
            token,
            requests: 0,
            generation: 1,
        })
    }

    /// Re-run the sequence and replace token and cookie jar in place. On
    /// failure the old handle is left untouched.
    pub async fn refresh(&self, handle: &mut SessionHandle) -> Result<(), AuthError> {
        let (client, token) = self.establish(handle.tribunal).await?;
        handle.client = client;
        handle.token = token;
        handle.requests = 0;
        handle.generation += 1;
        self.metrics.increment_session_refreshes();
        info!(
            tribunal = %handle.tribunal,
            generation = handle.generation,
            "Session refreshed"
        );
        Ok(())
    }

    /// Refresh the handle if it has used up its request allowance.
    pub async fn ensure_fresh(&self, handle: &mut SessionHandle) -> Result<(), AuthError> {
        if handle.requests >= self.max_requests {
            debug!(
                tribunal = %handle.tribunal,
                requests = handle.requests,
                "Session request allowance used up: refreshing"
            );
            self.refresh(handle).await?;
        }
        Ok(())
    }

    async fn establish(&self, tribunal: Tribunal) -> Result<(reqwest::Client, String), AuthError> {
        match tokio::time::timeout(self.session_timeout, self.run_sequence(tribunal)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tribunal = %tribunal, timeout = ?self.session_timeout, "Session acquisition timed out");
                Err(AuthError::Timeout(self.session_timeout))
            }
        }
    }

    async fn run_sequence(&self, tribunal: Tribunal) -> Result<(reqwest::Client, String), AuthError> {
        let client = self.build_client()?;

        // Step 1: landing page, token
        let landing = client
            .get(format!("{}/busqueda/lista_buscadores", self.base_url))
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        let status = landing.status();
        if !status.is_success() {
            return Err(AuthError::Status(status.as_u16()));
        }
        let body = landing
            .text()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        let token = parse_csrf_token(&body).ok_or(AuthError::TokenMissing)?;

        // Step 2: tribunal context on the cookie jar
        let context = client
            .get(format!("{}/busqueda?{}", self.base_url, tribunal.slug()))
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;
        if !context.status().is_success() {
            return Err(AuthError::Context {
                slug: tribunal.slug(),
                status: context.status().as_u16(),
            });
        }

        Ok((client, token))
    }

    fn build_client(&self) -> Result<reqwest::Client, AuthError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/html, */*; q=0.01"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("es-ES,es;q=0.9,en;q=0.8"));

        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(self.request_timeout)
            .user_agent(self.user_agent.as_str())
            .default_headers(headers)
            .build()
            .map_err(|e| AuthError::Client(e.to_string()))
    }
}

/// Pull the CSRF token out of the landing page HTML.
pub fn parse_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    let candidates = [
        ("meta[name=\"csrf-token\"]", "content"),
        ("input[name=\"_token\"]", "value"),
    ];

    candidates.iter().find_map(|(selector, attribute)| {
        let selector = Selector::parse(selector).ok()?;
        document
            .select(&selector)
            .filter_map(|element| element.value().attr(attribute))
            .map(str::trim)
            .find(|token| !token.is_empty())
            .map(str::to_string)
    })
}
