//! Resilient outbound HTTP for internet fetches.
//!
//! Never used for the note backend (see `siyuan::client`). Redirects are
//! followed by hand in a bounded loop, retries use linear backoff, and the
//! body is streamed so an oversized response is cut off mid-transfer.

use std::error::Error as _;
use std::io;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::url_guard::{check_public_url, UrlPolicyError};
use crate::config::RemoteBudget;

/// HTTP statuses worth another attempt.
pub const RETRYABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

pub const DEFAULT_MAX_REDIRECTS: u32 = 4;

/// Extra bytes tolerated past `max_bytes` before the stream is aborted, so the
/// validator can still report the real post-decompression size.
pub const DEFAULT_HEADROOM: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {url} timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },
    #[error("network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        retryable: bool,
    },
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("too many redirects (limit {limit}) fetching {url}")]
    TooManyRedirects { url: String, limit: u32 },
    #[error("invalid redirect from {url}: {reason}")]
    BadRedirect { url: String, reason: String },
    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
    #[error("redirect target rejected: {0}")]
    Blocked(#[from] UrlPolicyError),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Network { retryable, .. } => *retryable,
            FetchError::Status { status, .. } => RETRYABLE_STATUSES.contains(status),
            _ => false,
        }
    }
}

/// Per-call knobs. Each use case builds its own budget.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub body: Option<Vec<u8>>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub max_redirects: u32,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub max_bytes: Option<u64>,
    pub headroom: u64,
    /// Run every redirect target through the public-URL policy.
    pub guard_redirects: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: Vec::new(),
            timeout: Duration::from_secs(15),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_retries: 2,
            retry_base: Duration::from_millis(400),
            max_bytes: None,
            headroom: DEFAULT_HEADROOM,
            guard_redirects: true,
        }
    }
}

impl FetchOptions {
    pub fn from_budget(budget: &RemoteBudget) -> Self {
        Self {
            timeout: budget.timeout,
            max_retries: budget.max_retries,
            retry_base: budget.retry_base,
            ..Self::default()
        }
    }

    pub fn post(mut self, body: Vec<u8>) -> Self {
        self.method = Method::POST;
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn max_bytes(mut self, max: u64) -> Self {
        self.max_bytes = Some(max);
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A completed, fully buffered response. Never persisted.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    /// Case-insensitive, multi-valued.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub final_url: Url,
}

impl FetchResult {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Shared outbound client.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    user_agent: String,
}

impl Fetcher {
    pub fn new(user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }

    /// Fetch `url`, retrying transient failures with `retry_base * attempt`
    /// backoff. Any non-2xx final status is an error.
    pub async fn fetch(&self, url: &str, opts: &FetchOptions) -> Result<FetchResult, FetchError> {
        let start = Url::parse(url.trim()).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut attempt: u32 = 0;
        loop {
            let outcome = match tokio::time::timeout(opts.timeout, self.fetch_once(&start, opts))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout {
                    url: start.to_string(),
                    timeout_ms: opts.timeout.as_millis() as u64,
                }),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < opts.max_retries => {
                    attempt += 1;
                    let delay = opts.retry_base * attempt;
                    warn!(
                        url = %start,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying fetch: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn fetch_once(&self, start: &Url, opts: &FetchOptions) -> Result<FetchResult, FetchError> {
        let mut current = start.clone();
        let mut method = opts.method.clone();
        let mut body = opts.body.clone();
        let mut redirects_left = opts.max_redirects;

        loop {
            let mut req = self
                .client
                .request(method.clone(), current.clone())
                .header(USER_AGENT, &self.user_agent);
            for (name, value) in &opts.headers {
                if let (Ok(n), Ok(v)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    req = req.header(n, v);
                }
            }
            if let Some(ref b) = body {
                req = req.body(b.clone());
            }

            let resp = req.send().await.map_err(|e| classify(&current, &e))?;
            let status = resp.status();

            if status.is_redirection() {
                if let Some(location) = resp.headers().get(LOCATION) {
                    if redirects_left == 0 {
                        return Err(FetchError::TooManyRedirects {
                            url: start.to_string(),
                            limit: opts.max_redirects,
                        });
                    }
                    redirects_left -= 1;

                    let next = location
                        .to_str()
                        .map_err(|e| e.to_string())
                        .and_then(|loc| current.join(loc).map_err(|e| e.to_string()))
                        .map_err(|reason| FetchError::BadRedirect {
                            url: current.to_string(),
                            reason,
                        })?;
                    if opts.guard_redirects {
                        check_public_url(&next)?;
                    }
                    if status == StatusCode::SEE_OTHER {
                        method = Method::GET;
                        body = None;
                    }
                    debug!(from = %current, to = %next, status = status.as_u16(), "Following redirect");
                    current = next;
                    continue;
                }
            }

            if !status.is_success() {
                return Err(FetchError::Status {
                    url: current.to_string(),
                    status: status.as_u16(),
                });
            }

            let headers = resp.headers().clone();
            let limit = opts.max_bytes.map(|m| m.saturating_add(opts.headroom));
            if let (Some(limit), Some(declared)) = (limit, resp.content_length()) {
                if declared > limit {
                    return Err(FetchError::TooLarge {
                        url: current.to_string(),
                        limit,
                    });
                }
            }

            let mut buf: Vec<u8> = Vec::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| classify(&current, &e))?;
                buf.extend_from_slice(&chunk);
                if let Some(limit) = limit {
                    if buf.len() as u64 > limit {
                        // Dropping the stream tears the connection down.
                        return Err(FetchError::TooLarge {
                            url: current.to_string(),
                            limit,
                        });
                    }
                }
            }

            return Ok(FetchResult {
                status: status.as_u16(),
                headers,
                body: buf,
                final_url: current,
            });
        }
    }
}

fn classify(url: &Url, err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout {
            url: url.to_string(),
            timeout_ms: 0,
        };
    }
    let message = error_chain(err);
    let retryable =
        has_retryable_io_kind(err) || (err.is_connect() && connect_failure_is_transient(&message));
    FetchError::Network {
        url: url.to_string(),
        message,
        retryable,
    }
}

/// A failed name lookup only counts as transient when the resolver says so
/// (`EAI_AGAIN`). Every other connect failure is worth another attempt.
fn connect_failure_is_transient(chain: &str) -> bool {
    let chain = chain.to_ascii_lowercase();
    let resolve_failed = chain.contains("dns error") || chain.contains("failed to lookup address");
    if !resolve_failed {
        return true;
    }
    chain.contains("temporary failure in name resolution") || chain.contains("try again")
}

/// Socket-level failures that are plausibly transient.
fn has_retryable_io_kind(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            );
        }
        source = e.source();
    }
    false
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        parts.push(e.to_string());
        source = e.source();
    }
    parts.join(": ")
}
