//! Typed wrapper over the SiYuan kernel HTTP API.
//!
//! Every endpoint is `POST` with a JSON body and answers with the envelope
//! `{code, msg, data}`. Two failure classes are kept apart: the backend could
//! not be reached or answered with a non-2xx status (transport), or it was
//! reached and refused the operation with `code != 0` (application).

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use super::multipart::MultipartBody;

/// Directory the backend stores uploaded assets under.
pub const ASSETS_DIR_PATH: &str = "/assets/";

const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("SiYuan backend unreachable at {url}: {message}")]
    Transport { url: String, message: String },
    #[error("SiYuan backend HTTP {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("invalid SiYuan response from {path}: {reason}")]
    InvalidResponse { path: String, reason: String },
    #[error("{msg}")]
    Api { path: String, code: i64, msg: String },
}

impl BackendError {
    /// The backend could not be talked to at all, or answered at HTTP level
    /// with a failure.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, BackendError::Transport { .. } | BackendError::Status { .. })
    }

    /// The backend processed the call and rejected it.
    pub fn is_rejected(&self) -> bool {
        matches!(self, BackendError::Api { .. })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone)]
pub struct SiyuanClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl SiyuanClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| BackendError::Transport {
                url: base_url.to_string(),
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST a JSON body and unwrap the envelope's `data`.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, BackendError> {
        let payload = serde_json::to_vec(body).map_err(|e| BackendError::InvalidResponse {
            path: path.to_string(),
            reason: format!("could not encode request: {}", e),
        })?;
        self.post_bytes(path, "application/json", payload).await
    }

    /// Run a SQL statement through `/api/query/sql` and return the rows.
    pub async fn sql(&self, stmt: &str) -> Result<Vec<Value>, BackendError> {
        let data = self.post("/api/query/sql", &json!({ "stmt": stmt })).await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    /// Upload one file to the asset store. Returns the raw `data` object
    /// (`{errFiles, succMap}`).
    pub async fn upload_asset(
        &self,
        file_name: &str,
        mime: &str,
        bytes: &[u8],
    ) -> Result<Value, BackendError> {
        let (content_type, body) = MultipartBody::new()
            .text("assetsDirPath", ASSETS_DIR_PATH)
            .file("file[]", file_name, mime, bytes)
            .finish();
        self.post_bytes("/api/asset/upload", &content_type, body).await
    }

    async fn post_bytes(
        &self,
        path: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(path, bytes = body.len(), "SiYuan request");

        let mut req = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(body);
        if !self.token.is_empty() {
            req = req.header(AUTHORIZATION, format!("Token {}", self.token));
        }

        let response = req.send().await.map_err(|e| BackendError::Transport {
            url: url.clone(),
            message: if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                "cannot connect, is SiYuan running?".to_string()
            } else {
                e.to_string()
            },
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| BackendError::Transport {
            url: url.clone(),
            message: format!("failed to read response: {}", e),
        })?;

        if !status.is_success() {
            return Err(BackendError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: excerpt(&text, 200),
            });
        }

        let envelope: Envelope =
            serde_json::from_str(&text).map_err(|e| BackendError::InvalidResponse {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        if envelope.code != 0 {
            let msg = if envelope.msg.is_empty() {
                format!("SiYuan error code={}", envelope.code)
            } else {
                envelope.msg
            };
            return Err(BackendError::Api {
                path: path.to_string(),
                code: envelope.code,
                msg,
            });
        }

        Ok(envelope.data)
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
