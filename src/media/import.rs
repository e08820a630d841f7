//! Image import pipeline: URL policy -> fetch -> validate -> hash -> upload.

use chrono::Local;
use reqwest::header::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::validate::{validate_image, ValidatedImage, ValidationError};
use super::ImageAsset;
use crate::config::RemoteBudget;
use crate::net::{validate_public_url, FetchError, FetchOptions, Fetcher, UrlPolicyError};
use crate::siyuan::client::ASSETS_DIR_PATH;
use crate::siyuan::{BackendError, SiyuanClient};

const MAX_STEM_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Policy(#[from] UrlPolicyError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("asset upload failed: {0}")]
    Backend(#[from] BackendError),
    #[error("asset upload rejected: {0}")]
    Upload(String),
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Explicit file name; its extension is replaced by the validated one.
    pub file_name: Option<String>,
    /// Fetch and validate only; never upload.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ImagePipeline {
    fetcher: Fetcher,
    backend: SiyuanClient,
    max_bytes: u64,
    budget: RemoteBudget,
}

impl ImagePipeline {
    pub fn new(fetcher: Fetcher, backend: SiyuanClient, max_bytes: u64, budget: RemoteBudget) -> Self {
        Self {
            fetcher,
            backend,
            max_bytes,
            budget,
        }
    }

    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    pub fn backend(&self) -> &SiyuanClient {
        &self.backend
    }

    pub fn budget(&self) -> &RemoteBudget {
        &self.budget
    }

    /// Download a public image URL and store it as an asset.
    pub async fn import_image_from_url(
        &self,
        raw_url: &str,
        opts: &ImportOptions,
    ) -> Result<ImageAsset, ImportError> {
        let url = validate_public_url(raw_url)?;
        let fetch_opts = FetchOptions::from_budget(&self.budget)
            .max_bytes(self.max_bytes)
            .header("Accept", "image/avif,image/webp,image/png,image/*;q=0.9,*/*;q=0.5")
            .header("Accept-Encoding", "gzip, deflate, br");

        let fetched = self.fetcher.fetch(url.as_str(), &fetch_opts).await?;
        self.import_bytes(url.as_str(), &fetched.headers, fetched.body, opts)
            .await
    }

    /// Validate already obtained bytes and store them as an asset.
    pub async fn import_bytes(
        &self,
        source_url: &str,
        headers: &HeaderMap,
        body: Vec<u8>,
        opts: &ImportOptions,
    ) -> Result<ImageAsset, ImportError> {
        let image = validate_image(headers, body, self.max_bytes)?;
        let ext = image.extension();
        let file_name = derive_file_name(opts.file_name.as_deref(), source_url, &ext);
        let sha256 = hex::encode(Sha256::digest(&image.body));

        let (asset_path, uploaded_raw, uploaded) = if opts.dry_run {
            (planned_asset_path(&file_name), Value::Null, false)
        } else {
            let (path, raw) = self.upload(&file_name, &image).await?;
            (path, raw, true)
        };

        info!(
            source = source_url,
            asset = %asset_path,
            mime = %image.content_type,
            size = image.body.len(),
            dry_run = opts.dry_run,
            "Image imported"
        );

        Ok(ImageAsset {
            source_url: source_url.to_string(),
            file_name,
            mime_type: image.content_type.clone(),
            size: image.body.len() as u64,
            sha256,
            asset_path,
            uploaded,
            uploaded_raw,
            capture_provider_url: None,
        })
    }

    /// Upload, and if the backend stored the file under an extension that
    /// disagrees with the sniffed type, try once more with a fresh name.
    /// A failed or still-mismatched retry keeps the first upload.
    async fn upload(
        &self,
        file_name: &str,
        image: &ValidatedImage,
    ) -> Result<(String, Value), ImportError> {
        let raw = self
            .backend
            .upload_asset(file_name, &image.content_type, &image.body)
            .await?;
        let path = stored_path(&raw, file_name).ok_or_else(|| upload_failure(&raw))?;

        let expected = image.extension();
        if extension_matches(&path, &expected) {
            return Ok((path, raw));
        }

        let retry_name = format!(
            "{}-{}.{}",
            file_stem(file_name),
            &uuid::Uuid::new_v4().simple().to_string()[..6],
            expected
        );
        warn!(
            stored = %path,
            expected_ext = %expected,
            retry = %retry_name,
            "Backend changed asset extension, re-uploading"
        );

        match self
            .backend
            .upload_asset(&retry_name, &image.content_type, &image.body)
            .await
        {
            Ok(retry_raw) => match stored_path(&retry_raw, &retry_name) {
                Some(retry_path) if extension_matches(&retry_path, &expected) => {
                    Ok((retry_path, retry_raw))
                }
                _ => {
                    warn!(stored = %path, "Corrected upload did not help, keeping first upload");
                    Ok((path, raw))
                }
            },
            Err(e) => {
                warn!(stored = %path, "Corrected upload failed ({}), keeping first upload", e);
                Ok((path, raw))
            }
        }
    }
}

/// `data.succMap[file_name]`, else the first stored path in `succMap`.
fn stored_path(data: &Value, file_name: &str) -> Option<String> {
    let map = data.get("succMap")?.as_object()?;
    map.get(file_name)
        .or_else(|| map.values().next())
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn upload_failure(data: &Value) -> ImportError {
    let failed = data
        .get("errFiles")
        .and_then(|v| v.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    if failed.is_empty() {
        ImportError::Upload("backend returned no stored path".into())
    } else {
        ImportError::Upload(format!("backend rejected files: {}", failed))
    }
}

fn planned_asset_path(file_name: &str) -> String {
    format!("{}{}", ASSETS_DIR_PATH.trim_start_matches('/'), file_name)
}

fn extension_matches(path: &str, expected: &str) -> bool {
    let actual = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let canon = |e: &str| if e == "jpeg" { "jpg".to_string() } else { e.to_string() };
    canon(&actual) == canon(&expected.to_ascii_lowercase())
}

/// Pick a file name: explicit override, else the URL's last path segment,
/// else a timestamp. The extension always comes from the validated type.
pub fn derive_file_name(explicit: Option<&str>, source_url: &str, ext: &str) -> String {
    let from_explicit = explicit
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| file_stem(&sanitize_file_name(s)));

    let from_url = || {
        Url::parse(source_url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .and_then(|u| {
                u.path_segments()
                    .and_then(|mut segs| segs.next_back().map(String::from))
            })
            .map(|seg| file_stem(&sanitize_file_name(&seg)))
    };

    let stem = from_explicit
        .filter(|s| !s.is_empty())
        .or_else(|| from_url().filter(|s| !s.is_empty()))
        .unwrap_or_else(timestamp_stem);

    format!("{}.{}", truncate_chars(&stem, MAX_STEM_CHARS), ext)
}

fn timestamp_stem() -> String {
    format!("image-{}", Local::now().format("%Y%m%d%H%M%S%3f"))
}

/// Replace path separators, control characters and `<>:"|?*`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace()).to_string()
}

fn file_stem(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
