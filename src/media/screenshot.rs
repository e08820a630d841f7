//! Webpage screenshots: remote "screenshot as an image URL" services first,
//! then local headless tools run as subprocesses.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Local;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;

use super::import::{sanitize_file_name, ImagePipeline, ImportOptions};
use super::ImageAsset;
use crate::config::LocalScreenshotConfig;
use crate::net::{validate_public_url, UrlPolicyError};

pub const DEFAULT_WIDTH: u32 = 1280;

const BROWSER_BINARIES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "microsoft-edge",
    "microsoft-edge-stable",
    "brave-browser",
];

#[cfg(target_os = "macos")]
const BROWSER_APP_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];
#[cfg(not(target_os = "macos"))]
const BROWSER_APP_PATHS: &[&str] = &[];

const STDERR_TAIL_CHARS: usize = 300;

#[derive(Debug, Error)]
pub enum ScreenshotError {
    #[error(transparent)]
    Policy(#[from] UrlPolicyError),
    #[error("all screenshot attempts failed: {}", .attempts.join("; "))]
    AllFailed { attempts: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ScreenshotRequest {
    pub url: String,
    pub width: u32,
    pub height: Option<u32>,
    pub full_page: bool,
    pub file_name: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ScreenshotOutcome {
    pub asset: ImageAsset,
    pub local_fallback_used: bool,
    /// Failed attempts that preceded the successful one.
    pub warnings: Vec<String>,
}

/// One local capture attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotCandidate {
    pub provider: String,
    pub cmd: PathBuf,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScreenshotService {
    pipeline: ImagePipeline,
    providers: Vec<String>,
    local: LocalScreenshotConfig,
}

impl ScreenshotService {
    pub fn new(pipeline: ImagePipeline, providers: Vec<String>, local: LocalScreenshotConfig) -> Self {
        Self {
            pipeline,
            providers,
            local,
        }
    }

    pub async fn capture(&self, req: &ScreenshotRequest) -> Result<ScreenshotOutcome, ScreenshotError> {
        let target = validate_public_url(&req.url)?;
        let width = req.width.clamp(200, 8000);
        let height = req.height.unwrap_or(self.local.height).clamp(100, 20_000);
        let opts = ImportOptions {
            file_name: Some(
                req.file_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| default_file_name(&target)),
            ),
            dry_run: req.dry_run,
        };

        let mut warnings = Vec::new();
        for provider_url in remote_provider_urls(&self.providers, &target, width, height) {
            match self.pipeline.import_image_from_url(&provider_url, &opts).await {
                Ok(mut asset) => {
                    info!(provider = %provider_url, "Remote screenshot captured");
                    asset.capture_provider_url = Some(provider_url);
                    return Ok(ScreenshotOutcome {
                        asset,
                        local_fallback_used: false,
                        warnings,
                    });
                }
                Err(e) => {
                    warn!(provider = %provider_url, "Remote screenshot failed: {}", e);
                    warnings.push(format!("remote provider {} failed: {}", provider_url, e));
                }
            }
        }

        if !self.local.enabled {
            warnings.push("local screenshot fallback is disabled".into());
            return Err(ScreenshotError::AllFailed { attempts: warnings });
        }

        match self.capture_locally(&target, width, height, req.full_page, &opts).await {
            Ok((asset, local_failures)) => {
                warnings.extend(local_failures);
                Ok(ScreenshotOutcome {
                    asset,
                    local_fallback_used: true,
                    warnings,
                })
            }
            Err(local_failures) => {
                warnings.extend(local_failures);
                Err(ScreenshotError::AllFailed { attempts: warnings })
            }
        }
    }

    /// Try each local candidate in order. The temp directory is removed when
    /// this returns, whatever the outcome.
    async fn capture_locally(
        &self,
        target: &Url,
        width: u32,
        height: u32,
        full_page: bool,
        opts: &ImportOptions,
    ) -> Result<(ImageAsset, Vec<String>), Vec<String>> {
        let dir = tempfile::Builder::new()
            .prefix("siyuan-mcp-shot-")
            .tempdir()
            .map_err(|e| vec![format!("cannot create temp dir: {}", e)])?;
        let output = dir.path().join("capture.png");

        let candidates = local_candidates(&self.local, target, width, height, full_page, &output);
        if candidates.is_empty() {
            return Err(vec![format!(
                "no local capture tool found (looked for {}, wkhtmltoimage, npx)",
                BROWSER_BINARIES.join(", ")
            )]);
        }

        let mut failures = Vec::new();
        for candidate in &candidates {
            let provider_url = format!("local://{}", candidate.provider);
            if let Err(reason) = run_candidate(candidate, self.local.timeout, &output).await {
                warn!(provider = %provider_url, "Local screenshot failed: {}", reason);
                failures.push(format!("{} failed: {}", provider_url, reason));
                continue;
            }

            let bytes = match tokio::fs::read(&output).await {
                Ok(b) => b,
                Err(e) => {
                    failures.push(format!("{} failed: cannot read output: {}", provider_url, e));
                    continue;
                }
            };
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));

            match self
                .pipeline
                .import_bytes(&provider_url, &headers, bytes, opts)
                .await
            {
                Ok(mut asset) => {
                    info!(provider = %provider_url, "Local screenshot captured");
                    asset.capture_provider_url = Some(provider_url);
                    return Ok((asset, failures));
                }
                Err(e) => failures.push(format!("{} failed: {}", provider_url, e)),
            }
        }
        Err(failures)
    }
}

/// Expand provider templates. `{url}` is percent-encoded, `{raw_url}` is not.
pub fn remote_provider_urls(templates: &[String], target: &Url, width: u32, height: u32) -> Vec<String> {
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_str().as_bytes()).collect();
    templates
        .iter()
        .map(|t| {
            t.replace("{raw_url}", target.as_str())
                .replace("{url}", &encoded)
                .replace("{width}", &width.to_string())
                .replace("{height}", &height.to_string())
        })
        .collect()
}

/// Ordered local attempts: configured binary, common browsers found on
/// `PATH`, `wkhtmltoimage`, then `npx playwright`.
pub fn local_candidates(
    cfg: &LocalScreenshotConfig,
    target: &Url,
    width: u32,
    height: u32,
    full_page: bool,
    output: &Path,
) -> Vec<ScreenshotCandidate> {
    let mut browsers: Vec<PathBuf> = Vec::new();
    if let Some(bin) = &cfg.browser_bin {
        browsers.push(which::which(bin).unwrap_or_else(|_| bin.clone()));
    }
    browsers.extend(BROWSER_BINARIES.iter().filter_map(|b| which::which(b).ok()));
    browsers.extend(
        BROWSER_APP_PATHS
            .iter()
            .map(PathBuf::from)
            .filter(|p| p.is_file()),
    );

    let mut out: Vec<ScreenshotCandidate> = Vec::new();
    for cmd in browsers {
        if out.iter().any(|c| c.cmd == cmd) {
            continue;
        }
        out.push(ScreenshotCandidate {
            provider: provider_name(&cmd),
            args: browser_args(target, width, height, output),
            cmd,
        });
    }

    if let Ok(cmd) = which::which("wkhtmltoimage") {
        let mut args = vec![
            "--quiet".to_string(),
            "--format".into(),
            "png".into(),
            "--width".into(),
            width.to_string(),
        ];
        if !full_page {
            args.extend(["--height".to_string(), height.to_string()]);
        }
        args.extend([target.to_string(), output.display().to_string()]);
        out.push(ScreenshotCandidate {
            provider: "wkhtmltoimage".into(),
            cmd,
            args,
        });
    }

    if let Ok(cmd) = which::which("npx") {
        let mut args = vec![
            "--yes".to_string(),
            "playwright".into(),
            "screenshot".into(),
            format!("--viewport-size={},{}", width, height),
        ];
        if full_page {
            args.push("--full-page".into());
        }
        args.extend([target.to_string(), output.display().to_string()]);
        out.push(ScreenshotCandidate {
            provider: "playwright".into(),
            cmd,
            args,
        });
    }

    out
}

fn browser_args(target: &Url, width: u32, height: u32, output: &Path) -> Vec<String> {
    vec![
        "--headless".into(),
        "--disable-gpu".into(),
        "--hide-scrollbars".into(),
        "--no-first-run".into(),
        "--no-default-browser-check".into(),
        format!("--window-size={},{}", width, height),
        format!("--screenshot={}", output.display()),
        target.to_string(),
    ]
}

fn provider_name(cmd: &Path) -> String {
    cmd.file_name()
        .map(|n| n.to_string_lossy().replace(' ', "-").to_ascii_lowercase())
        .unwrap_or_else(|| "browser".into())
}

/// Success is exit 0 plus a non-empty output file.
pub async fn run_candidate(
    candidate: &ScreenshotCandidate,
    timeout: Duration,
    output: &Path,
) -> Result<(), String> {
    let _ = tokio::fs::remove_file(output).await;

    let child = Command::new(&candidate.cmd)
        .args(&candidate.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn {} failed: {}", candidate.cmd.display(), e))?;

    let result = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(r) => r.map_err(|e| format!("wait failed: {}", e))?,
        Err(_) => return Err(format!("timed out after {}ms", timeout.as_millis())),
    };

    if !result.status.success() {
        let code = result
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".into());
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(format!("exit code {}: {}", code, tail(stderr.trim(), STDERR_TAIL_CHARS)));
    }

    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        Ok(_) => Err("output file is empty".into()),
        Err(_) => Err("no output file produced".into()),
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}

fn default_file_name(target: &Url) -> String {
    let host = target.host_str().unwrap_or("page");
    format!(
        "screenshot-{}-{}",
        sanitize_file_name(&host.replace('.', "-")),
        Local::now().format("%Y%m%d%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteBudget;
    use crate::net::Fetcher;
    use crate::siyuan::SiyuanClient;
    use crate::test_support::{FakeResponse, FakeServer, ONE_BY_ONE_PNG};
    use serde_json::json;

    fn sh(script: &str) -> ScreenshotCandidate {
        ScreenshotCandidate {
            provider: "sh".into(),
            cmd: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn local_cfg(bin: Option<PathBuf>) -> LocalScreenshotConfig {
        LocalScreenshotConfig {
            enabled: true,
            timeout: Duration::from_secs(10),
            height: 900,
            browser_bin: bin,
        }
    }

    #[test]
    fn test_remote_provider_url_expansion() {
        let target = Url::parse("https://example.com/a?b=1").unwrap();
        let urls = remote_provider_urls(
            &[
                "https://shots.test/{width}x{height}/{raw_url}".to_string(),
                "https://api.test/?url={url}".to_string(),
            ],
            &target,
            1280,
            900,
        );
        assert_eq!(urls[0], "https://shots.test/1280x900/https://example.com/a?b=1");
        assert_eq!(urls[1], "https://api.test/?url=https%3A%2F%2Fexample.com%2Fa%3Fb%3D1");
    }

    #[test]
    fn test_configured_browser_comes_first() {
        let target = Url::parse("https://example.com/").unwrap();
        let out = Path::new("/tmp/out.png");
        let cands = local_candidates(
            &local_cfg(Some(PathBuf::from("/opt/custom/My Browser"))),
            &target,
            1024,
            768,
            true,
            out,
        );
        let first = &cands[0];
        assert_eq!(first.cmd, PathBuf::from("/opt/custom/My Browser"));
        assert_eq!(first.provider, "my-browser");
        assert!(first.args.contains(&"--headless".to_string()));
        assert!(first.args.contains(&"--window-size=1024,768".to_string()));
        assert!(first.args.contains(&"--screenshot=/tmp/out.png".to_string()));
        assert_eq!(first.args.last().unwrap(), "https://example.com/");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_candidate_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("shot.png");
        let out_s = out.display().to_string();
        let t = Duration::from_secs(10);

        run_candidate(&sh(&format!("printf x > '{}'", out_s)), t, &out)
            .await
            .unwrap();

        let err = run_candidate(&sh("echo boom >&2; exit 3"), t, &out).await.unwrap_err();
        assert!(err.contains("exit code 3"), "{err}");
        assert!(err.contains("boom"), "{err}");

        let err = run_candidate(&sh("exit 0"), t, &out).await.unwrap_err();
        assert_eq!(err, "no output file produced");

        let err = run_candidate(&sh(&format!(": > '{}'", out_s)), t, &out).await.unwrap_err();
        assert_eq!(err, "output file is empty");

        let err = run_candidate(&sh("sleep 5"), Duration::from_millis(200), &out)
            .await
            .unwrap_err();
        assert!(err.starts_with("timed out"), "{err}");

        let missing = ScreenshotCandidate {
            provider: "nope".into(),
            cmd: PathBuf::from("/definitely/not/here"),
            args: vec![],
        };
        let err = run_candidate(&missing, t, &out).await.unwrap_err();
        assert!(err.starts_with("spawn"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_back_to_local_capture() {
        use std::os::unix::fs::PermissionsExt;

        let backend = FakeServer::start(|_| {
            FakeResponse::envelope(json!({"errFiles": [], "succMap": {"file[]": "assets/shot-1.png"}}))
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("src.png");
        std::fs::write(&png, ONE_BY_ONE_PNG).unwrap();
        let script = dir.path().join("fake-chrome");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nfor a in \"$@\"; do case \"$a\" in --screenshot=*) out=\"${{a#--screenshot=}}\";; esac; done\ncp '{}' \"$out\"\n",
                png.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let pipeline = ImagePipeline::new(
            Fetcher::new("test").unwrap(),
            SiyuanClient::new(backend.base_url(), "").unwrap(),
            1024 * 1024,
            RemoteBudget {
                timeout: Duration::from_millis(500),
                max_retries: 0,
                retry_base: Duration::from_millis(1),
            },
        );
        let service = ScreenshotService::new(
            pipeline,
            vec![
                "https://provider-a.invalid/{raw_url}".into(),
                "https://provider-b.invalid/?u={url}".into(),
            ],
            local_cfg(Some(script.clone())),
        );

        let outcome = service
            .capture(&ScreenshotRequest {
                url: "https://unreachable.invalid/page".into(),
                width: DEFAULT_WIDTH,
                height: None,
                full_page: true,
                file_name: None,
                dry_run: false,
            })
            .await
            .unwrap();

        assert!(outcome.local_fallback_used);
        assert_eq!(outcome.asset.asset_path, "assets/shot-1.png");
        assert_eq!(
            outcome.asset.capture_provider_url.as_deref(),
            Some("local://fake-chrome")
        );
        assert_eq!(outcome.warnings.len(), 2);
        assert!(outcome.warnings[0].contains("provider-a.invalid"));
        assert!(outcome.warnings[1].contains("provider-b.invalid"));
        assert_eq!(backend.requests_to("/api/asset/upload").len(), 1);
    }

    #[tokio::test]
    async fn test_everything_failing_lists_every_attempt() {
        let pipeline = ImagePipeline::new(
            Fetcher::new("test").unwrap(),
            SiyuanClient::new("http://127.0.0.1:9", "").unwrap(),
            1024,
            RemoteBudget {
                timeout: Duration::from_millis(500),
                max_retries: 0,
                retry_base: Duration::from_millis(1),
            },
        );
        let mut local = local_cfg(None);
        local.enabled = false;
        let service = ScreenshotService::new(
            pipeline,
            vec!["https://provider-a.invalid/{raw_url}".into()],
            local,
        );
        let err = service
            .capture(&ScreenshotRequest {
                url: "https://example.invalid/".into(),
                width: DEFAULT_WIDTH,
                height: Some(600),
                full_page: false,
                file_name: None,
                dry_run: true,
            })
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("provider-a.invalid"), "{err}");
        assert!(err.contains("disabled"), "{err}");
    }

    #[tokio::test]
    async fn test_private_target_rejected() {
        let pipeline = ImagePipeline::new(
            Fetcher::new("test").unwrap(),
            SiyuanClient::new("http://127.0.0.1:9", "").unwrap(),
            1024,
            RemoteBudget {
                timeout: Duration::from_millis(100),
                max_retries: 0,
                retry_base: Duration::from_millis(1),
            },
        );
        let service = ScreenshotService::new(pipeline, vec![], local_cfg(None));
        let err = service
            .capture(&ScreenshotRequest {
                url: "http://192.168.1.1/admin".into(),
                width: DEFAULT_WIDTH,
                height: None,
                full_page: true,
                file_name: None,
                dry_run: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScreenshotError::Policy(_)));
    }
}
