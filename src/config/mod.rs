//! Bridge configuration, read once from the environment at startup.
//!
//! The resulting [`BridgeConfig`] is immutable and handed to the server at
//! construction, so nothing downstream needs locking to read it.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:6806";
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_PAGE_MIRROR_PREFIX: &str = "https://r.jina.ai/";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36 siyuan-mcp";

/// Remote "screenshot as an image URL" services, tried in order.
///
/// Placeholders: `{url}` (percent-encoded target), `{raw_url}`, `{width}`, `{height}`.
pub const DEFAULT_SCREENSHOT_PROVIDERS: &[&str] = &[
    "https://image.thum.io/get/width/{width}/crop/{height}/noanimate/{raw_url}",
    "https://s0.wp.com/mshots/v1/{url}?w={width}&h={height}",
    "https://api.microlink.io/?url={url}&screenshot=true&meta=false&embed=screenshot.url",
];

/// Budget for one class of outbound internet fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteBudget {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
}

/// Local screenshot fallback settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalScreenshotConfig {
    pub enabled: bool,
    pub timeout: Duration,
    pub height: u32,
    pub browser_bin: Option<PathBuf>,
}

/// Root configuration for the bridge process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub api_url: String,
    pub api_token: String,
    pub read_only: bool,
    pub max_image_bytes: u64,
    pub remote: RemoteBudget,
    pub user_agent: String,
    /// Empty string disables the mirror fallback for page fetches.
    pub page_mirror_prefix: String,
    pub screenshot_providers: Vec<String>,
    pub local_screenshot: LocalScreenshotConfig,
    /// `None` disables file logging.
    pub log_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            api_token: String::new(),
            read_only: true,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            remote: RemoteBudget {
                timeout: Duration::from_millis(15_000),
                max_retries: 2,
                retry_base: Duration::from_millis(400),
            },
            user_agent: DEFAULT_USER_AGENT.into(),
            page_mirror_prefix: DEFAULT_PAGE_MIRROR_PREFIX.into(),
            screenshot_providers: DEFAULT_SCREENSHOT_PROVIDERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            local_screenshot: LocalScreenshotConfig {
                enabled: true,
                timeout: Duration::from_millis(45_000),
                height: 900,
                browser_bin: None,
            },
            log_dir: default_log_dir(),
        }
    }
}

impl BridgeConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let api_url = get("SIYUAN_API_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.into())
            .trim_end_matches('/')
            .to_string();

        let screenshot_providers = match get("SIYUAN_MCP_SCREENSHOT_PROVIDERS") {
            Some(raw) if !raw.is_empty() => raw
                .split(['\n', ','])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            _ => defaults.screenshot_providers.clone(),
        };

        let log_dir = match get("SIYUAN_MCP_LOG_DIR") {
            Some(dir) if dir.is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => defaults.log_dir.clone(),
        };

        Self {
            api_url,
            api_token: get("SIYUAN_API_TOKEN").unwrap_or_default(),
            read_only: get("SIYUAN_MCP_READ_ONLY")
                .filter(|v| !v.is_empty())
                .map(|v| parse_flag(&v))
                .unwrap_or(defaults.read_only),
            max_image_bytes: parse_number(
                "SIYUAN_MCP_MAX_IMAGE_BYTES",
                get("SIYUAN_MCP_MAX_IMAGE_BYTES"),
                defaults.max_image_bytes,
            )
            .max(1),
            remote: RemoteBudget {
                timeout: Duration::from_millis(
                    parse_number(
                        "SIYUAN_MCP_REMOTE_TIMEOUT_MS",
                        get("SIYUAN_MCP_REMOTE_TIMEOUT_MS"),
                        defaults.remote.timeout.as_millis() as u64,
                    )
                    .max(1),
                ),
                max_retries: parse_number(
                    "SIYUAN_MCP_REMOTE_MAX_RETRIES",
                    get("SIYUAN_MCP_REMOTE_MAX_RETRIES"),
                    defaults.remote.max_retries as u64,
                )
                .min(10) as u32,
                retry_base: Duration::from_millis(parse_number(
                    "SIYUAN_MCP_RETRY_BASE_MS",
                    get("SIYUAN_MCP_RETRY_BASE_MS"),
                    defaults.remote.retry_base.as_millis() as u64,
                )),
            },
            user_agent: get("SIYUAN_MCP_USER_AGENT")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.user_agent),
            page_mirror_prefix: get("SIYUAN_MCP_PAGE_MIRROR_PREFIX")
                .unwrap_or(defaults.page_mirror_prefix),
            screenshot_providers,
            local_screenshot: LocalScreenshotConfig {
                enabled: get("SIYUAN_MCP_LOCAL_SCREENSHOT_FALLBACK")
                    .filter(|v| !v.is_empty())
                    .map(|v| parse_flag(&v))
                    .unwrap_or(defaults.local_screenshot.enabled),
                timeout: Duration::from_millis(
                    parse_number(
                        "SIYUAN_MCP_LOCAL_SCREENSHOT_TIMEOUT_MS",
                        get("SIYUAN_MCP_LOCAL_SCREENSHOT_TIMEOUT_MS"),
                        defaults.local_screenshot.timeout.as_millis() as u64,
                    )
                    .max(1),
                ),
                height: parse_number(
                    "SIYUAN_MCP_LOCAL_SCREENSHOT_HEIGHT",
                    get("SIYUAN_MCP_LOCAL_SCREENSHOT_HEIGHT"),
                    defaults.local_screenshot.height as u64,
                )
                .clamp(100, 20_000) as u32,
                browser_bin: get("SIYUAN_MCP_CHROME_BIN")
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from),
            },
            log_dir,
        }
    }
}

/// `1/true/yes/on` (case-insensitive) are true, everything else is false.
pub fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number(key: &str, raw: Option<String>, default: u64) -> u64 {
    match raw {
        None => default,
        Some(v) if v.is_empty() => default,
        Some(v) => match v.parse::<u64>() {
            Ok(n) => n,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}, using {}", key, v, default);
                default
            }
        },
    }
}

fn default_log_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("siyuan-mcp").join("logs"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> BridgeConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults_are_read_only() {
        let cfg = config_from(&[]);
        assert!(cfg.read_only);
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.remote.max_retries, 2);
        assert!(cfg.local_screenshot.enabled);
        assert_eq!(cfg.screenshot_providers.len(), DEFAULT_SCREENSHOT_PROVIDERS.len());
    }

    #[test]
    fn test_parse_flag_variants() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_flag(v), "{v} should be true");
        }
        for v in ["0", "false", "off", "", "nope"] {
            assert!(!parse_flag(v), "{v} should be false");
        }
    }

    #[test]
    fn test_env_overrides() {
        let cfg = config_from(&[
            ("SIYUAN_API_URL", "http://127.0.0.1:9999///"),
            ("SIYUAN_API_TOKEN", "secret"),
            ("SIYUAN_MCP_READ_ONLY", "0"),
            ("SIYUAN_MCP_REMOTE_TIMEOUT_MS", "200"),
            ("SIYUAN_MCP_REMOTE_MAX_RETRIES", "0"),
            ("SIYUAN_MCP_CHROME_BIN", "/opt/chrome"),
            ("SIYUAN_MCP_SCREENSHOT_PROVIDERS", "https://a.invalid/{url}, https://b.invalid/{url}"),
            ("SIYUAN_MCP_LOG_DIR", ""),
        ]);
        assert_eq!(cfg.api_url, "http://127.0.0.1:9999");
        assert_eq!(cfg.api_token, "secret");
        assert!(!cfg.read_only);
        assert_eq!(cfg.remote.timeout, Duration::from_millis(200));
        assert_eq!(cfg.remote.max_retries, 0);
        assert_eq!(
            cfg.local_screenshot.browser_bin,
            Some(PathBuf::from("/opt/chrome"))
        );
        assert_eq!(cfg.screenshot_providers.len(), 2);
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn test_empty_flags_keep_defaults() {
        let cfg = config_from(&[
            ("SIYUAN_MCP_READ_ONLY", ""),
            ("SIYUAN_MCP_LOCAL_SCREENSHOT_FALLBACK", "  "),
        ]);
        assert!(cfg.read_only);
        assert!(cfg.local_screenshot.enabled);
    }

    #[test]
    fn test_invalid_number_falls_back() {
        let cfg = config_from(&[("SIYUAN_MCP_MAX_IMAGE_BYTES", "lots")]);
        assert_eq!(cfg.max_image_bytes, DEFAULT_MAX_IMAGE_BYTES);
    }
}
