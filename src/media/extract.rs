//! Best-effort image URL scraping over raw HTML text.
//!
//! Regex based: pages are often partial, mirrored as markdown or
//! plain text, and only candidate URLs are needed. Callers go through
//! [`ImageUrlExtractor`] so a real HTML parser can replace this later.

use std::collections::HashSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::validate::decode_content_encoding;
use crate::net::{check_public_url, FetchOptions, Fetcher};

pub const DEFAULT_EXTRACT_LIMIT: usize = 20;
pub const MAX_EXTRACT_LIMIT: usize = 100;

/// Direct page fetches get a short budget and no retries; the mirror is
/// the retry.
pub const PAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PAGE_BYTES: u64 = 5 * 1024 * 1024;

const META_IMAGE_KEYS: &[&str] = &[
    "og:image",
    "og:image:url",
    "og:image:secure_url",
    "twitter:image",
    "twitter:image:src",
];

/// Attribute order inside `<img>`/`<source>` tags.
const IMG_ATTRS: &[&str] = &["srcset", "data-srcset", "data-src", "data-original", "src"];

static META_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").unwrap());
static IMG_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:img|source)\b[^>]*>").unwrap());
static BASE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<base\b[^>]*>").unwrap());
static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z_:.-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#).unwrap()
});
static MARKDOWN_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?(?:\s+["'][^"']*["'])?\s*\)"#).unwrap()
});
static BARE_IMAGE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)https?://[^\s"'<>()\[\]]+?\.(?:png|jpe?g|gif|webp|bmp|avif|svg)(?:\?[^\s"'<>()\[\]]*)?"#,
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchedVia {
    Direct,
    Mirror,
}

#[derive(Debug, Error)]
#[error("could not fetch page: {}", .attempts.join("; "))]
pub struct PageFetchError {
    pub attempts: Vec<String>,
}

/// Fetch a page as text, falling back to `mirror_prefix + url` once.
/// An empty prefix disables the fallback.
pub async fn fetch_page(
    fetcher: &Fetcher,
    page_url: &Url,
    mirror_prefix: &str,
    mirror_timeout: Duration,
) -> Result<(String, FetchedVia), PageFetchError> {
    let direct_timeout = PAGE_FETCH_TIMEOUT.min(mirror_timeout);
    let mut attempts = Vec::new();

    match fetch_text(fetcher, page_url.as_str(), direct_timeout).await {
        Ok(text) => return Ok((text, FetchedVia::Direct)),
        Err(e) => {
            warn!(url = %page_url, "Direct page fetch failed: {}", e);
            attempts.push(format!("direct: {}", e));
        }
    }

    let prefix = mirror_prefix.trim();
    if prefix.is_empty() {
        return Err(PageFetchError { attempts });
    }
    let mirror_url = format!("{}{}", prefix, page_url);
    match fetch_text(fetcher, &mirror_url, mirror_timeout).await {
        Ok(text) => {
            info!(url = %page_url, mirror = %mirror_url, "Fetched page through mirror");
            Ok((text, FetchedVia::Mirror))
        }
        Err(e) => {
            attempts.push(format!("mirror {}: {}", mirror_url, e));
            Err(PageFetchError { attempts })
        }
    }
}

async fn fetch_text(fetcher: &Fetcher, url: &str, timeout: Duration) -> Result<String, String> {
    let opts = FetchOptions::default()
        .timeout(timeout)
        .retries(0)
        .max_bytes(MAX_PAGE_BYTES)
        .header("Accept", "text/html,application/xhtml+xml,text/plain;q=0.9,*/*;q=0.5")
        .header("Accept-Encoding", "gzip, deflate, br");
    let fetched = fetcher.fetch(url, &opts).await.map_err(|e| e.to_string())?;
    let encoding = fetched.header("content-encoding").map(str::to_string);
    let body = match encoding {
        Some(encoding) => decode_content_encoding(&encoding, fetched.body, MAX_PAGE_BYTES)
            .map_err(|e| e.to_string())?,
        None => fetched.body,
    };
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Pulls candidate image URLs out of a fetched page.
pub trait ImageUrlExtractor: Send + Sync {
    /// Candidates in priority order, unresolved and possibly duplicated.
    fn candidates(&self, html: &str) -> Vec<String>;

    /// `<base href>` if the document declares one.
    fn base_href(&self, html: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegexImageExtractor;

impl ImageUrlExtractor for RegexImageExtractor {
    fn candidates(&self, html: &str) -> Vec<String> {
        let mut out = Vec::new();

        for tag in META_TAG.find_iter(html) {
            let attrs = parse_attrs(tag.as_str());
            let key = attr(&attrs, "property").or_else(|| attr(&attrs, "name"));
            if let (Some(key), Some(content)) = (key, attr(&attrs, "content")) {
                if META_IMAGE_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
                    out.push(content.to_string());
                }
            }
        }

        for tag in IMG_TAG.find_iter(html) {
            let attrs = parse_attrs(tag.as_str());
            for name in IMG_ATTRS {
                let Some(value) = attr(&attrs, name) else {
                    continue;
                };
                if name.ends_with("srcset") {
                    out.extend(parse_srcset(value));
                } else {
                    out.push(value.to_string());
                }
            }
        }

        out.extend(
            MARKDOWN_IMAGE
                .captures_iter(html)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str().to_string()),
        );
        out.extend(
            BARE_IMAGE_URL
                .find_iter(html)
                .map(|m| m.as_str().to_string()),
        );

        out.into_iter().map(|u| decode_entities(&u)).collect()
    }

    fn base_href(&self, html: &str) -> Option<String> {
        let tag = BASE_TAG.find(html)?;
        let attrs = parse_attrs(tag.as_str());
        attr(&attrs, "href").map(decode_entities)
    }
}

/// Resolve, filter and dedupe candidates from `html` using the default
/// regex extractor. `limit` is clamped to `1..=MAX_EXTRACT_LIMIT`.
pub fn extract_image_urls_from_html(page_url: &Url, html: &str, limit: usize) -> Vec<String> {
    extract_with(&RegexImageExtractor, page_url, html, limit)
}

pub fn extract_with(
    extractor: &dyn ImageUrlExtractor,
    page_url: &Url,
    html: &str,
    limit: usize,
) -> Vec<String> {
    let limit = limit.clamp(1, MAX_EXTRACT_LIMIT);
    let base = extractor
        .base_href(html)
        .and_then(|href| page_url.join(&href).ok())
        .unwrap_or_else(|| page_url.clone());

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for candidate in extractor.candidates(html) {
        let Some(resolved) = resolve(&base, &candidate) else {
            continue;
        };
        if seen.insert(resolved.clone()) {
            out.push(resolved);
            if out.len() >= limit {
                break;
            }
        }
    }
    out
}

fn resolve(base: &Url, candidate: &str) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.starts_with('#') {
        return None;
    }
    let lower = candidate.to_ascii_lowercase();
    if ["data:", "blob:", "javascript:", "about:"]
        .iter()
        .any(|p| lower.starts_with(p))
    {
        return None;
    }
    let mut url = base.join(candidate).ok()?;
    check_public_url(&url).ok()?;
    url.set_fragment(None);
    Some(url.to_string())
}

fn parse_attrs(tag: &str) -> Vec<(String, String)> {
    ATTR.captures_iter(tag)
        .filter_map(|c| {
            let name = c.get(1)?.as_str().to_ascii_lowercase();
            let value = c.get(2).or_else(|| c.get(3)).or_else(|| c.get(4))?;
            Some((name, value.as_str().trim().to_string()))
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, v)| k == name && !v.is_empty())
        .map(|(_, v)| v.as_str())
}

/// `a.png 1x, b.png 2x` -> `[a.png, b.png]`
fn parse_srcset(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|entry| entry.split_whitespace().next())
        .map(String::from)
        .collect()
}

fn decode_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x2F;", "/")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeResponse, FakeServer};

    fn page() -> Url {
        Url::parse("https://news.example.com/articles/42").unwrap()
    }

    #[test]
    fn test_priority_order_and_resolution() {
        let html = r#"
            <html><head>
            <meta property="og:image" content="/cover.jpg">
            <meta name="twitter:image" content="https://cdn.example.com/tw.png">
            </head><body>
            <img src="a.png" data-src="lazy.webp">
            <img srcset="small.jpg 1x, big.jpg 2x" src="fallback.jpg">
            ![chart](https://img.example.com/chart.gif "Chart")
            see https://files.example.com/raw/photo.jpeg?size=large for more
            </body></html>
        "#;
        let urls = extract_image_urls_from_html(&page(), html, 50);
        assert_eq!(
            urls,
            vec![
                "https://news.example.com/cover.jpg",
                "https://cdn.example.com/tw.png",
                "https://news.example.com/articles/lazy.webp",
                "https://news.example.com/articles/a.png",
                "https://news.example.com/articles/small.jpg",
                "https://news.example.com/articles/big.jpg",
                "https://news.example.com/articles/fallback.jpg",
                "https://img.example.com/chart.gif",
                "https://files.example.com/raw/photo.jpeg?size=large",
            ]
        );
    }

    #[test]
    fn test_skips_data_uris_private_hosts_and_duplicates() {
        let html = r#"
            <img src="data:image/png;base64,AAAA">
            <img src="http://127.0.0.1/secret.png">
            <img src="http://intranet.local/x.png">
            <img src="https://ok.example.com/a.png#frag">
            <img src="https://ok.example.com/a.png">
        "#;
        let urls = extract_image_urls_from_html(&page(), html, 20);
        assert_eq!(urls, vec!["https://ok.example.com/a.png"]);
    }

    #[test]
    fn test_limit_is_clamped() {
        let html: String = (0..150)
            .map(|i| format!("<img src=\"https://x.example.com/{i}.png\">"))
            .collect();
        assert_eq!(extract_image_urls_from_html(&page(), &html, 3).len(), 3);
        assert_eq!(
            extract_image_urls_from_html(&page(), &html, 10_000).len(),
            MAX_EXTRACT_LIMIT
        );
        assert_eq!(extract_image_urls_from_html(&page(), &html, 0).len(), 1);
    }

    #[test]
    fn test_base_href_and_entities() {
        let html = r#"<base href="https://static.example.org/assets/">
            <img src='pic.png?a=1&amp;b=2'>"#;
        let urls = extract_image_urls_from_html(&page(), html, 5);
        assert_eq!(urls, vec!["https://static.example.org/assets/pic.png?a=1&b=2"]);
    }

    #[test]
    fn test_plain_text_mirror_output() {
        let text = "Title: Example\n\n![Image 1](https://img.example.net/one.png)\n\
                    Link: https://img.example.net/two.webp.";
        let urls = extract_image_urls_from_html(&page(), text, 20);
        assert_eq!(
            urls,
            vec!["https://img.example.net/one.png", "https://img.example.net/two.webp"]
        );
    }

    struct Fixed(Vec<&'static str>);

    impl ImageUrlExtractor for Fixed {
        fn candidates(&self, _html: &str) -> Vec<String> {
            self.0.iter().map(|s| s.to_string()).collect()
        }
        fn base_href(&self, _html: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_custom_extractor_gets_same_filtering() {
        let ex = Fixed(vec!["/a.png", "http://localhost/b.png", "/a.png"]);
        assert_eq!(
            extract_with(&ex, &page(), "", 10),
            vec!["https://news.example.com/a.png"]
        );
    }

    #[tokio::test]
    async fn test_fetch_page_direct() {
        let server = FakeServer::start(|_| {
            FakeResponse::bytes(200, "text/html", "<img src=\"/a.png\">")
        })
        .await;
        let fetcher = Fetcher::new("test").unwrap();
        let url = Url::parse(&server.url("/article")).unwrap();
        let (html, via) = fetch_page(&fetcher, &url, "", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(via, FetchedVia::Direct);
        assert!(html.contains("a.png"));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_page_decodes_gzip_body() {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"<img src=\"/zipped.png\">").unwrap();
        let packed = enc.finish().unwrap();
        let server = FakeServer::start(move |_| {
            FakeResponse::bytes(200, "text/html", packed.clone())
                .with_header("Content-Encoding", "gzip")
        })
        .await;
        let fetcher = Fetcher::new("test").unwrap();
        let url = Url::parse(&server.url("/article")).unwrap();
        let (html, via) = fetch_page(&fetcher, &url, "", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(via, FetchedVia::Direct);
        assert_eq!(html, "<img src=\"/zipped.png\">");
    }

    #[tokio::test]
    async fn test_fetch_page_falls_back_to_mirror() {
        let server = FakeServer::start(|req| {
            if req.path.starts_with("/mirror/") {
                FakeResponse::bytes(200, "text/plain", "![x](https://img.example.com/x.png)")
            } else {
                FakeResponse::status(403)
            }
        })
        .await;
        let fetcher = Fetcher::new("test").unwrap();
        let direct = Url::parse(&server.url("/post")).unwrap();
        let prefix = server.url("/mirror/");

        let (text, via) = fetch_page(&fetcher, &direct, &prefix, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(via, FetchedVia::Mirror);
        assert!(text.contains("x.png"));
        assert_eq!(server.requests().len(), 2);
        assert_eq!(server.requests()[1].path, format!("/mirror/{}", direct));
    }

    #[tokio::test]
    async fn test_fetch_page_reports_every_attempt() {
        let server = FakeServer::start(|_| FakeResponse::status(500)).await;
        let fetcher = Fetcher::new("test").unwrap();
        let direct = Url::parse(&server.url("/post")).unwrap();
        let err = fetch_page(&fetcher, &direct, &server.url("/m/"), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 2);
        assert!(err.attempts[0].starts_with("direct:"));
        // no retries on the direct fetch
        assert_eq!(server.requests().len(), 2);
    }
}
