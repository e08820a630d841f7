//! Validation of downloaded bytes before they are trusted as an image.
//!
//! Order of checks: raw size, Content-Length agreement, Content-Encoding
//! decoding, decoded size, magic-byte sniffing, then the declared type is
//! reconciled against the sniff.

use std::io::Read;

use reqwest::header::{HeaderMap, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use thiserror::Error;

const PREVIEW_BYTES: usize = 160;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("downloaded body is empty")]
    Empty,
    #[error("{stage} size {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        stage: &'static str,
        size: u64,
        limit: u64,
    },
    #[error("truncated transfer: Content-Length {expected} but received {actual} bytes")]
    Truncated { expected: u64, actual: u64 },
    #[error("unsupported Content-Encoding {0:?}")]
    UnsupportedEncoding(String),
    #[error("failed to decode {encoding} body: {reason}")]
    Decompress { encoding: String, reason: String },
    #[error("response is not an image (Content-Type {content_type:?}); body starts with: {preview}")]
    NotAnImage {
        content_type: String,
        preview: String,
    },
    #[error("server declared {content_type:?} but returned an HTML page: {preview}")]
    HtmlPayload {
        content_type: String,
        preview: String,
    },
}

/// Output of validation. `content_type` is the corrected type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedImage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub detected_mime: Option<String>,
    pub detected_ext: Option<String>,
}

impl ValidatedImage {
    /// Extension matching the corrected content type.
    pub fn extension(&self) -> String {
        self.detected_ext
            .clone()
            .or_else(|| ext_for_mime(&self.content_type).map(String::from))
            .unwrap_or_else(|| fallback_ext(&self.content_type))
    }
}

/// Validate a raw download. `max_bytes` applies before and after decoding.
pub fn validate_image(
    headers: &HeaderMap,
    body: Vec<u8>,
    max_bytes: u64,
) -> Result<ValidatedImage, ValidationError> {
    let raw_len = body.len() as u64;
    if raw_len > max_bytes {
        return Err(ValidationError::TooLarge {
            stage: "download",
            size: raw_len,
            limit: max_bytes,
        });
    }

    if let Some(expected) = header_str(headers, CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
    {
        if expected != raw_len {
            return Err(ValidationError::Truncated {
                expected,
                actual: raw_len,
            });
        }
    }

    let encoding = header_str(headers, CONTENT_ENCODING.as_str()).unwrap_or("");
    let body = decode_content_encoding(encoding, body, max_bytes)?;
    if body.is_empty() {
        return Err(ValidationError::Empty);
    }

    let declared = header_str(headers, CONTENT_TYPE.as_str())
        .map(normalize_mime)
        .unwrap_or_default();

    if let Some(sniffed) = sniff_image(&body) {
        return Ok(ValidatedImage {
            body,
            content_type: sniffed.mime.to_string(),
            detected_mime: Some(sniffed.mime.to_string()),
            detected_ext: Some(sniffed.ext.to_string()),
        });
    }

    let preview = printable_preview(&body);
    if declared.starts_with("image/") {
        if looks_like_html(&preview) {
            return Err(ValidationError::HtmlPayload {
                content_type: declared,
                preview,
            });
        }
        return Ok(ValidatedImage {
            body,
            content_type: declared,
            detected_mime: None,
            detected_ext: None,
        });
    }

    Err(ValidationError::NotAnImage {
        content_type: declared,
        preview,
    })
}

/// Decode a `Content-Encoding` chain (applied left to right by the sender).
/// Output is capped at `max_bytes`.
pub fn decode_content_encoding(
    encoding: &str,
    body: Vec<u8>,
    max_bytes: u64,
) -> Result<Vec<u8>, ValidationError> {
    let codings: Vec<String> = encoding
        .split(',')
        .map(|c| c.trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty() && c != "identity")
        .collect();

    let mut data = body;
    for coding in codings.iter().rev() {
        data = match coding.as_str() {
            "gzip" | "x-gzip" => read_capped(flate2::read::GzDecoder::new(&data[..]), coding, max_bytes)?,
            "deflate" => inflate(&data, max_bytes)?,
            "br" => read_capped(
                brotli::Decompressor::new(&data[..], 4096),
                coding,
                max_bytes,
            )?,
            other => return Err(ValidationError::UnsupportedEncoding(other.to_string())),
        };
    }
    Ok(data)
}

/// HTTP "deflate" is usually zlib-wrapped but some servers send raw deflate.
fn inflate(data: &[u8], max_bytes: u64) -> Result<Vec<u8>, ValidationError> {
    match read_capped(flate2::read::ZlibDecoder::new(data), "deflate", max_bytes) {
        Ok(out) => Ok(out),
        Err(ValidationError::Decompress { .. }) => {
            read_capped(flate2::read::DeflateDecoder::new(data), "deflate", max_bytes)
        }
        Err(e) => Err(e),
    }
}

fn read_capped<R: Read>(reader: R, coding: &str, max_bytes: u64) -> Result<Vec<u8>, ValidationError> {
    let mut out = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| ValidationError::Decompress {
            encoding: coding.to_string(),
            reason: e.to_string(),
        })?;
    if out.len() as u64 > max_bytes {
        return Err(ValidationError::TooLarge {
            stage: "decompressed",
            size: out.len() as u64,
            limit: max_bytes,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub mime: &'static str,
    pub ext: &'static str,
}

/// Identify an image format from its leading bytes.
pub fn sniff_image(bytes: &[u8]) -> Option<Sniffed> {
    let hit = |mime, ext| Some(Sniffed { mime, ext });

    if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return hit("image/png", "png");
    }
    if bytes.starts_with(&[0xff, 0xd8, 0xff]) {
        return hit("image/jpeg", "jpg");
    }
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return hit("image/gif", "gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return hit("image/webp", "webp");
    }
    if bytes.len() >= 26 && bytes.starts_with(b"BM") {
        return hit("image/bmp", "bmp");
    }
    if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" && matches!(&bytes[8..12], b"avif" | b"avis") {
        return hit("image/avif", "avif");
    }
    if looks_like_svg(bytes) {
        return hit("image/svg+xml", "svg");
    }
    None
}

fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start().to_ascii_lowercase();
    if text.starts_with("<svg") {
        return true;
    }
    (text.starts_with("<?xml") || text.starts_with("<!--") || text.starts_with("<!doctype svg"))
        && text.contains("<svg")
        && !text.contains("<html")
}

/// Short, single-line, printable rendition of the start of a body.
pub fn printable_preview(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(PREVIEW_BYTES)];
    let text: String = String::from_utf8_lossy(head)
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if bytes.len() > PREVIEW_BYTES {
        format!("{}...", collapsed)
    } else {
        collapsed
    }
}

fn looks_like_html(preview: &str) -> bool {
    let lower = preview.to_ascii_lowercase();
    ["<!doctype html", "<html", "<head", "<body", "<title"]
        .iter()
        .any(|marker| lower.contains(marker))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `image/PNG; charset=x` -> `image/png`.
pub fn normalize_mime(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn ext_for_mime(mime: &str) -> Option<&'static str> {
    match normalize_mime(mime).as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" | "image/x-ms-bmp" => Some("bmp"),
        "image/avif" => Some("avif"),
        "image/svg+xml" => Some("svg"),
        _ => None,
    }
}

pub fn mime_for_ext(ext: &str) -> Option<&'static str> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" | "jpe" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "avif" => Some("image/avif"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// Extension for an image type outside the table: its alphanumeric subtype.
fn fallback_ext(mime: &str) -> String {
    let subtype: String = normalize_mime(mime)
        .split('/')
        .nth(1)
        .unwrap_or("")
        .trim_start_matches("x-")
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if subtype.is_empty() {
        "bin".to_string()
    } else {
        subtype
    }
}
