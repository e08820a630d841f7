//! Media tools: image import, page scraping, webpage screenshots and
//! inserting the resulting assets into notes.
//!
//! - `validate`   -- magic-byte sniffing, decoding and size checks
//! - `import`     -- fetch -> validate -> hash -> upload
//! - `extract`    -- best-effort image URL scraping from raw HTML
//! - `screenshot` -- remote providers with local subprocess fallback
//! - `insert`     -- anchored insertion with before/after snapshots

pub mod extract;
pub mod import;
pub mod insert;
pub mod screenshot;
pub mod validate;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a successful (or dry-run planned) image import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub source_url: String,
    pub file_name: String,
    pub mime_type: String,
    pub size: u64,
    /// Lower-case hex SHA-256 of the validated body.
    pub sha256: String,
    /// Backend-relative path; the planned path when `uploaded` is false.
    pub asset_path: String,
    pub uploaded: bool,
    #[serde(default)]
    pub uploaded_raw: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_provider_url: Option<String>,
}

/// Where new content goes relative to the note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMode {
    #[default]
    Append,
    Prepend,
    After,
    Before,
}

impl InsertMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InsertMode::Append => "append",
            InsertMode::Prepend => "prepend",
            InsertMode::After => "after",
            InsertMode::Before => "before",
        }
    }

    pub fn needs_anchor(self) -> bool {
        matches!(self, InsertMode::After | InsertMode::Before)
    }

    pub const ALL: [&'static str; 4] = ["append", "prepend", "after", "before"];
}
