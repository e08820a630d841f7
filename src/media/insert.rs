//! Inserting rendered content into a note, with before/after snapshots.
//!
//! Every mutation returns an [`Operation`] describing what changed so a UI
//! can render a diff. Under dry-run the operation is `pending` and no backend
//! write happens.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use super::{ImageAsset, InsertMode};
use crate::siyuan::{BackendError, SiyuanClient};

static BLOCK_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]{14}-[0-9a-z]{7}$").unwrap());

pub const OPERATION_KIND: &str = "siyuan_block_operation";

#[derive(Debug, Error)]
pub enum InsertError {
    #[error("invalid block id: {0:?}")]
    InvalidBlockId(String),
    #[error("block not found: {0}")]
    BlockNotFound(String),
    #[error("mode \"{0}\" requires anchorBlockId")]
    MissingAnchor(&'static str),
    #[error("anchor block {anchor} is not in document {doc_id}")]
    AnchorOutsideDocument { anchor: String, doc_id: String },
    #[error("no assets to insert")]
    NoAssets,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocInfo {
    pub doc_id: String,
    #[serde(rename = "box")]
    pub notebook: String,
    pub path: String,
    pub hpath: String,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Applied,
}

/// Audit record for one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub kind: String,
    pub operation_type: OperationType,
    pub block_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    pub old_content: String,
    pub old_content_for_display: String,
    pub new_content: String,
    pub new_content_for_display: String,
    pub status: OperationStatus,
}

impl Operation {
    pub fn pending(operation_type: OperationType, block_id: &str, position: Option<&str>, new_content: &str) -> Self {
        Self {
            kind: OPERATION_KIND.into(),
            operation_type,
            block_id: block_id.to_string(),
            position: position.map(String::from),
            old_content: String::new(),
            old_content_for_display: String::new(),
            new_content: new_content.to_string(),
            new_content_for_display: new_content.to_string(),
            status: OperationStatus::Pending,
        }
    }

    pub fn applied(
        operation_type: OperationType,
        block_id: &str,
        position: Option<&str>,
        before: Snapshot,
        after: Snapshot,
    ) -> Self {
        Self {
            kind: OPERATION_KIND.into(),
            operation_type,
            block_id: block_id.to_string(),
            position: position.map(String::from),
            old_content: before.kramdown,
            old_content_for_display: before.markdown,
            new_content: after.kramdown,
            new_content_for_display: after.markdown,
            status: OperationStatus::Applied,
        }
    }
}

/// Structural and display form of a block at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub kramdown: String,
    pub markdown: String,
}

/// An asset reference as accepted by the insert tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRef {
    pub asset_path: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub alt: Option<String>,
}

impl From<&ImageAsset> for AssetRef {
    fn from(a: &ImageAsset) -> Self {
        Self {
            asset_path: a.asset_path.clone(),
            file_name: Some(a.file_name.clone()),
            alt: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InsertRequest<'a> {
    pub note_block_id: &'a str,
    pub mode: InsertMode,
    pub anchor_block_id: Option<&'a str>,
    pub alt_prefix: Option<&'a str>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsertOutcome {
    pub doc: DocInfo,
    pub operation: Operation,
}

/// Reject anything that is not a well-formed block id before it reaches SQL.
pub fn check_block_id(id: &str) -> Result<&str, InsertError> {
    let id = id.trim();
    if BLOCK_ID.is_match(id) {
        Ok(id)
    } else {
        Err(InsertError::InvalidBlockId(id.to_string()))
    }
}

/// Resolve the document that owns `block_id`.
pub async fn resolve_doc(backend: &SiyuanClient, block_id: &str) -> Result<DocInfo, InsertError> {
    let id = check_block_id(block_id)?;
    let row = block_row(backend, id).await?;
    let root_id = row_str(&row, "root_id");
    let doc_id = if root_id.is_empty() { id.to_string() } else { root_id };

    let doc_row = if doc_id == id {
        row
    } else {
        block_row(backend, &doc_id).await?
    };

    let hpath = row_str(&doc_row, "hpath");
    let mut title = row_str(&doc_row, "content");
    if title.is_empty() {
        title = hpath.rsplit('/').next().unwrap_or_default().to_string();
    }
    Ok(DocInfo {
        doc_id,
        notebook: row_str(&doc_row, "box"),
        path: row_str(&doc_row, "path"),
        hpath,
        title,
    })
}

async fn block_row(backend: &SiyuanClient, id: &str) -> Result<Value, InsertError> {
    let stmt = format!(
        "SELECT id, root_id, type, box, path, hpath, content FROM blocks WHERE id = '{}' LIMIT 1",
        id
    );
    backend
        .sql(&stmt)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| InsertError::BlockNotFound(id.to_string()))
}

fn row_str(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

pub async fn snapshot(backend: &SiyuanClient, block_id: &str) -> Result<Snapshot, InsertError> {
    let kramdown = backend
        .post("/api/block/getBlockKramdown", &json!({ "id": block_id }))
        .await?;
    let markdown = backend
        .post("/api/export/exportMdContent", &json!({ "id": block_id }))
        .await?;
    Ok(Snapshot {
        kramdown: row_str(&kramdown, "kramdown"),
        markdown: row_str(&markdown, "content"),
    })
}

/// `![alt](path)` per asset, separated by blank lines.
pub fn render_markdown(assets: &[AssetRef], alt_prefix: Option<&str>) -> String {
    let prefix = alt_prefix.map(str::trim).filter(|p| !p.is_empty());
    assets
        .iter()
        .enumerate()
        .map(|(i, asset)| {
            let alt = match (&asset.alt, prefix) {
                (Some(alt), _) if !alt.trim().is_empty() => alt.trim().to_string(),
                (_, Some(prefix)) => format!("{} {}", prefix, i + 1),
                _ => asset
                    .file_name
                    .as_deref()
                    .map(|n| n.rsplit_once('.').map(|(s, _)| s).unwrap_or(n).to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "image".into()),
            };
            let alt = alt.replace('[', "\\[").replace(']', "\\]");
            let path = asset.asset_path.trim().replace(' ', "%20").replace(')', "%29");
            format!("![{}]({})", alt, path)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Insert the assets into the note owning `req.note_block_id`.
pub async fn insert_assets_to_note(
    backend: &SiyuanClient,
    assets: &[AssetRef],
    req: &InsertRequest<'_>,
) -> Result<InsertOutcome, InsertError> {
    if assets.is_empty() {
        return Err(InsertError::NoAssets);
    }
    let markdown = render_markdown(assets, req.alt_prefix);
    insert_markdown(backend, &markdown, req).await
}

pub async fn insert_markdown(
    backend: &SiyuanClient,
    markdown: &str,
    req: &InsertRequest<'_>,
) -> Result<InsertOutcome, InsertError> {
    let doc = resolve_doc(backend, req.note_block_id).await?;

    let anchor = if req.mode.needs_anchor() {
        let anchor = req
            .anchor_block_id
            .filter(|a| !a.trim().is_empty())
            .ok_or(InsertError::MissingAnchor(req.mode.as_str()))?;
        let anchor = check_block_id(anchor)?;
        let anchor_doc = resolve_doc(backend, anchor).await?;
        if anchor_doc.doc_id != doc.doc_id {
            return Err(InsertError::AnchorOutsideDocument {
                anchor: anchor.to_string(),
                doc_id: doc.doc_id.clone(),
            });
        }
        Some(anchor.to_string())
    } else {
        None
    };

    let position = Some(req.mode.as_str());
    if req.dry_run {
        let operation = Operation::pending(OperationType::Insert, &doc.doc_id, position, markdown);
        return Ok(InsertOutcome { doc, operation });
    }

    let before = snapshot(backend, &doc.doc_id).await?;
    let (path, body) = match (req.mode, anchor) {
        (InsertMode::Append, _) => (
            "/api/block/appendBlock",
            json!({ "dataType": "markdown", "data": markdown, "parentID": doc.doc_id }),
        ),
        (InsertMode::Prepend, _) => (
            "/api/block/prependBlock",
            json!({ "dataType": "markdown", "data": markdown, "parentID": doc.doc_id }),
        ),
        (InsertMode::After, anchor) => (
            "/api/block/insertBlock",
            json!({ "dataType": "markdown", "data": markdown, "previousID": anchor }),
        ),
        (InsertMode::Before, anchor) => (
            "/api/block/insertBlock",
            json!({ "dataType": "markdown", "data": markdown, "nextID": anchor }),
        ),
    };
    backend.post(path, &body).await?;
    let after = snapshot(backend, &doc.doc_id).await?;

    info!(doc = %doc.doc_id, mode = req.mode.as_str(), "Inserted content into note");
    let operation = Operation::applied(OperationType::Insert, &doc.doc_id, position, before, after);
    Ok(InsertOutcome { doc, operation })
}
