//! `siyuan_database`: attribute-view (database) operations keyed by `operation`.

use anyhow::bail;
use chrono::Local;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{optional, parse_args, required, ToolContext};

pub const OPERATIONS: &[&str] = &[
    "searchDatabase",
    "getColumns",
    "renderDatabase",
    "addDetachedRows",
    "addBoundBlocks",
    "setAttribute",
    "batchSetAttributes",
    "getDatabasesForBlock",
    "getItemIDsByBlockIDs",
    "getBlockIDsByItemIDs",
    "addColumn",
    "removeColumn",
    "removeRows",
];

const WRITE_OPERATIONS: &[&str] = &[
    "addDetachedRows",
    "addBoundBlocks",
    "setAttribute",
    "batchSetAttributes",
    "addColumn",
    "removeColumn",
    "removeRows",
];

const DEFAULT_PAGE_SIZE: i64 = 9_999_999;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatabaseArgs {
    keyword: Option<String>,
    #[serde(rename = "avID")]
    av_id: Option<String>,
    #[serde(rename = "viewID")]
    view_id: Option<String>,
    #[serde(rename = "pageSize")]
    page_size: Option<i64>,
    page: Option<i64>,
    #[serde(rename = "blocksValues")]
    blocks_values: Option<Value>,
    #[serde(rename = "blockIDs")]
    block_ids: Vec<String>,
    #[serde(rename = "itemIDs")]
    item_ids: Vec<String>,
    #[serde(rename = "keyID")]
    key_id: Option<String>,
    #[serde(rename = "itemID")]
    item_id: Option<String>,
    value: Option<Value>,
    values: Option<Value>,
    #[serde(rename = "blockID")]
    block_id: Option<String>,
    #[serde(rename = "keyName")]
    key_name: Option<String>,
    #[serde(rename = "keyType")]
    key_type: Option<String>,
    #[serde(rename = "keyIcon")]
    key_icon: Option<String>,
    #[serde(rename = "previousKeyID")]
    previous_key_id: Option<String>,
    #[serde(rename = "srcIDs")]
    src_ids: Vec<String>,
}

pub async fn handle_database(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    // The operation decides whether the guard applies, so peek at it before
    // full argument parsing.
    let operation = args
        .get("operation")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if operation.is_empty() {
        bail!("missing required argument: operation");
    }
    if WRITE_OPERATIONS.contains(&operation.as_str()) {
        ctx.assert_write_allowed(&format!("siyuan_database.{}", operation))?;
    }

    let a: DatabaseArgs = parse_args(args)?;
    let (path, body) = match operation.as_str() {
        "searchDatabase" => {
            let keyword = required(&a.keyword, "keyword")?;
            let body = match optional(&a.av_id) {
                Some(av_id) => json!({ "keyword": keyword, "avID": av_id }),
                None => json!({ "keyword": keyword }),
            };
            ("/api/av/searchAttributeView", body)
        }
        "getColumns" => (
            "/api/av/getAttributeViewKeysByAvID",
            json!({ "avID": required(&a.av_id, "avID")? }),
        ),
        "renderDatabase" => (
            "/api/av/renderAttributeView",
            json!({
                "id": required(&a.av_id, "avID")?,
                "viewID": required(&a.view_id, "viewID")?,
                "pageSize": a.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
                "page": a.page.unwrap_or(1),
            }),
        ),
        "addDetachedRows" => (
            "/api/av/appendAttributeViewDetachedBlocksWithValues",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "blocksValues": present(a.blocks_values, "blocksValues")?,
            }),
        ),
        "addBoundBlocks" => {
            let av_id = required(&a.av_id, "avID")?;
            let block_ids = non_empty(&a.block_ids, "blockIDs")?;
            let srcs: Vec<Value> = block_ids
                .iter()
                .enumerate()
                .map(|(i, &id)| {
                    let item_id = a
                        .item_ids
                        .get(i)
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .unwrap_or(id);
                    json!({ "id": id, "isDetached": false, "itemID": item_id })
                })
                .collect();
            ("/api/av/addAttributeViewBlocks", json!({ "avID": av_id, "srcs": srcs }))
        }
        "setAttribute" => (
            "/api/av/setAttributeViewBlockAttr",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "keyID": required(&a.key_id, "keyID")?,
                "itemID": required(&a.item_id, "itemID")?,
                "value": present(a.value, "value")?,
            }),
        ),
        "batchSetAttributes" => (
            "/api/av/batchSetAttributeViewBlockAttrs",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "values": present(a.values, "values")?,
            }),
        ),
        "getDatabasesForBlock" => (
            "/api/av/getAttributeViewKeys",
            json!({ "id": required(&a.block_id, "blockID")? }),
        ),
        "getItemIDsByBlockIDs" => (
            "/api/av/getAttributeViewItemIDsByBoundIDs",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "blockIDs": non_empty(&a.block_ids, "blockIDs")?,
            }),
        ),
        "getBlockIDsByItemIDs" => (
            "/api/av/getAttributeViewBoundBlockIDsByItemIDs",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "itemIDs": non_empty(&a.item_ids, "itemIDs")?,
            }),
        ),
        "addColumn" => {
            let key_id = optional(&a.key_id)
                .map(String::from)
                .unwrap_or_else(generate_node_id);
            (
                "/api/av/addAttributeViewKey",
                json!({
                    "avID": required(&a.av_id, "avID")?,
                    "keyID": key_id,
                    "keyName": required(&a.key_name, "keyName")?,
                    "keyType": required(&a.key_type, "keyType")?,
                    "keyIcon": a.key_icon.as_deref().unwrap_or_default(),
                    "previousKeyID": required(&a.previous_key_id, "previousKeyID")?,
                }),
            )
        }
        "removeColumn" => (
            "/api/av/removeAttributeViewKey",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "keyID": required(&a.key_id, "keyID")?,
            }),
        ),
        "removeRows" => (
            "/api/av/removeAttributeViewBlocks",
            json!({
                "avID": required(&a.av_id, "avID")?,
                "srcIDs": non_empty(&a.src_ids, "srcIDs")?,
            }),
        ),
        other => bail!(
            "unknown database operation: {} (expected one of {})",
            other,
            OPERATIONS.join(", ")
        ),
    };

    Ok(ctx.backend.post(path, &body).await?)
}

/// A JSON value that is present and not null, `false`, `0` or an empty string.
fn present(value: Option<Value>, name: &str) -> anyhow::Result<Value> {
    let empty = match &value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(_) => false,
    };
    match value {
        Some(v) if !empty => Ok(v),
        _ => bail!("missing required argument: {}", name),
    }
}

fn non_empty<'a>(ids: &'a [String], name: &str) -> anyhow::Result<Vec<&'a str>> {
    let ids: Vec<&str> = ids.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
    if ids.is_empty() {
        bail!("missing required argument: {}", name);
    }
    Ok(ids)
}

/// Block-style id: `YYYYMMDDhhmmss-` plus 7 lower-case alphanumerics.
pub fn generate_node_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Local::now().format("%Y%m%d%H%M%S"), &suffix[..7])
}
