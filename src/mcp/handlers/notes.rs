//! Note tools: SQL, blocks, documents, notebooks and block attributes.
//!
//! Each tool maps onto one backend endpoint (the doc tree walks several) and
//! returns the backend's `data` unchanged.

use anyhow::bail;
use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{optional, parse_args, required, ToolContext};
use crate::siyuan::SiyuanClient;

pub const DEFAULT_SQL_LIMIT: u32 = 1000;
const DEFAULT_DOC_SORT: i64 = 15;
const MAX_TREE_DEPTH: usize = 64;

static LIMIT_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\blimit\b").unwrap());

/// Append `LIMIT 1000` unless the statement already mentions `limit`.
pub fn clamp_limit_sql(sql: &str) -> String {
    let trimmed = sql.trim();
    if trimmed.is_empty() || LIMIT_CLAUSE.is_match(trimmed) {
        trimmed.to_string()
    } else {
        format!("{} LIMIT {}", trimmed, DEFAULT_SQL_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SqlArgs {
    sql: Option<String>,
}

pub async fn handle_sql_query(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: SqlArgs = parse_args(args)?;
    let sql = clamp_limit_sql(required(&a.sql, "sql")?);
    Ok(ctx
        .backend
        .post("/api/query/sql", &json!({ "stmt": sql }))
        .await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BlockContentArgs {
    id: Option<String>,
    format: Option<String>,
}

pub async fn handle_get_block_content(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: BlockContentArgs = parse_args(args)?;
    let id = required(&a.id, "id")?;
    let content = match optional(&a.format).unwrap_or("markdown") {
        "kramdown" => {
            let data = ctx
                .backend
                .post(
                    "/api/block/getBlockKramdown",
                    &json!({ "id": id, "mode": "textmark" }),
                )
                .await?;
            data.get("kramdown").cloned()
        }
        "markdown" => {
            let data = ctx
                .backend
                .post(
                    "/api/export/exportMdContent",
                    &json!({
                        "id": id,
                        "yfm": false,
                        "assets": false,
                        "merge": 2,
                        "ref": 0,
                        "pdf": false,
                    }),
                )
                .await?;
            data.get("content").cloned()
        }
        other => bail!("unsupported format {:?} (expected markdown or kramdown)", other),
    };
    Ok(content.unwrap_or_else(|| Value::String(String::new())))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InsertBlockArgs {
    data_type: Option<String>,
    data: Option<String>,
    #[serde(rename = "parentID")]
    parent_id: Option<String>,
    #[serde(rename = "appendParentID")]
    append_parent_id: Option<String>,
    #[serde(rename = "previousID")]
    previous_id: Option<String>,
    #[serde(rename = "nextID")]
    next_id: Option<String>,
}

pub async fn handle_insert_block(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_insert_block")?;
    let a: InsertBlockArgs = parse_args(args)?;
    let data_type = parse_data_type(&a.data_type)?;
    let data = required(&a.data, "data")?;
    let parent_id = optional(&a.parent_id);
    let previous_id = optional(&a.previous_id);
    let next_id = optional(&a.next_id);

    if let Some(append_to) = optional(&a.append_parent_id) {
        return Ok(ctx
            .backend
            .post(
                "/api/block/appendBlock",
                &json!({ "dataType": data_type, "data": data, "parentID": append_to }),
            )
            .await?);
    }
    if parent_id.is_none() && previous_id.is_none() && next_id.is_none() {
        bail!("at least one position argument is required: parentID, appendParentID, previousID or nextID");
    }

    let mut body = Map::new();
    body.insert("dataType".into(), json!(data_type));
    body.insert("data".into(), json!(data));
    for (key, value) in [("parentID", parent_id), ("previousID", previous_id), ("nextID", next_id)] {
        if let Some(v) = value {
            body.insert(key.into(), json!(v));
        }
    }
    Ok(ctx
        .backend
        .post("/api/block/insertBlock", &Value::Object(body))
        .await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UpdateBlockArgs {
    data_type: Option<String>,
    data: Option<String>,
    id: Option<String>,
}

pub async fn handle_update_block(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_update_block")?;
    let a: UpdateBlockArgs = parse_args(args)?;
    let data_type = parse_data_type(&a.data_type)?;
    let id = required(&a.id, "id")?;
    let data = required(&a.data, "data")?;
    Ok(ctx
        .backend
        .post(
            "/api/block/updateBlock",
            &json!({ "dataType": data_type, "data": data, "id": id }),
        )
        .await?)
}

fn parse_data_type(raw: &Option<String>) -> anyhow::Result<&str> {
    match optional(raw).unwrap_or("markdown") {
        t @ ("markdown" | "dom") => Ok(t),
        other => bail!("unsupported dataType {:?} (expected markdown or dom)", other),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateDocumentArgs {
    notebook: Option<String>,
    path: Option<String>,
    markdown: Option<String>,
}

pub async fn handle_create_document(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_create_document")?;
    let a: CreateDocumentArgs = parse_args(args)?;
    let notebook = required(&a.notebook, "notebook")?;
    let path = required(&a.path, "path")?;
    let markdown = a.markdown.as_deref().unwrap_or_default();
    Ok(ctx
        .backend
        .post(
            "/api/filetree/createDocWithMd",
            &json!({ "notebook": notebook, "path": path, "markdown": markdown }),
        )
        .await?)
}

pub async fn handle_list_notebooks(ctx: &ToolContext, _args: &Value) -> anyhow::Result<Value> {
    Ok(ctx
        .backend
        .post("/api/notebook/lsNotebooks", &json!({}))
        .await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CreateNotebookArgs {
    name: Option<String>,
}

pub async fn handle_create_notebook(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_create_notebook")?;
    let a: CreateNotebookArgs = parse_args(args)?;
    let name = required(&a.name, "name")?;
    Ok(ctx
        .backend
        .post("/api/notebook/createNotebook", &json!({ "name": name }))
        .await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DocTreeArgs {
    notebook: Option<String>,
    path: Option<String>,
    sort_mode: Option<i64>,
}

pub async fn handle_get_doc_tree(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: DocTreeArgs = parse_args(args)?;
    let notebook = required(&a.notebook, "notebook")?;
    let start = optional(&a.path).unwrap_or("/");
    let sort = a.sort_mode.unwrap_or(DEFAULT_DOC_SORT);
    let tree = walk_doc_tree(&ctx.backend, notebook, start.to_string(), sort, 0).await?;
    Ok(Value::Array(tree))
}

/// List `path` and recurse into every entry with `subFileCount > 0`.
fn walk_doc_tree<'a>(
    backend: &'a SiyuanClient,
    notebook: &'a str,
    path: String,
    sort: i64,
    depth: usize,
) -> BoxFuture<'a, anyhow::Result<Vec<Value>>> {
    Box::pin(async move {
        let data = backend
            .post(
                "/api/filetree/listDocsByPath",
                &json!({
                    "notebook": notebook,
                    "path": path,
                    "sort": sort,
                    "showHidden": false,
                    "maxListCount": 10000,
                }),
            )
            .await?;
        let files = data
            .get("files")
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();

        let mut nodes = Vec::with_capacity(files.len());
        for mut file in files {
            let has_children = file
                .get("subFileCount")
                .and_then(|c| c.as_i64())
                .is_some_and(|c| c > 0);
            let child_path = file.get("path").and_then(|p| p.as_str()).map(String::from);
            if let (true, Some(child_path)) = (has_children, child_path) {
                if depth + 1 >= MAX_TREE_DEPTH {
                    bail!("document tree deeper than {} levels at {}", MAX_TREE_DEPTH, child_path);
                }
                let children = walk_doc_tree(backend, notebook, child_path, sort, depth + 1).await?;
                if let Some(obj) = file.as_object_mut() {
                    obj.insert("children".into(), Value::Array(children));
                }
            }
            nodes.push(file);
        }
        Ok(nodes)
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RenameDocumentArgs {
    id: Option<String>,
    title: Option<String>,
}

pub async fn handle_rename_document(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_rename_document")?;
    let a: RenameDocumentArgs = parse_args(args)?;
    let id = required(&a.id, "id")?;
    let title = required(&a.title, "title")?;
    Ok(ctx
        .backend
        .post("/api/filetree/renameDocByID", &json!({ "id": id, "title": title }))
        .await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MoveDocumentsArgs {
    #[serde(rename = "fromIDs")]
    from_ids: Vec<String>,
    #[serde(rename = "toID")]
    to_id: Option<String>,
}

pub async fn handle_move_documents(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_move_documents")?;
    let a: MoveDocumentsArgs = parse_args(args)?;
    let from_ids: Vec<&str> = a
        .from_ids
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if from_ids.is_empty() {
        bail!("missing required argument: fromIDs");
    }
    let to_id = required(&a.to_id, "toID")?;
    Ok(ctx
        .backend
        .post(
            "/api/filetree/moveDocsByID",
            &json!({ "fromIDs": from_ids, "toID": to_id }),
        )
        .await?)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BlockAttrsArgs {
    id: Option<String>,
    attrs: Option<Map<String, Value>>,
}

pub async fn handle_get_block_attrs(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: BlockAttrsArgs = parse_args(args)?;
    let id = required(&a.id, "id")?;
    Ok(ctx
        .backend
        .post("/api/attr/getBlockAttrs", &json!({ "id": id }))
        .await?)
}

pub async fn handle_set_block_attrs(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    ctx.assert_write_allowed("siyuan_set_block_attrs")?;
    let a: BlockAttrsArgs = parse_args(args)?;
    let id = required(&a.id, "id")?;
    let Some(attrs) = a.attrs else {
        bail!("missing required argument: attrs");
    };
    Ok(ctx
        .backend
        .post("/api/attr/setBlockAttrs", &json!({ "id": id, "attrs": attrs }))
        .await?)
}
