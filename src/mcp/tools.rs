//! Static tool registry: the single source of truth for `tools/list`.

use serde_json::{json, Value};

use super::handlers::database::OPERATIONS;
use super::handlers::media::MAX_URLS_PER_CALL;
use crate::media::extract::{DEFAULT_EXTRACT_LIMIT, MAX_EXTRACT_LIMIT};
use crate::media::screenshot::DEFAULT_WIDTH;
use crate::media::InsertMode;

/// How a tool interacts with the read-only guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolAccess {
    Read,
    Write,
    /// Writes unless `dryRun` is set.
    WriteUnlessDryRun,
    /// Depends on the arguments (`operation`, `import`).
    PerCall,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
    pub access: ToolAccess,
}

impl ToolDescriptor {
    /// Shape used in the `tools/list` response.
    pub fn to_listing(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let mut tools = note_tools();
        tools.push(database_tool());
        tools.extend(media_tools());
        Self { tools }
    }

    /// All tools in registration order.
    pub fn list_tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.name == name)
    }
}

fn id_prop(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn data_type_prop() -> Value {
    json!({
        "type": "string",
        "enum": ["markdown", "dom"],
        "description": "Format of `data`"
    })
}

fn note_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "siyuan_sql_query",
            description: "Run a read-only SQL query against the SiYuan block database. \
                          A LIMIT is added when missing.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "SQL statement, e.g. SELECT * FROM blocks WHERE ..." }
                },
                "required": ["sql"]
            }),
            access: ToolAccess::Read,
        },
        ToolDescriptor {
            name: "siyuan_get_block_content",
            description: "Get the content of a block or document as markdown or kramdown",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": id_prop("Block or document ID"),
                    "format": {
                        "type": "string",
                        "enum": ["markdown", "kramdown"],
                        "default": "markdown"
                    }
                },
                "required": ["id"]
            }),
            access: ToolAccess::Read,
        },
        ToolDescriptor {
            name: "siyuan_insert_block",
            description: "Insert a new block. Use appendParentID to append as the last child, \
                          or one of previousID / nextID / parentID to position it.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "dataType": data_type_prop(),
                    "data": { "type": "string", "description": "Block content" },
                    "parentID": id_prop("Parent block ID"),
                    "appendParentID": id_prop("Append as last child of this block"),
                    "previousID": id_prop("Insert after this block"),
                    "nextID": id_prop("Insert before this block")
                },
                "required": ["dataType", "data"]
            }),
            access: ToolAccess::Write,
        },
        ToolDescriptor {
            name: "siyuan_update_block",
            description: "Replace the content of a block",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "dataType": data_type_prop(),
                    "data": { "type": "string", "description": "New block content" },
                    "id": id_prop("Block ID")
                },
                "required": ["dataType", "data", "id"]
            }),
            access: ToolAccess::Write,
        },
        ToolDescriptor {
            name: "siyuan_create_document",
            description: "Create a document from markdown at a human-readable path",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "notebook": id_prop("Notebook ID"),
                    "path": { "type": "string", "description": "Document path, e.g. /Projects/Notes" },
                    "markdown": { "type": "string", "description": "Document content" }
                },
                "required": ["notebook", "path", "markdown"]
            }),
            access: ToolAccess::Write,
        },
        ToolDescriptor {
            name: "siyuan_list_notebooks",
            description: "List all notebooks",
            input_schema: json!({ "type": "object", "properties": {} }),
            access: ToolAccess::Read,
        },
        ToolDescriptor {
            name: "siyuan_create_notebook",
            description: "Create a notebook",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Notebook name" }
                },
                "required": ["name"]
            }),
            access: ToolAccess::Write,
        },
        ToolDescriptor {
            name: "siyuan_get_doc_tree",
            description: "Get the document tree of a notebook, recursively",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "notebook": id_prop("Notebook ID"),
                    "path": { "type": "string", "description": "Storage path to start from", "default": "/" },
                    "sortMode": { "type": "integer", "description": "SiYuan sort mode", "default": 15 }
                },
                "required": ["notebook"]
            }),
            access: ToolAccess::Read,
        },
        ToolDescriptor {
            name: "siyuan_rename_document",
            description: "Rename a document",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": id_prop("Document ID"),
                    "title": { "type": "string", "description": "New title" }
                },
                "required": ["id", "title"]
            }),
            access: ToolAccess::Write,
        },
        ToolDescriptor {
            name: "siyuan_move_documents",
            description: "Move documents under another document or notebook",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "fromIDs": { "type": "array", "items": { "type": "string" }, "description": "Document IDs to move" },
                    "toID": id_prop("Target document or notebook ID")
                },
                "required": ["fromIDs", "toID"]
            }),
            access: ToolAccess::Write,
        },
        ToolDescriptor {
            name: "siyuan_get_block_attrs",
            description: "Get the attributes of a block",
            input_schema: json!({
                "type": "object",
                "properties": { "id": id_prop("Block ID") },
                "required": ["id"]
            }),
            access: ToolAccess::Read,
        },
        ToolDescriptor {
            name: "siyuan_set_block_attrs",
            description: "Set attributes on a block. Custom attributes must be prefixed with custom-.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": id_prop("Block ID"),
                    "attrs": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Attribute name to value"
                    }
                },
                "required": ["id", "attrs"]
            }),
            access: ToolAccess::Write,
        },
    ]
}

fn database_tool() -> ToolDescriptor {
    ToolDescriptor {
        name: "siyuan_database",
        description: "Work with SiYuan databases (attribute views): search, render, read columns, \
                      add rows or bound blocks, set values, add or remove columns and rows. \
                      Write operations are blocked in read-only mode.",
        input_schema: json!({
            "type": "object",
            "properties": {
                "operation": { "type": "string", "enum": OPERATIONS },
                "keyword": { "type": "string" },
                "avID": id_prop("Database (attribute view) ID"),
                "viewID": { "type": "string" },
                "pageSize": { "type": "integer" },
                "page": { "type": "integer" },
                "blocksValues": { "type": "array", "description": "Rows of cell values for detached rows" },
                "blockIDs": { "type": "array", "items": { "type": "string" } },
                "itemIDs": { "type": "array", "items": { "type": "string" } },
                "keyID": { "type": "string" },
                "itemID": { "type": "string" },
                "value": { "type": "object" },
                "values": { "type": "array" },
                "blockID": { "type": "string" },
                "keyName": { "type": "string" },
                "keyType": { "type": "string" },
                "keyIcon": { "type": "string" },
                "previousKeyID": { "type": "string" },
                "srcIDs": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["operation"]
        }),
        access: ToolAccess::PerCall,
    }
}

/// Properties shared by every media tool.
fn placement_props() -> serde_json::Map<String, Value> {
    let props = json!({
        "noteBlockId": id_prop("Block or document whose document receives the images; omit to skip insertion"),
        "mode": {
            "type": "string",
            "enum": InsertMode::ALL,
            "default": "append",
            "description": "Where to insert: append/prepend to the document, or after/before anchorBlockId"
        },
        "anchorBlockId": id_prop("Anchor block for after/before; must belong to the same document"),
        "dryRun": { "type": "boolean", "default": false, "description": "Fetch and validate only; no upload or insertion" },
        "altPrefix": { "type": "string", "description": "Alt text prefix, numbered per image" }
    });
    match props {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn media_schema(own: Value, required: &[&str]) -> Value {
    let mut props = placement_props();
    if let Value::Object(own) = own {
        props.extend(own);
    }
    json!({ "type": "object", "properties": props, "required": required })
}

fn media_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "siyuan_import_image_urls",
            description: "Download images from public URLs, verify they are real images, upload them \
                          as SiYuan assets and optionally insert them into a note",
            input_schema: media_schema(
                json!({
                    "urls": {
                        "type": "array",
                        "items": { "type": "string" },
                        "minItems": 1,
                        "maxItems": MAX_URLS_PER_CALL
                    },
                    "fileNamePrefix": { "type": "string", "description": "Base file name; numbered when several URLs" }
                }),
                &["urls"],
            ),
            access: ToolAccess::WriteUnlessDryRun,
        },
        ToolDescriptor {
            name: "siyuan_extract_page_images",
            description: "Fetch a web page and list the image URLs it references (Open Graph, img/srcset, \
                          markdown). Optionally import them. Falls back to a text mirror when the page \
                          cannot be fetched directly.",
            input_schema: media_schema(
                json!({
                    "pageUrl": { "type": "string", "description": "Public http(s) page URL" },
                    "limit": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_EXTRACT_LIMIT,
                        "default": DEFAULT_EXTRACT_LIMIT
                    },
                    "import": { "type": "boolean", "default": false },
                    "fileNamePrefix": { "type": "string" }
                }),
                &["pageUrl"],
            ),
            access: ToolAccess::PerCall,
        },
        ToolDescriptor {
            name: "siyuan_capture_webpage_screenshot",
            description: "Capture a screenshot of a web page and upload it as an asset. Tries remote \
                          screenshot services first, then a local headless-browser fallback \
                          (Chrome/Chromium/Edge/Brave, wkhtmltoimage or Playwright).",
            input_schema: media_schema(
                json!({
                    "url": { "type": "string", "description": "Public http(s) page URL" },
                    "width": { "type": "integer", "default": DEFAULT_WIDTH },
                    "height": { "type": "integer" },
                    "fullPage": { "type": "boolean", "default": true },
                    "fileName": { "type": "string" }
                }),
                &["url"],
            ),
            access: ToolAccess::WriteUnlessDryRun,
        },
        ToolDescriptor {
            name: "siyuan_insert_images_to_note",
            description: "Insert already uploaded assets into a note as markdown images. Returns an \
                          operation record with before/after snapshots.",
            input_schema: media_schema(
                json!({
                    "assets": {
                        "type": "array",
                        "minItems": 1,
                        "items": {
                            "type": "object",
                            "properties": {
                                "assetPath": { "type": "string" },
                                "fileName": { "type": "string" },
                                "alt": { "type": "string" }
                            },
                            "required": ["assetPath"]
                        }
                    }
                }),
                &["noteBlockId", "assets"],
            ),
            access: ToolAccess::WriteUnlessDryRun,
        },
    ]
}
