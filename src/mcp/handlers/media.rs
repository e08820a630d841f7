//! Media tools: importing images, scraping page images, webpage screenshots
//! and inserting assets into notes.
//!
//! All four accept the same placement arguments (`noteBlockId`, `mode`,
//! `anchorBlockId`, `dryRun`, `altPrefix`). With `dryRun` they still fetch and
//! validate but never upload or write, and the read-only guard is skipped.

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{optional, parse_args, required, ToolContext};
use crate::media::extract::{self, DEFAULT_EXTRACT_LIMIT};
use crate::media::import::ImportOptions;
use crate::media::insert::{insert_assets_to_note, AssetRef, InsertOutcome, InsertRequest};
use crate::media::screenshot::{ScreenshotRequest, DEFAULT_WIDTH};
use crate::media::{ImageAsset, InsertMode};
use crate::net::validate_public_url;

pub const MAX_URLS_PER_CALL: usize = 20;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Placement {
    note_block_id: Option<String>,
    mode: InsertMode,
    anchor_block_id: Option<String>,
    dry_run: bool,
    alt_prefix: Option<String>,
}

impl Placement {
    fn request<'a>(&'a self, note_block_id: &'a str) -> InsertRequest<'a> {
        InsertRequest {
            note_block_id,
            mode: self.mode,
            anchor_block_id: optional(&self.anchor_block_id),
            alt_prefix: optional(&self.alt_prefix),
            dry_run: self.dry_run,
        }
    }

    /// Insert `assets` when a target note was given.
    async fn insert_if_requested(
        &self,
        ctx: &ToolContext,
        assets: &[ImageAsset],
    ) -> anyhow::Result<Option<InsertOutcome>> {
        let Some(note) = optional(&self.note_block_id) else {
            return Ok(None);
        };
        if assets.is_empty() {
            return Ok(None);
        }
        let refs: Vec<AssetRef> = assets.iter().map(AssetRef::from).collect();
        let outcome = insert_assets_to_note(&ctx.backend, &refs, &self.request(note))
            .await
            .with_context(|| {
                let paths: Vec<&str> = assets.iter().map(|a| a.asset_path.as_str()).collect();
                format!(
                    "imported {} image(s) ({}) but inserting into note {} failed",
                    assets.len(),
                    paths.join(", "),
                    note
                )
            })?;
        Ok(Some(outcome))
    }
}

fn with_operation(mut payload: Value, outcome: Option<InsertOutcome>) -> Value {
    if let (Some(outcome), Some(obj)) = (outcome, payload.as_object_mut()) {
        obj.insert("doc".into(), json!(outcome.doc));
        obj.insert("operation".into(), json!(outcome.operation));
    }
    payload
}

/// `prefix` for a single file, `prefix-N` when importing several.
fn numbered_name(prefix: Option<&str>, index: usize, total: usize) -> Option<String> {
    prefix.map(|p| {
        if total > 1 {
            format!("{}-{}", p, index + 1)
        } else {
            p.to_string()
        }
    })
}

// ============================================
// siyuan_import_image_urls
// ============================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ImportUrlsArgs {
    urls: Vec<String>,
    file_name_prefix: Option<String>,
    #[serde(flatten)]
    placement: Placement,
}

pub async fn handle_import_image_urls(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: ImportUrlsArgs = parse_args(args)?;
    if !a.placement.dry_run {
        ctx.assert_write_allowed("siyuan_import_image_urls")?;
    }

    let mut urls: Vec<&str> = Vec::new();
    for url in a.urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    if urls.is_empty() {
        bail!("missing required argument: urls");
    }
    if urls.len() > MAX_URLS_PER_CALL {
        bail!("too many urls: {} (at most {} per call)", urls.len(), MAX_URLS_PER_CALL);
    }

    let prefix = optional(&a.file_name_prefix);
    let mut assets = Vec::new();
    let mut failures = Vec::new();
    for (i, url) in urls.iter().enumerate() {
        let opts = ImportOptions {
            file_name: numbered_name(prefix, i, urls.len()),
            dry_run: a.placement.dry_run,
        };
        match ctx.pipeline.import_image_from_url(url, &opts).await {
            Ok(asset) => assets.push(asset),
            Err(e) => {
                warn!(url, "Image import failed: {}", e);
                failures.push(json!({ "url": url, "error": e.to_string() }));
            }
        }
    }

    if assets.is_empty() {
        let reasons: Vec<String> = failures
            .iter()
            .map(|f| format!("{}: {}", f["url"].as_str().unwrap_or_default(), f["error"].as_str().unwrap_or_default()))
            .collect();
        bail!("all {} image import(s) failed: {}", urls.len(), reasons.join("; "));
    }

    let outcome = a.placement.insert_if_requested(ctx, &assets).await?;
    Ok(with_operation(
        json!({
            "ok": true,
            "assets": assets,
            "failures": failures,
            "dryRun": a.placement.dry_run,
        }),
        outcome,
    ))
}

// ============================================
// siyuan_extract_page_images
// ============================================

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ExtractArgs {
    page_url: Option<String>,
    limit: usize,
    import: bool,
    file_name_prefix: Option<String>,
    #[serde(flatten)]
    placement: Placement,
}

impl Default for ExtractArgs {
    fn default() -> Self {
        Self {
            page_url: None,
            limit: DEFAULT_EXTRACT_LIMIT,
            import: false,
            file_name_prefix: None,
            placement: Placement::default(),
        }
    }
}

pub async fn handle_extract_page_images(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: ExtractArgs = parse_args(args)?;
    if a.import && !a.placement.dry_run {
        ctx.assert_write_allowed("siyuan_extract_page_images")?;
    }
    let page_url = validate_public_url(required(&a.page_url, "pageUrl")?)?;

    let (html, via) = extract::fetch_page(
        ctx.pipeline.fetcher(),
        &page_url,
        &ctx.config.page_mirror_prefix,
        ctx.config.remote.timeout,
    )
    .await?;
    let image_urls = extract::extract_image_urls_from_html(&page_url, &html, a.limit);

    let mut payload = json!({
        "ok": true,
        "pageUrl": page_url.as_str(),
        "fetchedVia": via,
        "imageUrls": image_urls,
        "dryRun": a.placement.dry_run,
    });
    if !a.import {
        return Ok(payload);
    }

    let prefix = optional(&a.file_name_prefix);
    let mut assets = Vec::new();
    let mut failures = Vec::new();
    for (i, url) in image_urls.iter().enumerate() {
        let opts = ImportOptions {
            file_name: numbered_name(prefix, i, image_urls.len()),
            dry_run: a.placement.dry_run,
        };
        match ctx.pipeline.import_image_from_url(url, &opts).await {
            Ok(asset) => assets.push(asset),
            Err(e) => {
                warn!(url = %url, "Page image import failed: {}", e);
                failures.push(json!({ "url": url, "error": e.to_string() }));
            }
        }
    }

    let outcome = a.placement.insert_if_requested(ctx, &assets).await?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("assets".into(), json!(assets));
        obj.insert("failures".into(), json!(failures));
    }
    Ok(with_operation(payload, outcome))
}

// ============================================
// siyuan_capture_webpage_screenshot
// ============================================

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ScreenshotArgs {
    url: Option<String>,
    width: u32,
    height: Option<u32>,
    full_page: bool,
    file_name: Option<String>,
    #[serde(flatten)]
    placement: Placement,
}

impl Default for ScreenshotArgs {
    fn default() -> Self {
        Self {
            url: None,
            width: DEFAULT_WIDTH,
            height: None,
            full_page: true,
            file_name: None,
            placement: Placement::default(),
        }
    }
}

pub async fn handle_capture_webpage_screenshot(
    ctx: &ToolContext,
    args: &Value,
) -> anyhow::Result<Value> {
    let a: ScreenshotArgs = parse_args(args)?;
    if !a.placement.dry_run {
        ctx.assert_write_allowed("siyuan_capture_webpage_screenshot")?;
    }
    let url = required(&a.url, "url")?;

    let outcome = ctx
        .screenshots
        .capture(&ScreenshotRequest {
            url: url.to_string(),
            width: a.width,
            height: a.height,
            full_page: a.full_page,
            file_name: optional(&a.file_name).map(String::from),
            dry_run: a.placement.dry_run,
        })
        .await?;

    let inserted = a
        .placement
        .insert_if_requested(ctx, std::slice::from_ref(&outcome.asset))
        .await?;
    Ok(with_operation(
        json!({
            "ok": true,
            "localFallbackUsed": outcome.local_fallback_used,
            "asset": outcome.asset,
            "warnings": outcome.warnings,
            "dryRun": a.placement.dry_run,
        }),
        inserted,
    ))
}

// ============================================
// siyuan_insert_images_to_note
// ============================================

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InsertImagesArgs {
    assets: Vec<AssetRef>,
    #[serde(flatten)]
    placement: Placement,
}

pub async fn handle_insert_images_to_note(ctx: &ToolContext, args: &Value) -> anyhow::Result<Value> {
    let a: InsertImagesArgs = parse_args(args)?;
    if !a.placement.dry_run {
        ctx.assert_write_allowed("siyuan_insert_images_to_note")?;
    }
    let note = required(&a.placement.note_block_id, "noteBlockId")?;
    if a.assets.is_empty() {
        bail!("missing required argument: assets");
    }
    if let Some(bad) = a.assets.iter().find(|r| r.asset_path.trim().is_empty()) {
        bail!("asset entry without assetPath: {:?}", bad);
    }

    let outcome = insert_assets_to_note(&ctx.backend, &a.assets, &a.placement.request(note)).await?;
    Ok(json!({
        "ok": true,
        "doc": outcome.doc,
        "operation": outcome.operation,
    }))
}
