use crate::map::{build_map, has_map_support, is_image_path};
use crate::tree::{IgnoreRules, files_under, tree_body, tree_name};
use crate::url::url_name;
use crate::{ContextManager, LoadItem};
use anyhow::{Context as _, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use plandex_api::{LoadContextParams, LoadContextResponse};
use plandex_core::tokens::{estimate_image_bytes_tokens, estimate_text_tokens};
use plandex_core::{Context, ContextType, ImageDetail, body_sha, normalize_body};
use plandex_errors::PlandexError;
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info};

const MAX_SKIPPED_LISTED: usize = 20;
const BINARY_SNIFF_BYTES: usize = 8000;
const NOTE_NAME_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size: usize },
    Binary,
    Ignored,
    AlreadyLoaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub name: String,
    pub reason: SkipReason,
}

impl SkippedItem {
    fn new(name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            name: name.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOutcome {
    pub response: LoadContextResponse,
    pub loaded: Vec<String>,
    pub skipped: Vec<SkippedItem>,
    /// Map inputs read from a truncated prefix.
    pub truncated: Vec<String>,
    /// Map entries listed without a body.
    pub paths_only: Vec<String>,
}

fn mb(size: usize) -> String {
    format!("{:.2} MB", size as f64 / 1024.0 / 1024.0)
}

fn bullet_list(lines: &mut Vec<String>, header: &str, items: Vec<String>) {
    if items.is_empty() {
        return;
    }
    lines.push(header.to_string());
    let total = items.len();
    for item in items.into_iter().take(MAX_SKIPPED_LISTED) {
        lines.push(format!("  • {item}"));
    }
    if total > MAX_SKIPPED_LISTED {
        lines.push(format!("  • and {} more", total - MAX_SKIPPED_LISTED));
    }
}

impl LoadOutcome {
    /// Reasons for everything that was not loaded as-is. Empty when nothing
    /// needs reporting.
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        let by_reason = |pred: fn(&SkipReason) -> bool| -> Vec<&SkippedItem> {
            self.skipped.iter().filter(|s| pred(&s.reason)).collect()
        };
        bullet_list(
            &mut lines,
            "ℹ️  These files were skipped because they're too large:",
            by_reason(|r| matches!(r, SkipReason::TooLarge { .. }))
                .into_iter()
                .map(|s| match s.reason {
                    SkipReason::TooLarge { size } => format!("{} - {}", s.name, mb(size)),
                    _ => s.name.clone(),
                })
                .collect(),
        );
        bullet_list(
            &mut lines,
            "ℹ️  These files were skipped because they look binary:",
            by_reason(|r| *r == SkipReason::Binary)
                .into_iter()
                .map(|s| s.name.clone())
                .collect(),
        );
        bullet_list(
            &mut lines,
            "ℹ️  These paths are ignored (use --force-skip-ignore to load them):",
            by_reason(|r| *r == SkipReason::Ignored)
                .into_iter()
                .map(|s| s.name.clone())
                .collect(),
        );
        bullet_list(
            &mut lines,
            "ℹ️  Already in context:",
            by_reason(|r| *r == SkipReason::AlreadyLoaded)
                .into_iter()
                .map(|s| s.name.clone())
                .collect(),
        );
        bullet_list(
            &mut lines,
            "ℹ️  These files were mapped from a truncated prefix:",
            self.truncated.clone(),
        );
        bullet_list(
            &mut lines,
            "ℹ️  These files are listed in the map without definitions:",
            self.paths_only.clone(),
        );
        lines.join("\n")
    }
}

/// A load item after directory expansion, ready to be read.
#[derive(Debug, Clone)]
enum Planned {
    File { path: String, force_skip_ignore: bool },
    Image { path: String, detail: ImageDetail },
    Tree { path: String, force_skip_ignore: bool },
    Map { path: String, force_skip_ignore: bool },
    Url(String),
    Note(String),
    Piped(Vec<u8>),
}

impl Planned {
    fn key(&self) -> Option<(ContextType, String)> {
        match self {
            Planned::File { path, .. } => Some((ContextType::File, path.clone())),
            Planned::Image { path, .. } => Some((ContextType::Image, path.clone())),
            Planned::Tree { path, .. } => Some((ContextType::DirectoryTree, path.clone())),
            Planned::Map { path, .. } => Some((ContextType::Map, path.clone())),
            Planned::Url(url) => Some((ContextType::Url, url.clone())),
            Planned::Note(_) | Planned::Piped(_) => None,
        }
    }

    fn name(&self) -> String {
        match self {
            Planned::File { path, .. } | Planned::Image { path, .. } | Planned::Map { path, .. } => {
                path.clone()
            }
            Planned::Tree { path, .. } => tree_name(path),
            Planned::Url(url) => url_name(url),
            Planned::Note(text) => note_name(text),
            Planned::Piped(_) => "piped data".to_string(),
        }
    }
}

/// Identity of a stored item for duplicate detection. Notes and piped data
/// are never considered duplicates.
pub(crate) fn context_key(ctx: &Context) -> Option<(ContextType, String)> {
    match ctx.context_type {
        ContextType::Url => Some((ContextType::Url, ctx.url.clone())),
        ContextType::Note | ContextType::PipedData => None,
        other => Some((other, ctx.file_path.clone())),
    }
}

fn note_name(text: &str) -> String {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("note").trim();
    let mut name: String = first.chars().take(NOTE_NAME_CHARS).collect();
    if first.chars().count() > NOTE_NAME_CHARS {
        name.push('…');
    }
    name
}

#[derive(Debug, Default)]
struct Prepared {
    params: Option<LoadContextParams>,
    skipped: Option<SkippedItem>,
    truncated: Vec<String>,
    paths_only: Vec<String>,
}

impl Prepared {
    fn ready(params: LoadContextParams) -> Self {
        Self {
            params: Some(params),
            ..Self::default()
        }
    }

    fn skip(name: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            skipped: Some(SkippedItem::new(name, reason)),
            ..Self::default()
        }
    }
}

pub(crate) fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

pub(crate) fn text_params(
    ty: ContextType,
    name: String,
    body: &str,
) -> LoadContextParams {
    let body = normalize_body(body);
    LoadContextParams {
        context_type: Some(ty),
        name,
        sha: body_sha(&body),
        num_tokens: estimate_text_tokens(&body),
        body,
        ..LoadContextParams::default()
    }
}

pub(crate) fn image_params(path: &str, bytes: &[u8], detail: ImageDetail) -> LoadContextParams {
    let body = BASE64.encode(bytes);
    LoadContextParams {
        context_type: Some(ContextType::Image),
        name: path.to_string(),
        file_path: path.to_string(),
        sha: body_sha(&body),
        num_tokens: estimate_image_bytes_tokens(bytes, detail),
        body,
        image_detail: Some(detail),
        ..LoadContextParams::default()
    }
}

impl ContextManager {
    /// Loads `items` into the branch. Nothing is stored unless every item
    /// reads cleanly and the batch fits the count, size and token limits.
    pub fn load(&self, items: &[LoadItem]) -> Result<LoadOutcome> {
        let existing = self.api.list_context(&self.plan_id, &self.branch)?;
        let mut outcome = LoadOutcome::default();
        let planned = self.expand(items, &existing, &mut outcome.skipped)?;

        let prepared = self.pool.install(|| {
            planned
                .par_iter()
                .map(|p| self.prepare(p))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut batch = Vec::new();
        for p in prepared {
            outcome.truncated.extend(p.truncated);
            outcome.paths_only.extend(p.paths_only);
            if let Some(skipped) = p.skipped {
                outcome.skipped.push(skipped);
            }
            if let Some(params) = p.params {
                batch.push(params);
            }
        }

        outcome.response = self.submit(&existing, batch, false, &mut outcome.loaded)?;
        info!(
            plan_id = %self.plan_id,
            branch = %self.branch,
            loaded = outcome.loaded.len(),
            skipped = outcome.skipped.len(),
            tokens_added = outcome.response.tokens_added,
            "loaded context"
        );
        Ok(outcome)
    }

    /// Checks the batch against local caps, sends it, and turns a token
    /// overflow into a `ContextLimit` error.
    pub(crate) fn submit(
        &self,
        existing: &[Context],
        batch: Vec<LoadContextParams>,
        auto_loaded: bool,
        loaded: &mut Vec<String>,
    ) -> Result<LoadContextResponse> {
        let current_tokens: usize = existing.iter().map(|c| c.num_tokens).sum();
        // The server blocks an auto-loading stream until it hears back, even for nothing.
        if batch.is_empty() && !auto_loaded {
            return Ok(LoadContextResponse {
                tokens_added: 0,
                total_tokens: current_tokens,
                msg: "No context loaded".to_string(),
                ..LoadContextResponse::default()
            });
        }
        if !batch.is_empty() {
            self.check_limits(existing, &batch)?;
        }

        let names: Vec<String> = batch.iter().map(|p| p.name.clone()).collect();
        let resp = if auto_loaded {
            self.api.auto_load_context(&self.plan_id, &self.branch, &batch)?
        } else {
            self.api.load_context(&self.plan_id, &self.branch, &batch)?
        };
        if resp.max_tokens_exceeded {
            let projected = resp.total_tokens as i64 + resp.tokens_added;
            let overage = (projected - resp.max_tokens as i64).max(0) as usize;
            return Err(PlandexError::ContextLimit {
                reason: format!(
                    "loading would bring context to {projected} tokens, over the {} token limit",
                    resp.max_tokens
                ),
                overage_tokens: overage,
            }
            .into());
        }
        loaded.extend(names);
        Ok(resp)
    }

    fn check_limits(&self, existing: &[Context], batch: &[LoadContextParams]) -> Result<()> {
        let count = existing.len() + batch.len();
        if count > self.limits.max_context_count {
            return Err(PlandexError::ContextLimit {
                reason: format!(
                    "{count} context items would exceed the limit of {}",
                    self.limits.max_context_count
                ),
                overage_tokens: 0,
            }
            .into());
        }
        let existing_size: usize = existing
            .iter()
            .map(|c| if c.body_size > 0 { c.body_size } else { c.body.len() })
            .sum();
        let batch_size: usize = batch.iter().map(|p| p.body.len()).sum();
        if existing_size + batch_size > self.limits.max_total_size {
            return Err(PlandexError::ContextLimit {
                reason: format!(
                    "total context size of {} would exceed the limit of {}",
                    mb(existing_size + batch_size),
                    mb(self.limits.max_total_size)
                ),
                overage_tokens: 0,
            }
            .into());
        }
        Ok(())
    }

    fn expand(
        &self,
        items: &[LoadItem],
        existing: &[Context],
        skipped: &mut Vec<SkippedItem>,
    ) -> Result<Vec<Planned>> {
        let ignore = IgnoreRules::load(&self.root);
        let mut planned = Vec::new();
        for item in items {
            match item {
                LoadItem::File {
                    path,
                    force_skip_ignore,
                } => {
                    let rel = self.rel_path(path);
                    let abs = self.abs_path(&rel);
                    if abs.is_dir() {
                        return Err(anyhow!(
                            "{rel} is a directory; load it recursively, as a tree, or as a map"
                        ));
                    }
                    if !*force_skip_ignore && ignore.is_ignored(&rel, false) {
                        skipped.push(SkippedItem::new(rel, SkipReason::Ignored));
                        continue;
                    }
                    if is_image_path(&rel) {
                        planned.push(Planned::Image {
                            path: rel,
                            detail: ImageDetail::default(),
                        });
                    } else {
                        planned.push(Planned::File {
                            path: rel,
                            force_skip_ignore: *force_skip_ignore,
                        });
                    }
                }
                LoadItem::DirectoryTree {
                    path,
                    recursive,
                    names_only,
                    defs_only,
                    force_skip_ignore,
                } => {
                    let rel = self.rel_path(path);
                    let force = *force_skip_ignore;
                    if !self.abs_path(&rel).exists() {
                        return Err(anyhow!("path not found: {rel}"));
                    }
                    if *names_only {
                        planned.push(Planned::Tree {
                            path: rel,
                            force_skip_ignore: force,
                        });
                    } else if *defs_only {
                        planned.push(Planned::Map {
                            path: rel,
                            force_skip_ignore: force,
                        });
                    } else if *recursive {
                        for file in files_under(&self.root, &rel, force)? {
                            if is_image_path(&file) {
                                planned.push(Planned::Image {
                                    path: file,
                                    detail: ImageDetail::default(),
                                });
                            } else {
                                planned.push(Planned::File {
                                    path: file,
                                    force_skip_ignore: force,
                                });
                            }
                        }
                    } else {
                        return Err(anyhow!(
                            "{rel} is a directory; pass --recursive, --tree or --map"
                        ));
                    }
                }
                LoadItem::Url(url) => planned.push(Planned::Url(url.clone())),
                LoadItem::Note(text) => planned.push(Planned::Note(text.clone())),
                LoadItem::Image { path, detail } => planned.push(Planned::Image {
                    path: self.rel_path(path),
                    detail: *detail,
                }),
                LoadItem::PipedData(bytes) => planned.push(Planned::Piped(bytes.clone())),
            }
        }

        let mut seen: BTreeSet<(ContextType, String)> =
            existing.iter().filter_map(context_key).collect();
        let mut out = Vec::with_capacity(planned.len());
        for p in planned {
            if let Some(key) = p.key() {
                if !seen.insert(key) {
                    skipped.push(SkippedItem::new(p.name(), SkipReason::AlreadyLoaded));
                    continue;
                }
            }
            out.push(p);
        }
        debug!(items = out.len(), "expanded load items");
        Ok(out)
    }

    fn read_bytes(&self, rel: &str) -> Result<Vec<u8>> {
        std::fs::read(self.abs_path(rel)).with_context(|| format!("failed to read {rel}"))
    }

    fn prepare(&self, planned: &Planned) -> Result<Prepared> {
        let max = self.limits.max_body_size;
        Ok(match planned {
            Planned::File {
                path,
                force_skip_ignore,
            } => {
                let bytes = self.read_bytes(path)?;
                if bytes.len() > max {
                    return Ok(Prepared::skip(path, SkipReason::TooLarge { size: bytes.len() }));
                }
                if looks_binary(&bytes) {
                    return Ok(Prepared::skip(path, SkipReason::Binary));
                }
                let mut params =
                    text_params(ContextType::File, path.clone(), &String::from_utf8_lossy(&bytes));
                params.file_path = path.clone();
                params.force_skip_ignore = *force_skip_ignore;
                Prepared::ready(params)
            }
            Planned::Image { path, detail } => {
                let bytes = self.read_bytes(path)?;
                if bytes.len() > max {
                    return Ok(Prepared::skip(path, SkipReason::TooLarge { size: bytes.len() }));
                }
                Prepared::ready(image_params(path, &bytes, *detail))
            }
            Planned::Tree {
                path,
                force_skip_ignore,
            } => {
                let body = tree_body(&self.root, path, *force_skip_ignore)?;
                if body.len() > max {
                    return Ok(Prepared::skip(
                        tree_name(path),
                        SkipReason::TooLarge { size: body.len() },
                    ));
                }
                let mut params = text_params(ContextType::DirectoryTree, tree_name(path), &body);
                params.file_path = path.clone();
                params.force_skip_ignore = *force_skip_ignore;
                Prepared::ready(params)
            }
            Planned::Map {
                path,
                force_skip_ignore,
            } => {
                let files: Vec<String> = files_under(&self.root, path, *force_skip_ignore)?
                    .into_iter()
                    .filter(|f| has_map_support(f))
                    .collect();
                let built = build_map(&self.root, &files, &self.limits, Some(self.api.as_ref()))?;
                let body = built.body();
                let params = LoadContextParams {
                    context_type: Some(ContextType::Map),
                    name: path.clone(),
                    file_path: path.clone(),
                    sha: body_sha(&body),
                    num_tokens: built.num_tokens(),
                    body,
                    force_skip_ignore: *force_skip_ignore,
                    truncated: !built.truncated.is_empty() || built.omitted > 0,
                    map_parts: built.parts,
                    map_shas: built.shas,
                    map_tokens: built.tokens,
                    ..LoadContextParams::default()
                };
                Prepared {
                    params: Some(params),
                    skipped: None,
                    truncated: built.truncated,
                    paths_only: built.paths_only,
                }
            }
            Planned::Url(url) => {
                let body = self.fetcher.fetch(url)?;
                if body.len() > max {
                    return Ok(Prepared::skip(
                        url_name(url),
                        SkipReason::TooLarge { size: body.len() },
                    ));
                }
                let mut params = text_params(ContextType::Url, url_name(url), &body);
                params.url = url.clone();
                Prepared::ready(params)
            }
            Planned::Note(text) => {
                if text.len() > max {
                    return Ok(Prepared::skip(
                        note_name(text),
                        SkipReason::TooLarge { size: text.len() },
                    ));
                }
                Prepared::ready(text_params(ContextType::Note, note_name(text), text))
            }
            Planned::Piped(bytes) => {
                if bytes.len() > max {
                    return Ok(Prepared::skip(
                        "piped data",
                        SkipReason::TooLarge { size: bytes.len() },
                    ));
                }
                Prepared::ready(text_params(
                    ContextType::PipedData,
                    "piped data".to_string(),
                    &String::from_utf8_lossy(bytes),
                ))
            }
        })
    }
}
