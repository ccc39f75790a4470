use crate::ContextManager;
use anyhow::Result;
use glob::{MatchOptions, Pattern};
use plandex_api::{DeleteContextRequest, DeleteContextResponse};
use plandex_core::Context;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoveOutcome {
    pub removed: Vec<Context>,
    pub response: DeleteContextResponse,
}

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

fn clean_selector(sel: &str) -> &str {
    let sel = sel.trim();
    let sel = sel.strip_prefix("./").unwrap_or(sel);
    if sel.len() > 1 { sel.trim_end_matches('/') } else { sel }
}

fn index_matches(sel: &str, index: usize) -> bool {
    if let Ok(n) = sel.parse::<usize>() {
        return n == index;
    }
    if let Some((lo, hi)) = sel.split_once('-')
        && let (Ok(lo), Ok(hi)) = (lo.trim().parse::<usize>(), hi.trim().parse::<usize>())
    {
        return (lo..=hi).contains(&index);
    }
    false
}

/// True when `dir` is a proper ancestor of `file_path`. The walk stops at
/// `.`, `/` or an empty path so malformed input cannot loop.
fn under_dir(file_path: &str, dir: &str) -> bool {
    if dir.is_empty() || file_path.is_empty() {
        return false;
    }
    let mut current = Path::new(file_path).parent();
    while let Some(parent) = current {
        let s = parent.to_string_lossy();
        if s.is_empty() || s == "." || s == "/" {
            return false;
        }
        if s == dir {
            return true;
        }
        current = parent.parent();
    }
    false
}

fn matches(ctx: &Context, index: usize, raw: &str) -> bool {
    let sel = clean_selector(raw);
    if sel.is_empty() {
        return false;
    }
    if index_matches(sel, index) {
        return true;
    }
    if sel == ctx.name || (!ctx.url.is_empty() && sel == ctx.url) || sel == ctx.file_path {
        return true;
    }
    if ctx.file_path.is_empty() {
        return false;
    }
    if let Ok(pattern) = Pattern::new(sel)
        && pattern.matches_with(&ctx.file_path, GLOB_OPTIONS)
    {
        return true;
    }
    under_dir(&ctx.file_path, sel)
}

/// Positions in `contexts` (already in listing order) picked by `selectors`.
/// Selectors are 1-based indexes or ranges, names, urls, globs on the file
/// path, or a parent directory.
pub fn select_for_removal(contexts: &[Context], selectors: &[String]) -> Vec<usize> {
    contexts
        .iter()
        .enumerate()
        .filter(|(i, ctx)| selectors.iter().any(|s| matches(ctx, i + 1, s)))
        .map(|(i, _)| i)
        .collect()
}

impl ContextManager {
    pub fn remove(&self, selectors: &[String]) -> Result<RemoveOutcome> {
        let contexts = self.list(false)?;
        let picked = select_for_removal(&contexts, selectors);
        if picked.is_empty() {
            return Ok(RemoveOutcome::default());
        }
        let removed: Vec<Context> = picked.into_iter().map(|i| contexts[i].clone()).collect();
        let ids = removed.iter().map(|c| c.id.clone()).collect();
        let response =
            self.api
                .delete_context(&self.plan_id, &self.branch, &DeleteContextRequest { ids })?;
        info!(
            plan_id = %self.plan_id,
            branch = %self.branch,
            removed = removed.len(),
            tokens_removed = response.tokens_removed,
            "removed context"
        );
        Ok(RemoveOutcome { removed, response })
    }
}
