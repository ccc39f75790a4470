use crate::ContextManager;
use crate::load::{context_key, image_params, looks_binary, text_params};
use crate::map::is_image_path;
use anyhow::{Context as _, Result};
use plandex_api::LoadContextResponse;
use plandex_core::{ContextType, ImageDetail};
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoLoadOutcome {
    pub response: LoadContextResponse,
    pub loaded: Vec<String>,
    /// Loaded from their first `max_body_size` bytes.
    pub truncated: Vec<String>,
    /// Left out because the running size total would be exceeded.
    pub skipped: Vec<String>,
    pub already_loaded: Vec<String>,
}

impl AutoLoadOutcome {
    pub fn report(&self) -> String {
        let mut lines = Vec::new();
        if !self.loaded.is_empty() {
            lines.push(format!("📥 Loaded {} files into context", self.loaded.len()));
        }
        for path in &self.truncated {
            lines.push(format!("  ✂️  {path} was truncated to fit the size limit"));
        }
        if !self.skipped.is_empty() {
            lines.push(format!(
                "ℹ️  Skipped because context is full: {}",
                self.skipped.join(", ")
            ));
        }
        lines.join("\n")
    }
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

impl ContextManager {
    /// Loads files the model asked for during a plan step. Oversized files are
    /// cut down rather than refused; files past the running size total are
    /// skipped and reported.
    pub fn auto_load(&self, paths: &[String]) -> Result<AutoLoadOutcome> {
        let existing = self.api.list_context(&self.plan_id, &self.branch)?;
        let mut outcome = AutoLoadOutcome::default();
        let mut seen: BTreeSet<(ContextType, String)> =
            existing.iter().filter_map(context_key).collect();

        let mut wanted = Vec::new();
        for path in paths {
            let rel = self.rel_path(path);
            if self.abs_path(&rel).is_dir() {
                continue;
            }
            let ty = if is_image_path(&rel) {
                ContextType::Image
            } else {
                ContextType::File
            };
            if !seen.insert((ty, rel.clone())) {
                outcome.already_loaded.push(rel);
                continue;
            }
            wanted.push(rel);
        }

        let max = self.limits.max_body_size;
        let read = self.pool.install(|| {
            wanted
                .par_iter()
                .map(|rel| {
                    let bytes = std::fs::read(self.abs_path(rel))
                        .with_context(|| format!("failed to read {rel}"))?;
                    Ok((rel.clone(), bytes))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut running: usize = existing
            .iter()
            .map(|c| if c.body_size > 0 { c.body_size } else { c.body.len() })
            .sum();
        let mut count = existing.len();
        let mut batch = Vec::new();
        for (rel, bytes) in read {
            if is_image_path(&rel) {
                if bytes.len() > max || running + bytes.len() > self.limits.max_total_size {
                    outcome.skipped.push(rel);
                    continue;
                }
                running += bytes.len();
                let mut params = image_params(&rel, &bytes, ImageDetail::default());
                params.auto_loaded = true;
                batch.push(params);
                count += 1;
                continue;
            }
            if looks_binary(&bytes) {
                outcome.skipped.push(rel);
                continue;
            }
            let text = String::from_utf8_lossy(&bytes);
            let kept = truncate_at_char_boundary(&text, max);
            let truncated = kept.len() < text.len();
            if running + kept.len() > self.limits.max_total_size
                || count + 1 > self.limits.max_context_count
            {
                outcome.skipped.push(rel);
                continue;
            }
            running += kept.len();
            count += 1;
            let mut params = text_params(ContextType::File, rel.clone(), kept);
            params.file_path = rel.clone();
            params.auto_loaded = true;
            params.truncated = truncated;
            if truncated {
                outcome.truncated.push(rel);
            }
            batch.push(params);
        }

        outcome.response = self.submit(&existing, batch, true, &mut outcome.loaded)?;
        info!(
            plan_id = %self.plan_id,
            branch = %self.branch,
            loaded = outcome.loaded.len(),
            truncated = outcome.truncated.len(),
            skipped = outcome.skipped.len(),
            "auto-loaded context"
        );
        Ok(outcome)
    }
}
