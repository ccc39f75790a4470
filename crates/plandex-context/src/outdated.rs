use crate::ContextManager;
use crate::load::looks_binary;
use crate::map::{build_map, compose_map_body, has_map_support};
use crate::tree::{files_under, tree_body};
use anyhow::{Context as _, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use plandex_api::{DeleteContextRequest, LoadContextResponse, UpdateContextParams};
use plandex_core::tokens::{estimate_image_bytes_tokens, estimate_text_tokens};
use plandex_core::{Context, ContextType, body_sha, normalize_body, sha256_hex};
use plandex_errors::PlandexError;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use tracing::{info, warn};

enum Refresh {
    Unchanged,
    Updated(UpdateContextParams),
    Removed,
}

/// Items whose source no longer matches what is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutdatedReport {
    pub updated: BTreeMap<String, UpdateContextParams>,
    /// Items whose source is gone; they are deleted on update.
    pub removed: Vec<String>,
    pub token_diffs: BTreeMap<String, i64>,
    pub counts: BTreeMap<ContextType, usize>,
    /// Stored state of every item in the report, by id.
    pub contexts: BTreeMap<String, Context>,
}

impl OutdatedReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn total_token_diff(&self) -> i64 {
        self.token_diffs.values().sum()
    }

    pub fn num_items(&self) -> usize {
        self.updated.len() + self.removed.len()
    }

    fn record(&mut self, ctx: Context, refresh: Refresh) {
        let diff = match &refresh {
            Refresh::Unchanged => return,
            Refresh::Updated(params) => params.num_tokens as i64 - ctx.num_tokens as i64,
            Refresh::Removed => -(ctx.num_tokens as i64),
        };
        match refresh {
            Refresh::Updated(params) => {
                self.updated.insert(ctx.id.clone(), params);
            }
            Refresh::Removed => self.removed.push(ctx.id.clone()),
            Refresh::Unchanged => {}
        }
        self.token_diffs.insert(ctx.id.clone(), diff);
        *self.counts.entry(ctx.context_type).or_default() += 1;
        self.contexts.insert(ctx.id.clone(), ctx);
    }

    /// One-line description, e.g. `2 files and 1 url have changed (+35 🪙)`.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "✅ Context is up to date".to_string();
        }
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(ty, n)| {
                let label = ty.label();
                if *n == 1 {
                    format!("{n} {label}")
                } else {
                    format!("{n} {label}s")
                }
            })
            .collect();
        let joined = match parts.split_last() {
            Some((last, rest)) if !rest.is_empty() => format!("{} and {last}", rest.join(", ")),
            _ => parts.join(""),
        };
        let verb = if self.num_items() == 1 { "has" } else { "have" };
        let diff = self.total_token_diff();
        let sign = if diff >= 0 { "+" } else { "" };
        format!("{joined} {verb} changed ({sign}{diff} 🪙)")
    }

    /// New bodies of file items keyed by path; removed files map to an empty body.
    pub fn updated_file_bodies(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (id, ctx) in &self.contexts {
            if ctx.context_type != ContextType::File {
                continue;
            }
            if let Some(params) = self.updated.get(id) {
                out.insert(ctx.file_path.clone(), params.body.clone());
            } else if self.removed.contains(id) {
                out.insert(ctx.file_path.clone(), String::new());
            }
        }
        out
    }
}

/// What to do when an update would break pending replacements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    Cancel,
    Rebuild,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub response: LoadContextResponse,
    pub removed: usize,
    /// Paths whose pending changes must be rebuilt against the new bodies.
    pub conflicts: Vec<String>,
}

fn read_map_input(path: &std::path::Path, limit: usize) -> Result<String> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut buf = Vec::new();
    file.take(limit as u64)
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

impl ContextManager {
    /// Re-reads the source of every refreshable item (or only `ids`) and
    /// reports what changed. Stored context is not touched.
    pub fn check_outdated(&self, ids: Option<&[String]>) -> Result<OutdatedReport> {
        let contexts: Vec<Context> = self
            .list(false)?
            .into_iter()
            .filter(|c| c.context_type.is_refreshable())
            .filter(|c| ids.is_none_or(|ids| ids.contains(&c.id)))
            .collect();

        let refreshed = self.pool.install(|| {
            contexts
                .into_par_iter()
                .map(|ctx| {
                    let refresh = self
                        .refresh(&ctx)
                        .with_context(|| format!("failed to check {}", ctx.display_name()))?;
                    Ok((ctx, refresh))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut report = OutdatedReport::default();
        for (ctx, refresh) in refreshed {
            report.record(ctx, refresh);
        }
        Ok(report)
    }

    /// Report for explicitly supplied bodies, keyed by item id.
    pub fn report_for_bodies(&self, bodies: &BTreeMap<String, String>) -> Result<OutdatedReport> {
        let mut report = OutdatedReport::default();
        for ctx in self.list(false)? {
            let Some(body) = bodies.get(&ctx.id) else {
                continue;
            };
            let body = normalize_body(body);
            let sha = body_sha(&body);
            if sha == ctx.sha {
                continue;
            }
            let params = UpdateContextParams {
                num_tokens: estimate_text_tokens(&body),
                sha,
                body,
                ..UpdateContextParams::default()
            };
            report.record(ctx, Refresh::Updated(params));
        }
        Ok(report)
    }

    /// Paths with pending replacements that would no longer apply after `report`.
    pub fn conflicts(&self, report: &OutdatedReport) -> Result<Vec<String>> {
        let bodies = report.updated_file_bodies();
        if bodies.is_empty() {
            return Ok(Vec::new());
        }
        let state = self
            .api
            .get_current_plan_state(&self.plan_id, &self.branch)?;
        Ok(plandex_diff::conflicted_paths(&state, &bodies))
    }

    /// Stores the new bodies in `report` and deletes items whose source is gone.
    /// Conflicting pending changes either cancel the update or are returned
    /// for rebuilding.
    pub fn update(&self, report: &OutdatedReport, choice: ConflictChoice) -> Result<UpdateOutcome> {
        let mut outcome = UpdateOutcome::default();
        if report.is_empty() {
            return Ok(outcome);
        }
        let conflicts = self.conflicts(report)?;
        if !conflicts.is_empty() {
            if choice == ConflictChoice::Cancel {
                return Err(PlandexError::ContextConflict { paths: conflicts }.into());
            }
            warn!(paths = ?conflicts, "context update conflicts with pending changes");
        }

        if !report.updated.is_empty() {
            let resp = self
                .api
                .update_context(&self.plan_id, &self.branch, &report.updated)?;
            if resp.max_tokens_exceeded {
                let projected = resp.total_tokens as i64 + resp.tokens_added;
                return Err(PlandexError::ContextLimit {
                    reason: format!(
                        "updating would bring context to {projected} tokens, over the {} token limit",
                        resp.max_tokens
                    ),
                    overage_tokens: (projected - resp.max_tokens as i64).max(0) as usize,
                }
                .into());
            }
            outcome.response = resp;
        }
        if !report.removed.is_empty() {
            let resp = self.api.delete_context(
                &self.plan_id,
                &self.branch,
                &DeleteContextRequest {
                    ids: report.removed.clone(),
                },
            )?;
            outcome.response.total_tokens = resp.total_tokens;
            outcome.response.tokens_added -= resp.tokens_removed as i64;
            outcome.removed = report.removed.len();
        }
        outcome.conflicts = conflicts;
        info!(
            plan_id = %self.plan_id,
            branch = %self.branch,
            updated = report.updated.len(),
            removed = outcome.removed,
            conflicts = outcome.conflicts.len(),
            "updated context"
        );
        Ok(outcome)
    }

    fn refresh(&self, ctx: &Context) -> Result<Refresh> {
        let max = self.limits.max_body_size;
        match ctx.context_type {
            ContextType::File => {
                let abs = self.abs_path(&ctx.file_path);
                if !abs.is_file() {
                    return Ok(Refresh::Removed);
                }
                let mut bytes = std::fs::read(&abs)?;
                if looks_binary(&bytes) {
                    return Ok(Refresh::Removed);
                }
                bytes.truncate(max);
                let body = normalize_body(&String::from_utf8_lossy(&bytes));
                Ok(self.text_refresh(ctx, body))
            }
            ContextType::Image => {
                let abs = self.abs_path(&ctx.file_path);
                if !abs.is_file() {
                    return Ok(Refresh::Removed);
                }
                let bytes = std::fs::read(&abs)?;
                let body = BASE64.encode(&bytes);
                let sha = body_sha(&body);
                if sha == ctx.sha {
                    return Ok(Refresh::Unchanged);
                }
                let detail = ctx.image_detail.unwrap_or_default();
                Ok(Refresh::Updated(UpdateContextParams {
                    body,
                    sha,
                    num_tokens: estimate_image_bytes_tokens(&bytes, detail),
                    ..UpdateContextParams::default()
                }))
            }
            ContextType::DirectoryTree => {
                if !self.abs_path(&ctx.file_path).is_dir() {
                    return Ok(Refresh::Removed);
                }
                let body = tree_body(&self.root, &ctx.file_path, ctx.force_skip_ignore)?;
                Ok(self.text_refresh(ctx, body))
            }
            ContextType::Url => {
                let body = normalize_body(&self.fetcher.fetch(&ctx.url)?);
                Ok(self.text_refresh(ctx, body))
            }
            ContextType::Map => self.refresh_map(ctx),
            ContextType::Note | ContextType::PipedData => Ok(Refresh::Unchanged),
        }
    }

    fn text_refresh(&self, ctx: &Context, body: String) -> Refresh {
        let sha = body_sha(&body);
        if sha == ctx.sha {
            return Refresh::Unchanged;
        }
        Refresh::Updated(UpdateContextParams {
            num_tokens: estimate_text_tokens(&body),
            sha,
            body,
            ..UpdateContextParams::default()
        })
    }

    /// Re-maps only the paths whose input changed, plus paths that appeared.
    fn refresh_map(&self, ctx: &Context) -> Result<Refresh> {
        if !self.abs_path(&ctx.file_path).is_dir() {
            return Ok(Refresh::Removed);
        }
        let current: Vec<String> = files_under(&self.root, &ctx.file_path, ctx.force_skip_ignore)?
            .into_iter()
            .filter(|f| has_map_support(f))
            .collect();
        let current_set: BTreeSet<&String> = current.iter().collect();
        let removed: Vec<String> = ctx
            .map_parts
            .keys()
            .filter(|p| !current_set.contains(p))
            .cloned()
            .collect();

        let mut changed = Vec::new();
        for path in &current {
            match ctx.map_shas.get(path) {
                Some(stored) => {
                    let input =
                        read_map_input(&self.abs_path(path), self.limits.max_map_single_input_size)?;
                    if &sha256_hex(input.as_bytes()) != stored {
                        changed.push(path.clone());
                    }
                }
                None if !ctx.map_parts.contains_key(path) => changed.push(path.clone()),
                None => {}
            }
        }
        if changed.is_empty() && removed.is_empty() {
            return Ok(Refresh::Unchanged);
        }

        let rebuilt = build_map(&self.root, &changed, &self.limits, Some(self.api.as_ref()))?;
        let mut parts = ctx.map_parts.clone();
        let mut tokens = ctx.map_tokens.clone();
        for path in &removed {
            parts.remove(path);
            tokens.remove(path);
        }
        for (path, part) in &rebuilt.parts {
            parts.insert(path.clone(), part.clone());
        }
        for (path, n) in &rebuilt.tokens {
            tokens.insert(path.clone(), *n);
        }
        let body = compose_map_body(&parts);
        Ok(Refresh::Updated(UpdateContextParams {
            sha: body_sha(&body),
            num_tokens: tokens.values().sum(),
            body,
            map_parts: rebuilt.parts,
            map_shas: rebuilt.shas,
            map_tokens: rebuilt.tokens,
            removed_map_paths: removed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoadItem;
    use crate::testing::{StaticFetcher, manager};
    use plandex_core::{CurrentPlanState, PlanResult};
    use plandex_testkit::fixtures::{edits, rep};
    use plandex_testkit::FakeServer;
    use std::fs;

    fn file(path: &str) -> LoadItem {
        LoadItem::File {
            path: path.to_string(),
            force_skip_ignore: false,
        }
    }

    #[test]
    fn unchanged_context_reports_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), "a\n").expect("write");
        let server = FakeServer::shared();
        let mgr = manager(&server, dir.path());
        mgr.load(&[file("a.txt"), LoadItem::Note("n".to_string())]).expect("load");
        let report = mgr.check_outdated(None).expect("check");
        assert!(report.is_empty());
        assert_eq!(report.summary(), "✅ Context is up to date");
    }

    #[test]
    fn drift_is_detected_per_item_without_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), "aaaa").expect("write");
        fs::write(dir.path().join("gone.txt"), "bbbbbbbb").expect("write");
        let server = FakeServer::shared();
        let fetcher = StaticFetcher::new(&[("https://x.dev/doc", "v1")]);
        let mgr = manager(&server, dir.path()).with_fetcher(fetcher.clone());
        mgr.load(&[
            file("a.txt"),
            file("gone.txt"),
            LoadItem::Url("https://x.dev/doc".to_string()),
        ])
        .expect("load");

        fs::write(dir.path().join("a.txt"), "aaaaaaaaaaaa").expect("write");
        fs::remove_file(dir.path().join("gone.txt")).expect("rm");
        fetcher.set("https://x.dev/doc", "version two");

        let before = mgr.list(true).expect("list");
        let report = mgr.check_outdated(None).expect("check");
        assert_eq!(report.updated.len(), 2);
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.counts[&ContextType::File], 2);
        assert_eq!(report.counts[&ContextType::Url], 1);
        let a = before.iter().find(|c| c.name == "a.txt").expect("a");
        let gone = before.iter().find(|c| c.name == "gone.txt").expect("gone");
        assert_eq!(report.token_diffs[&a.id], 2);
        assert_eq!(report.token_diffs[&gone.id], -2);
        assert_eq!(report.summary(), "2 files and 1 url have changed (+2 🪙)");
        assert_eq!(mgr.list(true).expect("list"), before);

        let outcome = mgr.update(&report, ConflictChoice::Cancel).expect("update");
        assert_eq!(outcome.removed, 1);
        assert!(outcome.conflicts.is_empty());
        let after = mgr.list(true).expect("list");
        assert_eq!(after.len(), 2);
        for ctx in &after {
            assert_eq!(ctx.sha, body_sha(&ctx.body));
        }
        assert!(mgr.check_outdated(None).expect("recheck").is_empty());
    }

    #[test]
    fn conflicting_update_cancels_or_returns_rebuild_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("x.ts"), "const a = 1;\nconst b = 2;\n").expect("write");
        let server = FakeServer::shared();
        let mgr = manager(&server, dir.path());
        mgr.load(&[file("x.ts")]).expect("load");

        let base = "const a = 1;\nconst b = 2;\n";
        let result = edits(
            "x.ts",
            base,
            vec![rep("const a = 1;", "const a = 10;"), rep("const b = 2;", "const b = 20;")],
            1,
        );
        server.set_plan_state(
            mgr.plan_id(),
            mgr.branch(),
            CurrentPlanState {
                plan_result: PlanResult::from_results(vec![result]),
                ..CurrentPlanState::default()
            },
        );

        fs::write(dir.path().join("x.ts"), "let a = 1;\nlet b = 2;\n").expect("write");
        let report = mgr.check_outdated(None).expect("check");
        let err = mgr.update(&report, ConflictChoice::Cancel).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PlandexError>(),
            Some(&PlandexError::ContextConflict {
                paths: vec!["x.ts".to_string()]
            })
        );
        assert_eq!(
            mgr.list(true).expect("list")[0].body,
            "const a = 1;\nconst b = 2;\n"
        );

        let outcome = mgr.update(&report, ConflictChoice::Rebuild).expect("update");
        assert_eq!(outcome.conflicts, vec!["x.ts".to_string()]);
        assert_eq!(mgr.list(true).expect("list")[0].body, "let a = 1;\nlet b = 2;\n");
    }

    #[test]
    fn compatible_edits_do_not_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("x.ts"), "const a = 1;\n").expect("write");
        let server = FakeServer::shared();
        let mgr = manager(&server, dir.path());
        mgr.load(&[file("x.ts")]).expect("load");
        let result = edits("x.ts", "const a = 1;\n", vec![rep("const a = 1;", "const a = 2;")], 1);
        server.set_plan_state(
            mgr.plan_id(),
            mgr.branch(),
            CurrentPlanState {
                plan_result: PlanResult::from_results(vec![result]),
                ..CurrentPlanState::default()
            },
        );
        fs::write(dir.path().join("x.ts"), "// header\nconst a = 1;\n").expect("write");
        let report = mgr.check_outdated(None).expect("check");
        assert!(mgr.conflicts(&report).expect("conflicts").is_empty());
    }

    #[test]
    fn maps_refresh_only_changed_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        fs::write(dir.path().join("src/a.rs"), "fn a() {}\n").expect("write");
        fs::write(dir.path().join("src/b.rs"), "fn b() {}\n").expect("write");
        let server = FakeServer::shared();
        let mgr = manager(&server, dir.path());
        mgr.load(&[LoadItem::DirectoryTree {
            path: "src".to_string(),
            recursive: false,
            names_only: false,
            defs_only: true,
            force_skip_ignore: false,
        }])
        .expect("load");

        fs::write(dir.path().join("src/a.rs"), "fn a() {}\nfn a2() {}\n").expect("write");
        fs::remove_file(dir.path().join("src/b.rs")).expect("rm");
        fs::write(dir.path().join("src/c.rs"), "struct C;\n").expect("write");

        let report = mgr.check_outdated(None).expect("check");
        let (_, params) = report.updated.iter().next().expect("map update");
        let changed: Vec<&String> = params.map_parts.keys().collect();
        assert_eq!(changed, ["src/a.rs", "src/c.rs"]);
        assert_eq!(params.removed_map_paths, vec!["src/b.rs".to_string()]);
        assert_eq!(
            params.body,
            "src/a.rs:\nfn a() {}\nfn a2() {}\n\nsrc/c.rs:\nstruct C;\n\n"
        );
        assert_eq!(params.sha, body_sha(&params.body));

        mgr.update(&report, ConflictChoice::Cancel).expect("update");
        let stored = &mgr.list(true).expect("list")[0];
        assert_eq!(stored.map_parts.len(), 2);
        assert!(mgr.check_outdated(None).expect("recheck").is_empty());
    }

    #[test]
    fn explicit_bodies_build_a_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = FakeServer::shared();
        let mgr = manager(&server, dir.path());
        mgr.load(&[LoadItem::Note("first".to_string())]).expect("load");
        let id = mgr.list(false).expect("list")[0].id.clone();
        let bodies = BTreeMap::from([(id.clone(), "second\r\n".to_string())]);
        let report = mgr.report_for_bodies(&bodies).expect("report");
        assert_eq!(report.updated[&id].body, "second\n");
        mgr.update(&report, ConflictChoice::Cancel).expect("update");
        assert_eq!(mgr.list(true).expect("list")[0].body, "second\n");
    }
}
