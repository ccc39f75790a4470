use anyhow::{Result, anyhow};
use plandex_api::RewindPlanRequest;
use plandex_core::{APPLY_SCRIPT_PATH, CurrentPlanState, PlanLogEntry, body_sha};
use plandex_diff::apply_replacements;
use plandex_errors::{EnhancedError, ErrorType};
use plandex_observe::EventKind;
use plandex_tools::fs::{atomic_write, remove_empty_dirs};
use rayon::prelude::*;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::{PlanEngine, RollbackPlan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewindTarget {
    /// Number of log entries to step back from the latest.
    Steps(usize),
    /// A full sha or an unambiguous prefix.
    Sha(String),
}

/// Disk changes needed to bring the project back to a plan commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewindPlan {
    pub target_sha: String,
    pub target_message: String,
    /// Body each path must have afterwards; `None` removes the file.
    pub required: BTreeMap<String, Option<String>>,
    /// Paths whose disk content differs from what the plan last applied.
    pub conflicts: Vec<String>,
}

impl RewindPlan {
    pub fn is_noop(&self) -> bool {
        self.required.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewindOutcome {
    pub latest_sha: String,
    pub latest_commit: String,
    pub written: Vec<String>,
    pub removed: Vec<String>,
}

/// What applying every applied, non-rejected result left on disk, per path.
/// `None` means the file was removed. Paths the plan never applied are absent.
pub fn applied_file_bodies(state: &CurrentPlanState) -> Result<BTreeMap<String, Option<String>>> {
    let mut out = BTreeMap::new();
    for (path, results) in &state.plan_result.file_results_by_path {
        if path == APPLY_SCRIPT_PATH {
            continue;
        }
        let mut applied = results
            .iter()
            .filter(|r| r.applied_at.is_some() && r.rejected_at.is_none())
            .peekable();
        if applied.peek().is_none() {
            continue;
        }
        let mut body: Option<String> = state.contexts_by_path.get(path).map(|c| c.body.clone());
        let mut unresolved = false;
        for result in applied {
            if result.removed_file {
                body = None;
                continue;
            }
            if let Some(content) = &result.content {
                body = Some(content.clone());
                continue;
            }
            let base = match body.take() {
                Some(current) => current,
                None if !result.context_sha.is_empty() => result.context_body.clone(),
                None => {
                    unresolved = true;
                    break;
                }
            };
            let pending = result.replacements.iter().filter(|r| r.rejected_at.is_none());
            let report = apply_replacements(&base, pending, true);
            if !report.all_succeeded() {
                unresolved = true;
                break;
            }
            body = Some(report.updated);
        }
        if unresolved {
            warn!(path = %path, "cannot reconstruct applied content");
            continue;
        }
        out.insert(path.clone(), body);
    }
    Ok(out)
}

pub(crate) fn same_body(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => body_sha(a) == body_sha(b),
        (None, None) => true,
        _ => false,
    }
}

pub(crate) fn read_disk(root: &Path, path: &str) -> Result<Option<String>> {
    match fs::read(root.join(path)) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(anyhow!("failed to read {path}: {err}")),
    }
}

fn context_body(state: &CurrentPlanState, path: &str) -> Option<String> {
    state.contexts_by_path.get(path).map(|c| c.body.clone())
}

/// Body the file had before the plan first touched it, if known.
fn original_body(current: &CurrentPlanState, path: &str) -> Option<String> {
    context_body(current, path).or_else(|| {
        current
            .plan_result
            .file_results_by_path
            .get(path)?
            .iter()
            .find(|r| !r.context_sha.is_empty())
            .map(|r| r.context_body.clone())
    })
}

impl PlanEngine {
    pub fn resolve_rewind_target(&self, target: &RewindTarget) -> Result<PlanLogEntry> {
        let logs = self.api.list_logs(&self.plan_id, &self.branch)?;
        match target {
            RewindTarget::Steps(n) => logs.get(*n).cloned().ok_or_else(|| {
                anyhow!(
                    "cannot rewind {n} steps; the plan only has {} earlier states",
                    logs.len().saturating_sub(1)
                )
            }),
            RewindTarget::Sha(sha) => {
                let matches: Vec<&PlanLogEntry> =
                    logs.iter().filter(|e| e.sha.starts_with(sha.as_str())).collect();
                match matches.as_slice() {
                    [entry] => Ok((*entry).clone()),
                    [] => Err(anyhow!("no plan commit matches {sha}")),
                    _ => Err(anyhow!("{sha} matches several plan commits; use more characters")),
                }
            }
        }
    }

    /// Computes the disk changes for a rewind without touching anything.
    pub fn plan_rewind(&self, target: &RewindTarget) -> Result<RewindPlan> {
        let entry = self.resolve_rewind_target(target)?;
        let current = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
        let target_state = self
            .api
            .get_current_plan_state_at_sha(&self.plan_id, &self.branch, &entry.sha)?;
        let current_applied = applied_file_bodies(&current)?;
        let target_applied = applied_file_bodies(&target_state)?;

        let paths: BTreeSet<&String> = current_applied.keys().chain(target_applied.keys()).collect();
        let mut plan = RewindPlan {
            target_sha: entry.sha.clone(),
            target_message: entry.message.clone(),
            ..RewindPlan::default()
        };
        for path in paths {
            let wanted = match target_applied.get(path) {
                Some(body) => body.clone(),
                None => context_body(&target_state, path).or_else(|| original_body(&current, path)),
            };
            let now = match current_applied.get(path) {
                Some(body) => body.clone(),
                None => context_body(&current, path),
            };
            if same_body(wanted.as_deref(), now.as_deref()) {
                continue;
            }
            let disk = read_disk(&self.root, path)?;
            if !same_body(disk.as_deref(), now.as_deref()) {
                plan.conflicts.push(path.clone());
            }
            plan.required.insert(path.clone(), wanted);
        }
        Ok(plan)
    }

    /// Moves the plan back to `target` and makes disk match. Local edits to
    /// affected files stop the rewind unless `force` is set.
    pub fn rewind(&self, target: &RewindTarget, force: bool) -> Result<RewindOutcome> {
        self.ensure_not_streaming()?;
        let plan = self.plan_rewind(target)?;
        if !plan.conflicts.is_empty() && !force {
            let listed: Vec<String> = plan.conflicts.iter().map(|p| format!("• {p}")).collect();
            return Err(EnhancedError::new(
                "Rewind would overwrite local changes",
                format!(
                    "These files were modified after the plan last wrote them:\n{}",
                    listed.join("\n")
                ),
                ErrorType::Apply,
            )
            .with_suggestion("Revert or stash the listed files, then rewind again")
            .with_suggestion("Pass --force to overwrite them")
            .into_error());
        }

        let root = self.root.as_path();
        let rollback = RollbackPlan::capture(root, plan.required.keys().map(String::as_str))?;
        let changes: Vec<(&String, &Option<String>)> = plan.required.iter().collect();
        let written = changes
            .par_iter()
            .map(|(path, body)| -> Result<bool> {
                let abs = root.join(path.as_str());
                match body {
                    Some(body) => {
                        atomic_write(&abs, body.as_bytes())?;
                        Ok(true)
                    }
                    None => {
                        match fs::remove_file(&abs) {
                            Ok(()) => {}
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(err) => return Err(anyhow!("failed to remove {path}: {err}")),
                        }
                        if let Some(parent) = abs.parent() {
                            remove_empty_dirs(root, parent)?;
                        }
                        Ok(false)
                    }
                }
            })
            .collect::<Result<Vec<bool>>>();
        let applied = match written {
            Ok(applied) => applied,
            Err(err) => {
                self.undo_rewind_writes(&rollback);
                return Err(err);
            }
        };

        let resp = match self.api.rewind_plan(
            &self.plan_id,
            &self.branch,
            &RewindPlanRequest {
                sha: plan.target_sha.clone(),
            },
        ) {
            Ok(resp) => resp,
            Err(err) => {
                self.undo_rewind_writes(&rollback);
                return Err(err);
            }
        };

        let mut outcome = RewindOutcome {
            latest_sha: resp.latest_sha,
            latest_commit: resp.latest_commit,
            ..RewindOutcome::default()
        };
        for ((path, _), wrote) in changes.iter().zip(applied) {
            if wrote {
                outcome.written.push((*path).clone());
            } else {
                outcome.removed.push((*path).clone());
            }
        }
        info!(
            sha = %outcome.latest_sha,
            written = outcome.written.len(),
            removed = outcome.removed.len(),
            "rewound plan"
        );
        self.record(
            EventKind::Rewind,
            &json!({
                "planId": self.plan_id,
                "branch": self.branch,
                "sha": outcome.latest_sha,
                "written": outcome.written,
                "removed": outcome.removed,
                "forced": force && !plan.conflicts.is_empty(),
            }),
        );
        Ok(outcome)
    }

    fn undo_rewind_writes(&self, rollback: &RollbackPlan) {
        match rollback.restore(&self.root) {
            Ok(()) => warn!("rewind failed; restored files on disk"),
            Err(err) => warn!("rewind failed and files could not be restored: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ApplyFlags;
    use crate::testing::Harness;
    use crate::{AutoConfirm, TurnOptions};
    use plandex_api::PlanApi;
    use plandex_core::MAIN_BRANCH;
    use plandex_testkit::fixtures::{at, description, edits, rep, whole};
    use plandex_testkit::{FakeVcs, ScriptedTurn};

    fn flags() -> ApplyFlags {
        ApplyFlags {
            auto_confirm: true,
            no_commit: true,
            no_exec: true,
            ..ApplyFlags::default()
        }
    }

    /// Applies "one" then "two" to a.txt through two applies.
    fn two_applies(h: &Harness) {
        let engine = h.engine();
        h.plan("write one", vec![whole("a.txt", "one\n", 1)]);
        engine.apply(&flags(), &mut AutoConfirm).expect("apply one");
        h.server.queue_turn(
            ScriptedTurn::reply("again")
                .with_plan(description("m", "write two", &["a.txt"], 2), vec![whole("a.txt", "two\n", 2)]),
        );
        engine.tell(&TurnOptions::tell("change it"), &mut |_| {}).expect("tell");
        engine.apply(&flags(), &mut AutoConfirm).expect("apply two");
        assert_eq!(h.read("a.txt").as_deref(), Some("two\n"));
    }

    #[test]
    fn applied_bodies_fold_edits_over_context() {
        let mut applied = edits("a.txt", "fn a() {}\n", vec![rep("a()", "b()")], 1);
        applied.applied_at = Some(at(2));
        let pending = whole("b.txt", "b\n", 3);
        let state = CurrentPlanState {
            plan_result: plandex_core::PlanResult::from_results(vec![applied, pending]),
            ..CurrentPlanState::default()
        };
        let bodies = applied_file_bodies(&state).expect("fold");
        assert_eq!(bodies.get("a.txt"), Some(&Some("fn b() {}\n".to_string())));
        assert!(!bodies.contains_key("b.txt"));
    }

    #[test]
    fn rewind_refuses_local_edits_then_succeeds_once_reverted() {
        let h = Harness::new(FakeVcs::not_a_repo());
        two_applies(&h);
        let engine = h.engine();
        let target = RewindTarget::Steps(2);
        let sha = engine.resolve_rewind_target(&target).expect("target").sha;

        h.write("a.txt", "mine\n");
        let err = engine.rewind(&target, false).expect_err("conflict");
        let enhanced = err.downcast_ref::<EnhancedError>().expect("enhanced");
        assert_eq!(enhanced.title, "Rewind would overwrite local changes");
        assert!(enhanced.message.contains("a.txt"));
        assert_eq!(h.read("a.txt").as_deref(), Some("mine\n"));

        h.write("a.txt", "two\n");
        let outcome = engine.rewind(&target, false).expect("rewind");
        assert_eq!(outcome.latest_sha, sha);
        assert_eq!(outcome.written, vec!["a.txt".to_string()]);
        assert_eq!(h.read("a.txt").as_deref(), Some("one\n"));

        let again = engine.rewind(&RewindTarget::Sha(sha.clone()), false).expect("again");
        assert_eq!(again.latest_sha, sha);
        assert!(again.written.is_empty() && again.removed.is_empty());
        assert_eq!(h.read("a.txt").as_deref(), Some("one\n"));
    }

    #[test]
    fn forced_rewinds_overwrite_local_edits() {
        let h = Harness::new(FakeVcs::not_a_repo());
        two_applies(&h);
        h.write("a.txt", "mine\n");
        h.engine().rewind(&RewindTarget::Steps(2), true).expect("rewind");
        assert_eq!(h.read("a.txt").as_deref(), Some("one\n"));
    }

    #[test]
    fn rewinding_an_apply_removes_created_files_and_their_dirs() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let engine = h.engine();
        h.plan("add f", vec![whole("new/dir/f.txt", "x\n", 1)]);
        engine.apply(&flags(), &mut AutoConfirm).expect("apply");
        assert!(h.root().join("new/dir/f.txt").exists());

        let outcome = engine.rewind(&RewindTarget::Steps(1), false).expect("rewind");
        assert_eq!(outcome.removed, vec!["new/dir/f.txt".to_string()]);
        assert!(!h.root().join("new").exists());
        let state = h.state();
        assert_eq!(state.plan_result.pending_paths(), vec!["new/dir/f.txt".to_string()]);
    }

    #[test]
    fn server_side_rewind_failures_leave_disk_untouched() {
        let h = Harness::new(FakeVcs::not_a_repo());
        two_applies(&h);
        let engine = h.engine();
        let before = h.server.list_logs(&h.plan_id, MAIN_BRANCH).expect("logs");

        h.server.fail_next_rewind("database unavailable");
        let err = engine.rewind(&RewindTarget::Steps(2), false).expect_err("server failure");
        assert!(err.to_string().contains("database unavailable"));
        assert_eq!(h.read("a.txt").as_deref(), Some("two\n"));
        assert_eq!(h.server.list_logs(&h.plan_id, MAIN_BRANCH).expect("logs"), before);

        engine.rewind(&RewindTarget::Steps(2), false).expect("retry");
        assert_eq!(h.read("a.txt").as_deref(), Some("one\n"));
    }

    #[test]
    fn failed_rewinds_bring_back_removed_files() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let engine = h.engine();
        h.plan("add f", vec![whole("new/dir/f.txt", "x\n", 1)]);
        engine.apply(&flags(), &mut AutoConfirm).expect("apply");

        h.server.fail_next_rewind("offline");
        engine.rewind(&RewindTarget::Steps(1), false).expect_err("server failure");
        assert_eq!(h.read("new/dir/f.txt").as_deref(), Some("x\n"));
        assert!(h.state().plan_result.pending_paths().is_empty());
    }

    #[test]
    fn targets_resolve_by_steps_and_sha_prefix() {
        let h = Harness::new(FakeVcs::not_a_repo());
        h.plan("p", vec![whole("a.txt", "a\n", 1)]);
        let engine = h.engine();
        let logs = h.server.list_logs(&h.plan_id, MAIN_BRANCH).expect("logs");
        let latest = engine.resolve_rewind_target(&RewindTarget::Steps(0)).expect("latest");
        assert_eq!(latest, logs[0]);
        let by_prefix = engine
            .resolve_rewind_target(&RewindTarget::Sha(logs[1].sha[..8].to_string()))
            .expect("prefix");
        assert_eq!(by_prefix.message, logs[1].message);
        let err = engine
            .resolve_rewind_target(&RewindTarget::Steps(logs.len()))
            .expect_err("too far");
        assert!(err.to_string().contains("cannot rewind"));
    }
}
