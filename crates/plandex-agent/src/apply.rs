use anyhow::{Result, anyhow};
use plandex_api::{ApplyPlanRequest, RejectFilesRequest};
use plandex_context::ConflictChoice;
use plandex_core::{
    APPLY_SCRIPT_PATH, CurrentPlanState, PlanConfig, plan_config::DEFAULT_AUTO_DEBUG_TRIES,
};
use plandex_diff::{apply_summary, pending_changes_summary};
use plandex_errors::PlandexError;
use plandex_observe::EventKind;
use plandex_stream::UiEvent;
use plandex_tools::fs::{atomic_write, remove_empty_dirs};
use plandex_tools::vcs::AUTO_STASH_MESSAGE;
use plandex_tools::{ExecOutcome, StashPopOutcome};
use rayon::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use tracing::{info, warn};

use crate::PlanEngine;
use crate::exec::ExecReport;
use crate::rewind::{applied_file_bodies, read_disk, same_body};
use crate::rollback::RollbackPlan;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyFlags {
    /// Skip the apply confirmation.
    pub auto_confirm: bool,
    pub auto_commit: bool,
    pub no_commit: bool,
    pub no_exec: bool,
    pub auto_exec: bool,
    pub auto_debug: bool,
    pub auto_debug_tries: u32,
    /// Refresh drifted context without asking.
    pub auto_update_context: bool,
    /// Overrides the generated commit message.
    pub commit_msg: Option<String>,
}

impl Default for ApplyFlags {
    fn default() -> Self {
        Self {
            auto_confirm: false,
            auto_commit: false,
            no_commit: false,
            no_exec: false,
            auto_exec: false,
            auto_debug: false,
            auto_debug_tries: DEFAULT_AUTO_DEBUG_TRIES,
            auto_update_context: false,
            commit_msg: None,
        }
    }
}

impl ApplyFlags {
    pub fn from_config(cfg: &PlanConfig) -> Self {
        Self {
            auto_confirm: cfg.auto_apply,
            auto_commit: cfg.auto_commit,
            no_commit: cfg.skip_commit,
            no_exec: !cfg.can_exec,
            auto_exec: cfg.auto_exec,
            auto_debug: cfg.auto_debug,
            auto_debug_tries: cfg.auto_debug_tries,
            auto_update_context: cfg.auto_update_context,
            commit_msg: None,
        }
    }

    /// Flags for applying a fix produced inside the auto-debug loop.
    pub(crate) fn for_fix(&self) -> Self {
        Self {
            auto_confirm: true,
            auto_commit: true,
            commit_msg: None,
            ..self.clone()
        }
    }
}

/// Decisions the apply flow needs from the user.
pub trait ApplyPrompter {
    fn confirm_apply(&mut self, summary: &str) -> Result<bool>;
    /// Files changed on disk since they were loaded; update context and rebuild?
    fn confirm_update(&mut self, paths: &[String]) -> Result<bool>;
    fn confirm_commit(&mut self, message: &str) -> Result<bool>;
    fn confirm_exec(&mut self, script: &str) -> Result<bool>;
    /// The script failed for good; put the applied files back?
    fn rollback_after_failure(&mut self, outcome: &ExecOutcome) -> Result<bool>;
    /// Stream events from turns started by the debug loop.
    fn on_stream_event(&mut self, _event: &UiEvent) {}
}

/// Says yes to everything except rolling back.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoConfirm;

impl ApplyPrompter for AutoConfirm {
    fn confirm_apply(&mut self, _summary: &str) -> Result<bool> {
        Ok(true)
    }

    fn confirm_update(&mut self, _paths: &[String]) -> Result<bool> {
        Ok(true)
    }

    fn confirm_commit(&mut self, _message: &str) -> Result<bool> {
        Ok(true)
    }

    fn confirm_exec(&mut self, _script: &str) -> Result<bool> {
        Ok(true)
    }

    fn rollback_after_failure(&mut self, _outcome: &ExecOutcome) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub plan_apply_id: String,
    pub written: Vec<String>,
    pub removed: Vec<String>,
    /// Pending files whose content already matched disk.
    pub skipped_unchanged: Vec<String>,
    /// Set when a commit was made.
    pub commit_msg: Option<String>,
    pub stash: Option<StashPopOutcome>,
    pub exec: Option<ExecReport>,
}

pub(crate) struct Written {
    pub outcome: ApplyOutcome,
    pub rollback: RollbackPlan,
}

impl PlanEngine {
    /// Writes every pending change to disk, commits it and runs the plan's
    /// `_apply.sh`. `None` when there was nothing to apply or the user declined.
    pub fn apply(&self, flags: &ApplyFlags, prompter: &mut dyn ApplyPrompter) -> Result<Option<ApplyOutcome>> {
        let mut state = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
        if state.has_pending_builds() {
            return Err(anyhow!(
                "this plan has changes that are not built yet; run `plandex build` first"
            ));
        }
        self.ensure_not_streaming()?;

        let drifted = self.drifted_paths(&state)?;
        if !drifted.is_empty() {
            if !flags.auto_update_context && !prompter.confirm_update(&drifted)? {
                return Err(PlandexError::ApplyDrift { paths: drifted }.into());
            }
            self.refresh_drifted(&state, &drifted)?;
            state = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
            if state.has_pending_builds() {
                return Err(anyhow!(
                    "context changes invalidated pending builds; run `plandex build` first"
                ));
            }
        }

        if state.plan_result.pending_results().next().is_none() {
            info!(plan_id = %self.plan_id, branch = %self.branch, "no pending changes to apply");
            return Ok(None);
        }
        if !flags.auto_confirm && !prompter.confirm_apply(&pending_changes_summary(&state))? {
            return Ok(None);
        }

        let script = state
            .current_plan_files
            .files
            .get(APPLY_SCRIPT_PATH)
            .cloned();
        let Written {
            mut outcome,
            mut rollback,
        } = self.write_pending(&state, flags, prompter)?;
        if let Some(script) = script {
            outcome.exec = self.exec_after_apply(script, flags, prompter, &mut rollback)?;
        }
        Ok(Some(outcome))
    }

    /// Pending paths whose disk content is not what the plan expects.
    pub fn drifted_paths(&self, state: &CurrentPlanState) -> Result<Vec<String>> {
        let applied = applied_file_bodies(state)?;
        let mut drifted = Vec::new();
        for path in state.plan_result.pending_paths() {
            if path == APPLY_SCRIPT_PATH {
                continue;
            }
            let Some(expected) = expected_disk_body(state, &applied, &path) else {
                continue;
            };
            let disk = read_disk(&self.root, &path)?;
            if !same_body(disk.as_deref(), expected.as_deref()) {
                drifted.push(path);
            }
        }
        Ok(drifted)
    }

    fn refresh_drifted(&self, state: &CurrentPlanState, drifted: &[String]) -> Result<()> {
        let Some(context) = &self.context else {
            return Err(PlandexError::ApplyDrift {
                paths: drifted.to_vec(),
            }
            .into());
        };
        let ids: Vec<String> = drifted
            .iter()
            .filter_map(|p| state.contexts_by_path.get(p))
            .map(|c| c.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let report = context.check_outdated(Some(ids.as_slice()))?;
        let update = context.update(&report, ConflictChoice::Rebuild)?;
        self.record(
            EventKind::Context,
            &json!({
                "planId": self.plan_id,
                "branch": self.branch,
                "updated": report.updated.len(),
                "removed": update.removed,
                "conflicts": update.conflicts,
            }),
        );
        if !update.conflicts.is_empty() {
            self.rebuild(&update.conflicts)?;
        }
        Ok(())
    }

    /// Writes the folded pending files, stamps them applied and commits.
    /// With local changes in a repo they are stashed around the write; any
    /// failure leaves the working copy as it was.
    pub(crate) fn write_pending(
        &self,
        state: &CurrentPlanState,
        flags: &ApplyFlags,
        prompter: &mut dyn ApplyPrompter,
    ) -> Result<Written> {
        let files = &state.current_plan_files;
        let mut to_write: Vec<(String, String)> = Vec::new();
        let mut skipped_unchanged = Vec::new();
        for (path, content) in &files.files {
            if path == APPLY_SCRIPT_PATH {
                continue;
            }
            match read_disk(&self.root, path)? {
                Some(disk) if disk == *content => skipped_unchanged.push(path.clone()),
                _ => to_write.push((path.clone(), content.clone())),
            }
        }
        let to_remove: Vec<String> = files
            .removed_by_path
            .iter()
            .filter(|(path, removed)| **removed && path.as_str() != APPLY_SCRIPT_PATH)
            .map(|(path, _)| path.clone())
            .collect();
        let touched: Vec<&str> = to_write
            .iter()
            .map(|(p, _)| p.as_str())
            .chain(to_remove.iter().map(String::as_str))
            .collect();
        let rollback = RollbackPlan::capture(&self.root, touched.iter().copied())?;

        let is_repo = self.vcs.is_repo();
        let mut stashed = false;
        if is_repo && self.vcs.has_uncommitted_changes()? {
            let overwritten: Vec<String> = self
                .vcs
                .modified_tracked_paths()?
                .into_iter()
                .filter(|p| touched.contains(&p.as_str()))
                .collect();
            if !overwritten.is_empty() {
                self.vcs.checkout_paths(&overwritten)?;
            }
            self.vcs.stash_push(AUTO_STASH_MESSAGE)?;
            stashed = true;
        }

        let commit_msg = flags
            .commit_msg
            .clone()
            .unwrap_or_else(|| apply_summary(state));
        let committed = match self.write_and_commit(&to_write, &to_remove, &commit_msg, is_repo, flags, prompter) {
            Ok(committed) => committed,
            Err(err) => {
                warn!(plan_id = %self.plan_id, "apply failed, restoring working copy: {err:#}");
                if stashed {
                    if let Err(restore_err) = self
                        .vcs
                        .clear_uncommitted()
                        .and_then(|_| self.vcs.stash_pop().map(|_| ()))
                    {
                        warn!("failed to restore stashed changes: {restore_err:#}");
                    }
                } else if let Err(restore_err) = rollback.restore(&self.root) {
                    warn!("failed to roll back applied files: {restore_err:#}");
                }
                return Err(err);
            }
        };
        let stash = if stashed {
            Some(self.vcs.stash_pop()?)
        } else {
            None
        };

        let ids: Vec<String> = state
            .plan_result
            .pending_results()
            .map(|r| r.id.clone())
            .collect();
        let resp = self.api.apply_plan(
            &self.plan_id,
            &self.branch,
            &ApplyPlanRequest {
                plan_file_result_ids: ids,
                commit_msg: commit_msg.clone(),
            },
        )?;

        let written: Vec<String> = to_write.into_iter().map(|(p, _)| p).collect();
        info!(
            plan_id = %self.plan_id,
            branch = %self.branch,
            written = written.len(),
            removed = to_remove.len(),
            committed,
            "applied pending changes"
        );
        self.record(
            EventKind::Apply,
            &json!({
                "planId": self.plan_id,
                "branch": self.branch,
                "planApplyId": resp.plan_apply_id,
                "written": written,
                "removed": to_remove,
                "committed": committed,
                "stashed": stashed,
            }),
        );
        Ok(Written {
            outcome: ApplyOutcome {
                plan_apply_id: resp.plan_apply_id,
                written,
                removed: to_remove,
                skipped_unchanged,
                commit_msg: committed.then_some(commit_msg),
                stash,
                exec: None,
            },
            rollback,
        })
    }

    fn write_and_commit(
        &self,
        to_write: &[(String, String)],
        to_remove: &[String],
        commit_msg: &str,
        is_repo: bool,
        flags: &ApplyFlags,
        prompter: &mut dyn ApplyPrompter,
    ) -> Result<bool> {
        let root = self.root.as_path();
        to_write
            .par_iter()
            .map(|(path, content)| atomic_write(&root.join(path), content.as_bytes()))
            .collect::<Result<Vec<()>>>()?;
        to_remove
            .par_iter()
            .map(|path| -> Result<()> {
                let abs = root.join(path);
                match fs::remove_file(&abs) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                    Err(err) => return Err(anyhow!("failed to remove {path}: {err}")),
                }
                if let Some(parent) = abs.parent() {
                    remove_empty_dirs(root, parent)?;
                }
                Ok(())
            })
            .collect::<Result<Vec<()>>>()?;

        if !is_repo || flags.no_commit {
            return Ok(false);
        }
        if !flags.auto_commit && !prompter.confirm_commit(commit_msg)? {
            return Ok(false);
        }
        self.vcs.add_all_and_commit(commit_msg)?;
        Ok(true)
    }

    pub fn reject_all(&self) -> Result<()> {
        self.ensure_not_streaming()?;
        self.api.reject_all_changes(&self.plan_id, &self.branch)?;
        info!(plan_id = %self.plan_id, branch = %self.branch, "rejected all pending changes");
        Ok(())
    }

    /// Rejects the pending changes for `paths`. Every path must have some.
    pub fn reject_files(&self, paths: &[String]) -> Result<()> {
        self.ensure_not_streaming()?;
        let state = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
        let pending = state.plan_result.pending_paths();
        let unknown: Vec<&String> = paths.iter().filter(|p| !pending.contains(p)).collect();
        if !unknown.is_empty() {
            let names: Vec<&str> = unknown.iter().map(|p| p.as_str()).collect();
            return Err(anyhow!("no pending changes for {}", names.join(", ")));
        }
        self.api.reject_files(
            &self.plan_id,
            &self.branch,
            &RejectFilesRequest {
                paths: paths.to_vec(),
            },
        )
    }
}

/// What disk should hold for `path` before the pending changes land: the
/// context body, unless the plan applied to the path after the context was
/// last refreshed. `None` when there is nothing to compare against.
fn expected_disk_body(
    state: &CurrentPlanState,
    applied: &BTreeMap<String, Option<String>>,
    path: &str,
) -> Option<Option<String>> {
    let ctx = state.contexts_by_path.get(path);
    let last_applied = state
        .plan_result
        .file_results_by_path
        .get(path)
        .and_then(|results| results.iter().filter_map(|r| r.applied_at).max());
    match (applied.get(path), ctx) {
        (Some(body), Some(ctx)) if last_applied.is_some_and(|at| at > ctx.updated_at) => Some(body.clone()),
        (_, Some(ctx)) => Some(Some(ctx.body.clone())),
        (Some(body), None) => Some(body.clone()),
        (None, None) => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::Harness;
    use plandex_api::PlanApi;
    use plandex_core::{ContextType, MAIN_BRANCH, PlanResult, body_sha};
    use plandex_testkit::FakeVcs;
    use plandex_testkit::fixtures::{context, description, edits, removal, rep, whole};

    /// Scripted answers; records what it was asked.
    #[derive(Default)]
    pub struct Answers {
        pub apply: bool,
        pub update: bool,
        pub commit: bool,
        pub exec: bool,
        pub rollback: bool,
        pub asked: Vec<&'static str>,
    }

    impl ApplyPrompter for Answers {
        fn confirm_apply(&mut self, _summary: &str) -> Result<bool> {
            self.asked.push("apply");
            Ok(self.apply)
        }

        fn confirm_update(&mut self, _paths: &[String]) -> Result<bool> {
            self.asked.push("update");
            Ok(self.update)
        }

        fn confirm_commit(&mut self, _message: &str) -> Result<bool> {
            self.asked.push("commit");
            Ok(self.commit)
        }

        fn confirm_exec(&mut self, _script: &str) -> Result<bool> {
            self.asked.push("exec");
            Ok(self.exec)
        }

        fn rollback_after_failure(&mut self, _outcome: &ExecOutcome) -> Result<bool> {
            self.asked.push("rollback");
            Ok(self.rollback)
        }
    }

    fn quiet() -> ApplyFlags {
        ApplyFlags {
            auto_confirm: true,
            no_commit: true,
            no_exec: true,
            ..ApplyFlags::default()
        }
    }

    #[test]
    fn applies_a_new_file_outside_a_repo() {
        let h = Harness::new(FakeVcs::not_a_repo());
        h.plan("add greeting", vec![whole("a/b.txt", "hello\n", 1)]);
        let outcome = h
            .engine()
            .apply(&quiet(), &mut AutoConfirm)
            .expect("apply")
            .expect("something applied");

        assert_eq!(h.read("a/b.txt").as_deref(), Some("hello\n"));
        assert_eq!(outcome.written, vec!["a/b.txt".to_string()]);
        assert_eq!(outcome.commit_msg, None);
        assert!(h.vcs.ops().is_empty());
        let state = h.state();
        assert!(state.plan_result.pending_paths().is_empty());
        assert!(state.plan_result.results[0].applied_at.is_some());
        assert_eq!(state.plan_applies.len(), 1);
    }

    #[test]
    fn local_changes_are_stashed_around_the_commit() {
        let vcs = FakeVcs::repo()
            .with_modified(&["foo.go", "other.go"])
            .with_pop_conflicts(&["foo.go"]);
        let h = Harness::new(vcs);
        h.write("foo.go", "package local\n");
        h.plan("rewrite foo", vec![whole("foo.go", "package plan\n", 1)]);
        let flags = ApplyFlags {
            auto_confirm: true,
            auto_commit: true,
            no_exec: true,
            ..ApplyFlags::default()
        };
        let outcome = h
            .engine()
            .apply(&flags, &mut AutoConfirm)
            .expect("apply")
            .expect("applied");

        assert_eq!(
            h.vcs.ops(),
            vec![
                "checkout foo.go",
                "stash push",
                "commit",
                "stash pop",
                "checkout --ours foo.go",
                "stash drop",
            ]
        );
        assert_eq!(h.read("foo.go").as_deref(), Some("package plan\n"));
        assert_eq!(
            outcome.stash,
            Some(StashPopOutcome::ResolvedConflicts(vec!["foo.go".to_string()]))
        );
        let msg = outcome.commit_msg.expect("committed");
        assert!(msg.starts_with(plandex_diff::summary::APPLY_HEADER));
        assert!(msg.contains("rewrite foo"));
        assert_eq!(h.vcs.commits(), vec![msg]);
    }

    #[test]
    fn a_failed_stash_writes_nothing() {
        let h = Harness::new(FakeVcs::repo().with_modified(&["x.txt"]).failing_on("stash push"));
        h.write("foo.txt", "before\n");
        h.plan("change foo", vec![whole("foo.txt", "after\n", 1)]);
        let err = h.engine().apply(&quiet(), &mut AutoConfirm).expect_err("stash fails");
        assert!(matches!(
            err.downcast_ref::<PlandexError>(),
            Some(PlandexError::VcsConflict(_))
        ));
        assert_eq!(h.read("foo.txt").as_deref(), Some("before\n"));
        assert_eq!(h.state().plan_result.pending_paths(), vec!["foo.txt".to_string()]);
    }

    #[test]
    fn a_failed_commit_rolls_back_the_written_files() {
        let h = Harness::new(FakeVcs::repo().failing_on("commit"));
        h.write("a.txt", "old\n");
        h.plan(
            "two files",
            vec![whole("a.txt", "new\n", 1), whole("fresh/b.txt", "b\n", 2)],
        );
        let flags = ApplyFlags {
            auto_confirm: true,
            auto_commit: true,
            no_exec: true,
            ..ApplyFlags::default()
        };
        h.engine().apply(&flags, &mut AutoConfirm).expect_err("commit fails");
        assert_eq!(h.read("a.txt").as_deref(), Some("old\n"));
        assert!(!h.root().join("fresh").exists());
        assert_eq!(h.vcs.ops(), vec!["commit (failed)"]);
        assert_eq!(h.state().plan_result.pending_paths().len(), 2);
    }

    #[test]
    fn a_failed_commit_restores_the_stash() {
        let h = Harness::new(FakeVcs::repo().with_modified(&["notes.md"]).failing_on("commit"));
        h.write("a.txt", "old\n");
        h.plan("change a", vec![whole("a.txt", "new\n", 1)]);
        let flags = ApplyFlags {
            auto_confirm: true,
            auto_commit: true,
            no_exec: true,
            ..ApplyFlags::default()
        };
        h.engine().apply(&flags, &mut AutoConfirm).expect_err("commit fails");
        assert_eq!(
            h.vcs.ops(),
            vec!["stash push", "commit (failed)", "clear", "stash pop"]
        );
        assert!(!h.vcs.is_stashed());
    }

    #[test]
    fn unchanged_files_are_skipped_and_removals_delete() {
        let h = Harness::new(FakeVcs::not_a_repo());
        h.write("same.txt", "same\n");
        h.write("gone/old.txt", "bye\n");
        h.plan(
            "tidy",
            vec![whole("same.txt", "same\n", 1), removal("gone/old.txt", 2)],
        );
        let outcome = h
            .engine()
            .apply(&quiet(), &mut AutoConfirm)
            .expect("apply")
            .expect("applied");
        assert_eq!(outcome.skipped_unchanged, vec!["same.txt".to_string()]);
        assert_eq!(outcome.removed, vec!["gone/old.txt".to_string()]);
        assert!(!h.root().join("gone").exists());
    }

    #[test]
    fn declining_the_commit_still_applies() {
        let h = Harness::new(FakeVcs::repo());
        h.plan("add a", vec![whole("a.txt", "a\n", 1)]);
        let mut answers = Answers {
            apply: true,
            ..Answers::default()
        };
        let flags = ApplyFlags {
            no_exec: true,
            ..ApplyFlags::default()
        };
        let outcome = h
            .engine()
            .apply(&flags, &mut answers)
            .expect("apply")
            .expect("applied");
        assert_eq!(answers.asked, vec!["apply", "commit"]);
        assert_eq!(outcome.commit_msg, None);
        assert!(h.vcs.commits().is_empty());
        assert_eq!(h.read("a.txt").as_deref(), Some("a\n"));
    }

    #[test]
    fn declining_the_apply_changes_nothing() {
        let h = Harness::new(FakeVcs::not_a_repo());
        h.plan("add a", vec![whole("a.txt", "a\n", 1)]);
        let outcome = h
            .engine()
            .apply(&ApplyFlags::default(), &mut Answers::default())
            .expect("apply");
        assert!(outcome.is_none());
        assert!(h.read("a.txt").is_none());
    }

    #[test]
    fn nothing_pending_is_a_no_op() {
        let h = Harness::new(FakeVcs::not_a_repo());
        assert!(h.engine().apply(&quiet(), &mut AutoConfirm).expect("apply").is_none());
    }

    #[test]
    fn unbuilt_plans_must_be_built_first() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let mut desc = description("m1", "later", &["a.txt"], 1);
        desc.did_build = false;
        h.server.set_plan_state(
            &h.plan_id,
            MAIN_BRANCH,
            CurrentPlanState {
                convo_message_descriptions: vec![desc],
                ..CurrentPlanState::default()
            },
        );
        let err = h.engine().apply(&quiet(), &mut AutoConfirm).expect_err("unbuilt");
        assert!(err.to_string().contains("plandex build"));
    }

    #[test]
    fn declined_drift_aborts_with_the_drifted_paths() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let mut ctx = context("ctx-a", ContextType::File, "a.txt", 1);
        ctx.body = "fn old() {}\n".to_string();
        ctx.sha = body_sha(&ctx.body);
        h.server.set_plan_state(
            &h.plan_id,
            MAIN_BRANCH,
            CurrentPlanState {
                plan_result: PlanResult::from_results(vec![edits(
                    "a.txt",
                    "fn old() {}\n",
                    vec![rep("old", "new")],
                    2,
                )]),
                convo_message_descriptions: vec![description("m1", "rename", &["a.txt"], 2)],
                contexts_by_path: [("a.txt".to_string(), ctx)].into(),
                ..CurrentPlanState::default()
            },
        );
        h.write("a.txt", "fn mine() {}\n");

        let err = h
            .engine()
            .apply(&quiet(), &mut Answers::default())
            .expect_err("drift");
        assert_eq!(
            err.downcast_ref::<PlandexError>(),
            Some(&PlandexError::ApplyDrift {
                paths: vec!["a.txt".to_string()]
            })
        );
        assert_eq!(h.read("a.txt").as_deref(), Some("fn mine() {}\n"));
    }

    #[test]
    fn files_written_by_an_earlier_apply_are_not_drift() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let engine = h.engine();
        h.plan("first", vec![whole("a.txt", "one\n", 1)]);
        engine.apply(&quiet(), &mut AutoConfirm).expect("first apply");

        let mut state = h.state();
        let next = whole("a.txt", "two\n", 100);
        state.plan_result = PlanResult::from_results(
            state
                .plan_result
                .results
                .into_iter()
                .chain(std::iter::once(next))
                .collect(),
        );
        h.server.set_plan_state(&h.plan_id, MAIN_BRANCH, state);

        assert!(engine.drifted_paths(&h.state()).expect("drift").is_empty());
        h.write("a.txt", "edited\n");
        assert_eq!(
            engine.drifted_paths(&h.state()).expect("drift"),
            vec!["a.txt".to_string()]
        );
    }

    #[test]
    fn reject_files_needs_pending_changes() {
        let h = Harness::new(FakeVcs::not_a_repo());
        h.plan("two", vec![whole("a.txt", "a\n", 1), whole("b.txt", "b\n", 2)]);
        let engine = h.engine();
        let err = engine
            .reject_files(&["c.txt".to_string()])
            .expect_err("unknown path");
        assert!(err.to_string().contains("c.txt"));

        engine.reject_files(&["a.txt".to_string()]).expect("reject");
        assert_eq!(h.state().plan_result.pending_paths(), vec!["b.txt".to_string()]);
        engine.reject_all().expect("reject all");
        assert!(h.state().plan_result.pending_paths().is_empty());
        assert!(h.server.list_logs(&h.plan_id, MAIN_BRANCH).expect("logs")[0]
            .message
            .starts_with("Rejected"));
    }
}
