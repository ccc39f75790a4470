use anyhow::Result;
use plandex_api::BuildMode;
use plandex_core::APPLY_SCRIPT_PATH;
use plandex_errors::PlandexError;
use plandex_observe::EventKind;
use plandex_stream::UiEvent;
use plandex_tools::ExecOutcome;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::PlanEngine;
use crate::apply::{ApplyFlags, ApplyPrompter, Written};
use crate::rollback::RollbackPlan;
use crate::turn::TurnOptions;

const APPLY_SCRIPT_COMMAND: &str = "sh _apply.sh";

/// Prompt sent back to the model after `_apply.sh` fails.
pub fn exec_debug_prompt(code: i32, output: &str) -> String {
    format!("Execution failed with exit status {code}. Output:\n\n{output}\n\n--\n\n")
}

/// Prompt sent after a user-supplied command fails under `plandex debug`.
pub fn command_debug_prompt(command: &str, code: i32, output: &str) -> String {
    format!("`{command}` failed with exit status {code}. Output:\n\n{output}\n\n--\n\n")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub command: String,
    pub outcome: ExecOutcome,
    /// Fixes applied before the last run.
    pub fix_attempts: u32,
}

impl ExecReport {
    pub fn message(&self) -> String {
        match self.fix_attempts {
            0 => format!("Command `{}` succeeded.", self.command),
            1 => format!("Command `{}` succeeded after 1 fix attempt.", self.command),
            n => format!("Command `{}` succeeded after {n} fix attempts.", self.command),
        }
    }
}

/// How a failed run is turned into the next prompt.
#[derive(Clone, Copy)]
enum DebugKind<'a> {
    ApplyScript,
    Command(&'a str),
}

impl DebugKind<'_> {
    fn prompt(&self, outcome: &ExecOutcome) -> String {
        match self {
            DebugKind::ApplyScript => exec_debug_prompt(outcome.code, &outcome.output),
            DebugKind::Command(cmd) => command_debug_prompt(cmd, outcome.code, &outcome.output),
        }
    }
}

impl PlanEngine {
    /// Runs the plan's `_apply.sh` once the files are on disk. A failing run
    /// feeds its output back to the model while `auto_debug` tries remain.
    pub(crate) fn exec_after_apply(
        &self,
        script: String,
        flags: &ApplyFlags,
        prompter: &mut dyn ApplyPrompter,
        rollback: &mut RollbackPlan,
    ) -> Result<Option<ExecReport>> {
        if flags.no_exec {
            info!(plan_id = %self.plan_id, "skipping {APPLY_SCRIPT_PATH}: execution disabled");
            return Ok(None);
        }
        if !flags.auto_exec && !prompter.confirm_exec(&script)? {
            return Ok(None);
        }
        let tries = if flags.auto_debug { flags.auto_debug_tries } else { 0 };
        self.run_with_debug(
            APPLY_SCRIPT_COMMAND,
            script,
            DebugKind::ApplyScript,
            tries,
            flags,
            prompter,
            rollback,
        )
        .map(Some)
    }

    /// Runs `command` and, while it fails, asks the model to fix it, applies
    /// the fix and runs it again, up to `tries` times.
    pub fn debug_command(
        &self,
        command: &str,
        tries: u32,
        flags: &ApplyFlags,
        prompter: &mut dyn ApplyPrompter,
    ) -> Result<ExecReport> {
        let mut rollback = RollbackPlan::default();
        self.run_with_debug(
            command,
            command.to_string(),
            DebugKind::Command(command),
            tries,
            flags,
            prompter,
            &mut rollback,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn run_with_debug(
        &self,
        command: &str,
        mut script: String,
        kind: DebugKind<'_>,
        tries: u32,
        flags: &ApplyFlags,
        prompter: &mut dyn ApplyPrompter,
        rollback: &mut RollbackPlan,
    ) -> Result<ExecReport> {
        let mut fix_attempts = 0;
        loop {
            let outcome = self.runner.run_script(&self.root, &script, &self.cancel)?;
            self.record(
                EventKind::Exec,
                &json!({
                    "planId": self.plan_id,
                    "branch": self.branch,
                    "command": command,
                    "code": outcome.code,
                    "interrupted": outcome.interrupted,
                    "attempt": fix_attempts,
                }),
            );
            if outcome.success() {
                let report = ExecReport {
                    command: command.to_string(),
                    outcome,
                    fix_attempts,
                };
                info!(plan_id = %self.plan_id, "{}", report.message());
                return Ok(report);
            }
            if outcome.interrupted || fix_attempts >= tries {
                return self.exec_failed(outcome, prompter, rollback);
            }

            fix_attempts += 1;
            warn!(
                plan_id = %self.plan_id,
                code = outcome.code,
                attempt = fix_attempts,
                tries,
                "`{command}` failed, asking for a fix"
            );
            if let Some(next) = self.apply_fix(kind, &outcome, flags, prompter, rollback)? {
                script = next;
            }
        }
    }

    /// One debug round: send the failure, build what comes back and apply it.
    /// Returns a replacement script when the fix rewrote `_apply.sh`.
    fn apply_fix(
        &self,
        kind: DebugKind<'_>,
        failed: &ExecOutcome,
        flags: &ApplyFlags,
        prompter: &mut dyn ApplyPrompter,
        rollback: &mut RollbackPlan,
    ) -> Result<Option<String>> {
        let opts = TurnOptions {
            prompt: kind.prompt(failed),
            build_mode: BuildMode::Auto,
            user_debug: matches!(kind, DebugKind::Command(_)),
            application_debug: matches!(kind, DebugKind::ApplyScript),
            exec_enabled: true,
            ..TurnOptions::default()
        };
        let mut forward = |ev: &UiEvent| prompter.on_stream_event(ev);
        let turn = self.tell(&opts, &mut forward)?;
        if turn.stream.suppresses_commit() {
            return Err(PlandexError::StreamFatal(format!(
                "debug turn ended early ({:?}) before a fix was built",
                turn.stream.state()
            ))
            .into());
        }
        let mut state = turn.state;
        if state.has_pending_builds() {
            let mut forward = |ev: &UiEvent| prompter.on_stream_event(ev);
            if let Some(built) = self.build(&mut forward)? {
                state = built.state;
            }
        }
        if state.plan_result.pending_results().next().is_none() {
            warn!(plan_id = %self.plan_id, "debug turn produced no changes");
            return Ok(None);
        }

        let next_script = match kind {
            DebugKind::ApplyScript => state.current_plan_files.files.get(APPLY_SCRIPT_PATH).cloned(),
            DebugKind::Command(_) => None,
        };
        let Written {
            rollback: fix_rollback,
            ..
        } = self.write_pending(&state, &flags.for_fix(), prompter)?;
        rollback.absorb(fix_rollback);
        Ok(next_script)
    }

    fn exec_failed(
        &self,
        outcome: ExecOutcome,
        prompter: &mut dyn ApplyPrompter,
        rollback: &RollbackPlan,
    ) -> Result<ExecReport> {
        if !outcome.interrupted
            && !rollback.is_empty()
            && prompter.rollback_after_failure(&outcome)?
        {
            rollback.restore(&self.root)?;
        }
        Err(PlandexError::ExecFailure {
            code: outcome.code,
            output: outcome.output,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::AutoConfirm;
    use crate::apply::tests::Answers;
    use crate::testing::Harness;
    use plandex_errors::exit_code;
    use plandex_testkit::fixtures::{description, whole};
    use plandex_testkit::{FakeVcs, ScriptedExec, ScriptedTurn};

    fn debugging(tries: u32) -> ApplyFlags {
        ApplyFlags {
            auto_confirm: true,
            no_commit: true,
            auto_exec: true,
            auto_debug: true,
            auto_debug_tries: tries,
            ..ApplyFlags::default()
        }
    }

    fn broken_plan(h: &Harness) {
        h.plan(
            "add tests",
            vec![
                whole("src/lib.rs", "fn broken(\n", 1),
                whole(APPLY_SCRIPT_PATH, "cargo test\n", 2),
            ],
        );
    }

    #[test]
    fn debug_prompts_carry_code_and_output() {
        assert_eq!(
            exec_debug_prompt(1, "boom"),
            "Execution failed with exit status 1. Output:\n\nboom\n\n--\n\n"
        );
        assert!(command_debug_prompt("make", 2, "x").starts_with("`make` failed with exit status 2."));
    }

    #[test]
    fn a_failing_script_is_fixed_and_rerun() {
        let exec = ScriptedExec::new(vec![
            ScriptedExec::failure(1, "error[E0308]: mismatched types"),
            ScriptedExec::success(),
        ]);
        let h = Harness::new(FakeVcs::not_a_repo()).with_exec(exec);
        broken_plan(&h);
        h.server.queue_turn(ScriptedTurn::reply("Fixing the signature.").with_plan(
            description("m2", "fix signature", &["src/lib.rs"], 5),
            vec![whole("src/lib.rs", "fn fixed() {}\n", 5)],
        ));

        let outcome = h
            .engine()
            .apply(&debugging(3), &mut AutoConfirm)
            .expect("apply")
            .expect("applied");
        let report = outcome.exec.expect("script ran");
        assert_eq!(report.fix_attempts, 1);
        assert_eq!(
            report.message(),
            "Command `sh _apply.sh` succeeded after 1 fix attempt."
        );
        assert_eq!(h.read("src/lib.rs").as_deref(), Some("fn fixed() {}\n"));
        assert!(h.read(APPLY_SCRIPT_PATH).is_none());
        assert_eq!(h.exec.scripts(), vec!["cargo test\n", "cargo test\n"]);

        let req = &h.server.tell_requests()[0];
        assert!(req.is_application_debug);
        assert_eq!(
            req.prompt,
            exec_debug_prompt(1, "error[E0308]: mismatched types")
        );
    }

    #[test]
    fn exhausted_tries_surface_the_last_failure() {
        let exec = ScriptedExec::new(vec![
            ScriptedExec::failure(2, "first"),
            ScriptedExec::failure(2, "still failing"),
        ]);
        let h = Harness::new(FakeVcs::not_a_repo()).with_exec(exec);
        broken_plan(&h);
        h.server.queue_turn(ScriptedTurn::reply("Trying again.").with_plan(
            description("m2", "another try", &["src/lib.rs"], 5),
            vec![whole("src/lib.rs", "fn nope(\n", 5)],
        ));

        let err = h
            .engine()
            .apply(&debugging(1), &mut AutoConfirm)
            .expect_err("gives up");
        assert_eq!(
            err.downcast_ref::<PlandexError>(),
            Some(&PlandexError::ExecFailure {
                code: 2,
                output: "still failing".to_string()
            })
        );
        assert_eq!(exit_code(&err), 2);
        assert_eq!(h.exec.runs(), 2);
        assert_eq!(h.server.tell_requests().len(), 1);
    }

    #[test]
    fn without_auto_debug_a_failure_can_be_rolled_back() {
        let exec = ScriptedExec::new(vec![ScriptedExec::failure(1, "nope")]);
        let h = Harness::new(FakeVcs::not_a_repo()).with_exec(exec);
        h.write("src/lib.rs", "fn original() {}\n");
        broken_plan(&h);
        let mut answers = Answers {
            apply: true,
            exec: true,
            rollback: true,
            ..Answers::default()
        };
        let flags = ApplyFlags {
            no_commit: true,
            ..ApplyFlags::default()
        };

        let err = h.engine().apply(&flags, &mut answers).expect_err("script fails");
        assert_eq!(exit_code(&err), 1);
        assert_eq!(answers.asked, vec!["apply", "exec", "rollback"]);
        assert_eq!(h.read("src/lib.rs").as_deref(), Some("fn original() {}\n"));
        assert!(h.server.tell_requests().is_empty());
    }

    #[test]
    fn declined_exec_or_no_exec_skips_the_script() {
        let h = Harness::new(FakeVcs::not_a_repo());
        broken_plan(&h);
        let flags = ApplyFlags {
            no_commit: true,
            ..ApplyFlags::default()
        };
        let mut answers = Answers {
            apply: true,
            ..Answers::default()
        };
        let outcome = h
            .engine()
            .apply(&flags, &mut answers)
            .expect("apply")
            .expect("applied");
        assert!(outcome.exec.is_none());
        assert_eq!(answers.asked, vec!["apply", "exec"]);
        assert_eq!(h.exec.runs(), 0);
    }

    #[test]
    fn debug_command_marks_turns_as_user_debug() {
        let exec = ScriptedExec::new(vec![
            ScriptedExec::failure(101, "test failed"),
            ScriptedExec::success(),
        ]);
        let h = Harness::new(FakeVcs::not_a_repo()).with_exec(exec);
        h.server.queue_turn(ScriptedTurn::reply("Patched.").with_plan(
            description("m3", "patch", &["src/main.rs"], 3),
            vec![whole("src/main.rs", "fn main() {}\n", 3)],
        ));
        let flags = ApplyFlags {
            no_commit: true,
            ..ApplyFlags::default()
        };
        let report = h
            .engine()
            .debug_command("cargo test", 2, &flags, &mut AutoConfirm)
            .expect("debug");
        assert_eq!(report.fix_attempts, 1);
        assert_eq!(report.message(), "Command `cargo test` succeeded after 1 fix attempt.");
        let req = &h.server.tell_requests()[0];
        assert!(req.is_user_debug);
        assert!(!req.is_application_debug);
        assert!(req.prompt.starts_with("`cargo test` failed with exit status 101."));
        assert_eq!(h.read("src/main.rs").as_deref(), Some("fn main() {}\n"));
    }
}
