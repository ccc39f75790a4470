use anyhow::{Result, anyhow};
use plandex_core::{CurrentPlanState, ModelRoleConfig, PlanFileResult, body_sha};
use plandex_diff::{apply_replacements, validate_result};
use plandex_llm::{ChatMessage, FallbackDriver};
use plandex_stream::{StreamSession, StreamState, start_stream};
use tracing::info;

use crate::PlanEngine;

const REBUILD_SYSTEM_PROMPT: &str = "You update a single source file. You are given the file as it is \
now on disk and a list of changes that were planned against an older version of it. Apply the intent \
of every change to the current file. Reply with the complete updated file and nothing else: no \
explanation and no markdown fences.";

/// Rewrites files whose pending edits stopped applying after their context
/// changed, using the builder model directly.
pub struct Rebuilder {
    driver: FallbackDriver,
    role: ModelRoleConfig,
}

impl Rebuilder {
    pub fn new(driver: FallbackDriver, role: ModelRoleConfig) -> Self {
        Self { driver, role }
    }
}

impl PlanEngine {
    /// Rebuilds each of `paths` against its current context body and stores
    /// the result as a whole-file change.
    pub fn rebuild(&self, paths: &[String]) -> Result<Vec<PlanFileResult>> {
        let rebuilder = self
            .rebuilder
            .as_ref()
            .ok_or_else(|| anyhow!("no builder model configured; cannot rebuild {}", paths.join(", ")))?;
        let state = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
        let mut rebuilt = Vec::with_capacity(paths.len());
        for path in paths {
            let result = self.rebuild_path(rebuilder, &state, path)?;
            validate_result(&result)?;
            rebuilt.push(result);
        }
        self.api
            .put_plan_file_results(&self.plan_id, &self.branch, &rebuilt)?;
        info!(plan_id = %self.plan_id, branch = %self.branch, paths = ?paths, "rebuilt invalidated paths");
        Ok(rebuilt)
    }

    fn rebuild_path(&self, rebuilder: &Rebuilder, state: &CurrentPlanState, path: &str) -> Result<PlanFileResult> {
        let base = state
            .contexts_by_path
            .get(path)
            .map(|c| c.body.clone())
            .ok_or_else(|| anyhow!("{path} is not in context; load it before rebuilding"))?;
        let pending: Vec<&PlanFileResult> = state
            .plan_result
            .pending_results()
            .filter(|r| r.path == path)
            .collect();
        let last = pending
            .last()
            .ok_or_else(|| anyhow!("no pending changes for {path}"))?;

        let mut draft = base.clone();
        let mut changes = Vec::new();
        for result in &pending {
            if let Some(content) = &result.content {
                draft = content.clone();
                changes.push("- replace the whole file with the draft below".to_string());
                continue;
            }
            draft = apply_replacements(&draft, &result.replacements, false).updated;
            changes.extend(result.replacements.iter().map(|rep| {
                format!(
                    "- {}\n  replace:\n{}\n  with:\n{}",
                    rep.summary, rep.old, rep.new
                )
            }));
        }

        let prompt = format!(
            "Path: {path}\n\nCurrent file:\n```\n{base}\n```\n\nPlanned changes:\n{}\n\nDraft with the changes that still applied:\n```\n{draft}\n```",
            changes.join("\n")
        );
        let messages = [
            ChatMessage::system(REBUILD_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];
        let opened = rebuilder.driver.open(&rebuilder.role, &messages)?;
        info!(path, model = %opened.model_id, attempts = opened.attempts, "rebuilding file");
        let outcome = start_stream(
            opened.body,
            StreamSession::detached(),
            StreamState::Replying,
            self.stream_opts.clone(),
        )
        .wait()?;
        if let Some(err) = outcome.error {
            return Err(err.into());
        }
        let content = strip_fences(&outcome.reply);
        if content.trim().is_empty() {
            return Err(anyhow!("builder model returned an empty file for {path}"));
        }

        Ok(PlanFileResult {
            id: String::new(),
            convo_message_id: last.convo_message_id.clone(),
            plan_build_id: last.plan_build_id.clone(),
            path: path.to_string(),
            context_sha: body_sha(&base),
            context_body: base,
            content: Some(content),
            replacements: Vec::new(),
            any_failed: false,
            removed_file: false,
            applied_at: None,
            rejected_at: None,
            created_at: last.created_at,
            updated_at: last.updated_at,
        })
    }
}

/// Drops a single wrapping markdown fence, keeping a trailing newline.
fn strip_fences(reply: &str) -> String {
    let trimmed = reply.trim();
    let inner = trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.split_once('\n'))
        .and_then(|(_lang, body)| body.trim_end().strip_suffix("```"));
    let mut body = match inner {
        Some(body) => body.trim_end_matches('\n').to_string(),
        None => trimmed.to_string(),
    };
    body.push('\n');
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::{ApplyFlags, AutoConfirm};
    use crate::testing::Harness;
    use plandex_context::{ContextManager, LoadItem};
    use plandex_core::models::{builtin_provider_option, find_builtin_model};
    use plandex_core::{ContextConfig, CurrentPlanState, MAIN_BRANCH, PlanResult, Provider};
    use plandex_llm::{ModelTarget, RetryPolicy, TargetResolver};
    use plandex_testkit::fixtures::{description, edits, rep};
    use plandex_testkit::{FakeVcs, ScriptedModelClient};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct Sonnet;

    impl TargetResolver for Sonnet {
        fn resolve(&self, _cfg: &ModelRoleConfig) -> Result<ModelTarget> {
            Ok(ModelTarget {
                model: find_builtin_model("anthropic/claude-sonnet-4").ok_or_else(|| anyhow!("model"))?,
                provider: builtin_provider_option(&Provider::Anthropic).ok_or_else(|| anyhow!("provider"))?,
                model_name: "claude-sonnet-4-20250514".to_string(),
                auth_vars: BTreeMap::new(),
            })
        }
    }

    #[test]
    fn strip_fences_unwraps_one_code_block() {
        assert_eq!(strip_fences("```ts\nconst a = 1;\n```\n"), "const a = 1;\n");
        assert_eq!(strip_fences("const a = 1;"), "const a = 1;\n");
    }

    #[test]
    fn drifted_files_are_refreshed_and_rebuilt_before_apply() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let original = "const a = 1;\nconst b = 2;\n";
        h.write("x.ts", original);

        let context = Arc::new(
            ContextManager::new(
                h.server.clone(),
                h.plan_id.clone(),
                MAIN_BRANCH,
                h.root(),
                &ContextConfig {
                    fetch_concurrency: 2,
                    url_timeout_seconds: 5,
                },
            )
            .expect("context manager"),
        );
        context
            .load(&[LoadItem::File {
                path: "x.ts".to_string(),
                force_skip_ignore: false,
            }])
            .expect("load");
        h.server.set_plan_state(
            &h.plan_id,
            MAIN_BRANCH,
            CurrentPlanState {
                plan_result: PlanResult::from_results(vec![edits(
                    "x.ts",
                    original,
                    vec![rep("const a = 1;", "const a = 10;"), rep("const b = 2;", "const b = 20;")],
                    100,
                )]),
                convo_message_descriptions: vec![description("m1", "bump constants", &["x.ts"], 100)],
                ..CurrentPlanState::default()
            },
        );
        h.write("x.ts", "const a = 1;\nconst b = 3;\n");

        let client = ScriptedModelClient::new();
        client.reply("```ts\nconst a = 10;\nconst b = 30;\n```");
        let driver = FallbackDriver::new(client.clone(), Arc::new(Sonnet)).with_policy(RetryPolicy {
            max_retries: 0,
            fallback_retries: 0,
            base_ms: 1,
        });
        let engine = h
            .engine()
            .with_context_manager(context)
            .with_rebuilder(Rebuilder::new(driver, ModelRoleConfig::new("anthropic/claude-sonnet-4")));

        let flags = ApplyFlags {
            auto_confirm: true,
            no_commit: true,
            no_exec: true,
            auto_update_context: true,
            ..ApplyFlags::default()
        };
        let outcome = engine
            .apply(&flags, &mut AutoConfirm)
            .expect("apply")
            .expect("applied");

        assert_eq!(outcome.written, vec!["x.ts".to_string()]);
        assert_eq!(h.read("x.ts").as_deref(), Some("const a = 10;\nconst b = 30;\n"));
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model_name, "claude-sonnet-4-20250514");
        assert!(calls[0].request.messages[1].content.contains("const b = 3;"));
        assert!(h.state().plan_result.pending_paths().is_empty());
    }

    #[test]
    fn rebuilding_without_a_builder_fails() {
        let h = Harness::new(FakeVcs::not_a_repo());
        let err = h.engine().rebuild(&["x.ts".to_string()]).expect_err("no builder");
        assert!(err.to_string().contains("no builder model configured"));
    }
}
