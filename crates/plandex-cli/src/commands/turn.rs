use anyhow::{Result, anyhow};
use plandex_agent::{ApplyFlags, PlanEngine, TurnOptions, TurnOutcome};
use plandex_api::BuildMode;
use plandex_core::PlanConfig;
use plandex_diff::{build_summary, pending_changes_summary};
use plandex_stream::{StreamState, UiEvent};
use serde_json::{Value, json};
use std::io::{IsTerminal, Read};
use tracing::{info, warn};

use crate::commands::changes::{apply_outcome_json, print_apply_outcome};
use crate::context::{CliContext, PlanRef};
use crate::output::{StreamPrinter, format_time, print_json};
use crate::prompt::TerminalPrompter;
use crate::{PromptArgs, TellArgs};

/// Files the model may pull into context on its own in a single command.
const MAX_AUTO_LOADS: usize = 3;

fn read_prompt(args: &PromptArgs) -> Result<String> {
    let prompt = if let Some(path) = &args.file {
        std::fs::read_to_string(path).map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?
    } else if let Some(prompt) = &args.prompt {
        prompt.clone()
    } else if !std::io::stdin().is_terminal() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        return Err(anyhow!("no prompt given; pass it as an argument, with --file, or on stdin"));
    };
    if prompt.trim().is_empty() {
        return Err(anyhow!("prompt is empty"));
    }
    Ok(prompt)
}

struct TurnRun<'a> {
    ctx: &'a CliContext,
    plan: PlanRef,
    config: PlanConfig,
    engine: PlanEngine,
}

impl<'a> TurnRun<'a> {
    fn start(ctx: &'a CliContext) -> Result<Self> {
        let plan = ctx.current_plan()?;
        let engine = ctx.engine(&plan, true)?;
        let config = engine.api().get_plan_config(&plan.plan_id)?;
        Ok(Self {
            ctx,
            plan,
            config,
            engine,
        })
    }

    fn stream(&self, opts: &TurnOptions) -> Result<TurnOutcome> {
        let mut printer = StreamPrinter::new(self.ctx.json);
        self.engine.tell(opts, &mut |ev: &UiEvent| printer.on_event(ev))
    }

    /// Runs a turn, pulling in files the model asks for when the plan allows it.
    fn run(&self, opts: TurnOptions) -> Result<TurnOutcome> {
        let mut outcome = self.stream(&opts)?;
        let mut loads = 0;
        while let Some(path) = outcome.stream.missing_file.clone() {
            if !self.config.auto_load_context || loads >= MAX_AUTO_LOADS {
                if !self.ctx.json {
                    eprintln!("Run `plandex load {path}` and then `plandex continue` to keep going");
                }
                break;
            }
            loads += 1;
            let manager = self.ctx.context_manager(self.engine.api().clone(), &self.plan)?;
            let loaded = manager.auto_load(std::slice::from_ref(&path))?;
            if !self.ctx.json {
                let report = loaded.report();
                if !report.is_empty() {
                    eprintln!("{report}");
                }
            }
            info!(%path, "loaded missing file, continuing");
            let mut next = TurnOptions::continue_plan().configured(&self.config);
            next.build_mode = opts.build_mode;
            outcome = self.stream(&next)?;
        }
        Ok(outcome)
    }

    /// Reports the turn and applies it when asked to.
    fn finish(&self, outcome: &TurnOutcome, apply: bool) -> Result<()> {
        let mut applied: Option<Value> = None;
        let ready = outcome.finished() && outcome.has_pending_changes() && !outcome.state.has_pending_builds();

        if !self.ctx.json {
            match outcome.stream.state() {
                StreamState::Canceled => println!("🛑 Stopped. `plandex continue` picks up where it left off"),
                _ if outcome.state.has_pending_builds() => {
                    println!("{}", build_summary(&outcome.state));
                    println!("Run `plandex build` to build these changes");
                }
                _ if outcome.has_pending_changes() => println!("{}", pending_changes_summary(&outcome.state)),
                _ => {}
            }
        }

        if ready && (apply || self.config.auto_apply) {
            let mut flags = ApplyFlags::from_config(&self.config);
            flags.auto_confirm = true;
            let mut prompter = TerminalPrompter::new(self.ctx.json);
            match self.engine.apply(&flags, &mut prompter)? {
                Some(result) => {
                    if !self.ctx.json {
                        print_apply_outcome(&result);
                    }
                    applied = Some(apply_outcome_json(&result));
                }
                None => warn!("auto-apply found nothing to write"),
            }
        } else if ready && !self.ctx.json {
            println!("Review with `plandex diff`, then `plandex apply` or `plandex reject`");
        }

        if self.ctx.json {
            let commits: Vec<&str> = outcome
                .stream
                .descriptions
                .iter()
                .map(|d| d.commit_msg.as_str())
                .filter(|m| !m.trim().is_empty())
                .collect();
            print_json(&json!({
                "planId": self.plan.plan_id,
                "branch": self.plan.branch,
                "state": outcome.stream.state(),
                "reply": outcome.stream.reply,
                "descriptions": commits,
                "pendingPaths": outcome.state.plan_result.pending_paths(),
                "pendingBuilds": outcome.state.has_pending_builds(),
                "missingFile": outcome.stream.missing_file,
                "modelError": outcome.stream.model_error,
                "applied": applied,
            }))?;
        }
        Ok(())
    }
}

pub(crate) fn run_tell(ctx: &CliContext, args: TellArgs) -> Result<()> {
    let prompt = read_prompt(&args.prompt)?;
    let run = TurnRun::start(ctx)?;
    let mut opts = TurnOptions::tell(prompt).configured(&run.config);
    if args.no_build {
        opts.build_mode = BuildMode::None;
    }
    let outcome = run.run(opts)?;
    run.finish(&outcome, args.apply)
}

pub(crate) fn run_chat(ctx: &CliContext, args: PromptArgs) -> Result<()> {
    let prompt = read_prompt(&args)?;
    let run = TurnRun::start(ctx)?;
    let outcome = run.run(TurnOptions::chat(prompt).configured(&run.config))?;
    run.finish(&outcome, false)
}

pub(crate) fn run_continue(ctx: &CliContext, no_build: bool) -> Result<()> {
    let run = TurnRun::start(ctx)?;
    let mut opts = TurnOptions::continue_plan().configured(&run.config);
    if no_build {
        opts.build_mode = BuildMode::None;
    }
    let outcome = run.run(opts)?;
    run.finish(&outcome, false)
}

pub(crate) fn run_build(ctx: &CliContext) -> Result<()> {
    let run = TurnRun::start(ctx)?;
    let mut printer = StreamPrinter::new(ctx.json);
    match run.engine.build(&mut |ev: &UiEvent| printer.on_event(ev))? {
        Some(outcome) => run.finish(&outcome, false),
        None => {
            if ctx.json {
                print_json(&json!({"built": false}))
            } else {
                println!("🤷‍♂️ Nothing to build");
                Ok(())
            }
        }
    }
}

pub(crate) fn run_connect(ctx: &CliContext) -> Result<()> {
    let run = TurnRun::start(ctx)?;
    let mut printer = StreamPrinter::new(ctx.json);
    let outcome = run.engine.connect(&mut |ev: &UiEvent| printer.on_event(ev))?;
    run.finish(&outcome, false)
}

pub(crate) fn run_stop(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let plan = ctx.current_plan()?;
    api.stop_plan(&plan.plan_id, &plan.branch)?;
    if ctx.json {
        print_json(&json!({"stopped": true, "planId": plan.plan_id, "branch": plan.branch}))?;
    } else {
        println!("🛑 Stopped the stream on {}", plan.branch);
    }
    Ok(())
}

pub(crate) fn run_ps(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let project_id = ctx.project_id()?;
    let running = api.list_plans_running(&[project_id])?;
    if ctx.json {
        return print_json(&running);
    }
    if running.streams.is_empty() {
        println!("🤷‍♂️ Nothing is running");
        return Ok(());
    }
    for stream in &running.streams {
        let name = running
            .plans
            .iter()
            .find(|p| p.id == stream.plan_id)
            .map(|p| p.name.as_str())
            .unwrap_or(stream.plan_id.as_str());
        println!(
            "{:<32} {:<20} {:<11} since {}",
            name,
            stream.branch,
            stream.status.as_str(),
            format_time(stream.started_at)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn prompt_file_wins_over_the_argument() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, "from file").expect("write");
        let args = PromptArgs {
            prompt: Some("inline".to_string()),
            file: Some(file.path().to_path_buf()),
        };
        assert_eq!(read_prompt(&args).expect("prompt"), "from file");
    }

    #[test]
    fn blank_prompts_are_rejected() {
        let args = PromptArgs {
            prompt: Some("   ".to_string()),
            file: None,
        };
        assert!(read_prompt(&args).is_err());
    }
}
