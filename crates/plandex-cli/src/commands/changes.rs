use anyhow::{Result, bail};
use plandex_agent::{ApplyFlags, ApplyOutcome, ApplyPrompter, AutoConfirm, RewindTarget};
use plandex_diff::render_plan_diffs;
use plandex_tools::StashPopOutcome;
use serde_json::{Value, json};

use crate::context::CliContext;
use crate::output::print_json;
use crate::prompt::TerminalPrompter;
use crate::{ApplyArgs, DebugArgs, RejectArgs, RewindArgs};

pub(crate) fn apply_outcome_json(outcome: &ApplyOutcome) -> Value {
    let stash = match &outcome.stash {
        None => Value::Null,
        Some(StashPopOutcome::Restored) => json!({"restored": true}),
        Some(StashPopOutcome::ResolvedConflicts(paths)) => json!({"restored": true, "conflicts": paths}),
    };
    json!({
        "planApplyId": outcome.plan_apply_id,
        "written": outcome.written,
        "removed": outcome.removed,
        "unchanged": outcome.skipped_unchanged,
        "commitMsg": outcome.commit_msg,
        "stash": stash,
        "exec": outcome.exec,
    })
}

pub(crate) fn print_apply_outcome(outcome: &ApplyOutcome) {
    for path in &outcome.written {
        println!("  ✅ {path}");
    }
    for path in &outcome.removed {
        println!("  🗑️  {path}");
    }
    let total = outcome.written.len() + outcome.removed.len();
    println!("🚀 Applied {total} file(s)");
    if !outcome.skipped_unchanged.is_empty() {
        println!("ℹ️  Already up to date: {}", outcome.skipped_unchanged.join(", "));
    }
    if let Some(msg) = &outcome.commit_msg {
        println!("📝 Committed: {}", msg.lines().next().unwrap_or_default());
    }
    if let Some(StashPopOutcome::ResolvedConflicts(paths)) = &outcome.stash {
        println!(
            "⚠️  Your stashed edits to {} conflicted with the plan; the plan's version was kept",
            paths.join(", ")
        );
    }
    if let Some(exec) = &outcome.exec {
        println!("{}", exec.message());
    }
}

pub(crate) fn run_diff(ctx: &CliContext, server: bool) -> Result<()> {
    let api = ctx.api()?;
    let plan = ctx.current_plan()?;
    if server {
        let text = api.get_plan_diffs(&plan.plan_id, &plan.branch, ctx.json)?;
        if ctx.json {
            return print_json(&json!({"diff": text}));
        }
        print!("{text}");
        return Ok(());
    }

    let state = api.get_current_plan_state(&plan.plan_id, &plan.branch)?;
    let diffs = render_plan_diffs(&state)?;
    if ctx.json {
        let files: Vec<Value> = diffs
            .iter()
            .map(|d| json!({"path": d.path, "added": d.added, "removed": d.removed, "diff": d.text}))
            .collect();
        return print_json(&files);
    }
    if diffs.is_empty() {
        println!("🤷‍♂️ No pending changes");
        return Ok(());
    }
    for diff in &diffs {
        print!("{}", diff.text);
        if !diff.text.ends_with('\n') {
            println!();
        }
    }
    let added: usize = diffs.iter().map(|d| d.added).sum();
    let removed: usize = diffs.iter().map(|d| d.removed).sum();
    println!("{} file(s) changed, +{added} -{removed}", diffs.len());
    Ok(())
}

fn apply_flags(args: &ApplyArgs, mut flags: ApplyFlags) -> ApplyFlags {
    if args.yes {
        flags.auto_confirm = true;
    }
    if args.commit {
        flags.auto_commit = true;
    }
    if args.skip_commit {
        flags.no_commit = true;
    }
    if args.no_exec {
        flags.no_exec = true;
    }
    if args.auto_exec {
        flags.no_exec = false;
        flags.auto_exec = true;
    }
    if let Some(tries) = args.debug {
        flags.auto_debug = true;
        flags.auto_debug_tries = tries;
    }
    if let Some(msg) = args.commit_msg.as_deref().filter(|m| !m.trim().is_empty()) {
        flags.commit_msg = Some(msg.to_string());
    }
    flags
}

pub(crate) fn run_apply(ctx: &CliContext, args: ApplyArgs) -> Result<()> {
    let plan = ctx.current_plan()?;
    let engine = ctx.engine(&plan, false)?;
    let config = engine.api().get_plan_config(&plan.plan_id)?;
    let flags = apply_flags(&args, ApplyFlags::from_config(&config));

    let mut terminal = TerminalPrompter::new(ctx.json);
    let mut auto = AutoConfirm;
    let prompter: &mut dyn ApplyPrompter = if args.yes { &mut auto } else { &mut terminal };

    match engine.apply(&flags, prompter)? {
        Some(outcome) => {
            if ctx.json {
                print_json(&apply_outcome_json(&outcome))?;
            } else {
                print_apply_outcome(&outcome);
            }
        }
        None if ctx.json => print_json(&json!({"applied": false}))?,
        None => println!("🤷‍♂️ Nothing applied"),
    }
    Ok(())
}

pub(crate) fn run_reject(ctx: &CliContext, args: RejectArgs) -> Result<()> {
    if !args.all && args.paths.is_empty() {
        bail!("pass the paths to reject, or --all");
    }
    let plan = ctx.current_plan()?;
    let engine = ctx.engine(&plan, false)?;
    if args.all {
        engine.reject_all()?;
    } else {
        engine.reject_files(&args.paths)?;
    }
    if ctx.json {
        let rejected = if args.all { json!("all") } else { json!(args.paths) };
        return print_json(&json!({ "rejected": rejected }));
    }
    if args.all {
        println!("🚫 Rejected every pending change");
    } else {
        for path in &args.paths {
            println!("🚫 Rejected {path}");
        }
    }
    Ok(())
}

fn rewind_target(raw: Option<&str>) -> RewindTarget {
    match raw.map(str::trim) {
        None | Some("") => RewindTarget::Steps(1),
        Some(raw) => match raw.parse::<usize>() {
            Ok(n) => RewindTarget::Steps(n),
            Err(_) => RewindTarget::Sha(raw.to_string()),
        },
    }
}

pub(crate) fn run_rewind(ctx: &CliContext, args: RewindArgs) -> Result<()> {
    let plan = ctx.current_plan()?;
    let engine = ctx.engine(&plan, false)?;
    let target = rewind_target(args.target.as_deref());
    let outcome = engine.rewind(&target, args.force)?;
    if ctx.json {
        return print_json(&json!({
            "latestSha": outcome.latest_sha,
            "latestCommit": outcome.latest_commit,
            "written": outcome.written,
            "removed": outcome.removed,
        }));
    }
    println!("⏪ Rewound to {}", outcome.latest_commit.lines().next().unwrap_or(&outcome.latest_sha));
    for path in &outcome.written {
        println!("  ✏️  {path}");
    }
    for path in &outcome.removed {
        println!("  🗑️  {path}");
    }
    Ok(())
}

pub(crate) fn run_debug(ctx: &CliContext, args: DebugArgs) -> Result<()> {
    let plan = ctx.current_plan()?;
    let engine = ctx.engine(&plan, true)?;
    let config = engine.api().get_plan_config(&plan.plan_id)?;
    let tries = args.tries.unwrap_or(config.auto_debug_tries);
    let command = shell_words::join(&args.command);
    let flags = ApplyFlags::from_config(&config);
    let mut prompter = TerminalPrompter::new(ctx.json);
    let report = engine.debug_command(&command, tries, &flags, &mut prompter)?;
    if ctx.json {
        print_json(&report)?;
    } else {
        println!("✅ {}", report.message());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plandex_core::PlanConfig;

    fn base_flags() -> ApplyFlags {
        ApplyFlags::from_config(&PlanConfig::default())
    }

    fn args() -> ApplyArgs {
        ApplyArgs {
            yes: false,
            commit: false,
            skip_commit: false,
            commit_msg: None,
            no_exec: false,
            auto_exec: false,
            debug: None,
        }
    }

    #[test]
    fn rewind_targets_parse_steps_or_shas() {
        assert_eq!(rewind_target(None), RewindTarget::Steps(1));
        assert_eq!(rewind_target(Some("3")), RewindTarget::Steps(3));
        assert_eq!(rewind_target(Some("a1b2c3")), RewindTarget::Sha("a1b2c3".to_string()));
    }

    #[test]
    fn command_line_flags_override_plan_config() {
        let mut base = base_flags();
        base.no_exec = true;
        base.auto_confirm = false;
        let mut a = args();
        a.auto_exec = true;
        a.debug = Some(2);
        a.commit_msg = Some("ship it".to_string());
        let flags = apply_flags(&a, base);
        assert!(!flags.no_exec);
        assert!(flags.auto_exec);
        assert!(flags.auto_debug);
        assert_eq!(flags.auto_debug_tries, 2);
        assert_eq!(flags.commit_msg.as_deref(), Some("ship it"));
        assert!(!flags.auto_confirm);
    }

    #[test]
    fn blank_commit_messages_are_ignored() {
        let mut a = args();
        a.commit_msg = Some("  ".to_string());
        assert_eq!(apply_flags(&a, base_flags()).commit_msg, None);
    }
}
