use anyhow::{Result, bail};
use plandex_api::DeleteContextRequest;
use plandex_context::{ConflictChoice, LoadFlags, LoadItem, format_context_table};
use plandex_core::ImageDetail;
use plandex_diff::rebuild_summary;
use serde_json::json;
use std::io::{IsTerminal, Read};

use crate::LoadArgs;
use crate::context::CliContext;
use crate::output::{print_json, token_delta};
use crate::prompt::confirm;

fn parse_detail(raw: &str) -> Result<ImageDetail> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "high" => Ok(ImageDetail::High),
        "low" => Ok(ImageDetail::Low),
        other => bail!("unknown image detail {other:?}; use high or low"),
    }
}

fn read_piped() -> Result<Vec<u8>> {
    let mut data = Vec::new();
    std::io::stdin().read_to_end(&mut data)?;
    Ok(data)
}

fn load_items(ctx: &CliContext, args: &LoadArgs) -> Result<Vec<LoadItem>> {
    let root = ctx.project_root()?;
    let flags = LoadFlags {
        recursive: args.recursive,
        names_only: args.names_only,
        defs_only: args.defs_only,
        force_skip_ignore: args.force_skip_ignore,
        detail: parse_detail(&args.detail)?,
    };
    let mut items = Vec::new();
    let mut piped = false;
    for arg in &args.paths {
        if arg == "-" {
            if !piped {
                items.push(LoadItem::PipedData(read_piped()?));
                piped = true;
            }
            continue;
        }
        items.push(LoadItem::from_arg(root, arg, flags));
    }
    if let Some(note) = args.note.as_deref().filter(|n| !n.trim().is_empty()) {
        items.push(LoadItem::Note(note.to_string()));
    }
    if items.is_empty() && !std::io::stdin().is_terminal() {
        items.push(LoadItem::PipedData(read_piped()?));
    }
    Ok(items)
}

pub(crate) fn run_load(ctx: &CliContext, args: LoadArgs) -> Result<()> {
    let items = load_items(ctx, &args)?;
    if items.is_empty() {
        bail!("nothing to load; pass paths, urls, --note, or pipe data in");
    }
    let plan = ctx.current_plan()?;
    let manager = ctx.context_manager(ctx.api()?, &plan)?;
    let outcome = manager.load(&items)?;

    if ctx.json {
        let skipped: Vec<_> = outcome.skipped.iter().map(|s| s.name.clone()).collect();
        return print_json(&json!({
            "loaded": outcome.loaded,
            "skipped": skipped,
            "truncated": outcome.truncated,
            "tokensAdded": outcome.response.tokens_added,
            "totalTokens": outcome.response.total_tokens,
            "maxTokensExceeded": outcome.response.max_tokens_exceeded,
        }));
    }
    if !outcome.loaded.is_empty() {
        println!(
            "✅ Loaded {} item(s) into context | {} | total → {} 🪙",
            outcome.loaded.len(),
            token_delta(outcome.response.tokens_added),
            outcome.response.total_tokens
        );
    }
    let report = outcome.report();
    if !report.is_empty() {
        println!("{report}");
    }
    if !outcome.response.msg.is_empty() {
        println!("{}", outcome.response.msg);
    }
    Ok(())
}

pub(crate) fn run_ls(ctx: &CliContext) -> Result<()> {
    let plan = ctx.current_plan()?;
    let manager = ctx.context_manager(ctx.api()?, &plan)?;
    let contexts = manager.list(false)?;
    if ctx.json {
        return print_json(&contexts);
    }
    println!("{}", format_context_table(&contexts));
    let total: usize = contexts.iter().map(|c| c.num_tokens).sum();
    if !contexts.is_empty() {
        println!("Total: {total} 🪙");
    }
    Ok(())
}

pub(crate) fn run_rm(ctx: &CliContext, selectors: &[String]) -> Result<()> {
    let plan = ctx.current_plan()?;
    let manager = ctx.context_manager(ctx.api()?, &plan)?;
    let outcome = manager.remove(selectors)?;
    if ctx.json {
        let names: Vec<&str> = outcome.removed.iter().map(|c| c.display_name()).collect();
        return print_json(&json!({
            "removed": names,
            "tokensRemoved": outcome.response.tokens_removed,
            "totalTokens": outcome.response.total_tokens,
        }));
    }
    if outcome.removed.is_empty() {
        println!("🤷‍♂️ Nothing matched; context unchanged");
        return Ok(());
    }
    for ctx_item in &outcome.removed {
        println!("🗑️  {}", ctx_item.display_name());
    }
    println!(
        "Removed {} item(s) | -{} 🪙 | total → {} 🪙",
        outcome.removed.len(),
        outcome.response.tokens_removed,
        outcome.response.total_tokens
    );
    Ok(())
}

pub(crate) fn run_clear(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let plan = ctx.current_plan()?;
    let contexts = api.list_context(&plan.plan_id, &plan.branch)?;
    if contexts.is_empty() {
        if ctx.json {
            return print_json(&json!({"removed": 0}));
        }
        println!("🤷‍♂️ Context is already empty");
        return Ok(());
    }
    let ids = contexts.iter().map(|c| c.id.clone()).collect();
    let res = api.delete_context(&plan.plan_id, &plan.branch, &DeleteContextRequest { ids })?;
    if ctx.json {
        return print_json(&json!({
            "removed": contexts.len(),
            "tokensRemoved": res.tokens_removed,
        }));
    }
    println!("🧹 Cleared {} item(s) | -{} 🪙", contexts.len(), res.tokens_removed);
    Ok(())
}

pub(crate) fn run_update(ctx: &CliContext, yes: bool) -> Result<()> {
    let plan = ctx.current_plan()?;
    let manager = ctx.context_manager(ctx.api()?, &plan)?;
    let report = manager.check_outdated(None)?;
    if report.is_empty() {
        if ctx.json {
            return print_json(&json!({"updated": 0}));
        }
        println!("{}", report.summary());
        return Ok(());
    }
    if !ctx.json {
        println!("{}", report.summary());
    }

    let conflicts = manager.conflicts(&report)?;
    let choice = if conflicts.is_empty() {
        ConflictChoice::Rebuild
    } else {
        if !ctx.json {
            println!("Pending changes were built against the old versions of these files:");
            println!("{}", rebuild_summary(&conflicts));
        }
        if yes || confirm("Update context and rebuild them?")? {
            ConflictChoice::Rebuild
        } else {
            ConflictChoice::Cancel
        }
    };
    let outcome = manager.update(&report, choice)?;

    let rebuilt = if outcome.conflicts.is_empty() {
        Vec::new()
    } else {
        let engine = ctx.engine(&plan, true)?;
        engine.rebuild(&outcome.conflicts)?;
        outcome.conflicts.clone()
    };

    if ctx.json {
        return print_json(&json!({
            "updated": report.num_items(),
            "removed": outcome.removed,
            "rebuilt": rebuilt,
            "tokensAdded": outcome.response.tokens_added,
            "totalTokens": outcome.response.total_tokens,
        }));
    }
    println!(
        "✅ Context updated | {} | total → {} 🪙",
        token_delta(outcome.response.tokens_added),
        outcome.response.total_tokens
    );
    for path in &rebuilt {
        println!("  🏗️  rebuilt {path}");
    }
    Ok(())
}
