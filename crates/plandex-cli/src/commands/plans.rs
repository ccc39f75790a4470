use anyhow::{Result, anyhow, bail};
use plandex_api::{CreateBranchRequest, CreatePlanRequest, CreateProjectRequest, PlanApi};
use plandex_core::{MAIN_BRANCH, Plan, runtime_dir};
use plandex_tools::fs::find_git_root;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::context::CliContext;
use crate::output::{format_time, print_json};
use crate::prompt::confirm;

const DRAFT_PLAN_NAME: &str = "draft";

/// Project root for `new`: the existing one, else the git root, else cwd.
fn ensure_project(ctx: &CliContext, api: &Arc<dyn PlanApi>) -> Result<(PathBuf, String)> {
    let root = match &ctx.root {
        Some(root) => root.clone(),
        None => find_git_root(&ctx.cwd).unwrap_or_else(|| ctx.cwd.clone()),
    };
    std::fs::create_dir_all(runtime_dir(&root))?;
    let local = ctx.local_at(&root)?;
    if let Some(id) = local.project_id()? {
        return Ok((root, id));
    }
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    let created = api.create_project(&CreateProjectRequest { name: name.clone() })?;
    local.set_project_id(&created.id)?;
    info!(project = %created.id, %name, "created project");
    Ok((root, created.id))
}

pub(crate) fn run_new(ctx: &CliContext, name: Option<String>) -> Result<()> {
    let api = ctx.api()?;
    let (root, project_id) = ensure_project(ctx, &api)?;
    let name = name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DRAFT_PLAN_NAME.to_string());
    let plan = api.create_plan(&project_id, &CreatePlanRequest { name })?;

    let local = ctx.local_at(&root)?;
    local.set_current_plan(&project_id, &plan.id)?;
    local.set_current_branch(&project_id, &plan.id, MAIN_BRANCH)?;

    if ctx.json {
        print_json(&json!({"id": plan.id, "name": plan.name, "branch": MAIN_BRANCH}))?;
    } else {
        println!("✅ Started new plan {} and set it as current", plan.name);
        println!("Load context with `plandex load`, then `plandex tell` what to build");
    }
    Ok(())
}

fn sorted_plans(api: &Arc<dyn PlanApi>, project_id: &str, archived: bool) -> Result<Vec<Plan>> {
    let ids = [project_id.to_string()];
    let mut plans = if archived {
        api.list_archived_plans(&ids)?
    } else {
        api.list_plans(&ids)?
    };
    plans.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(plans)
}

/// A plan by 1-based list number, exact name, or id.
fn resolve_plan<'a>(plans: &'a [Plan], selector: &str) -> Result<&'a Plan> {
    if let Ok(n) = selector.parse::<usize>()
        && n >= 1
        && n <= plans.len()
    {
        return Ok(&plans[n - 1]);
    }
    plans
        .iter()
        .find(|p| p.name == selector || p.id == selector)
        .ok_or_else(|| anyhow!("no plan matches {selector:?}; run `plandex plans` to list them"))
}

pub(crate) fn run_plans(ctx: &CliContext, archived: bool) -> Result<()> {
    let api = ctx.api()?;
    let project_id = ctx.project_id()?;
    let plans = sorted_plans(&api, &project_id, archived)?;
    let current = ctx.local()?.current_plan_id(&project_id)?;

    if ctx.json {
        return print_json(&json!({
            "current": current,
            "plans": plans,
        }));
    }
    if plans.is_empty() {
        println!("{}", if archived { "No archived plans" } else { "No plans yet; run `plandex new`" });
        return Ok(());
    }
    for (i, plan) in plans.iter().enumerate() {
        let marker = if current.as_deref() == Some(plan.id.as_str()) { "👉" } else { "  " };
        println!(
            "{marker} {:>3}  {:<32} {:>4} replies  {}",
            i + 1,
            plan.name,
            plan.total_replies,
            format_time(plan.updated_at)
        );
    }
    Ok(())
}

pub(crate) fn run_cd(ctx: &CliContext, selector: &str) -> Result<()> {
    let api = ctx.api()?;
    let project_id = ctx.project_id()?;
    let plans = sorted_plans(&api, &project_id, false)?;
    let plan = resolve_plan(&plans, selector)?;
    ctx.local()?.set_current_plan(&project_id, &plan.id)?;
    let branch = ctx.local()?.current_branch(&project_id, &plan.id)?;
    if ctx.json {
        print_json(&json!({"id": plan.id, "name": plan.name, "branch": branch}))?;
    } else {
        println!("✅ Changed current plan to {} ({branch})", plan.name);
    }
    Ok(())
}

pub(crate) fn run_current(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let current = ctx.current_plan()?;
    let plan = api.get_plan(&current.plan_id)?;
    if ctx.json {
        return print_json(&json!({"plan": plan, "branch": current.branch}));
    }
    println!("{}  (branch {})", plan.name, current.branch);
    println!("  created {}  updated {}", format_time(plan.created_at), format_time(plan.updated_at));
    Ok(())
}

pub(crate) fn run_rename(ctx: &CliContext, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("plan name cannot be empty");
    }
    let api = ctx.api()?;
    let current = ctx.current_plan()?;
    api.rename_plan(&current.plan_id, name)?;
    if ctx.json {
        print_json(&json!({"id": current.plan_id, "name": name}))?;
    } else {
        println!("✅ Plan renamed to {name}");
    }
    Ok(())
}

pub(crate) fn run_branches(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let current = ctx.current_plan()?;
    let branches = api.list_branches(&current.plan_id)?;
    if ctx.json {
        return print_json(&json!({"current": current.branch, "branches": branches}));
    }
    for branch in &branches {
        let marker = if branch.name == current.branch { "👉" } else { "  " };
        println!(
            "{marker} {:<24} {:<11} {:>7} 🪙 context  {:>7} 🪙 convo  {}",
            branch.name,
            branch.status.as_str(),
            branch.context_tokens,
            branch.convo_tokens,
            format_time(branch.updated_at)
        );
    }
    Ok(())
}

pub(crate) fn run_checkout(ctx: &CliContext, name: &str, yes: bool) -> Result<()> {
    let api = ctx.api()?;
    let current = ctx.current_plan()?;
    let branches = api.list_branches(&current.plan_id)?;
    let exists = branches.iter().any(|b| b.name == name);

    if !exists {
        if !yes && !confirm(&format!("Branch {name} doesn't exist. Create it from {}?", current.branch))? {
            return Ok(());
        }
        api.create_branch(
            &current.plan_id,
            &current.branch,
            &CreateBranchRequest { name: name.to_string() },
        )?;
        info!(branch = name, from = %current.branch, "created branch");
    }
    ctx.local()?
        .set_current_branch(&current.project_id, &current.plan_id, name)?;

    if ctx.json {
        print_json(&json!({"branch": name, "created": !exists}))?;
    } else if exists {
        println!("✅ Checked out branch {name}");
    } else {
        println!("✅ Created branch {name} from {} and checked it out", current.branch);
    }
    Ok(())
}

pub(crate) fn run_delete_branch(ctx: &CliContext, name: &str) -> Result<()> {
    if name == MAIN_BRANCH {
        bail!("the {MAIN_BRANCH} branch cannot be deleted");
    }
    let api = ctx.api()?;
    let current = ctx.current_plan()?;
    api.delete_branch(&current.plan_id, name)?;
    if current.branch == name {
        ctx.local()?
            .set_current_branch(&current.project_id, &current.plan_id, MAIN_BRANCH)?;
    }
    if ctx.json {
        print_json(&json!({"deleted": name}))?;
    } else {
        println!("🗑️  Deleted branch {name}");
        if current.branch == name {
            println!("Switched to {MAIN_BRANCH}");
        }
    }
    Ok(())
}

fn plan_id_for(ctx: &CliContext, api: &Arc<dyn PlanApi>, selector: Option<&str>, archived: bool) -> Result<(String, String)> {
    match selector {
        Some(sel) => {
            let project_id = ctx.project_id()?;
            let plans = sorted_plans(api, &project_id, archived)?;
            let plan = resolve_plan(&plans, sel)?;
            Ok((plan.id.clone(), plan.name.clone()))
        }
        None => {
            let current = ctx.current_plan()?;
            let plan = api.get_plan(&current.plan_id)?;
            Ok((plan.id, plan.name))
        }
    }
}

/// Drops the local current-plan pointer if it names `plan_id`.
fn forget_if_current(ctx: &CliContext, plan_id: &str) -> Result<()> {
    let project_id = ctx.project_id()?;
    let local = ctx.local()?;
    if local.current_plan_id(&project_id)?.as_deref() == Some(plan_id) {
        local.clear_current_plan(&project_id)?;
    }
    Ok(())
}

pub(crate) fn run_archive(ctx: &CliContext, selector: Option<&str>) -> Result<()> {
    let api = ctx.api()?;
    let (plan_id, name) = plan_id_for(ctx, &api, selector, false)?;
    api.archive_plan(&plan_id)?;
    forget_if_current(ctx, &plan_id)?;
    if ctx.json {
        print_json(&json!({"archived": plan_id}))?;
    } else {
        println!("📦 Archived {name}");
    }
    Ok(())
}

pub(crate) fn run_unarchive(ctx: &CliContext, selector: &str) -> Result<()> {
    let api = ctx.api()?;
    let (plan_id, name) = plan_id_for(ctx, &api, Some(selector), true)?;
    api.unarchive_plan(&plan_id)?;
    if ctx.json {
        print_json(&json!({"unarchived": plan_id}))?;
    } else {
        println!("✅ Restored {name}");
    }
    Ok(())
}

pub(crate) fn run_delete_plan(ctx: &CliContext, selector: Option<&str>, all: bool) -> Result<()> {
    let api = ctx.api()?;
    if all {
        let project_id = ctx.project_id()?;
        api.delete_all_plans(&project_id)?;
        ctx.local()?.clear_current_plan(&project_id)?;
        if ctx.json {
            print_json(&json!({"deleted": "all"}))?;
        } else {
            println!("🗑️  Deleted every plan in this project");
        }
        return Ok(());
    }
    let (plan_id, name) = plan_id_for(ctx, &api, selector, false)?;
    api.delete_plan(&plan_id)?;
    forget_if_current(ctx, &plan_id)?;
    if ctx.json {
        print_json(&json!({"deleted": plan_id}))?;
    } else {
        println!("🗑️  Deleted {name}");
    }
    Ok(())
}
