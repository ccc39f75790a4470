use anyhow::{Result, anyhow, bail};
use plandex_api::{PlanApi, PlanSettings};
use plandex_core::models::{builtin_model_packs, builtin_models, find_builtin_model, suggest_model_id};
use plandex_core::settings::{set_from_str, visible_settings};
use plandex_core::{BaseModel, ModelPack, ModelRole, PlanConfig};
use plandex_router::CredentialCheck;
use plandex_store::SettingsFile;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::SetModelArgs;
use crate::context::{CliContext, PlanRef};
use crate::output::{format_time, print_json};

fn load_config(ctx: &CliContext, api: &Arc<dyn PlanApi>, default: bool) -> Result<(Option<PlanRef>, PlanConfig)> {
    if default {
        return Ok((None, api.get_default_plan_config()?));
    }
    let plan = ctx.current_plan()?;
    let cfg = api.get_plan_config(&plan.plan_id)?;
    Ok((Some(plan), cfg))
}

fn print_settings(cfg: &PlanConfig) {
    let rows = visible_settings(cfg);
    let width = rows.iter().map(|(key, ..)| key.len()).max().unwrap_or(0);
    for (key, label, value) in rows {
        println!("  {key:<width$}  {value:<10} {label}");
    }
}

pub(crate) fn run_config(ctx: &CliContext, default: bool) -> Result<()> {
    let api = ctx.api()?;
    let (_, cfg) = load_config(ctx, &api, default)?;
    if ctx.json {
        return print_json(&cfg);
    }
    println!("{}", if default { "Default settings for new plans" } else { "Plan settings" });
    println!("  auto mode: {} ({})\n", cfg.auto_mode.as_str(), cfg.auto_mode.description());
    print_settings(&cfg);
    Ok(())
}

pub(crate) fn run_set_config(ctx: &CliContext, key: &str, value: &str, default: bool) -> Result<()> {
    let api = ctx.api()?;
    let (plan, mut cfg) = load_config(ctx, &api, default)?;
    let changed = set_from_str(&mut cfg, key, value)?;
    if changed {
        match &plan {
            Some(plan) => api.update_plan_config(&plan.plan_id, &cfg)?,
            None => api.update_default_plan_config(&cfg)?,
        }
        info!(key, value, default, "updated plan config");
    }
    if ctx.json {
        return print_json(&json!({"changed": changed, "config": cfg}));
    }
    if changed {
        println!("✅ Updated {key}");
        print_settings(&cfg);
    } else {
        println!("{key} is already {value}");
    }
    Ok(())
}

fn known_model(model_id: &str, custom: &[BaseModel]) -> bool {
    find_builtin_model(model_id).is_some() || custom.iter().any(|m| m.model_id == model_id)
}

fn find_pack(name: &str, server: &[ModelPack]) -> Option<ModelPack> {
    builtin_model_packs()
        .into_iter()
        .chain(server.iter().cloned())
        .find(|p| p.name == name || p.id == name)
}

/// Swaps a pack, or one role's model within the current pack.
fn choose_pack(
    current: &ModelPack,
    target: &str,
    model: Option<&str>,
    server_packs: &[ModelPack],
    custom_models: &[BaseModel],
) -> Result<ModelPack> {
    let Some(model_id) = model else {
        return find_pack(target, server_packs)
            .ok_or_else(|| anyhow!("no model pack named {target:?}; run `plandex model-packs` to list them"));
    };
    let role = ModelRole::parse(target).ok_or_else(|| anyhow!("unknown model role {target:?}"))?;
    if !known_model(model_id, custom_models) {
        let hint = suggest_model_id(model_id)
            .map(|s| format!(" (did you mean {s}?)"))
            .unwrap_or_default();
        bail!("unknown model {model_id:?}{hint}");
    }
    let mut pack = current.clone();
    pack.role_config_mut(role).model_id = model_id.to_string();
    Ok(pack)
}

pub(crate) fn run_set_model(ctx: &CliContext, args: SetModelArgs) -> Result<()> {
    let api = ctx.api()?;
    let plan = if args.default { None } else { Some(ctx.current_plan()?) };
    let current = ctx.model_pack(&api, plan.as_ref())?;
    let custom = ctx.custom_models(&api)?;
    let server_packs = api.list_model_packs()?;
    let pack = choose_pack(&current, &args.target, args.model.as_deref(), &server_packs, &custom.custom_models)?;

    let settings = PlanSettings {
        model_pack: pack.clone(),
        updated_at: None,
    };
    let file = match &plan {
        Some(plan) => {
            api.update_settings(&plan.plan_id, &plan.branch, &settings)?;
            SettingsFile::<ModelPack>::new(ctx.paths.plan_model_settings_file(&plan.plan_id))
        }
        None => {
            api.update_default_settings(&settings)?;
            SettingsFile::<ModelPack>::new(ctx.paths.default_model_settings_file())
        }
    };
    file.write(&pack)?;

    if ctx.json {
        return print_json(&pack);
    }
    match args.model {
        Some(model) => println!("✅ {} now uses {model}", args.target),
        None => println!("✅ Switched to model pack {}", pack.name),
    }
    Ok(())
}

pub(crate) fn run_models(ctx: &CliContext) -> Result<()> {
    let mut models = builtin_models();
    let mut custom_count = 0;
    if ctx.signed_in() {
        let custom = ctx.api()?.list_custom_models()?;
        custom_count = custom.len();
        models.extend(custom);
    }
    if ctx.json {
        return print_json(&models);
    }
    for model in &models {
        let providers: Vec<String> = model.providers.iter().map(|p| p.provider.name()).collect();
        println!(
            "{:<36} {:>8} ctx {:>7} out  {}",
            model.model_id,
            model.max_tokens,
            model.max_output_tokens,
            providers.join(", ")
        );
    }
    if custom_count > 0 {
        println!("\n{custom_count} custom model(s) included");
    }
    Ok(())
}

pub(crate) fn run_model_packs(ctx: &CliContext) -> Result<()> {
    let mut packs = builtin_model_packs();
    if ctx.signed_in() {
        packs.extend(ctx.api()?.list_model_packs()?);
    }
    if ctx.json {
        return print_json(&packs);
    }
    for pack in &packs {
        println!("{:<20} {}", pack.name, pack.description);
        println!("    planner {}  builder {}", pack.planner.model_id, pack.builder.model_id);
    }
    Ok(())
}

fn providers_json(check: &CredentialCheck) -> Value {
    let publishers: Vec<Value> = check
        .publishers
        .iter()
        .map(|p| {
            let partial: Vec<Value> = p
                .partial
                .iter()
                .map(|s| json!({"provider": s.option.provider.name(), "missing": s.missing_vars}))
                .collect();
            json!({
                "publisher": p.publisher.as_str(),
                "providers": p.providers.iter().map(|pr| pr.name()).collect::<Vec<_>>(),
                "selected": p.selected.as_ref().map(|s| s.option.provider.name()),
                "partial": partial,
            })
        })
        .collect();
    json!({"allSatisfied": check.all_satisfied, "publishers": publishers})
}

pub(crate) fn run_providers(ctx: &CliContext) -> Result<()> {
    let (pack, router) = if ctx.signed_in() {
        let api = ctx.api()?;
        let plan = ctx.current_plan().ok();
        let pack = ctx.model_pack(&api, plan.as_ref())?;
        let custom = ctx.custom_models(&api)?;
        let router = ctx.router(Some(&custom), &pack)?;
        (pack, router)
    } else {
        let pack = ctx.offline_pack();
        let router = ctx.router(None, &pack)?;
        (pack, router)
    };
    let check = router.check_pack(&pack)?;

    if ctx.json {
        let mut out = providers_json(&check);
        out["pack"] = json!(pack.name);
        return print_json(&out);
    }
    println!("Model pack {}\n", pack.name);
    for p in &check.publishers {
        match &p.selected {
            Some(s) => println!("  ✅ {:<12} → {}", p.publisher.as_str(), s.option.provider.name()),
            None => {
                let names: Vec<String> = p.providers.iter().map(|pr| pr.name()).collect();
                println!("  ❌ {:<12} no credentials ({})", p.publisher.as_str(), names.join(", "));
            }
        }
    }
    if !check.all_satisfied {
        println!("\n{}", check.explanation());
    }
    Ok(())
}

pub(crate) fn run_usage(ctx: &CliContext) -> Result<()> {
    let api = ctx.api()?;
    let usage = api.get_usage_summary()?;
    if ctx.json {
        return print_json(&usage);
    }
    if let Some(since) = usage.since {
        println!("Since {}", format_time(since));
    }
    println!(
        "{:<36} {:>10} in {:>10} out {:>10} cached {:>6} calls",
        "total",
        usage.total.input_tokens,
        usage.total.output_tokens,
        usage.total.cached_tokens,
        usage.total.num_requests
    );
    for (model, u) in &usage.by_model {
        println!(
            "{:<36} {:>10} in {:>10} out {:>10} cached {:>6} calls",
            model, u.input_tokens, u.output_tokens, u.cached_tokens, u.num_requests
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plandex_core::models::default_model_pack;

    #[test]
    fn a_bare_name_selects_a_builtin_pack() {
        let pack = choose_pack(&default_model_pack(), "oss", None, &[], &[]).expect("pack");
        assert_eq!(pack.id, "oss");
    }

    #[test]
    fn a_role_and_model_change_only_that_role() {
        let current = default_model_pack();
        let pack = choose_pack(&current, "builder", Some("openai/gpt-4.1"), &[], &[]).expect("pack");
        assert_eq!(pack.builder.model_id, "openai/gpt-4.1");
        assert_eq!(pack.planner, current.planner);
    }

    #[test]
    fn unknown_models_are_rejected() {
        let err = choose_pack(&default_model_pack(), "planner", Some("made/up-model"), &[], &[])
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown model"));
    }
}
