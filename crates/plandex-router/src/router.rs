use anyhow::{Result, anyhow, bail};
use plandex_api::{CustomModelsInput, CustomProvider};
use plandex_core::models::{
    ALL_ROLES, builtin_provider_option, find_builtin_model, suggest_model_id,
};
use plandex_core::tokens::with_padding;
use plandex_core::{BaseModel, ModelPack, ModelRoleConfig, Provider, ProviderOption, Publisher};
use plandex_errors::PlandexError;
use plandex_llm::{MAX_FALLBACK_DEPTH, ModelTarget, TargetResolver};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::{debug, info};

use crate::resolver::{AuthStatus, CredentialCheck, CredentialResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutedBy {
    Primary,
    LargeContext,
    LargeOutput,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub config: ModelRoleConfig,
    pub target: ModelTarget,
    pub routed_by: RoutedBy,
}

fn custom_option(provider: &CustomProvider) -> ProviderOption {
    ProviderOption {
        provider: Provider::Custom(provider.name.clone()),
        custom_provider: Some(provider.name.clone()),
        base_url: provider.base_url.clone(),
        api_key_env_var: provider.api_key_env_var.clone().filter(|v| !v.is_empty()),
        extra_auth_vars: provider.extra_auth_vars.clone(),
        has_aws_auth: false,
        has_oauth_auth: false,
        skip_auth: provider.skip_auth,
        local_only: false,
    }
}

/// `root` and its fallbacks in depth-first order, at most
/// `MAX_FALLBACK_DEPTH` links below the root.
fn collect_configs(root: &ModelRoleConfig) -> Vec<&ModelRoleConfig> {
    let mut out = Vec::new();
    let mut stack = vec![(root, 0_usize)];
    while let Some((cfg, depth)) = stack.pop() {
        out.push(cfg);
        if depth == MAX_FALLBACK_DEPTH {
            continue;
        }
        let links = [
            &cfg.large_context_fallback,
            &cfg.large_output_fallback,
            &cfg.error_fallback,
        ];
        for next in links.into_iter().rev().flatten() {
            stack.push((next.as_ref(), depth + 1));
        }
    }
    out
}

/// Binds role configs to providers: picks the fallback that fits the prompt,
/// then the first provider whose credentials are complete.
pub struct ModelRouter {
    resolver: CredentialResolver,
    custom_models: Vec<BaseModel>,
    custom_providers: Vec<CustomProvider>,
    local_provider: Option<Provider>,
}

impl ModelRouter {
    pub fn new(resolver: CredentialResolver) -> Self {
        Self {
            resolver,
            custom_models: Vec::new(),
            custom_providers: Vec::new(),
            local_provider: None,
        }
    }

    pub fn with_custom(mut self, custom: &CustomModelsInput) -> Self {
        self.custom_models = custom.custom_models.clone();
        self.custom_providers = custom.custom_providers.clone();
        self
    }

    pub fn for_pack(mut self, pack: &ModelPack) -> Self {
        self.local_provider = pack.local_provider.clone();
        self
    }

    pub fn model(&self, model_id: &str) -> Result<BaseModel> {
        if let Some(model) = self.custom_models.iter().find(|m| m.model_id == model_id) {
            return Ok(model.clone());
        }
        if let Some(model) = find_builtin_model(model_id) {
            return Ok(model);
        }
        match suggest_model_id(model_id) {
            Some(hint) => bail!("unknown model {model_id}; did you mean {hint}?"),
            None => bail!("unknown model {model_id}"),
        }
    }

    fn option_for(&self, provider: &Provider) -> Option<ProviderOption> {
        match provider {
            Provider::Custom(name) => self
                .custom_providers
                .iter()
                .find(|p| &p.name == name)
                .map(custom_option),
            builtin => builtin_provider_option(builtin),
        }
    }

    /// Options that can serve `model`, highest priority first.
    pub fn candidate_options(&self, model: &BaseModel) -> Vec<ProviderOption> {
        if let Some(local) = &self.local_provider
            && model.declares(local)
            && let Some(option) = self.option_for(local)
        {
            return vec![option];
        }
        let priority = model.publisher.provider_priority();
        let mut ordered: Vec<&Provider> = priority.iter().filter(|p| model.declares(p)).collect();
        ordered.extend(
            model
                .providers
                .iter()
                .map(|p| &p.provider)
                .filter(|p| !priority.contains(p)),
        );
        ordered
            .into_iter()
            .filter_map(|p| self.option_for(p))
            .filter(|o| !o.local_only)
            .collect()
    }

    /// Credential status for every model a pack can reach, fallbacks included.
    pub fn check_pack(&self, pack: &ModelPack) -> Result<CredentialCheck> {
        let mut configs = Vec::new();
        for role in ALL_ROLES {
            configs.extend(collect_configs(pack.role_config(role)));
        }
        let mut by_publisher: BTreeMap<Publisher, Vec<ProviderOption>> = BTreeMap::new();
        for cfg in configs {
            let model = self.model(&cfg.model_id)?;
            let options = by_publisher.entry(model.publisher).or_default();
            for option in self.candidate_options(&model) {
                if !options.iter().any(|o| o.provider == option.provider) {
                    options.push(option);
                }
            }
        }
        for (publisher, options) in by_publisher.iter_mut() {
            let priority = publisher.provider_priority();
            options.sort_by_key(|o| {
                priority
                    .iter()
                    .position(|p| p == &o.provider)
                    .unwrap_or(priority.len())
            });
        }
        let candidates: Vec<_> = by_publisher.into_iter().collect();
        self.resolver.check(&candidates)
    }

    fn missing_credentials(&self, model: &BaseModel, options: &[ProviderOption]) -> Result<String> {
        let check = self.resolver.check(&[(model.publisher, options.to_vec())])?;
        let mut out = format!("No provider credentials for {}.\n", model.model_id);
        for option in options {
            let needs = if option.has_oauth_auth {
                "a Claude Max sign-in".to_string()
            } else {
                option.required_vars().join(", ")
            };
            let _ = writeln!(out, "  {} needs {needs}", option.provider.name());
        }
        out.push('\n');
        out.push_str(&check.explanation());
        Ok(out)
    }

    /// Fallback walk for a prompt of `input_tokens` expecting `output_tokens`
    /// of reply, then provider selection.
    pub fn route(&self, cfg: &ModelRoleConfig, input_tokens: usize, output_tokens: usize) -> Result<Route> {
        let mut current = cfg.clone();
        let mut routed_by = RoutedBy::Primary;
        let mut hops = 0_usize;

        let needed_input = with_padding(input_tokens);
        while hops < MAX_FALLBACK_DEPTH {
            let model = self.model(&current.model_id)?;
            if needed_input <= model.max_tokens {
                break;
            }
            let Some(next) = current.large_context_fallback.as_deref().cloned() else {
                break;
            };
            debug!(from = %current.model_id, to = %next.model_id, needed_input, "large-context fallback");
            current = next;
            routed_by = RoutedBy::LargeContext;
            hops += 1;
        }

        if output_tokens > 0 {
            let needed_output = with_padding(output_tokens);
            while hops < MAX_FALLBACK_DEPTH {
                let model = self.model(&current.model_id)?;
                if model.reserved_output_tokens(&current) >= needed_output {
                    break;
                }
                let next = current
                    .large_output_fallback
                    .as_deref()
                    .or(current.large_context_fallback.as_deref())
                    .cloned();
                let Some(next) = next else {
                    break;
                };
                debug!(from = %current.model_id, to = %next.model_id, needed_output, "large-output fallback");
                current = next;
                routed_by = RoutedBy::LargeOutput;
                hops += 1;
            }
        }

        let target = match self.resolve(&current) {
            Ok(target) => target,
            Err(err) if routed_by != RoutedBy::Primary => {
                let Some(PlandexError::AuthMissing { explanation }) = err.downcast_ref::<PlandexError>() else {
                    return Err(err);
                };
                let reason = match routed_by {
                    RoutedBy::LargeOutput => "output",
                    _ => "context",
                };
                return Err(anyhow!(PlandexError::AuthMissing {
                    explanation: format!(
                        "This prompt ({input_tokens} tokens) needs the large-{reason} fallback of {}.\nprimary → {}\nfallback → {}\n\n{explanation}",
                        cfg.model_id, cfg.model_id, current.model_id
                    ),
                }));
            }
            Err(err) => return Err(err),
        };
        info!(
            model_id = %current.model_id,
            provider = %target.provider.provider,
            ?routed_by,
            "routed model"
        );
        Ok(Route {
            config: current,
            target,
            routed_by,
        })
    }
}

impl TargetResolver for ModelRouter {
    fn resolve(&self, cfg: &ModelRoleConfig) -> Result<ModelTarget> {
        let model = self.model(&cfg.model_id)?;
        let options = self.candidate_options(&model);
        if options.is_empty() {
            bail!("no provider is configured for {}", model.model_id);
        }
        for option in &options {
            if option.has_oauth_auth && !self.resolver.has_claude_max() {
                continue;
            }
            let (status, auth_vars) = self.resolver.status_of(option)?;
            if status.status != AuthStatus::FullySatisfied {
                continue;
            }
            let model_name = model
                .providers
                .iter()
                .find(|p| p.provider == option.provider)
                .map(|p| p.model_name.clone())
                .unwrap_or_else(|| model.model_id.clone());
            return Ok(ModelTarget {
                model,
                provider: option.clone(),
                model_name,
                auth_vars,
            });
        }
        Err(anyhow!(PlandexError::AuthMissing {
            explanation: self.missing_credentials(&model, &options)?,
        }))
    }
}
