//! Credential checks per provider, grouped by publisher.

use anyhow::{Context, Result};
use plandex_core::models::CLAUDE_MAX_TOKEN_VAR;
use plandex_core::{Provider, ProviderOption, Publisher};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

use crate::env::{AWS_PROFILE_VAR, AuthEnv, load_aws_profile, maybe_load_json};
use crate::oauth::ClaudeMaxAuth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    FullySatisfied,
    PartiallySatisfied,
    FullyMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub option: ProviderOption,
    pub status: AuthStatus,
    pub missing_vars: Vec<String>,
}

impl ProviderStatus {
    /// Required variables that are present.
    pub fn set_vars(&self) -> Vec<String> {
        all_required(&self.option)
            .into_iter()
            .filter(|v| !self.missing_vars.contains(v))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherStatus {
    pub publisher: Publisher,
    /// Every provider considered, in priority order.
    pub providers: Vec<Provider>,
    pub selected: Option<ProviderStatus>,
    pub partial: Vec<ProviderStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialCheck {
    pub all_satisfied: bool,
    pub publishers: Vec<PublisherStatus>,
    pub auth_vars: BTreeMap<String, String>,
}

fn all_required(option: &ProviderOption) -> Vec<String> {
    let mut vars: Vec<String> = option.api_key_env_var.iter().cloned().collect();
    vars.extend(
        option
            .extra_auth_vars
            .iter()
            .filter(|v| v.required)
            .map(|v| v.var.clone()),
    );
    vars
}

pub struct CredentialResolver {
    env: Arc<dyn AuthEnv>,
    claude_max: Option<Arc<ClaudeMaxAuth>>,
}

impl CredentialResolver {
    pub fn new(env: Arc<dyn AuthEnv>) -> Self {
        Self {
            env,
            claude_max: None,
        }
    }

    pub fn with_claude_max(mut self, auth: Arc<ClaudeMaxAuth>) -> Self {
        self.claude_max = Some(auth);
        self
    }

    pub fn has_claude_max(&self) -> bool {
        self.claude_max.is_some()
    }

    /// Collects the variables `option` needs from the environment, the AWS
    /// profile when opted in, and stored OAuth tokens.
    pub fn resolve_auth_vars(&self, option: &ProviderOption) -> Result<BTreeMap<String, String>> {
        let mut vars = BTreeMap::new();
        if option.skip_auth {
            return Ok(vars);
        }

        if option.has_aws_auth
            && let Some(profile) = self.env.var(AWS_PROFILE_VAR)
        {
            let creds = self
                .env
                .home_dir()
                .and_then(|home| load_aws_profile(&home, &profile));
            if let Some(creds) = creds {
                creds.into_vars(&mut vars);
                return Ok(vars);
            }
            debug!(profile, "aws profile not usable; falling back to env vars");
        }

        if option.has_oauth_auth
            && let Some(auth) = &self.claude_max
            && let Some(token) = auth.access_token()?
        {
            vars.insert(CLAUDE_MAX_TOKEN_VAR.to_string(), token);
        }

        if let Some(key) = &option.api_key_env_var
            && let Some(value) = self.env.var(key)
        {
            vars.insert(key.clone(), value);
        }

        for extra in &option.extra_auth_vars {
            let Some(value) = self.env.var(&extra.var).or_else(|| extra.default.clone()) else {
                continue;
            };
            let value = if extra.maybe_json_file_path {
                maybe_load_json(&value)
                    .with_context(|| format!("failed to load file for {}", extra.var))?
            } else {
                value
            };
            vars.insert(extra.var.clone(), value);
        }
        Ok(vars)
    }

    pub fn provider_status(
        &self,
        option: &ProviderOption,
        vars: &BTreeMap<String, String>,
    ) -> Result<(AuthStatus, Vec<String>)> {
        if option.skip_auth {
            return Ok((AuthStatus::FullySatisfied, Vec::new()));
        }
        if option.has_oauth_auth {
            let connected = match &self.claude_max {
                Some(auth) => auth.is_connected()?,
                None => false,
            };
            if !connected {
                return Ok((AuthStatus::FullyMissing, Vec::new()));
            }
        }
        let required = all_required(option);
        let missing: Vec<String> = required
            .iter()
            .filter(|v| vars.get(*v).is_none_or(|val| val.is_empty()))
            .cloned()
            .collect();
        let status = if missing.is_empty() {
            AuthStatus::FullySatisfied
        } else if missing.len() == required.len() {
            AuthStatus::FullyMissing
        } else {
            AuthStatus::PartiallySatisfied
        };
        Ok((status, missing))
    }

    /// Resolves and classifies one option.
    pub fn status_of(&self, option: &ProviderOption) -> Result<(ProviderStatus, BTreeMap<String, String>)> {
        let vars = self.resolve_auth_vars(option)?;
        let (status, missing_vars) = self.provider_status(option, &vars)?;
        Ok((
            ProviderStatus {
                option: option.clone(),
                status,
                missing_vars,
            },
            vars,
        ))
    }

    /// Walks each publisher's options in order; the first fully satisfied
    /// option is selected. OAuth options are skipped when no OAuth sign-in
    /// is configured.
    pub fn check(&self, candidates: &[(Publisher, Vec<ProviderOption>)]) -> Result<CredentialCheck> {
        let mut auth_vars = BTreeMap::new();
        let mut publishers = Vec::new();
        let mut all_satisfied = true;

        for (publisher, options) in candidates {
            let mut selected = None;
            let mut partial = Vec::new();
            for option in options {
                if option.has_oauth_auth && !self.has_claude_max() {
                    continue;
                }
                let (status, vars) = self.status_of(option)?;
                match status.status {
                    AuthStatus::FullySatisfied => {
                        auth_vars.extend(vars);
                        selected = Some(status);
                        break;
                    }
                    AuthStatus::PartiallySatisfied => partial.push(status),
                    AuthStatus::FullyMissing => {}
                }
            }
            if selected.is_none() {
                all_satisfied = false;
            }
            publishers.push(PublisherStatus {
                publisher: *publisher,
                providers: options.iter().map(|o| o.provider.clone()).collect(),
                selected,
                partial,
            });
        }

        Ok(CredentialCheck {
            all_satisfied,
            publishers,
            auth_vars,
        })
    }
}

impl CredentialCheck {
    /// Plain-text report of what is missing and how to fix it.
    pub fn explanation(&self) -> String {
        let mut out = String::from("Required API key(s) or model credentials are missing\n");

        let ready = |p: &PublisherStatus| p.selected.is_some();
        let some_ok = self.publishers.iter().any(ready);
        let some_missing = self.publishers.iter().any(|p| !ready(p));
        if some_ok && some_missing {
            out.push_str("\nSome models are missing a provider\n");
            let mut sorted: Vec<&PublisherStatus> = self.publishers.iter().collect();
            sorted.sort_by_key(|p| !ready(p));
            for p in sorted {
                let label = p
                    .selected
                    .as_ref()
                    .map(|s| s.option.provider.name())
                    .unwrap_or_else(|| "missing".to_string());
                let mark = if ready(p) { "✓" } else { "✗" };
                let _ = writeln!(out, "{mark} {} models → {label}", p.publisher.as_str());
            }
        }

        let mut seen = BTreeSet::new();
        let mut partial_lines = Vec::new();
        for status in self.publishers.iter().flat_map(|p| &p.partial) {
            let name = status.option.provider.name();
            if !seen.insert(name.clone()) {
                continue;
            }
            partial_lines.push(format!(
                "{name}\n  set → {}\n  missing → {}",
                status.set_vars().join(", "),
                status.missing_vars.join(", ")
            ));
        }
        if !partial_lines.is_empty() {
            partial_lines.sort();
            out.push_str("\nProviders with partial credentials\n");
            for line in partial_lines {
                let _ = writeln!(out, "{line}");
            }
        }

        let all_openrouter = !self.publishers.is_empty()
            && self
                .publishers
                .iter()
                .all(|p| p.providers.contains(&Provider::OpenRouter));
        if all_openrouter {
            out.push_str("\nQuick option → OpenRouter.ai\n");
            out.push_str(
                "OpenRouter serves every model in the current model pack with a single API key.\n",
            );
            out.push_str("1. Sign up at https://openrouter.ai/sign-up\n");
            out.push_str("2. Buy credits at https://openrouter.ai/settings/credits\n");
            out.push_str("3. Generate an API key at https://openrouter.ai/settings/keys\n");
            out.push_str("4. Run export OPENROUTER_API_KEY=…\n");
        }

        if !self.publishers.is_empty() {
            out.push_str("\nOther model providers\n");
            let mut rows: Vec<(&str, Vec<String>)> = self
                .publishers
                .iter()
                .map(|p| {
                    let names = p
                        .providers
                        .iter()
                        .filter(|prov| !(all_openrouter && **prov == Provider::OpenRouter))
                        .map(Provider::name)
                        .collect();
                    (p.publisher.as_str(), names)
                })
                .collect();
            rows.sort();
            rows.dedup();
            for (publisher, names) in rows {
                let _ = writeln!(out, "{publisher} models → {}", names.join(", "));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::MapEnv;
    use plandex_core::models::builtin_provider_option;

    fn option(provider: Provider) -> ProviderOption {
        builtin_provider_option(&provider).expect("builtin")
    }

    fn resolver(vars: &[(&str, &str)]) -> CredentialResolver {
        CredentialResolver::new(Arc::new(MapEnv::new(vars.iter().copied())))
    }

    #[test]
    fn first_fully_satisfied_provider_wins() {
        let r = resolver(&[("OPENROUTER_API_KEY", "or"), ("OPENAI_API_KEY", "oa")]);
        let check = r
            .check(&[(
                Publisher::OpenAI,
                vec![option(Provider::OpenAI), option(Provider::OpenRouter)],
            )])
            .expect("check");
        assert!(check.all_satisfied);
        let selected = check.publishers[0].selected.as_ref().expect("selected");
        assert_eq!(selected.option.provider, Provider::OpenAI);
        assert_eq!(check.auth_vars.get("OPENAI_API_KEY").map(String::as_str), Some("oa"));
        assert!(!check.auth_vars.contains_key("OPENROUTER_API_KEY"));
    }

    #[test]
    fn partial_credentials_list_set_and_missing_vars() {
        let r = resolver(&[("VERTEXAI_PROJECT", "proj")]);
        let check = r
            .check(&[(Publisher::Google, vec![option(Provider::GoogleVertex)])])
            .expect("check");
        assert!(!check.all_satisfied);
        let partial = &check.publishers[0].partial[0];
        assert_eq!(partial.status, AuthStatus::PartiallySatisfied);
        assert_eq!(
            partial.missing_vars,
            vec!["GOOGLE_APPLICATION_CREDENTIALS", "VERTEXAI_LOCATION"]
        );
        let text = check.explanation();
        assert!(text.contains("google-vertex\n  set → VERTEXAI_PROJECT\n  missing → GOOGLE_APPLICATION_CREDENTIALS, VERTEXAI_LOCATION"));
    }

    #[test]
    fn defaults_satisfy_optional_vars() {
        let r = resolver(&[
            ("AWS_ACCESS_KEY_ID", "id"),
            ("AWS_SECRET_ACCESS_KEY", "secret"),
        ]);
        let (status, vars) = r.status_of(&option(Provider::AmazonBedrock)).expect("status");
        assert_eq!(status.status, AuthStatus::FullySatisfied);
        assert_eq!(vars.get("AWS_REGION").map(String::as_str), Some("us-east-1"));
    }

    #[test]
    fn aws_profile_is_opt_in() {
        let dir = tempfile::tempdir().expect("tempdir");
        let aws = dir.path().join(".aws");
        std::fs::create_dir_all(&aws).expect("mkdir");
        std::fs::write(
            aws.join("credentials"),
            "[dev]\naws_access_key_id=AKID\naws_secret_access_key=s\n",
        )
        .expect("write");
        let home = dir.path().to_str().expect("utf8");

        let without = resolver(&[("HOME", home)]);
        let (status, _) = without.status_of(&option(Provider::AmazonBedrock)).expect("status");
        assert_eq!(status.status, AuthStatus::FullyMissing);

        let with = resolver(&[("HOME", home), (AWS_PROFILE_VAR, "dev")]);
        let (status, vars) = with.status_of(&option(Provider::AmazonBedrock)).expect("status");
        assert_eq!(status.status, AuthStatus::FullySatisfied);
        assert_eq!(vars.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("AKID"));
    }

    #[test]
    fn json_credentials_are_loaded_from_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sa.json");
        std::fs::write(&path, "{\"type\":\"service_account\"}").expect("write");
        let r = resolver(&[
            ("GOOGLE_APPLICATION_CREDENTIALS", path.to_str().expect("utf8")),
            ("VERTEXAI_PROJECT", "p"),
            ("VERTEXAI_LOCATION", "us-east5"),
        ]);
        let (status, vars) = r.status_of(&option(Provider::GoogleVertex)).expect("status");
        assert_eq!(status.status, AuthStatus::FullySatisfied);
        assert_eq!(
            vars.get("GOOGLE_APPLICATION_CREDENTIALS").map(String::as_str),
            Some("{\"type\":\"service_account\"}")
        );
    }

    #[test]
    fn oauth_options_are_skipped_without_a_sign_in() {
        let r = resolver(&[("ANTHROPIC_API_KEY", "k")]);
        let check = r
            .check(&[(
                Publisher::Anthropic,
                vec![option(Provider::AnthropicClaudeMax), option(Provider::Anthropic)],
            )])
            .expect("check");
        let selected = check.publishers[0].selected.as_ref().expect("selected");
        assert_eq!(selected.option.provider, Provider::Anthropic);
    }

    #[test]
    fn quick_option_needs_openrouter_everywhere() {
        let r = resolver(&[]);
        let both = r
            .check(&[
                (Publisher::OpenAI, vec![option(Provider::OpenAI), option(Provider::OpenRouter)]),
                (Publisher::Google, vec![option(Provider::GoogleAIStudio), option(Provider::OpenRouter)]),
            ])
            .expect("check");
        let text = both.explanation();
        assert!(text.contains("Quick option → OpenRouter.ai"));
        assert!(text.contains("openai models → openai\n"));

        let one = r
            .check(&[(Publisher::Anthropic, vec![option(Provider::GoogleVertex)])])
            .expect("check");
        assert!(!one.explanation().contains("Quick option"));
    }
}
