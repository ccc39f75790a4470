//! Per-provider reshaping of a chat request into an OpenAI-compatible
//! `chat/completions` call.

use crate::{ChatMessage, ModelRequest, ModelTarget};
use anyhow::{Result, anyhow};
use plandex_core::models::{CLAUDE_MAX_BETA_HEADER, CLAUDE_MAX_TOKEN_VAR};
use plandex_core::{MessageRole, Provider};
use plandex_errors::PlandexError;
use serde_json::{Value, json};

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

/// Models that reject system prompts and multi-turn input get everything
/// folded into one user message.
fn shape_messages(messages: &[ChatMessage], single_message: bool) -> Vec<Value> {
    if single_message {
        let joined = messages
            .iter()
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        return vec![json!({ "role": "user", "content": joined })];
    }
    messages
        .iter()
        .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
        .collect()
}

fn annotate_cache_control(message: &mut Value) {
    if let Some(obj) = message.as_object_mut() {
        obj.insert("cache_control".to_string(), json!({ "type": "ephemeral" }));
    }
}

/// Marks the stable prefix: every system message plus the first user turn.
fn apply_cache_annotations(messages: &mut [Value]) {
    let mut marked_user = false;
    for msg in messages.iter_mut() {
        match msg.get("role").and_then(Value::as_str) {
            Some("system") => annotate_cache_control(msg),
            Some("user") if !marked_user => {
                annotate_cache_control(msg);
                marked_user = true;
            }
            _ => {}
        }
    }
}

pub fn build_payload(target: &ModelTarget, req: &ModelRequest) -> Value {
    let model = &target.model;
    let mut messages = shape_messages(&req.messages, model.single_message_no_system_prompt);
    if req.cache_control && model.supports_cache_control {
        apply_cache_annotations(&mut messages);
    }
    let mut payload = json!({
        "model": target.model_name,
        "messages": messages,
        "stream": true,
    });
    if !model.role_params_disabled {
        payload["temperature"] = json!(req.temperature);
        payload["top_p"] = json!(req.top_p);
    }
    if let Some(max_tokens) = req.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(effort) = req.reasoning_effort
        && let Ok(value) = serde_json::to_value(effort)
    {
        payload["reasoning_effort"] = value;
    }
    payload
}

fn auth_var<'a>(target: &'a ModelTarget, var: &str) -> Result<&'a str> {
    target
        .auth_vars
        .get(var)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            anyhow::Error::new(PlandexError::AuthMissing {
                explanation: format!(
                    "{var} is required for {} via {}",
                    target.model.model_id, target.provider.provider
                ),
            })
        })
}

fn optional_var(target: &ModelTarget, var: &str) -> Option<String> {
    target.auth_vars.get(var).cloned().or_else(|| {
        target
            .provider
            .extra_auth_vars
            .iter()
            .find(|v| v.var == var)
            .and_then(|v| v.default.clone())
    })
}

pub fn chat_endpoint(target: &ModelTarget) -> Result<String> {
    if target.provider.provider == Provider::AzureOpenAI {
        let base = auth_var(target, "AZURE_API_BASE")?;
        let version = optional_var(target, "AZURE_API_VERSION").unwrap_or_default();
        return Ok(format!(
            "{}/openai/deployments/{}/chat/completions?api-version={version}",
            base.trim_end_matches('/'),
            target.model_name
        ));
    }
    let base = target.provider.base_url.trim_end_matches('/');
    if base.is_empty() {
        return Err(anyhow!(
            "provider {} has no chat endpoint configured",
            target.provider.provider
        ));
    }
    Ok(format!("{base}/chat/completions"))
}

pub fn request_headers(target: &ModelTarget) -> Result<Vec<(String, String)>> {
    let provider = &target.provider;
    if provider.skip_auth {
        return Ok(Vec::new());
    }
    if provider.has_oauth_auth {
        let token = auth_var(target, CLAUDE_MAX_TOKEN_VAR)?;
        return Ok(vec![
            ("Authorization".to_string(), format!("Bearer {token}")),
            ("anthropic-beta".to_string(), CLAUDE_MAX_BETA_HEADER.to_string()),
        ]);
    }
    let Some(var) = provider.api_key_env_var.as_deref().filter(|v| !v.is_empty()) else {
        return Ok(Vec::new());
    };
    let key = auth_var(target, var)?;
    if provider.provider == Provider::AzureOpenAI {
        return Ok(vec![("api-key".to_string(), key.to_string())]);
    }
    Ok(vec![("Authorization".to_string(), format!("Bearer {key}"))])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use plandex_core::models::{builtin_provider_option, find_builtin_model};
    use plandex_core::{ModelRoleConfig, ReasoningEffort};
    use std::collections::BTreeMap;

    pub(crate) fn target(model_id: &str, provider: Provider, vars: &[(&str, &str)]) -> ModelTarget {
        let model = find_builtin_model(model_id).expect("builtin model");
        let model_name = model
            .providers
            .iter()
            .find(|p| p.provider == provider)
            .map(|p| p.model_name.clone())
            .unwrap_or_else(|| model_id.to_string());
        ModelTarget {
            model,
            provider: builtin_provider_option(&provider).expect("builtin provider"),
            model_name,
            auth_vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn convo() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a planner."),
            ChatMessage::user("add a route"),
            ChatMessage::assistant("ok"),
            ChatMessage::user("continue"),
        ]
    }

    #[test]
    fn openai_payload_carries_role_params() {
        let t = target("openai/gpt-4.1", Provider::OpenAI, &[("OPENAI_API_KEY", "k")]);
        let req = ModelRequest::for_role(&ModelRoleConfig::new("openai/gpt-4.1"), &t.model, convo());
        let payload = build_payload(&t, &req);
        assert_eq!(payload["model"], "gpt-4.1");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"].as_array().map(Vec::len), Some(4));
        assert!(payload.get("temperature").is_some());
        assert!(payload["messages"][0].get("cache_control").is_none());
        assert_eq!(payload["max_tokens"], 32_000);
    }

    #[test]
    fn role_params_disabled_models_omit_sampling_and_pass_effort() {
        let t = target("openai/o4-mini", Provider::OpenAI, &[("OPENAI_API_KEY", "k")]);
        let mut cfg = ModelRoleConfig::new("openai/o4-mini");
        cfg.reasoning_effort = Some(ReasoningEffort::High);
        let payload = build_payload(&t, &ModelRequest::for_role(&cfg, &t.model, convo()));
        assert!(payload.get("temperature").is_none());
        assert!(payload.get("top_p").is_none());
        assert_eq!(payload["reasoning_effort"], "high");
    }

    #[test]
    fn single_message_models_fold_the_conversation() {
        let mut t = target("deepseek/r1", Provider::DeepSeek, &[("DEEPSEEK_API_KEY", "k")]);
        t.model.single_message_no_system_prompt = true;
        let req = ModelRequest::for_role(&ModelRoleConfig::new("deepseek/r1"), &t.model, convo());
        let payload = build_payload(&t, &req);
        let messages = payload["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(
            messages[0]["content"],
            "You are a planner.\n\nadd a route\n\nok\n\ncontinue"
        );
    }

    #[test]
    fn cache_control_marks_the_stable_prefix_only_when_enabled() {
        let t = target(
            "anthropic/claude-sonnet-4",
            Provider::Anthropic,
            &[("ANTHROPIC_API_KEY", "k")],
        );
        let mut req =
            ModelRequest::for_role(&ModelRoleConfig::new("anthropic/claude-sonnet-4"), &t.model, convo());
        let payload = build_payload(&t, &req);
        assert_eq!(payload["messages"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(payload["messages"][1]["cache_control"]["type"], "ephemeral");
        assert!(payload["messages"][3].get("cache_control").is_none());

        req.cache_control = false;
        let payload = build_payload(&t, &req);
        assert!(payload["messages"][0].get("cache_control").is_none());
    }

    #[test]
    fn headers_follow_the_provider() {
        let t = target("openai/gpt-4.1", Provider::OpenAI, &[("OPENAI_API_KEY", "sk")]);
        assert_eq!(
            request_headers(&t).expect("headers"),
            vec![("Authorization".to_string(), "Bearer sk".to_string())]
        );

        let t = target(
            "openai/gpt-4.1",
            Provider::AzureOpenAI,
            &[("AZURE_OPENAI_API_KEY", "az"), ("AZURE_API_BASE", "https://r.example/")],
        );
        assert_eq!(
            request_headers(&t).expect("headers"),
            vec![("api-key".to_string(), "az".to_string())]
        );
        assert_eq!(
            chat_endpoint(&t).expect("endpoint"),
            "https://r.example/openai/deployments/gpt-4.1/chat/completions?api-version=2025-04-01-preview"
        );

        let t = target(
            "anthropic/claude-sonnet-4",
            Provider::AnthropicClaudeMax,
            &[(CLAUDE_MAX_TOKEN_VAR, "oauth")],
        );
        let headers = request_headers(&t).expect("headers");
        assert_eq!(headers[0].1, "Bearer oauth");
        assert_eq!(headers[1].0, "anthropic-beta");
    }

    #[test]
    fn missing_keys_are_auth_errors() {
        let t = target("openai/gpt-4.1", Provider::OpenAI, &[]);
        let err = request_headers(&t).expect_err("missing key");
        assert!(matches!(
            err.downcast_ref::<PlandexError>(),
            Some(PlandexError::AuthMissing { .. })
        ));
    }

    #[test]
    fn endpoints_join_the_base_url() {
        let t = target("openai/gpt-4.1", Provider::OpenRouter, &[]);
        assert_eq!(
            chat_endpoint(&t).expect("endpoint"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        let t = target(
            "anthropic/claude-sonnet-4",
            Provider::AmazonBedrock,
            &[],
        );
        assert!(chat_endpoint(&t).is_err());
    }
}
