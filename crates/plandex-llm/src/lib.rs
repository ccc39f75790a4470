//! Provider side of a plan turn: the `ModelClient` port, classification of
//! provider failures, and the retry driver that walks error and
//! large-context fallbacks.

use anyhow::Result;
use plandex_api::StreamBody;
use plandex_core::{BaseModel, MessageRole, ModelRoleConfig, ProviderOption, ReasoningEffort};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod adapter;
pub mod error;
pub mod fallback;
pub mod http;

pub use adapter::{build_payload, chat_endpoint, request_headers};
pub use error::{MAX_RETRY_DELAY_SECONDS, ModelError, extract_retry_after};
pub use fallback::{
    FallbackDriver, FallbackKind, MAX_FALLBACK_DEPTH, MAX_RETRIES_BEFORE_FALLBACK, OpenedStream,
    RetryPolicy, TargetResolver,
};
pub use http::{HttpModelClient, SseFrameReader};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// A model bound to the provider that will serve it, with resolved
/// credentials keyed by variable name.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTarget {
    pub model: BaseModel,
    pub provider: ProviderOption,
    /// The provider's own name for the model.
    pub model_name: String,
    pub auth_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<usize>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub cache_control: bool,
}

impl ModelRequest {
    pub fn for_role(cfg: &ModelRoleConfig, model: &BaseModel, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            max_tokens: Some(model.reserved_output_tokens(cfg)),
            reasoning_effort: cfg.reasoning_effort,
            cache_control: model.supports_cache_control,
        }
    }
}

/// Opens a streaming reply. The body yields `<MSG_SEP>`-framed records, the
/// same framing the plan server uses, ending with `<END>`.
///
/// Failures before the first byte should carry a [`ModelError`] so the
/// fallback driver can classify them.
pub trait ModelClient: Send + Sync {
    fn open(&self, target: &ModelTarget, req: &ModelRequest) -> Result<StreamBody>;
}
