//! Model registry: roles, packs, base models and the providers that can serve them.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelRole {
    Planner,
    Coder,
    ContextLoader,
    PlanSummary,
    Builder,
    WholeFileBuilder,
    Namer,
    CommitMsg,
    ExecStatus,
}

pub const ALL_ROLES: [ModelRole; 9] = [
    ModelRole::Planner,
    ModelRole::Coder,
    ModelRole::ContextLoader,
    ModelRole::PlanSummary,
    ModelRole::Builder,
    ModelRole::WholeFileBuilder,
    ModelRole::Namer,
    ModelRole::CommitMsg,
    ModelRole::ExecStatus,
];

impl ModelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Planner => "planner",
            ModelRole::Coder => "coder",
            ModelRole::ContextLoader => "context-loader",
            ModelRole::PlanSummary => "plan-summary",
            ModelRole::Builder => "builder",
            ModelRole::WholeFileBuilder => "whole-file-builder",
            ModelRole::Namer => "namer",
            ModelRole::CommitMsg => "commit-msg",
            ModelRole::ExecStatus => "exec-status",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        ALL_ROLES
            .iter()
            .copied()
            .find(|role| role.as_str() == normalized)
            .or(match normalized.as_str() {
                // legacy names
                "architect" => Some(ModelRole::ContextLoader),
                "summarizer" => Some(ModelRole::PlanSummary),
                _ => None,
            })
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Per-role model settings. Fallbacks are owned, so a chain is a finite tree;
/// traversal is still depth-guarded because packs are user-editable JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRoleConfig {
    pub model_id: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub reserved_output_tokens: Option<usize>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default)]
    pub large_context_fallback: Option<Box<ModelRoleConfig>>,
    #[serde(default)]
    pub large_output_fallback: Option<Box<ModelRoleConfig>>,
    #[serde(default)]
    pub error_fallback: Option<Box<ModelRoleConfig>>,
}

fn default_temperature() -> f32 {
    0.3
}

fn default_top_p() -> f32 {
    0.3
}

impl ModelRoleConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            reserved_output_tokens: None,
            reasoning_effort: None,
            large_context_fallback: None,
            large_output_fallback: None,
            error_fallback: None,
        }
    }

    pub fn with_large_context_fallback(mut self, fallback: ModelRoleConfig) -> Self {
        self.large_context_fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_large_output_fallback(mut self, fallback: ModelRoleConfig) -> Self {
        self.large_output_fallback = Some(Box::new(fallback));
        self
    }

    pub fn with_error_fallback(mut self, fallback: ModelRoleConfig) -> Self {
        self.error_fallback = Some(Box::new(fallback));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPack {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub local_provider: Option<Provider>,
    pub planner: ModelRoleConfig,
    #[serde(default)]
    pub coder: Option<ModelRoleConfig>,
    #[serde(default, alias = "architect")]
    pub context_loader: Option<ModelRoleConfig>,
    #[serde(alias = "summarizer")]
    pub plan_summary: ModelRoleConfig,
    pub builder: ModelRoleConfig,
    #[serde(default)]
    pub whole_file_builder: Option<ModelRoleConfig>,
    pub namer: ModelRoleConfig,
    pub commit_msg: ModelRoleConfig,
    pub exec_status: ModelRoleConfig,
}

impl ModelPack {
    /// Optional roles inherit from the role they specialize.
    pub fn role_config(&self, role: ModelRole) -> &ModelRoleConfig {
        match role {
            ModelRole::Planner => &self.planner,
            ModelRole::Coder => self.coder.as_ref().unwrap_or(&self.planner),
            ModelRole::ContextLoader => self.context_loader.as_ref().unwrap_or(&self.planner),
            ModelRole::PlanSummary => &self.plan_summary,
            ModelRole::Builder => &self.builder,
            ModelRole::WholeFileBuilder => {
                self.whole_file_builder.as_ref().unwrap_or(&self.builder)
            }
            ModelRole::Namer => &self.namer,
            ModelRole::CommitMsg => &self.commit_msg,
            ModelRole::ExecStatus => &self.exec_status,
        }
    }

    pub fn role_config_mut(&mut self, role: ModelRole) -> &mut ModelRoleConfig {
        match role {
            ModelRole::Planner => &mut self.planner,
            ModelRole::Coder => self.coder.get_or_insert_with(|| self.planner.clone()),
            ModelRole::ContextLoader => self
                .context_loader
                .get_or_insert_with(|| self.planner.clone()),
            ModelRole::PlanSummary => &mut self.plan_summary,
            ModelRole::Builder => &mut self.builder,
            ModelRole::WholeFileBuilder => self
                .whole_file_builder
                .get_or_insert_with(|| self.builder.clone()),
            ModelRole::Namer => &mut self.namer,
            ModelRole::CommitMsg => &mut self.commit_msg,
            ModelRole::ExecStatus => &mut self.exec_status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Publisher {
    Anthropic,
    OpenAI,
    Google,
    DeepSeek,
    Qwen,
    Perplexity,
    Mistral,
}

impl Publisher {
    pub fn as_str(&self) -> &'static str {
        match self {
            Publisher::Anthropic => "anthropic",
            Publisher::OpenAI => "openai",
            Publisher::Google => "google",
            Publisher::DeepSeek => "deepseek",
            Publisher::Qwen => "qwen",
            Publisher::Perplexity => "perplexity",
            Publisher::Mistral => "mistral",
        }
    }

    /// Providers that can serve this publisher's models, highest priority first.
    pub fn provider_priority(&self) -> &'static [Provider] {
        match self {
            Publisher::Anthropic => &[
                Provider::AnthropicClaudeMax,
                Provider::Anthropic,
                Provider::AmazonBedrock,
                Provider::GoogleVertex,
                Provider::OpenRouter,
            ],
            Publisher::OpenAI => &[Provider::OpenAI, Provider::AzureOpenAI, Provider::OpenRouter],
            Publisher::Google => &[
                Provider::GoogleAIStudio,
                Provider::GoogleVertex,
                Provider::OpenRouter,
            ],
            Publisher::DeepSeek => &[Provider::DeepSeek, Provider::OpenRouter, Provider::Ollama],
            Publisher::Qwen => &[Provider::OpenRouter, Provider::Ollama],
            Publisher::Perplexity => &[Provider::Perplexity, Provider::OpenRouter],
            Publisher::Mistral => &[Provider::OpenRouter, Provider::Ollama],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "anthropic-claude-max")]
    AnthropicClaudeMax,
    #[serde(rename = "google-ai-studio")]
    GoogleAIStudio,
    #[serde(rename = "google-vertex")]
    GoogleVertex,
    #[serde(rename = "azure-openai")]
    AzureOpenAI,
    #[serde(rename = "aws-bedrock")]
    AmazonBedrock,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "perplexity")]
    Perplexity,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "ollama")]
    Ollama,
    #[serde(untagged)]
    Custom(String),
}

impl Provider {
    pub fn name(&self) -> String {
        match self {
            Provider::OpenAI => "openai".to_string(),
            Provider::Anthropic => "anthropic".to_string(),
            Provider::AnthropicClaudeMax => "anthropic-claude-max".to_string(),
            Provider::GoogleAIStudio => "google-ai-studio".to_string(),
            Provider::GoogleVertex => "google-vertex".to_string(),
            Provider::AzureOpenAI => "azure-openai".to_string(),
            Provider::AmazonBedrock => "aws-bedrock".to_string(),
            Provider::DeepSeek => "deepseek".to_string(),
            Provider::Perplexity => "perplexity".to_string(),
            Provider::OpenRouter => "openrouter".to_string(),
            Provider::Ollama => "ollama".to_string(),
            Provider::Custom(name) => name.clone(),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraAuthVar {
    pub var: String,
    #[serde(default)]
    pub maybe_json_file_path: bool,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ExtraAuthVar {
    pub fn required(var: &str) -> Self {
        Self {
            var: var.to_string(),
            maybe_json_file_path: false,
            required: true,
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOption {
    pub provider: Provider,
    #[serde(default)]
    pub custom_provider: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default)]
    pub extra_auth_vars: Vec<ExtraAuthVar>,
    #[serde(default, rename = "hasAWSAuth")]
    pub has_aws_auth: bool,
    #[serde(default, rename = "hasOAuthAuth")]
    pub has_oauth_auth: bool,
    #[serde(default)]
    pub skip_auth: bool,
    #[serde(default)]
    pub local_only: bool,
}

impl ProviderOption {
    fn keyed(provider: Provider, base_url: &str, key: &str) -> Self {
        Self {
            provider,
            custom_provider: None,
            base_url: base_url.to_string(),
            api_key_env_var: Some(key.to_string()),
            extra_auth_vars: Vec::new(),
            has_aws_auth: false,
            has_oauth_auth: false,
            skip_auth: false,
            local_only: false,
        }
    }

    /// Every environment variable this option needs to be fully satisfied.
    pub fn required_vars(&self) -> Vec<String> {
        let mut vars = Vec::new();
        if let Some(key) = &self.api_key_env_var {
            vars.push(key.clone());
        }
        vars.extend(
            self.extra_auth_vars
                .iter()
                .filter(|v| v.required && v.default.is_none())
                .map(|v| v.var.clone()),
        );
        vars
    }
}

/// Auth var carrying a Claude Max OAuth access token once credentials resolve.
pub const CLAUDE_MAX_TOKEN_VAR: &str = "ANTHROPIC_CLAUDE_MAX_TOKEN";
pub const CLAUDE_MAX_BETA_HEADER: &str = "oauth-2025-04-20";

/// Built-in provider options.
pub fn builtin_provider_option(provider: &Provider) -> Option<ProviderOption> {
    let opt = match provider {
        Provider::OpenAI => ProviderOption::keyed(
            Provider::OpenAI,
            "https://api.openai.com/v1",
            "OPENAI_API_KEY",
        ),
        Provider::Anthropic => ProviderOption::keyed(
            Provider::Anthropic,
            "https://api.anthropic.com/v1",
            "ANTHROPIC_API_KEY",
        ),
        Provider::AnthropicClaudeMax => ProviderOption {
            api_key_env_var: None,
            has_oauth_auth: true,
            ..ProviderOption::keyed(
                Provider::AnthropicClaudeMax,
                "https://api.anthropic.com/v1",
                "",
            )
        },
        Provider::GoogleAIStudio => ProviderOption::keyed(
            Provider::GoogleAIStudio,
            "https://generativelanguage.googleapis.com/v1beta",
            "GEMINI_API_KEY",
        ),
        Provider::GoogleVertex => ProviderOption {
            api_key_env_var: None,
            extra_auth_vars: vec![
                ExtraAuthVar {
                    maybe_json_file_path: true,
                    ..ExtraAuthVar::required("GOOGLE_APPLICATION_CREDENTIALS")
                },
                ExtraAuthVar::required("VERTEXAI_PROJECT"),
                ExtraAuthVar::required("VERTEXAI_LOCATION"),
            ],
            ..ProviderOption::keyed(
                Provider::GoogleVertex,
                "https://aiplatform.googleapis.com/v1",
                "",
            )
        },
        Provider::AzureOpenAI => ProviderOption {
            extra_auth_vars: vec![
                ExtraAuthVar::required("AZURE_API_BASE"),
                ExtraAuthVar {
                    required: false,
                    default: Some("2025-04-01-preview".to_string()),
                    ..ExtraAuthVar::required("AZURE_API_VERSION")
                },
            ],
            ..ProviderOption::keyed(Provider::AzureOpenAI, "", "AZURE_OPENAI_API_KEY")
        },
        Provider::AmazonBedrock => ProviderOption {
            api_key_env_var: None,
            has_aws_auth: true,
            extra_auth_vars: vec![
                ExtraAuthVar::required("AWS_ACCESS_KEY_ID"),
                ExtraAuthVar::required("AWS_SECRET_ACCESS_KEY"),
                ExtraAuthVar {
                    required: false,
                    default: Some("us-east-1".to_string()),
                    ..ExtraAuthVar::required("AWS_REGION")
                },
            ],
            ..ProviderOption::keyed(Provider::AmazonBedrock, "", "")
        },
        Provider::DeepSeek => ProviderOption::keyed(
            Provider::DeepSeek,
            "https://api.deepseek.com/v1",
            "DEEPSEEK_API_KEY",
        ),
        Provider::Perplexity => ProviderOption::keyed(
            Provider::Perplexity,
            "https://api.perplexity.ai",
            "PERPLEXITY_API_KEY",
        ),
        Provider::OpenRouter => ProviderOption::keyed(
            Provider::OpenRouter,
            "https://openrouter.ai/api/v1",
            "OPENROUTER_API_KEY",
        ),
        Provider::Ollama => ProviderOption {
            api_key_env_var: None,
            skip_auth: true,
            local_only: true,
            ..ProviderOption::keyed(Provider::Ollama, "http://localhost:11434/v1", "")
        },
        Provider::Custom(_) => return None,
    };
    Some(opt)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProvider {
    pub provider: Provider,
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseModel {
    pub model_id: String,
    pub publisher: Publisher,
    pub max_tokens: usize,
    pub max_output_tokens: usize,
    pub default_reserved_output_tokens: usize,
    pub providers: Vec<ModelProvider>,
    #[serde(default)]
    pub has_image_support: bool,
    #[serde(default)]
    pub supports_cache_control: bool,
    #[serde(default)]
    pub single_message_no_system_prompt: bool,
    #[serde(default)]
    pub role_params_disabled: bool,
}

impl BaseModel {
    fn new(
        model_id: &str,
        publisher: Publisher,
        max_tokens: usize,
        max_output_tokens: usize,
        providers: &[(Provider, &str)],
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            publisher,
            max_tokens,
            max_output_tokens,
            default_reserved_output_tokens: max_output_tokens.min(32_000),
            providers: providers
                .iter()
                .map(|(provider, name)| ModelProvider {
                    provider: provider.clone(),
                    model_name: name.to_string(),
                })
                .collect(),
            has_image_support: false,
            supports_cache_control: false,
            single_message_no_system_prompt: false,
            role_params_disabled: false,
        }
    }

    pub fn reserved_output_tokens(&self, cfg: &ModelRoleConfig) -> usize {
        cfg.reserved_output_tokens
            .unwrap_or(self.default_reserved_output_tokens)
    }

    pub fn declares(&self, provider: &Provider) -> bool {
        self.providers.iter().any(|p| &p.provider == provider)
    }
}

pub fn builtin_models() -> Vec<BaseModel> {
    let anthropic_providers = [
        (Provider::AnthropicClaudeMax, "claude-sonnet-4-20250514"),
        (Provider::Anthropic, "claude-sonnet-4-20250514"),
        (
            Provider::AmazonBedrock,
            "anthropic.claude-sonnet-4-20250514-v1:0",
        ),
        (Provider::OpenRouter, "anthropic/claude-sonnet-4"),
    ];
    let mut sonnet = BaseModel::new(
        "anthropic/claude-sonnet-4",
        Publisher::Anthropic,
        200_000,
        64_000,
        &anthropic_providers,
    );
    sonnet.has_image_support = true;
    sonnet.supports_cache_control = true;

    let mut sonnet_vertex = BaseModel::new(
        "anthropic/claude-sonnet-4-vertex-1m",
        Publisher::Anthropic,
        1_000_000,
        64_000,
        &[(Provider::GoogleVertex, "claude-sonnet-4@20250514")],
    );
    sonnet_vertex.has_image_support = true;

    let mut gpt41 = BaseModel::new(
        "openai/gpt-4.1",
        Publisher::OpenAI,
        1_047_576,
        32_768,
        &[
            (Provider::OpenAI, "gpt-4.1"),
            (Provider::AzureOpenAI, "gpt-4.1"),
            (Provider::OpenRouter, "openai/gpt-4.1"),
        ],
    );
    gpt41.has_image_support = true;

    let mut o4_mini = BaseModel::new(
        "openai/o4-mini",
        Publisher::OpenAI,
        200_000,
        100_000,
        &[
            (Provider::OpenAI, "o4-mini"),
            (Provider::AzureOpenAI, "o4-mini"),
            (Provider::OpenRouter, "openai/o4-mini"),
        ],
    );
    o4_mini.role_params_disabled = true;

    let mut gemini_pro = BaseModel::new(
        "google/gemini-2.5-pro",
        Publisher::Google,
        1_048_576,
        65_535,
        &[
            (Provider::GoogleAIStudio, "gemini-2.5-pro"),
            (Provider::GoogleVertex, "gemini-2.5-pro"),
            (Provider::OpenRouter, "google/gemini-2.5-pro"),
        ],
    );
    gemini_pro.has_image_support = true;

    let gemini_flash = BaseModel::new(
        "google/gemini-2.5-flash",
        Publisher::Google,
        1_048_576,
        65_535,
        &[
            (Provider::GoogleAIStudio, "gemini-2.5-flash"),
            (Provider::GoogleVertex, "gemini-2.5-flash"),
            (Provider::OpenRouter, "google/gemini-2.5-flash"),
        ],
    );

    let mut r1 = BaseModel::new(
        "deepseek/r1",
        Publisher::DeepSeek,
        128_000,
        32_000,
        &[
            (Provider::DeepSeek, "deepseek-reasoner"),
            (Provider::OpenRouter, "deepseek/deepseek-r1"),
            (Provider::Ollama, "deepseek-r1"),
        ],
    );
    r1.single_message_no_system_prompt = true;

    let qwen = BaseModel::new(
        "qwen/qwen3-coder",
        Publisher::Qwen,
        262_144,
        65_536,
        &[
            (Provider::OpenRouter, "qwen/qwen3-coder"),
            (Provider::Ollama, "qwen3-coder"),
        ],
    );

    let sonar = BaseModel::new(
        "perplexity/sonar-pro",
        Publisher::Perplexity,
        200_000,
        8_000,
        &[
            (Provider::Perplexity, "sonar-pro"),
            (Provider::OpenRouter, "perplexity/sonar-pro"),
        ],
    );

    let devstral = BaseModel::new(
        "mistral/devstral-small",
        Publisher::Mistral,
        128_000,
        32_000,
        &[
            (Provider::OpenRouter, "mistralai/devstral-small"),
            (Provider::Ollama, "devstral"),
        ],
    );

    vec![
        sonnet,
        sonnet_vertex,
        gpt41,
        o4_mini,
        gemini_pro,
        gemini_flash,
        r1,
        qwen,
        sonar,
        devstral,
    ]
}

pub fn find_builtin_model(model_id: &str) -> Option<BaseModel> {
    builtin_models()
        .into_iter()
        .find(|m| m.model_id == model_id)
}

/// Closest built-in model id for "did you mean" hints.
pub fn suggest_model_id(input: &str) -> Option<String> {
    builtin_models()
        .into_iter()
        .map(|m| (strsim::jaro_winkler(input, &m.model_id), m.model_id))
        .filter(|(score, _)| *score > 0.8)
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, id)| id)
}

fn pack_with(
    id: &str,
    name: &str,
    description: &str,
    planner: ModelRoleConfig,
    builder: ModelRoleConfig,
    cheap: &str,
) -> ModelPack {
    ModelPack {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        local_provider: None,
        coder: None,
        context_loader: None,
        whole_file_builder: None,
        plan_summary: ModelRoleConfig::new(cheap),
        namer: ModelRoleConfig::new(cheap),
        commit_msg: ModelRoleConfig::new(cheap),
        exec_status: builder.clone(),
        planner,
        builder,
    }
}

pub fn builtin_model_packs() -> Vec<ModelPack> {
    let daily = pack_with(
        "daily-driver",
        "daily-driver",
        "Claude Sonnet for planning and coding, large-context fallback to Gemini",
        ModelRoleConfig::new("anthropic/claude-sonnet-4")
            .with_large_context_fallback(ModelRoleConfig::new("google/gemini-2.5-pro"))
            .with_error_fallback(ModelRoleConfig::new("openai/gpt-4.1")),
        ModelRoleConfig::new("openai/o4-mini")
            .with_error_fallback(ModelRoleConfig::new("anthropic/claude-sonnet-4")),
        "openai/gpt-4.1",
    );
    let gemini = pack_with(
        "gemini-planner",
        "gemini-planner",
        "Gemini 2.5 Pro for planning, Sonnet for coding",
        ModelRoleConfig::new("google/gemini-2.5-pro"),
        ModelRoleConfig::new("openai/o4-mini"),
        "google/gemini-2.5-flash",
    );
    let mut oss = pack_with(
        "oss",
        "oss",
        "Open source models only",
        ModelRoleConfig::new("deepseek/r1")
            .with_large_context_fallback(ModelRoleConfig::new("qwen/qwen3-coder")),
        ModelRoleConfig::new("qwen/qwen3-coder"),
        "mistral/devstral-small",
    );
    oss.coder = Some(ModelRoleConfig::new("qwen/qwen3-coder"));
    let mut ollama = oss.clone();
    ollama.id = "ollama".to_string();
    ollama.name = "ollama".to_string();
    ollama.description = "Local models served by ollama".to_string();
    ollama.local_provider = Some(Provider::Ollama);
    vec![daily, gemini, oss, ollama]
}

pub fn default_model_pack() -> ModelPack {
    let mut packs = builtin_model_packs();
    packs.remove(0)
}
