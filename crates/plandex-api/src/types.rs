//! Request and response bodies exchanged with the plan server.

use chrono::{DateTime, Utc};
use plandex_core::{
    BaseModel, ContextType, ExtraAuthVar, ImageDetail, ModelPack, Plan, PlanStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Account session the client authenticates with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAuth {
    pub user_id: String,
    pub org_id: String,
    pub token: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthHeader<'a> {
    pub token: &'a str,
    pub org_id: &'a str,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanResponse {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamePlanRequest {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBranchRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStream {
    pub plan_id: String,
    pub branch: String,
    pub status: PlanStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPlansRunningResponse {
    pub plans: Vec<Plan>,
    pub streams: Vec<ActiveStream>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadContextParams {
    pub context_type: Option<ContextType>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub num_tokens: usize,
    #[serde(default)]
    pub force_skip_ignore: bool,
    #[serde(default)]
    pub auto_loaded: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_detail: Option<ImageDetail>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map_parts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map_shas: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map_tokens: BTreeMap<String, usize>,
}

pub type LoadContextRequest = Vec<LoadContextParams>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadContextResponse {
    pub tokens_added: i64,
    pub total_tokens: usize,
    #[serde(default)]
    pub max_tokens_exceeded: bool,
    #[serde(default)]
    pub max_tokens: usize,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContextParams {
    pub body: String,
    pub sha: String,
    pub num_tokens: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map_parts: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map_shas: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map_tokens: BTreeMap<String, usize>,
    /// Paths dropped from a map since the last load.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_map_paths: Vec<String>,
}

/// Keyed by context id.
pub type UpdateContextRequest = BTreeMap<String, UpdateContextParams>;
pub type UpdateContextResponse = LoadContextResponse;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteContextRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteContextResponse {
    pub tokens_removed: usize,
    pub total_tokens: usize,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFileMapRequest {
    /// path -> file content
    pub map_inputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFileMapResponse {
    pub map_bodies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TellPlanRequest {
    pub prompt: String,
    #[serde(default)]
    pub build_mode: BuildMode,
    #[serde(default)]
    pub auto_context: bool,
    #[serde(default)]
    pub smart_context: bool,
    #[serde(default)]
    pub is_chat_only: bool,
    #[serde(default)]
    pub is_user_continue: bool,
    #[serde(default)]
    pub is_user_debug: bool,
    #[serde(default)]
    pub is_application_debug: bool,
    #[serde(default)]
    pub exec_enabled: bool,
    #[serde(default)]
    pub connect_stream: bool,
    #[serde(default)]
    pub os_details: String,
    /// Provider credentials resolved on the client, keyed by variable name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Auto,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildPlanRequest {
    #[serde(default)]
    pub connect_stream: bool,
    #[serde(default)]
    pub os_details: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auth_vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindPlanRequest {
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewindPlanResponse {
    pub latest_sha: String,
    pub latest_commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPlanRequest {
    pub plan_file_result_ids: Vec<String>,
    #[serde(default)]
    pub commit_msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyPlanResponse {
    pub plan_apply_id: String,
    #[serde(default)]
    pub commit_msg: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectFilesRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSettings {
    pub model_pack: ModelPack,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PlanSettings {
    fn default() -> Self {
        Self {
            model_pack: plandex_core::models::default_model_pack(),
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProvider {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env_var: Option<String>,
    #[serde(default)]
    pub extra_auth_vars: Vec<ExtraAuthVar>,
    #[serde(default)]
    pub skip_auth: bool,
}

/// The shape of `custom-models.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomModelsInput {
    #[serde(default)]
    pub custom_providers: Vec<CustomProvider>,
    #[serde(default)]
    pub custom_models: Vec<BaseModel>,
    #[serde(default)]
    pub custom_model_packs: Vec<ModelPack>,
}

impl CustomModelsInput {
    pub fn is_empty(&self) -> bool {
        self.custom_providers.is_empty()
            && self.custom_models.is_empty()
            && self.custom_model_packs.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cached_tokens: u64,
    pub num_requests: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    pub total: ModelUsage,
    #[serde(default)]
    pub by_model: BTreeMap<String, ModelUsage>,
}
