use anyhow::Result;
use plandex_core::{
    BaseModel, Branch, Context, ConvoMessage, ConvoSummary, CurrentPlanState, ModelPack, Plan,
    PlanConfig, PlanFileResult, PlanLogEntry, Project,
};
use std::io::Read;

pub mod client;
pub mod error;
pub mod types;

pub use client::HttpApiClient;
pub use error::{ApiError, ApiErrorType};
pub use types::*;

/// Raw stream body; framing is decoded by the stream crate.
pub type StreamBody = Box<dyn Read + Send>;

/// Client-side port to the plan server. Failures carry an [`ApiError`] that
/// callers can recover with `downcast_ref`.
pub trait PlanApi: Send + Sync {
    fn list_projects(&self) -> Result<Vec<Project>>;
    fn create_project(&self, req: &CreateProjectRequest) -> Result<CreateProjectResponse>;

    fn list_plans(&self, project_ids: &[String]) -> Result<Vec<Plan>>;
    fn list_archived_plans(&self, project_ids: &[String]) -> Result<Vec<Plan>>;
    fn list_plans_running(&self, project_ids: &[String]) -> Result<ListPlansRunningResponse>;
    fn create_plan(&self, project_id: &str, req: &CreatePlanRequest) -> Result<CreatePlanResponse>;
    fn get_plan(&self, plan_id: &str) -> Result<Plan>;
    fn delete_plan(&self, plan_id: &str) -> Result<()>;
    fn delete_all_plans(&self, project_id: &str) -> Result<()>;
    fn rename_plan(&self, plan_id: &str, name: &str) -> Result<()>;
    fn archive_plan(&self, plan_id: &str) -> Result<()>;
    fn unarchive_plan(&self, plan_id: &str) -> Result<()>;

    fn list_branches(&self, plan_id: &str) -> Result<Vec<Branch>>;
    fn create_branch(&self, plan_id: &str, from_branch: &str, req: &CreateBranchRequest)
    -> Result<()>;
    fn delete_branch(&self, plan_id: &str, branch: &str) -> Result<()>;

    fn list_context(&self, plan_id: &str, branch: &str) -> Result<Vec<Context>>;
    fn get_context_body(&self, plan_id: &str, branch: &str, context_id: &str) -> Result<String>;
    fn load_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &LoadContextRequest,
    ) -> Result<LoadContextResponse>;
    fn update_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &UpdateContextRequest,
    ) -> Result<UpdateContextResponse>;
    fn delete_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &DeleteContextRequest,
    ) -> Result<DeleteContextResponse>;
    fn auto_load_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &LoadContextRequest,
    ) -> Result<LoadContextResponse>;
    fn get_file_map(&self, req: &GetFileMapRequest) -> Result<GetFileMapResponse>;

    fn list_convo(&self, plan_id: &str, branch: &str) -> Result<Vec<ConvoMessage>>;
    fn list_convo_summaries(&self, plan_id: &str, branch: &str) -> Result<Vec<ConvoSummary>>;

    fn get_current_plan_state(&self, plan_id: &str, branch: &str) -> Result<CurrentPlanState>;
    fn get_current_plan_state_at_sha(
        &self,
        plan_id: &str,
        branch: &str,
        sha: &str,
    ) -> Result<CurrentPlanState>;
    fn get_plan_diffs(&self, plan_id: &str, branch: &str, plain: bool) -> Result<String>;
    fn list_logs(&self, plan_id: &str, branch: &str) -> Result<Vec<PlanLogEntry>>;
    fn rewind_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &RewindPlanRequest,
    ) -> Result<RewindPlanResponse>;
    fn apply_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &ApplyPlanRequest,
    ) -> Result<ApplyPlanResponse>;
    fn reject_all_changes(&self, plan_id: &str, branch: &str) -> Result<()>;
    fn reject_files(&self, plan_id: &str, branch: &str, req: &RejectFilesRequest) -> Result<()>;
    /// Stores results produced by a client-side rebuild.
    fn put_plan_file_results(
        &self,
        plan_id: &str,
        branch: &str,
        results: &[PlanFileResult],
    ) -> Result<()>;

    /// `None` when the request asked not to connect to the stream.
    fn tell_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &TellPlanRequest,
    ) -> Result<Option<StreamBody>>;
    fn build_plan(
        &self,
        plan_id: &str,
        branch: &str,
        req: &BuildPlanRequest,
    ) -> Result<Option<StreamBody>>;
    fn connect_plan(&self, plan_id: &str, branch: &str) -> Result<StreamBody>;
    fn stop_plan(&self, plan_id: &str, branch: &str) -> Result<()>;

    fn get_settings(&self, plan_id: &str, branch: &str) -> Result<PlanSettings>;
    fn update_settings(&self, plan_id: &str, branch: &str, settings: &PlanSettings) -> Result<()>;
    fn get_default_settings(&self) -> Result<PlanSettings>;
    fn update_default_settings(&self, settings: &PlanSettings) -> Result<()>;

    fn get_plan_config(&self, plan_id: &str) -> Result<PlanConfig>;
    fn update_plan_config(&self, plan_id: &str, config: &PlanConfig) -> Result<()>;
    fn get_default_plan_config(&self) -> Result<PlanConfig>;
    fn update_default_plan_config(&self, config: &PlanConfig) -> Result<()>;

    fn list_custom_models(&self) -> Result<Vec<BaseModel>>;
    fn create_custom_model(&self, model: &BaseModel) -> Result<()>;
    fn update_custom_model(&self, model: &BaseModel) -> Result<()>;
    fn delete_custom_model(&self, model_id: &str) -> Result<()>;
    /// Replaces providers, models and packs in one call.
    fn update_custom_models_input(&self, input: &CustomModelsInput) -> Result<()>;

    fn list_custom_providers(&self) -> Result<Vec<CustomProvider>>;
    fn create_custom_provider(&self, provider: &CustomProvider) -> Result<()>;
    fn delete_custom_provider(&self, provider_id: &str) -> Result<()>;

    fn list_model_packs(&self) -> Result<Vec<ModelPack>>;
    fn create_model_pack(&self, pack: &ModelPack) -> Result<()>;
    fn update_model_pack(&self, pack: &ModelPack) -> Result<()>;
    fn delete_model_pack(&self, pack_id: &str) -> Result<()>;

    fn get_usage_summary(&self) -> Result<UsageSummary>;

    fn get_custom_models_input(&self) -> Result<CustomModelsInput> {
        Ok(CustomModelsInput {
            custom_providers: self.list_custom_providers()?,
            custom_models: self.list_custom_models()?,
            custom_model_packs: self.list_model_packs()?,
        })
    }
}

/// The `ApiError` behind an error, if any.
pub fn api_error(err: &anyhow::Error) -> Option<&ApiError> {
    err.downcast_ref::<ApiError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<ApiError>()))
}
