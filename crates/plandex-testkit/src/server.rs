//! `FakeServer` keeps plans, branches, context and plan state in memory and
//! answers the whole `PlanApi` the way the plan server does, including log
//! snapshots for rewind and build-path invalidation on context updates.

use anyhow::Result;
use chrono::{DateTime, Utc};
use plandex_api::{
    ActiveStream, ApiError, ApplyPlanRequest, ApplyPlanResponse, BuildMode, BuildPlanRequest,
    CreateBranchRequest, CreatePlanRequest, CreatePlanResponse, CreateProjectRequest,
    CreateProjectResponse, CustomModelsInput, CustomProvider, DeleteContextRequest,
    DeleteContextResponse, GetFileMapRequest, GetFileMapResponse, ListPlansRunningResponse,
    LoadContextParams, LoadContextRequest, LoadContextResponse, PlanApi, PlanSettings,
    RejectFilesRequest, RewindPlanRequest, RewindPlanResponse, StreamBody, TellPlanRequest,
    UpdateContextRequest, UpdateContextResponse, UsageSummary,
};
use plandex_core::{
    BaseModel, Branch, Context, ContextType, ConvoMessage, ConvoMessageDescription,
    ConvoMessageFlags, ConvoSummary, CurrentPlanState, DEFAULT_MAX_CONTEXT_TOKENS, MAIN_BRANCH,
    MessageRole, ModelPack, Plan, PlanApply, PlanConfig, PlanFileResult, PlanLogEntry, PlanResult,
    PlanStatus, Project, body_sha, sha256_hex,
};
use plandex_stream::{BuildInfo, Frame, Sentinel, StreamMessage, StreamMessageType};
use std::collections::{BTreeMap, VecDeque};
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::framed;

pub const USER_ID: &str = "user-1";
const CLOCK_START: i64 = 1_700_000_000;

/// How a scripted turn's stream ends.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEnd {
    Finished,
    Aborted,
    Failed(String),
    /// The connection closes without a terminator while the turn keeps running.
    Dropped,
}

/// One reply the fake server streams back for `tell`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedTurn {
    pub reply: String,
    pub description: Option<ConvoMessageDescription>,
    pub results: Vec<PlanFileResult>,
    pub missing_file: Option<String>,
    /// Files the stream asks the client to load before it continues.
    pub load_context: Option<Vec<String>>,
    pub end: TurnEnd,
}

impl ScriptedTurn {
    pub fn reply(text: &str) -> Self {
        Self {
            reply: text.to_string(),
            description: None,
            results: Vec::new(),
            missing_file: None,
            load_context: None,
            end: TurnEnd::Finished,
        }
    }

    /// The turn describes a plan; `results` are stored when the turn builds.
    pub fn with_plan(mut self, description: ConvoMessageDescription, results: Vec<PlanFileResult>) -> Self {
        self.description = Some(description);
        self.results = results;
        self
    }

    pub fn aborted(mut self) -> Self {
        self.end = TurnEnd::Aborted;
        self
    }

    pub fn failed(mut self, msg: &str) -> Self {
        self.end = TurnEnd::Failed(msg.to_string());
        self
    }

    pub fn dropped(mut self) -> Self {
        self.end = TurnEnd::Dropped;
        self
    }

    pub fn loading(mut self, paths: &[&str]) -> Self {
        self.load_context = Some(paths.iter().map(|p| p.to_string()).collect());
        self
    }

    fn body(&self) -> String {
        let mut frames = Vec::new();
        if let Some(paths) = &self.load_context {
            frames.push(Frame::Message(Box::new(StreamMessage::load_context(paths.clone()))));
        }
        if !self.reply.is_empty() {
            frames.push(Frame::Message(Box::new(StreamMessage::reply(&self.reply))));
        }
        if let Some(path) = &self.missing_file {
            let mut msg = StreamMessage::new(StreamMessageType::PromptMissingFile);
            msg.missing_file_path = path.clone();
            frames.push(Frame::Message(Box::new(msg)));
        }
        if let Some(desc) = &self.description {
            let mut msg = StreamMessage::new(StreamMessageType::Describing);
            msg.description = Some(desc.clone());
            frames.push(Frame::Message(Box::new(msg)));
            frames.extend(self.results.iter().map(build_info_frame));
        }
        match &self.end {
            TurnEnd::Finished => frames.push(Frame::Sentinel(Sentinel::End)),
            TurnEnd::Aborted => frames.push(Frame::Sentinel(Sentinel::Abort)),
            TurnEnd::Failed(msg) => frames.push(Frame::Message(Box::new(StreamMessage::error(msg)))),
            TurnEnd::Dropped => {}
        }
        framed(&frames)
    }
}

fn build_info_frame(result: &PlanFileResult) -> Frame {
    let mut msg = StreamMessage::new(StreamMessageType::BuildInfo);
    msg.build_info = Some(BuildInfo {
        path: result.path.clone(),
        num_tokens: 0,
        finished: true,
        removed: result.removed_file,
    });
    Frame::Message(Box::new(msg))
}

fn not_found(what: &str) -> anyhow::Error {
    ApiError::other(404, format!("{what} not found")).into()
}

fn bad_request(msg: impl Into<String>) -> anyhow::Error {
    ApiError::other(400, msg).into()
}

#[derive(Debug, Default)]
struct Clock {
    ticks: i64,
    seq: u64,
}

impl Clock {
    /// Strictly increasing, one second apart.
    fn now(&mut self) -> DateTime<Utc> {
        self.ticks += 1;
        DateTime::from_timestamp(CLOCK_START + self.ticks, 0).unwrap_or_default()
    }

    fn id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{}", self.seq)
    }

    fn sha(&mut self, message: &str) -> String {
        self.seq += 1;
        let mut sha = sha256_hex(format!("{}:{message}", self.seq).as_bytes());
        sha.truncate(40);
        sha
    }
}

#[derive(Debug, Clone, Default)]
struct BranchData {
    contexts: Vec<Context>,
    convo: Vec<ConvoMessage>,
    summaries: Vec<ConvoSummary>,
    results: Vec<PlanFileResult>,
    descriptions: Vec<ConvoMessageDescription>,
    applies: Vec<PlanApply>,
    /// Results of turns told with `BuildMode::None`, waiting for `build`.
    unbuilt: Vec<PlanFileResult>,
}

impl BranchData {
    fn context_tokens(&self) -> usize {
        self.contexts.iter().map(|c| c.num_tokens).sum()
    }

    fn plan_state(&self) -> CurrentPlanState {
        let mut state = CurrentPlanState {
            plan_result: PlanResult::from_results(self.results.clone()),
            convo_message_descriptions: self.descriptions.clone(),
            contexts_by_path: self
                .contexts
                .iter()
                .filter(|c| c.context_type == ContextType::File && !c.file_path.is_empty())
                .map(|c| (c.file_path.clone(), c.clone()))
                .collect(),
            plan_applies: self.applies.clone(),
            ..CurrentPlanState::default()
        };
        state.current_plan_files = plandex_diff::current_plan_files(&state).unwrap_or_default();
        state
    }
}

#[derive(Debug)]
struct BranchEntry {
    branch: Branch,
    data: BranchData,
    settings: Option<PlanSettings>,
    /// Oldest first; each snapshot is the state right after its entry.
    logs: Vec<(PlanLogEntry, BranchData)>,
}

impl BranchEntry {
    fn commit(&mut self, clock: &mut Clock, message: &str) {
        let entry = PlanLogEntry {
            sha: clock.sha(message),
            message: message.to_string(),
            created_at: clock.now(),
        };
        self.branch.updated_at = entry.created_at;
        self.branch.context_tokens = self.data.context_tokens();
        self.logs.push((entry, self.data.clone()));
    }
}

#[derive(Debug)]
struct PlanEntry {
    plan: Plan,
    config: Option<PlanConfig>,
    branches: BTreeMap<String, BranchEntry>,
}

#[derive(Default)]
struct Inner {
    clock: Clock,
    projects: Vec<Project>,
    plans: BTreeMap<String, PlanEntry>,
    max_tokens: Option<usize>,
    default_settings: Option<PlanSettings>,
    default_config: Option<PlanConfig>,
    custom_models: Vec<BaseModel>,
    custom_providers: Vec<CustomProvider>,
    model_packs: Vec<ModelPack>,
    usage: UsageSummary,
    file_maps: BTreeMap<String, String>,
    turns: VecDeque<ScriptedTurn>,
    connect_bodies: VecDeque<String>,
    tell_requests: Vec<TellPlanRequest>,
    build_requests: Vec<BuildPlanRequest>,
    stops: Vec<(String, String)>,
    auto_loads: Vec<LoadContextRequest>,
    rewind_failure: Option<String>,
}

impl Inner {
    fn max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(DEFAULT_MAX_CONTEXT_TOKENS)
    }
}

fn plan_mut<'a>(plans: &'a mut BTreeMap<String, PlanEntry>, plan_id: &str) -> Result<&'a mut PlanEntry> {
    plans.get_mut(plan_id).ok_or_else(|| not_found("plan"))
}

fn branch_mut<'a>(
    plans: &'a mut BTreeMap<String, PlanEntry>,
    plan_id: &str,
    branch: &str,
) -> Result<&'a mut BranchEntry> {
    plan_mut(plans, plan_id)?
        .branches
        .get_mut(branch)
        .ok_or_else(|| not_found("branch"))
}

fn branch_ref<'a>(
    plans: &'a BTreeMap<String, PlanEntry>,
    plan_id: &str,
    branch: &str,
) -> Result<&'a BranchEntry> {
    plans
        .get(plan_id)
        .ok_or_else(|| not_found("plan"))?
        .branches
        .get(branch)
        .ok_or_else(|| not_found("branch"))
}

fn new_branch(clock: &mut Clock, plan_id: &str, name: &str, parent: Option<String>) -> Branch {
    let now = clock.now();
    Branch {
        id: clock.id("branch"),
        plan_id: plan_id.to_string(),
        owner_id: USER_ID.to_string(),
        parent_branch_id: parent,
        name: name.to_string(),
        status: PlanStatus::Draft,
        context_tokens: 0,
        convo_tokens: 0,
        created_at: now,
        updated_at: now,
    }
}

fn context_from_params(clock: &mut Clock, params: &LoadContextParams) -> Result<Context> {
    let context_type = params
        .context_type
        .ok_or_else(|| bad_request(format!("context {} has no type", params.name)))?;
    let now = clock.now();
    Ok(Context {
        id: clock.id("ctx"),
        owner_id: USER_ID.to_string(),
        context_type,
        name: params.name.clone(),
        url: params.url.clone(),
        file_path: params.file_path.clone(),
        sha: if params.sha.is_empty() {
            body_sha(&params.body)
        } else {
            params.sha.clone()
        },
        num_tokens: params.num_tokens,
        body: params.body.clone(),
        body_size: params.body.len(),
        force_skip_ignore: params.force_skip_ignore,
        auto_loaded: params.auto_loaded,
        truncated: params.truncated,
        image_detail: params.image_detail,
        map_parts: params.map_parts.clone(),
        map_shas: params.map_shas.clone(),
        map_tokens: params.map_tokens.clone(),
        created_at: now,
        updated_at: now,
    })
}

/// Restamps incoming results so they sort after everything already stored.
fn stamp_results(clock: &mut Clock, results: &[PlanFileResult], message_id: Option<&str>) -> Vec<PlanFileResult> {
    results
        .iter()
        .map(|r| {
            let mut r = r.clone();
            let now = clock.now();
            if r.id.is_empty() {
                r.id = clock.id("result");
            }
            if let Some(id) = message_id {
                r.convo_message_id = id.to_string();
            }
            r.created_at = now;
            r.updated_at = now;
            r
        })
        .collect()
}

/// Descriptions whose results are all applied become applied themselves.
fn mark_applied_descriptions(data: &mut BranchData, now: DateTime<Utc>) {
    for desc in data.descriptions.iter_mut() {
        if desc.applied_at.is_some() || !desc.made_plan {
            continue;
        }
        let mut results = data
            .results
            .iter()
            .filter(|r| r.convo_message_id == desc.convo_message_id)
            .peekable();
        if results.peek().is_none() {
            continue;
        }
        if results.all(|r| r.applied_at.is_some() || r.rejected_at.is_some()) {
            desc.applied_at = Some(now);
        }
    }
}

#[derive(Default)]
pub struct FakeServer {
    inner: Mutex<Inner>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a plan with a `main` branch in the default project.
    pub fn seed_plan(&self, name: &str) -> String {
        let project_id = {
            let mut inner = self.lock();
            match inner.projects.first() {
                Some(p) => p.id.clone(),
                None => {
                    let id = inner.clock.id("project");
                    inner.projects.push(Project {
                        id: id.clone(),
                        name: "default".to_string(),
                    });
                    id
                }
            }
        };
        self.insert_plan(&project_id, name)
    }

    fn insert_plan(&self, project_id: &str, name: &str) -> String {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let id = uuid::Uuid::now_v7().to_string();
        let now = clock.now();
        let plan = Plan {
            id: id.clone(),
            owner_id: USER_ID.to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            total_replies: 0,
            active_branches: 0,
            plan_config: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut main = BranchEntry {
            branch: new_branch(clock, &id, MAIN_BRANCH, None),
            data: BranchData::default(),
            settings: None,
            logs: Vec::new(),
        };
        main.commit(clock, "Create plan");
        plans.insert(
            id.clone(),
            PlanEntry {
                plan,
                config: None,
                branches: BTreeMap::from([(MAIN_BRANCH.to_string(), main)]),
            },
        );
        id
    }

    pub fn set_max_tokens(&self, max_tokens: usize) {
        self.lock().max_tokens = Some(max_tokens);
    }

    /// Replaces the results, descriptions and applies of a branch. Contexts in
    /// `contexts_by_path` are added when no item has that path yet. Unknown
    /// plans are ignored.
    pub fn set_plan_state(&self, plan_id: &str, branch: &str, state: CurrentPlanState) {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let Ok(entry) = branch_mut(plans, plan_id, branch) else {
            return;
        };
        entry.data.results = state.plan_result.results;
        entry.data.descriptions = state.convo_message_descriptions;
        entry.data.applies = state.plan_applies;
        for (path, ctx) in state.contexts_by_path {
            if !entry.data.contexts.iter().any(|c| c.file_path == path) {
                entry.data.contexts.push(ctx);
            }
        }
        entry.commit(clock, "Update plan state");
    }

    pub fn set_branch_status(&self, plan_id: &str, branch: &str, status: PlanStatus) {
        let mut inner = self.lock();
        if let Ok(entry) = branch_mut(&mut inner.plans, plan_id, branch) {
            entry.branch.status = status;
        }
    }

    pub fn add_convo_message(&self, plan_id: &str, branch: &str, role: MessageRole, message: &str) {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        if let Ok(entry) = branch_mut(plans, plan_id, branch) {
            let msg = convo_message(clock, &entry.data, role, message, ConvoMessageFlags::default());
            entry.data.convo.push(msg);
        }
    }

    pub fn queue_turn(&self, turn: ScriptedTurn) {
        self.lock().turns.push_back(turn);
    }

    /// Body returned by the next `connect_plan`.
    pub fn queue_connect(&self, body: String) {
        self.lock().connect_bodies.push_back(body);
    }

    /// Map body the server returns for `path` from `get_file_map`.
    pub fn set_file_map(&self, path: &str, body: &str) {
        self.lock()
            .file_maps
            .insert(path.to_string(), body.to_string());
    }

    pub fn set_usage(&self, usage: UsageSummary) {
        self.lock().usage = usage;
    }

    pub fn tell_requests(&self) -> Vec<TellPlanRequest> {
        self.lock().tell_requests.clone()
    }

    pub fn build_requests(&self) -> Vec<BuildPlanRequest> {
        self.lock().build_requests.clone()
    }

    pub fn stops(&self) -> Vec<(String, String)> {
        self.lock().stops.clone()
    }

    /// The next `rewind_plan` fails with a server error.
    pub fn fail_next_rewind(&self, msg: &str) {
        self.lock().rewind_failure = Some(msg.to_string());
    }

    /// Every batch sent to the auto-load endpoint, empty ones included.
    pub fn auto_load_requests(&self) -> Vec<LoadContextRequest> {
        self.lock().auto_loads.clone()
    }

    fn load(&self, plan_id: &str, branch: &str, req: &LoadContextRequest) -> Result<LoadContextResponse> {
        let mut inner = self.lock();
        let max_tokens = inner.max_tokens();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let current = entry.data.context_tokens();
        let added: usize = req.iter().map(|p| p.num_tokens).sum();
        if current + added > max_tokens {
            return Ok(LoadContextResponse {
                tokens_added: added as i64,
                total_tokens: current,
                max_tokens_exceeded: true,
                max_tokens,
                msg: String::new(),
            });
        }
        let mut created = Vec::with_capacity(req.len());
        for params in req {
            created.push(context_from_params(clock, params)?);
        }
        entry.data.contexts.extend(created);
        let msg = format!("Loaded {} context item(s)", req.len());
        entry.commit(clock, &msg);
        Ok(LoadContextResponse {
            tokens_added: added as i64,
            total_tokens: current + added,
            max_tokens_exceeded: false,
            max_tokens,
            msg,
        })
    }
}

fn convo_message(
    clock: &mut Clock,
    data: &BranchData,
    role: MessageRole,
    message: &str,
    flags: ConvoMessageFlags,
) -> ConvoMessage {
    let created_at = clock.now();
    ConvoMessage {
        id: clock.id("msg"),
        user_id: USER_ID.to_string(),
        role,
        tokens: message.len().div_ceil(4),
        num: data.convo.len() as u32 + 1,
        message: message.to_string(),
        stopped: false,
        flags,
        created_at,
    }
}

fn body_of(text: String) -> StreamBody {
    Box::new(Cursor::new(text.into_bytes()))
}

impl PlanApi for FakeServer {
    fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.lock().projects.clone())
    }

    fn create_project(&self, req: &CreateProjectRequest) -> Result<CreateProjectResponse> {
        let mut inner = self.lock();
        let id = inner.clock.id("project");
        inner.projects.push(Project {
            id: id.clone(),
            name: req.name.clone(),
        });
        Ok(CreateProjectResponse { id })
    }

    fn list_plans(&self, project_ids: &[String]) -> Result<Vec<Plan>> {
        let inner = self.lock();
        let mut plans: Vec<Plan> = inner
            .plans
            .values()
            .filter(|p| p.plan.archived_at.is_none())
            .filter(|p| project_ids.is_empty() || project_ids.contains(&p.plan.project_id))
            .map(|p| p.plan.clone())
            .collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    fn list_archived_plans(&self, project_ids: &[String]) -> Result<Vec<Plan>> {
        let inner = self.lock();
        let mut plans: Vec<Plan> = inner
            .plans
            .values()
            .filter(|p| p.plan.archived_at.is_some())
            .filter(|p| project_ids.is_empty() || project_ids.contains(&p.plan.project_id))
            .map(|p| p.plan.clone())
            .collect();
        plans.sort_by_key(|p| p.created_at);
        Ok(plans)
    }

    fn list_plans_running(&self, project_ids: &[String]) -> Result<ListPlansRunningResponse> {
        let inner = self.lock();
        let mut resp = ListPlansRunningResponse::default();
        for entry in inner.plans.values() {
            if !project_ids.is_empty() && !project_ids.contains(&entry.plan.project_id) {
                continue;
            }
            let active: Vec<&BranchEntry> = entry
                .branches
                .values()
                .filter(|b| b.branch.status.is_active())
                .collect();
            if active.is_empty() {
                continue;
            }
            resp.plans.push(entry.plan.clone());
            resp.streams.extend(active.iter().map(|b| ActiveStream {
                plan_id: entry.plan.id.clone(),
                branch: b.branch.name.clone(),
                status: b.branch.status,
                started_at: b.branch.updated_at,
            }));
        }
        Ok(resp)
    }

    fn create_plan(&self, project_id: &str, req: &CreatePlanRequest) -> Result<CreatePlanResponse> {
        if !self.lock().projects.iter().any(|p| p.id == project_id) {
            return Err(not_found("project"));
        }
        let name = if req.name.trim().is_empty() {
            "draft".to_string()
        } else {
            req.name.clone()
        };
        let id = self.insert_plan(project_id, &name);
        Ok(CreatePlanResponse { id, name })
    }

    fn get_plan(&self, plan_id: &str) -> Result<Plan> {
        let inner = self.lock();
        let entry = inner.plans.get(plan_id).ok_or_else(|| not_found("plan"))?;
        let mut plan = entry.plan.clone();
        plan.plan_config = entry.config.clone();
        plan.active_branches = entry
            .branches
            .values()
            .filter(|b| b.branch.status.is_active())
            .count() as u32;
        Ok(plan)
    }

    fn delete_plan(&self, plan_id: &str) -> Result<()> {
        self.lock()
            .plans
            .remove(plan_id)
            .map(|_| ())
            .ok_or_else(|| not_found("plan"))
    }

    fn delete_all_plans(&self, project_id: &str) -> Result<()> {
        self.lock()
            .plans
            .retain(|_, p| p.plan.project_id != project_id);
        Ok(())
    }

    fn rename_plan(&self, plan_id: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let now = inner.clock.now();
        let entry = plan_mut(&mut inner.plans, plan_id)?;
        entry.plan.name = name.to_string();
        entry.plan.updated_at = now;
        Ok(())
    }

    fn archive_plan(&self, plan_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let now = inner.clock.now();
        plan_mut(&mut inner.plans, plan_id)?.plan.archived_at = Some(now);
        Ok(())
    }

    fn unarchive_plan(&self, plan_id: &str) -> Result<()> {
        let mut inner = self.lock();
        plan_mut(&mut inner.plans, plan_id)?.plan.archived_at = None;
        Ok(())
    }

    fn list_branches(&self, plan_id: &str) -> Result<Vec<Branch>> {
        let inner = self.lock();
        let entry = inner.plans.get(plan_id).ok_or_else(|| not_found("plan"))?;
        let mut branches: Vec<Branch> = entry.branches.values().map(|b| b.branch.clone()).collect();
        branches.sort_by_key(|b| b.created_at);
        Ok(branches)
    }

    fn create_branch(&self, plan_id: &str, from_branch: &str, req: &CreateBranchRequest) -> Result<()> {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let plan = plan_mut(plans, plan_id)?;
        if plan.branches.contains_key(&req.name) {
            return Err(ApiError::other(409, format!("branch {} already exists", req.name)).into());
        }
        let parent = plan
            .branches
            .get(from_branch)
            .ok_or_else(|| not_found("branch"))?;
        let data = parent.data.clone();
        let logs = parent.logs.clone();
        let settings = parent.settings.clone();
        let mut branch = new_branch(clock, plan_id, &req.name, Some(parent.branch.id.clone()));
        branch.context_tokens = data.context_tokens();
        plan.branches.insert(
            req.name.clone(),
            BranchEntry {
                branch,
                data,
                settings,
                logs,
            },
        );
        Ok(())
    }

    fn delete_branch(&self, plan_id: &str, branch: &str) -> Result<()> {
        if branch == MAIN_BRANCH {
            return Err(bad_request("cannot delete the main branch"));
        }
        let mut inner = self.lock();
        plan_mut(&mut inner.plans, plan_id)?
            .branches
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| not_found("branch"))
    }

    fn list_context(&self, plan_id: &str, branch: &str) -> Result<Vec<Context>> {
        let inner = self.lock();
        let entry = branch_ref(&inner.plans, plan_id, branch)?;
        let mut contexts = entry.data.contexts.clone();
        contexts.sort_by_key(|c| c.created_at);
        for ctx in &mut contexts {
            ctx.body.clear();
        }
        Ok(contexts)
    }

    fn get_context_body(&self, plan_id: &str, branch: &str, context_id: &str) -> Result<String> {
        let inner = self.lock();
        branch_ref(&inner.plans, plan_id, branch)?
            .data
            .contexts
            .iter()
            .find(|c| c.id == context_id)
            .map(|c| c.body.clone())
            .ok_or_else(|| not_found("context"))
    }

    fn load_context(&self, plan_id: &str, branch: &str, req: &LoadContextRequest) -> Result<LoadContextResponse> {
        self.load(plan_id, branch, req)
    }

    fn update_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &UpdateContextRequest,
    ) -> Result<UpdateContextResponse> {
        let mut inner = self.lock();
        let max_tokens = inner.max_tokens();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let current = entry.data.context_tokens();

        let mut delta: i64 = 0;
        let mut new_bodies = BTreeMap::new();
        for (id, params) in req {
            let ctx = entry
                .data
                .contexts
                .iter()
                .find(|c| &c.id == id)
                .ok_or_else(|| not_found("context"))?;
            delta += params.num_tokens as i64 - ctx.num_tokens as i64;
            if ctx.context_type == ContextType::File && !ctx.file_path.is_empty() {
                new_bodies.insert(ctx.file_path.clone(), params.body.clone());
            }
        }
        let total = (current as i64 + delta).max(0) as usize;
        if total > max_tokens {
            return Ok(UpdateContextResponse {
                tokens_added: delta,
                total_tokens: current,
                max_tokens_exceeded: true,
                max_tokens,
                msg: String::new(),
            });
        }

        let conflicts = plandex_diff::conflicted_paths(&entry.data.plan_state(), &new_bodies);
        plandex_diff::invalidate_build_paths(&mut entry.data.descriptions, &conflicts);

        for (id, params) in req {
            let now = clock.now();
            let Some(ctx) = entry.data.contexts.iter_mut().find(|c| &c.id == id) else {
                continue;
            };
            ctx.body = params.body.clone();
            ctx.body_size = params.body.len();
            ctx.sha = params.sha.clone();
            ctx.num_tokens = params.num_tokens;
            ctx.map_parts.extend(params.map_parts.clone());
            ctx.map_shas.extend(params.map_shas.clone());
            ctx.map_tokens.extend(params.map_tokens.clone());
            for path in &params.removed_map_paths {
                ctx.map_parts.remove(path);
                ctx.map_shas.remove(path);
                ctx.map_tokens.remove(path);
            }
            ctx.updated_at = now;
        }
        let msg = format!("Updated {} context item(s)", req.len());
        entry.commit(clock, &msg);
        Ok(UpdateContextResponse {
            tokens_added: delta,
            total_tokens: total,
            max_tokens_exceeded: false,
            max_tokens,
            msg,
        })
    }

    fn delete_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &DeleteContextRequest,
    ) -> Result<DeleteContextResponse> {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let before = entry.data.context_tokens();
        entry.data.contexts.retain(|c| !req.ids.contains(&c.id));
        let total = entry.data.context_tokens();
        let msg = format!("Removed {} context item(s)", req.ids.len());
        entry.commit(clock, &msg);
        Ok(DeleteContextResponse {
            tokens_removed: before - total,
            total_tokens: total,
            msg,
        })
    }

    fn auto_load_context(
        &self,
        plan_id: &str,
        branch: &str,
        req: &LoadContextRequest,
    ) -> Result<LoadContextResponse> {
        self.lock().auto_loads.push(req.clone());
        self.load(plan_id, branch, req)
    }

    fn get_file_map(&self, req: &GetFileMapRequest) -> Result<GetFileMapResponse> {
        let inner = self.lock();
        Ok(GetFileMapResponse {
            map_bodies: req
                .map_inputs
                .keys()
                .filter_map(|path| inner.file_maps.get(path).map(|b| (path.clone(), b.clone())))
                .collect(),
        })
    }

    fn list_convo(&self, plan_id: &str, branch: &str) -> Result<Vec<ConvoMessage>> {
        let inner = self.lock();
        Ok(branch_ref(&inner.plans, plan_id, branch)?.data.convo.clone())
    }

    fn list_convo_summaries(&self, plan_id: &str, branch: &str) -> Result<Vec<ConvoSummary>> {
        let inner = self.lock();
        Ok(branch_ref(&inner.plans, plan_id, branch)?.data.summaries.clone())
    }

    fn get_current_plan_state(&self, plan_id: &str, branch: &str) -> Result<CurrentPlanState> {
        let inner = self.lock();
        Ok(branch_ref(&inner.plans, plan_id, branch)?.data.plan_state())
    }

    fn get_current_plan_state_at_sha(&self, plan_id: &str, branch: &str, sha: &str) -> Result<CurrentPlanState> {
        let inner = self.lock();
        branch_ref(&inner.plans, plan_id, branch)?
            .logs
            .iter()
            .find(|(entry, _)| entry.sha == sha)
            .map(|(_, data)| data.plan_state())
            .ok_or_else(|| not_found("commit"))
    }

    fn get_plan_diffs(&self, plan_id: &str, branch: &str, _plain: bool) -> Result<String> {
        let state = self.get_current_plan_state(plan_id, branch)?;
        let diffs = plandex_diff::render_plan_diffs(&state)?;
        Ok(diffs.into_iter().map(|d| d.text).collect::<Vec<_>>().join("\n"))
    }

    fn list_logs(&self, plan_id: &str, branch: &str) -> Result<Vec<PlanLogEntry>> {
        let inner = self.lock();
        Ok(branch_ref(&inner.plans, plan_id, branch)?
            .logs
            .iter()
            .rev()
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    fn rewind_plan(&self, plan_id: &str, branch: &str, req: &RewindPlanRequest) -> Result<RewindPlanResponse> {
        let mut inner = self.lock();
        if let Some(msg) = inner.rewind_failure.take() {
            return Err(ApiError::other(500, msg).into());
        }
        let entry = branch_mut(&mut inner.plans, plan_id, branch)?;
        let idx = entry
            .logs
            .iter()
            .position(|(log, _)| log.sha == req.sha)
            .ok_or_else(|| not_found("commit"))?;
        entry.logs.truncate(idx + 1);
        let (log, data) = entry.logs[idx].clone();
        entry.data = data;
        entry.branch.context_tokens = entry.data.context_tokens();
        Ok(RewindPlanResponse {
            latest_sha: log.sha,
            latest_commit: log.message,
        })
    }

    fn apply_plan(&self, plan_id: &str, branch: &str, req: &ApplyPlanRequest) -> Result<ApplyPlanResponse> {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let now = clock.now();
        for result in entry.data.results.iter_mut() {
            if req.plan_file_result_ids.contains(&result.id) && result.is_pending() {
                result.applied_at = Some(now);
                result.updated_at = now;
            }
        }
        mark_applied_descriptions(&mut entry.data, now);
        let apply = PlanApply {
            id: clock.id("apply"),
            plan_file_result_ids: req.plan_file_result_ids.clone(),
            commit_msg: req.commit_msg.clone(),
            created_at: now,
        };
        let resp = ApplyPlanResponse {
            plan_apply_id: apply.id.clone(),
            commit_msg: apply.commit_msg.clone(),
        };
        entry.data.applies.push(apply);
        entry.commit(clock, "Applied pending changes");
        Ok(resp)
    }

    fn reject_all_changes(&self, plan_id: &str, branch: &str) -> Result<()> {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let now = clock.now();
        for result in entry.data.results.iter_mut().filter(|r| r.is_pending()) {
            result.rejected_at = Some(now);
        }
        mark_applied_descriptions(&mut entry.data, now);
        entry.commit(clock, "Rejected all pending changes");
        Ok(())
    }

    fn reject_files(&self, plan_id: &str, branch: &str, req: &RejectFilesRequest) -> Result<()> {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let now = clock.now();
        for result in entry
            .data
            .results
            .iter_mut()
            .filter(|r| r.is_pending() && req.paths.contains(&r.path))
        {
            result.rejected_at = Some(now);
        }
        mark_applied_descriptions(&mut entry.data, now);
        entry.commit(clock, &format!("Rejected {}", req.paths.join(", ")));
        Ok(())
    }

    /// Rebuilt results replace the pending results for their paths and clear
    /// the matching invalidation flags.
    fn put_plan_file_results(&self, plan_id: &str, branch: &str, results: &[PlanFileResult]) -> Result<()> {
        let mut inner = self.lock();
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let stamped = stamp_results(clock, results, None);
        for result in &stamped {
            entry
                .data
                .results
                .retain(|r| !(r.path == result.path && r.is_pending()));
            for desc in entry.data.descriptions.iter_mut() {
                desc.build_paths_invalidated.remove(&result.path);
            }
        }
        let paths: Vec<&str> = stamped.iter().map(|r| r.path.as_str()).collect();
        let msg = format!("Rebuilt {}", paths.join(", "));
        entry.data.results.extend(stamped);
        entry.commit(clock, &msg);
        Ok(())
    }

    fn tell_plan(&self, plan_id: &str, branch: &str, req: &TellPlanRequest) -> Result<Option<StreamBody>> {
        let mut inner = self.lock();
        inner.tell_requests.push(req.clone());
        let turn = inner
            .turns
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn::reply("ok"));
        let Inner { clock, plans, .. } = &mut *inner;
        let plan = plan_mut(plans, plan_id)?;
        plan.plan.total_replies += 1;
        let entry = plan
            .branches
            .get_mut(branch)
            .ok_or_else(|| not_found("branch"))?;

        if !req.prompt.is_empty() {
            let user = convo_message(clock, &entry.data, MessageRole::User, &req.prompt, ConvoMessageFlags::default());
            entry.data.convo.push(user);
        }
        let flags = ConvoMessageFlags {
            did_make_plan: turn.description.is_some(),
            did_write_code: !turn.results.is_empty(),
            has_error: matches!(turn.end, TurnEnd::Failed(_)),
            ..ConvoMessageFlags::default()
        };
        let reply = convo_message(clock, &entry.data, MessageRole::Assistant, &turn.reply, flags);
        let reply_id = reply.id.clone();
        entry.data.convo.push(reply);

        if turn.end == TurnEnd::Finished
            && let Some(desc) = &turn.description
        {
            let mut desc = desc.clone();
            desc.convo_message_id = reply_id.clone();
            desc.created_at = clock.now();
            desc.updated_at = desc.created_at;
            let results = stamp_results(clock, &turn.results, Some(reply_id.as_str()));
            if req.build_mode == BuildMode::Auto {
                desc.did_build = true;
                entry.data.results.extend(results);
            } else {
                desc.did_build = false;
                entry.data.unbuilt.extend(results);
            }
            entry.data.descriptions.push(desc);
        }
        entry.branch.status = match turn.end {
            TurnEnd::Finished => PlanStatus::Finished,
            TurnEnd::Aborted => PlanStatus::Stopped,
            TurnEnd::Failed(_) => PlanStatus::Error,
            TurnEnd::Dropped => PlanStatus::Replying,
        };
        let first_line = req.prompt.lines().next().unwrap_or_default().to_string();
        entry.commit(clock, &format!("Tell: {first_line}"));

        Ok(req.connect_stream.then(|| body_of(turn.body())))
    }

    fn build_plan(&self, plan_id: &str, branch: &str, req: &BuildPlanRequest) -> Result<Option<StreamBody>> {
        let mut inner = self.lock();
        inner.build_requests.push(req.clone());
        let Inner { clock, plans, .. } = &mut *inner;
        let entry = branch_mut(plans, plan_id, branch)?;
        let unbuilt = std::mem::take(&mut entry.data.unbuilt);
        let now = clock.now();
        for desc in entry.data.descriptions.iter_mut().filter(|d| d.has_pending_builds()) {
            desc.did_build = true;
            desc.updated_at = now;
        }
        let mut frames: Vec<Frame> = unbuilt.iter().map(build_info_frame).collect();
        frames.push(Frame::Sentinel(Sentinel::End));
        entry.data.results.extend(unbuilt);
        entry.branch.status = PlanStatus::Finished;
        entry.commit(clock, "Built pending changes");
        Ok(req.connect_stream.then(|| body_of(framed(&frames))))
    }

    fn connect_plan(&self, plan_id: &str, branch: &str) -> Result<StreamBody> {
        let mut inner = self.lock();
        branch_ref(&inner.plans, plan_id, branch)?;
        inner
            .connect_bodies
            .pop_front()
            .map(body_of)
            .ok_or_else(|| not_found("active stream"))
    }

    fn stop_plan(&self, plan_id: &str, branch: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.stops.push((plan_id.to_string(), branch.to_string()));
        let entry = branch_mut(&mut inner.plans, plan_id, branch)?;
        if entry.branch.status.is_active() {
            entry.branch.status = PlanStatus::Stopped;
        }
        Ok(())
    }

    fn get_settings(&self, plan_id: &str, branch: &str) -> Result<PlanSettings> {
        let inner = self.lock();
        let entry = branch_ref(&inner.plans, plan_id, branch)?;
        Ok(entry
            .settings
            .clone()
            .or_else(|| inner.default_settings.clone())
            .unwrap_or_default())
    }

    fn update_settings(&self, plan_id: &str, branch: &str, settings: &PlanSettings) -> Result<()> {
        let mut inner = self.lock();
        let now = inner.clock.now();
        let entry = branch_mut(&mut inner.plans, plan_id, branch)?;
        let mut settings = settings.clone();
        settings.updated_at = Some(now);
        entry.settings = Some(settings);
        Ok(())
    }

    fn get_default_settings(&self) -> Result<PlanSettings> {
        Ok(self.lock().default_settings.clone().unwrap_or_default())
    }

    fn update_default_settings(&self, settings: &PlanSettings) -> Result<()> {
        let mut inner = self.lock();
        let mut settings = settings.clone();
        settings.updated_at = Some(inner.clock.now());
        inner.default_settings = Some(settings);
        Ok(())
    }

    fn get_plan_config(&self, plan_id: &str) -> Result<PlanConfig> {
        let inner = self.lock();
        let entry = inner.plans.get(plan_id).ok_or_else(|| not_found("plan"))?;
        Ok(entry
            .config
            .clone()
            .or_else(|| inner.default_config.clone())
            .unwrap_or_default())
    }

    fn update_plan_config(&self, plan_id: &str, config: &PlanConfig) -> Result<()> {
        config.validate().map_err(|e| bad_request(e.to_string()))?;
        let mut inner = self.lock();
        plan_mut(&mut inner.plans, plan_id)?.config = Some(config.clone());
        Ok(())
    }

    fn get_default_plan_config(&self) -> Result<PlanConfig> {
        Ok(self.lock().default_config.clone().unwrap_or_default())
    }

    fn update_default_plan_config(&self, config: &PlanConfig) -> Result<()> {
        config.validate().map_err(|e| bad_request(e.to_string()))?;
        self.lock().default_config = Some(config.clone());
        Ok(())
    }

    fn list_custom_models(&self) -> Result<Vec<BaseModel>> {
        Ok(self.lock().custom_models.clone())
    }

    fn create_custom_model(&self, model: &BaseModel) -> Result<()> {
        let mut inner = self.lock();
        if inner.custom_models.iter().any(|m| m.model_id == model.model_id) {
            return Err(ApiError::other(409, format!("model {} already exists", model.model_id)).into());
        }
        inner.custom_models.push(model.clone());
        Ok(())
    }

    fn update_custom_model(&self, model: &BaseModel) -> Result<()> {
        let mut inner = self.lock();
        let existing = inner
            .custom_models
            .iter_mut()
            .find(|m| m.model_id == model.model_id)
            .ok_or_else(|| not_found("model"))?;
        *existing = model.clone();
        Ok(())
    }

    fn delete_custom_model(&self, model_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let before = inner.custom_models.len();
        inner.custom_models.retain(|m| m.model_id != model_id);
        if inner.custom_models.len() == before {
            return Err(not_found("model"));
        }
        Ok(())
    }

    fn update_custom_models_input(&self, input: &CustomModelsInput) -> Result<()> {
        let mut inner = self.lock();
        inner.custom_providers = input.custom_providers.clone();
        inner.custom_models = input.custom_models.clone();
        inner.model_packs = input.custom_model_packs.clone();
        Ok(())
    }

    fn list_custom_providers(&self) -> Result<Vec<CustomProvider>> {
        Ok(self.lock().custom_providers.clone())
    }

    fn create_custom_provider(&self, provider: &CustomProvider) -> Result<()> {
        let mut inner = self.lock();
        let mut provider = provider.clone();
        if provider.id.is_empty() {
            provider.id = inner.clock.id("provider");
        }
        inner.custom_providers.push(provider);
        Ok(())
    }

    fn delete_custom_provider(&self, provider_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let before = inner.custom_providers.len();
        inner
            .custom_providers
            .retain(|p| p.id != provider_id && p.name != provider_id);
        if inner.custom_providers.len() == before {
            return Err(not_found("provider"));
        }
        Ok(())
    }

    fn list_model_packs(&self) -> Result<Vec<ModelPack>> {
        Ok(self.lock().model_packs.clone())
    }

    fn create_model_pack(&self, pack: &ModelPack) -> Result<()> {
        let mut inner = self.lock();
        if inner.model_packs.iter().any(|p| p.name == pack.name) {
            return Err(ApiError::other(409, format!("model pack {} already exists", pack.name)).into());
        }
        let mut pack = pack.clone();
        if pack.id.is_empty() {
            pack.id = inner.clock.id("pack");
        }
        inner.model_packs.push(pack);
        Ok(())
    }

    fn update_model_pack(&self, pack: &ModelPack) -> Result<()> {
        let mut inner = self.lock();
        let existing = inner
            .model_packs
            .iter_mut()
            .find(|p| p.id == pack.id || p.name == pack.name)
            .ok_or_else(|| not_found("model pack"))?;
        *existing = pack.clone();
        Ok(())
    }

    fn delete_model_pack(&self, pack_id: &str) -> Result<()> {
        let mut inner = self.lock();
        let before = inner.model_packs.len();
        inner
            .model_packs
            .retain(|p| p.id != pack_id && p.name != pack_id);
        if inner.model_packs.len() == before {
            return Err(not_found("model pack"));
        }
        Ok(())
    }

    fn get_usage_summary(&self) -> Result<UsageSummary> {
        Ok(self.lock().usage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{description, edits, rep, whole};
    use plandex_api::{UpdateContextParams, api_error};

    fn file_params(path: &str, body: &str, tokens: usize) -> LoadContextParams {
        LoadContextParams {
            context_type: Some(ContextType::File),
            name: path.to_string(),
            file_path: path.to_string(),
            body: body.to_string(),
            sha: body_sha(body),
            num_tokens: tokens,
            ..LoadContextParams::default()
        }
    }

    #[test]
    fn loads_past_the_token_limit_store_nothing() {
        let server = FakeServer::new();
        let plan = server.seed_plan("p");
        server.set_max_tokens(100);
        let ok = server
            .load_context(&plan, MAIN_BRANCH, &vec![file_params("a.rs", "a", 60)])
            .expect("load");
        assert_eq!(ok.total_tokens, 60);
        let over = server
            .load_context(&plan, MAIN_BRANCH, &vec![file_params("b.rs", "b", 50)])
            .expect("load");
        assert!(over.max_tokens_exceeded);
        assert_eq!(over.total_tokens, 60);
        assert_eq!(over.tokens_added, 50);
        assert_eq!(server.list_context(&plan, MAIN_BRANCH).expect("list").len(), 1);
    }

    #[test]
    fn listing_omits_bodies_until_fetched() {
        let server = FakeServer::new();
        let plan = server.seed_plan("p");
        server
            .load_context(&plan, MAIN_BRANCH, &vec![file_params("a.rs", "fn a() {}", 3)])
            .expect("load");
        let listed = server.list_context(&plan, MAIN_BRANCH).expect("list");
        assert!(listed[0].body.is_empty());
        assert_eq!(listed[0].body_size, 9);
        assert_eq!(
            server
                .get_context_body(&plan, MAIN_BRANCH, &listed[0].id)
                .expect("body"),
            "fn a() {}"
        );
    }

    #[test]
    fn conflicting_updates_invalidate_build_paths() {
        let server = FakeServer::new();
        let plan = server.seed_plan("p");
        let base = "const a = 1;\n";
        server
            .load_context(&plan, MAIN_BRANCH, &vec![file_params("x.ts", base, 4)])
            .expect("load");
        let mut result = edits("x.ts", base, vec![rep("const a = 1;", "const a = 2;")], 1);
        result.convo_message_id = "m1".to_string();
        server.set_plan_state(
            &plan,
            MAIN_BRANCH,
            CurrentPlanState {
                plan_result: PlanResult::from_results(vec![result]),
                convo_message_descriptions: vec![description("m1", "bump a", &["x.ts"], 1)],
                ..CurrentPlanState::default()
            },
        );
        let id = server.list_context(&plan, MAIN_BRANCH).expect("list")[0].id.clone();
        let body = "let a = 1;\n";
        let req = BTreeMap::from([(
            id,
            UpdateContextParams {
                body: body.to_string(),
                sha: body_sha(body),
                num_tokens: 4,
                ..UpdateContextParams::default()
            },
        )]);
        server.update_context(&plan, MAIN_BRANCH, &req).expect("update");
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        assert_eq!(state.pending_build_paths(), vec!["x.ts".to_string()]);
    }

    #[test]
    fn rewind_restores_the_snapshot_and_drops_later_logs() {
        let server = FakeServer::new();
        let plan = server.seed_plan("p");
        let first = server.list_logs(&plan, MAIN_BRANCH).expect("logs")[0].sha.clone();
        server.queue_turn(
            ScriptedTurn::reply("writing")
                .with_plan(description("m", "add a", &["a.txt"], 1), vec![whole("a.txt", "a\n", 1)]),
        );
        server
            .tell_plan(
                &plan,
                MAIN_BRANCH,
                &TellPlanRequest {
                    prompt: "add a".to_string(),
                    ..TellPlanRequest::default()
                },
            )
            .expect("tell");
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        assert_eq!(state.current_plan_files.files["a.txt"], "a\n");
        assert_eq!(server.list_logs(&plan, MAIN_BRANCH).expect("logs").len(), 2);

        let resp = server
            .rewind_plan(&plan, MAIN_BRANCH, &RewindPlanRequest { sha: first.clone() })
            .expect("rewind");
        assert_eq!(resp.latest_sha, first);
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        assert!(state.plan_result.results.is_empty());
        assert_eq!(server.list_logs(&plan, MAIN_BRANCH).expect("logs").len(), 1);
    }

    #[test]
    fn tell_without_build_defers_results_until_build() {
        let server = FakeServer::new();
        let plan = server.seed_plan("p");
        server.queue_turn(
            ScriptedTurn::reply("plan")
                .with_plan(description("m", "add a", &["a.txt"], 1), vec![whole("a.txt", "a\n", 1)]),
        );
        let body = server
            .tell_plan(
                &plan,
                MAIN_BRANCH,
                &TellPlanRequest {
                    prompt: "go".to_string(),
                    build_mode: BuildMode::None,
                    connect_stream: true,
                    ..TellPlanRequest::default()
                },
            )
            .expect("tell");
        assert!(body.is_some());
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        assert!(state.has_pending_builds());
        assert!(state.plan_result.results.is_empty());

        server
            .build_plan(&plan, MAIN_BRANCH, &BuildPlanRequest::default())
            .expect("build");
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        assert!(!state.has_pending_builds());
        assert_eq!(state.plan_result.pending_paths(), vec!["a.txt".to_string()]);
        assert_eq!(server.list_convo(&plan, MAIN_BRANCH).expect("convo").len(), 2);
    }

    #[test]
    fn apply_marks_results_and_descriptions() {
        let server = FakeServer::new();
        let plan = server.seed_plan("p");
        server.queue_turn(
            ScriptedTurn::reply("")
                .with_plan(description("m", "add a", &["a.txt"], 1), vec![whole("a.txt", "a\n", 1)]),
        );
        server
            .tell_plan(&plan, MAIN_BRANCH, &TellPlanRequest::default())
            .expect("tell");
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        let ids: Vec<String> = state.plan_result.results.iter().map(|r| r.id.clone()).collect();
        server
            .apply_plan(
                &plan,
                MAIN_BRANCH,
                &ApplyPlanRequest {
                    plan_file_result_ids: ids,
                    commit_msg: "add a".to_string(),
                },
            )
            .expect("apply");
        let state = server.get_current_plan_state(&plan, MAIN_BRANCH).expect("state");
        assert!(state.plan_result.pending_paths().is_empty());
        assert!(state.convo_message_descriptions[0].applied_at.is_some());
        assert_eq!(state.plan_applies.len(), 1);
    }

    #[test]
    fn missing_plans_are_api_errors() {
        let server = FakeServer::new();
        let err = server.list_context("nope", MAIN_BRANCH).unwrap_err();
        assert_eq!(api_error(&err).map(|e| e.status), Some(404));
        let plan = server.seed_plan("p");
        assert!(server.delete_branch(&plan, MAIN_BRANCH).is_err());
    }
}
