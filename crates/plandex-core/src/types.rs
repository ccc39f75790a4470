use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::plan_config::PlanConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub owner_id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub total_replies: u32,
    #[serde(default)]
    pub active_branches: u32,
    #[serde(default)]
    pub plan_config: Option<PlanConfig>,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Branch status as stored by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanStatus {
    Draft,
    Replying,
    Describing,
    Building,
    Finished,
    Stopped,
    Error,
    MissingFile,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Replying => "replying",
            PlanStatus::Describing => "describing",
            PlanStatus::Building => "building",
            PlanStatus::Finished => "finished",
            PlanStatus::Stopped => "stopped",
            PlanStatus::Error => "error",
            PlanStatus::MissingFile => "missingFile",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlanStatus::Replying
                | PlanStatus::Describing
                | PlanStatus::Building
                | PlanStatus::MissingFile
        )
    }
}

pub fn is_valid_status_transition(from: &PlanStatus, to: &PlanStatus) -> bool {
    use PlanStatus::*;
    matches!(
        (from, to),
        (Draft, Replying)
            | (Replying, Describing)
            | (Replying, Building)
            | (Replying, MissingFile)
            | (Replying, Finished)
            | (Replying, Stopped)
            | (Replying, Error)
            | (Describing, Replying)
            | (Describing, Building)
            | (Describing, Finished)
            | (Describing, Stopped)
            | (Describing, Error)
            | (Building, Replying)
            | (Building, Finished)
            | (Building, Stopped)
            | (Building, Error)
            | (MissingFile, Replying)
            | (MissingFile, Stopped)
            | (MissingFile, Error)
            | (Finished, Replying)
            | (Finished, Building)
            | (Stopped, Replying)
            | (Stopped, Building)
            | (Error, Replying)
            | (Error, Building)
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub plan_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub parent_branch_id: Option<String>,
    pub name: String,
    pub status: PlanStatus,
    #[serde(default)]
    pub context_tokens: usize,
    #[serde(default)]
    pub convo_tokens: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContextType {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "directory tree")]
    DirectoryTree,
    #[serde(rename = "url")]
    Url,
    #[serde(rename = "note")]
    Note,
    #[serde(rename = "piped data")]
    PipedData,
    #[serde(rename = "image")]
    Image,
    #[serde(rename = "map")]
    Map,
}

impl ContextType {
    pub fn label(&self) -> &'static str {
        match self {
            ContextType::File => "file",
            ContextType::DirectoryTree => "tree",
            ContextType::Url => "url",
            ContextType::Note => "note",
            ContextType::PipedData => "piped",
            ContextType::Image => "image",
            ContextType::Map => "map",
        }
    }

    /// Types whose body can be re-read from a source on disk or the network.
    pub fn is_refreshable(&self) -> bool {
        matches!(
            self,
            ContextType::File
                | ContextType::DirectoryTree
                | ContextType::Url
                | ContextType::Image
                | ContextType::Map
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    #[default]
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub id: String,
    #[serde(default)]
    pub owner_id: String,
    pub context_type: ContextType,
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub file_path: String,
    pub sha: String,
    pub num_tokens: usize,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_size: usize,
    #[serde(default)]
    pub force_skip_ignore: bool,
    #[serde(default)]
    pub auto_loaded: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub image_detail: Option<ImageDetail>,
    #[serde(default)]
    pub map_parts: BTreeMap<String, String>,
    #[serde(default)]
    pub map_shas: BTreeMap<String, String>,
    #[serde(default)]
    pub map_tokens: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    /// The identifier users see: file path for file-like items, url for urls, else name.
    pub fn display_name(&self) -> &str {
        if !self.file_path.is_empty() {
            &self.file_path
        } else if !self.url.is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvoMessageFlags {
    pub did_load_context: bool,
    pub did_make_plan: bool,
    pub did_write_code: bool,
    pub did_complete_plan: bool,
    pub has_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoMessage {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub role: MessageRole,
    pub tokens: usize,
    pub num: u32,
    pub message: String,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub flags: ConvoMessageFlags,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoSummary {
    pub id: String,
    pub latest_convo_message_id: String,
    pub latest_convo_message_created_at: DateTime<Utc>,
    pub summary: String,
    pub tokens: usize,
    pub num_messages: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    #[default]
    Replace,
    Append,
    Prepend,
}

/// Inclusive, 1-based line range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    pub start_line: usize,
    pub end_line: usize,
}

impl LineRange {
    pub fn new(start_line: usize, end_line: usize) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_line == 0 || self.end_line < self.start_line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamedChange {
    #[serde(default)]
    pub change_type: ChangeType,
    pub old: LineRange,
    pub new: LineRange,
    #[serde(default)]
    pub short_summary: String,
    #[serde(default)]
    pub change_sections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replacement {
    pub id: String,
    pub old: String,
    pub new: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub streamed_change: Option<StreamedChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanFileResult {
    pub id: String,
    #[serde(default)]
    pub convo_message_id: String,
    #[serde(default)]
    pub plan_build_id: String,
    pub path: String,
    #[serde(default)]
    pub context_body: String,
    #[serde(default)]
    pub context_sha: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub replacements: Vec<Replacement>,
    #[serde(default)]
    pub any_failed: bool,
    #[serde(default)]
    pub removed_file: bool,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlanFileResult {
    pub fn is_whole_file(&self) -> bool {
        self.content.is_some()
    }

    pub fn has_pending_replacements(&self) -> bool {
        self.replacements.iter().any(|r| r.rejected_at.is_none())
    }

    pub fn is_pending(&self) -> bool {
        self.applied_at.is_none()
            && self.rejected_at.is_none()
            && (self.content.is_some() || self.removed_file || self.has_pending_replacements())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoMessageDescription {
    pub id: String,
    pub convo_message_id: String,
    #[serde(default)]
    pub summarized_to_message_id: String,
    #[serde(default)]
    pub made_plan: bool,
    #[serde(default)]
    pub commit_msg: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub did_build: bool,
    #[serde(default)]
    pub build_paths_invalidated: BTreeMap<String, bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConvoMessageDescription {
    /// A description that produced a plan but whose files have not (all) been built.
    pub fn has_pending_builds(&self) -> bool {
        self.applied_at.is_none()
            && self.made_plan
            && !self.files.is_empty()
            && (!self.did_build || self.build_paths_invalidated.values().any(|v| *v))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanApply {
    pub id: String,
    pub plan_file_result_ids: Vec<String>,
    #[serde(default)]
    pub commit_msg: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPlanFiles {
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub removed_by_path: BTreeMap<String, bool>,
    #[serde(default)]
    pub updated_at_by_path: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub sorted_paths: Vec<String>,
    pub file_results_by_path: BTreeMap<String, Vec<PlanFileResult>>,
    pub results: Vec<PlanFileResult>,
    #[serde(default)]
    pub replacements_by_path: BTreeMap<String, Vec<Replacement>>,
}

impl PlanResult {
    pub fn from_results(results: Vec<PlanFileResult>) -> Self {
        let mut sorted = results;
        sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut by_path: BTreeMap<String, Vec<PlanFileResult>> = BTreeMap::new();
        let mut replacements_by_path: BTreeMap<String, Vec<Replacement>> = BTreeMap::new();
        let mut sorted_paths = Vec::new();
        for result in &sorted {
            if !by_path.contains_key(&result.path) {
                sorted_paths.push(result.path.clone());
            }
            by_path
                .entry(result.path.clone())
                .or_default()
                .push(result.clone());
            replacements_by_path
                .entry(result.path.clone())
                .or_default()
                .extend(result.replacements.iter().cloned());
        }
        Self {
            sorted_paths,
            file_results_by_path: by_path,
            results: sorted,
            replacements_by_path,
        }
    }

    pub fn pending_results(&self) -> impl Iterator<Item = &PlanFileResult> {
        self.results.iter().filter(|r| r.is_pending())
    }

    pub fn pending_paths(&self) -> Vec<String> {
        self.sorted_paths
            .iter()
            .filter(|p| {
                self.file_results_by_path
                    .get(*p)
                    .is_some_and(|results| results.iter().any(|r| r.is_pending()))
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPlanState {
    pub plan_result: PlanResult,
    pub current_plan_files: CurrentPlanFiles,
    #[serde(default)]
    pub convo_message_descriptions: Vec<ConvoMessageDescription>,
    #[serde(default)]
    pub contexts_by_path: BTreeMap<String, Context>,
    #[serde(default)]
    pub plan_applies: Vec<PlanApply>,
}

impl CurrentPlanState {
    pub fn has_pending_builds(&self) -> bool {
        self.convo_message_descriptions
            .iter()
            .any(ConvoMessageDescription::has_pending_builds)
    }

    pub fn pending_build_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for desc in &self.convo_message_descriptions {
            if !desc.has_pending_builds() {
                continue;
            }
            let invalidated: Vec<&String> = desc
                .build_paths_invalidated
                .iter()
                .filter(|(_, v)| **v)
                .map(|(k, _)| k)
                .collect();
            let candidates: Vec<&String> = if desc.did_build {
                invalidated
            } else {
                desc.files.iter().collect()
            };
            for path in candidates {
                if !paths.contains(path) {
                    paths.push(path.clone());
                }
            }
        }
        paths
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLogEntry {
    pub sha: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
