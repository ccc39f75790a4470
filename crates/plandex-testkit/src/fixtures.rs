//! Small constructors for plan results and context items.

use chrono::{DateTime, Utc};
use plandex_core::{
    Context, ContextType, ConvoMessageDescription, PlanFileResult, Replacement, body_sha,
};
use std::collections::BTreeMap;

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub fn rep(old: &str, new: &str) -> Replacement {
    Replacement {
        id: format!("rep-{old}"),
        old: old.to_string(),
        new: new.to_string(),
        summary: format!("change {old}"),
        failed: false,
        rejected_at: None,
        streamed_change: None,
    }
}

/// A whole-file result created at `secs`.
pub fn whole(path: &str, content: &str, secs: i64) -> PlanFileResult {
    PlanFileResult {
        id: format!("{path}-{secs}"),
        convo_message_id: "m1".to_string(),
        plan_build_id: String::new(),
        path: path.to_string(),
        context_body: String::new(),
        context_sha: String::new(),
        content: Some(content.to_string()),
        replacements: Vec::new(),
        any_failed: false,
        removed_file: false,
        applied_at: None,
        rejected_at: None,
        created_at: at(secs),
        updated_at: at(secs),
    }
}

/// Ordered replacements against `base`.
pub fn edits(path: &str, base: &str, reps: Vec<Replacement>, secs: i64) -> PlanFileResult {
    PlanFileResult {
        content: None,
        replacements: reps,
        context_body: base.to_string(),
        context_sha: body_sha(base),
        ..whole(path, "", secs)
    }
}

pub fn removal(path: &str, secs: i64) -> PlanFileResult {
    PlanFileResult {
        content: None,
        removed_file: true,
        ..whole(path, "", secs)
    }
}

pub fn context(id: &str, context_type: ContextType, name: &str, secs: i64) -> Context {
    Context {
        id: id.to_string(),
        owner_id: String::new(),
        context_type,
        name: name.to_string(),
        url: String::new(),
        file_path: if context_type == ContextType::File {
            name.to_string()
        } else {
            String::new()
        },
        sha: body_sha(""),
        num_tokens: 0,
        body: String::new(),
        body_size: 0,
        force_skip_ignore: false,
        auto_loaded: false,
        truncated: false,
        image_detail: None,
        map_parts: BTreeMap::new(),
        map_shas: BTreeMap::new(),
        map_tokens: BTreeMap::new(),
        created_at: at(secs),
        updated_at: at(secs),
    }
}

/// A description for message `convo_message_id` that planned `files`.
pub fn description(
    convo_message_id: &str,
    commit_msg: &str,
    files: &[&str],
    secs: i64,
) -> ConvoMessageDescription {
    ConvoMessageDescription {
        id: format!("desc-{convo_message_id}"),
        convo_message_id: convo_message_id.to_string(),
        summarized_to_message_id: String::new(),
        made_plan: true,
        commit_msg: commit_msg.to_string(),
        files: files.iter().map(|f| f.to_string()).collect(),
        did_build: true,
        build_paths_invalidated: BTreeMap::new(),
        error: None,
        applied_at: None,
        created_at: at(secs),
        updated_at: at(secs),
    }
}
