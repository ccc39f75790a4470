use chrono::{DateTime, Utc};
use plandex_core::{ConvoMessageDescription, CurrentPlanFiles, CurrentPlanState};
use std::collections::BTreeMap;
use tracing::warn;

use crate::BuildError;
use crate::replace::apply_replacements;
use crate::streamed::validate_result;

enum PathOutcome {
    Content(String, Option<DateTime<Utc>>),
    Removed(Option<DateTime<Utc>>),
    Untouched,
}

/// Folds the pending results for `path` in creation order. `base_override`
/// stands in for the stored context body (used for conflict dry runs).
fn fold_path(
    state: &CurrentPlanState,
    path: &str,
    base_override: Option<&str>,
) -> Result<PathOutcome, BuildError> {
    let Some(results) = state.plan_result.file_results_by_path.get(path) else {
        return Ok(PathOutcome::Untouched);
    };
    let mut updated: Option<String> = None;
    let mut from_replacements = false;
    let mut removed = false;
    let mut updated_at = None;

    for result in results.iter().filter(|r| r.is_pending()) {
        validate_result(result)?;
        updated_at = Some(result.created_at);

        if result.removed_file {
            removed = true;
            updated = None;
            from_replacements = false;
            continue;
        }
        removed = false;

        if let Some(content) = &result.content {
            if from_replacements {
                return Err(BuildError::OutOfOrder {
                    path: path.to_string(),
                });
            }
            updated = Some(content.clone());
            continue;
        }

        let base = match updated.take() {
            Some(current) => current,
            None => match base_override {
                Some(body) => body.to_string(),
                None => match state.contexts_by_path.get(path) {
                    Some(ctx) => ctx.body.clone(),
                    None if !result.context_sha.is_empty() => result.context_body.clone(),
                    None => {
                        return Err(BuildError::NoContext {
                            path: path.to_string(),
                        });
                    }
                },
            },
        };
        let pending = result.replacements.iter().filter(|r| r.rejected_at.is_none());
        let report = apply_replacements(&base, pending, true);
        if !report.all_succeeded() {
            return Err(BuildError::ReplacementFailed {
                path: path.to_string(),
            });
        }
        updated = Some(report.updated);
        from_replacements = true;
    }

    Ok(match (removed, updated) {
        (true, _) => PathOutcome::Removed(updated_at),
        (false, Some(content)) => PathOutcome::Content(content, updated_at),
        (false, None) => PathOutcome::Untouched,
    })
}

/// Final content of every path with pending results.
pub fn current_plan_files(state: &CurrentPlanState) -> Result<CurrentPlanFiles, BuildError> {
    let mut files = CurrentPlanFiles::default();
    for path in &state.plan_result.sorted_paths {
        match fold_path(state, path, None)? {
            PathOutcome::Content(content, at) => {
                files.files.insert(path.clone(), content);
                if let Some(at) = at {
                    files.updated_at_by_path.insert(path.clone(), at);
                }
            }
            PathOutcome::Removed(at) => {
                files.removed_by_path.insert(path.clone(), true);
                if let Some(at) = at {
                    files.updated_at_by_path.insert(path.clone(), at);
                }
            }
            PathOutcome::Untouched => {}
        }
    }
    Ok(files)
}

pub fn pending_content(state: &CurrentPlanState, path: &str) -> Result<Option<String>, BuildError> {
    Ok(match fold_path(state, path, None)? {
        PathOutcome::Content(content, _) => Some(content),
        PathOutcome::Removed(_) | PathOutcome::Untouched => None,
    })
}

/// Paths whose pending replacements no longer apply when their base is
/// replaced by the body in `updated_bodies`.
pub fn conflicted_paths(
    state: &CurrentPlanState,
    updated_bodies: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut conflicts = Vec::new();
    for (path, body) in updated_bodies {
        match fold_path(state, path, Some(body)) {
            Ok(_) => {}
            Err(BuildError::ReplacementFailed { .. }) => conflicts.push(path.clone()),
            Err(err) => {
                warn!(path = %path, "pending results cannot be folded: {err}");
                conflicts.push(path.clone());
            }
        }
    }
    conflicts
}

/// Flags `paths` for rebuild on every pending description that touched them.
/// Returns the ids of the descriptions that changed.
pub fn invalidate_build_paths(
    descriptions: &mut [ConvoMessageDescription],
    paths: &[String],
) -> Vec<String> {
    let mut touched = Vec::new();
    for desc in descriptions.iter_mut() {
        if desc.applied_at.is_some() || !desc.made_plan {
            continue;
        }
        let mut changed = false;
        for path in paths {
            if desc.files.contains(path) {
                desc.build_paths_invalidated.insert(path.clone(), true);
                changed = true;
            }
        }
        if changed {
            touched.push(desc.id.clone());
        }
    }
    touched
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::{DateTime, Utc};
    use plandex_core::{PlanFileResult, Replacement};

    pub fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
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

    pub fn edits(path: &str, base: &str, reps: Vec<Replacement>, secs: i64) -> PlanFileResult {
        PlanFileResult {
            content: None,
            replacements: reps,
            context_body: base.to_string(),
            context_sha: plandex_core::body_sha(base),
            ..whole(path, "", secs)
        }
    }
}
