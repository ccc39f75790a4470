use plandex_core::{CurrentPlanFiles, CurrentPlanState};
use similar::TextDiff;

use crate::BuildError;
use crate::files::current_plan_files;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    pub path: String,
    pub text: String,
    pub added: usize,
    pub removed: usize,
}

pub fn unified_diff(path: &str, before: &str, after: &str) -> UnifiedDiff {
    let diff = TextDiff::from_lines(before, after);
    let mut added = 0;
    let mut removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => added += 1,
            similar::ChangeTag::Delete => removed += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    let text = diff
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string();
    UnifiedDiff {
        path: path.to_string(),
        text,
        added,
        removed,
    }
}

/// Diffs each pending path's base against its pending content. The base is
/// the loaded context body, or empty for new files.
pub fn render_plan_diffs(state: &CurrentPlanState) -> Result<Vec<UnifiedDiff>, BuildError> {
    let CurrentPlanFiles {
        files,
        removed_by_path,
        ..
    } = current_plan_files(state)?;
    let base_for = |path: &str| -> String {
        if let Some(ctx) = state.contexts_by_path.get(path) {
            return ctx.body.clone();
        }
        state
            .plan_result
            .file_results_by_path
            .get(path)
            .and_then(|results| results.first())
            .map(|r| r.context_body.clone())
            .unwrap_or_default()
    };
    let mut out = Vec::new();
    for path in &state.plan_result.sorted_paths {
        if let Some(content) = files.get(path) {
            let diff = unified_diff(path, &base_for(path), content);
            if diff.added + diff.removed > 0 {
                out.push(diff);
            }
        } else if removed_by_path.get(path).copied().unwrap_or(false) {
            out.push(unified_diff(path, &base_for(path), ""));
        }
    }
    Ok(out)
}
