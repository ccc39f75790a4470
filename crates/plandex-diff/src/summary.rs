//! Human-readable summaries of pending work. The apply summary doubles as
//! the commit message.

use plandex_core::{ConvoMessageDescription, CurrentPlanState};
use std::collections::{BTreeMap, BTreeSet};

pub const APPLY_HEADER: &str = "🤖 Plandex → apply pending changes";
pub const BUILD_HEADER: &str = "🏗️  Build pending changes";
pub const REBUILD_HEADER: &str = "🏗️  Rebuild paths invalidated by context update";

fn descriptions_by_message(state: &CurrentPlanState) -> BTreeMap<&str, &ConvoMessageDescription> {
    state
        .convo_message_descriptions
        .iter()
        .filter(|d| !d.convo_message_id.is_empty())
        .map(|d| (d.convo_message_id.as_str(), d))
        .collect()
}

/// Commit message for applying every pending result.
pub fn apply_summary(state: &CurrentPlanState) -> String {
    let by_message = descriptions_by_message(state);
    let mut described: Vec<&ConvoMessageDescription> = Vec::new();
    for result in state.plan_result.pending_results() {
        if let Some(desc) = by_message.get(result.convo_message_id.as_str())
            && !described.iter().any(|d| d.id == desc.id)
        {
            described.push(desc);
        }
    }
    described.sort_by_key(|d| d.created_at);

    let mut lines = vec![APPLY_HEADER.to_string()];
    lines.extend(
        described
            .iter()
            .filter(|d| !d.commit_msg.trim().is_empty())
            .map(|d| format!("  ✏️  {}", d.commit_msg.trim())),
    );
    lines.join("\n")
}

/// Summary shown before a build. When every pending description only needs
/// paths rebuilt after a context update, the rebuild form is used.
pub fn build_summary(state: &CurrentPlanState) -> String {
    let mut pending: Vec<&ConvoMessageDescription> = state
        .convo_message_descriptions
        .iter()
        .filter(|d| d.has_pending_builds())
        .collect();
    pending.sort_by_key(|d| d.created_at);

    let rebuild_only = !pending.is_empty() && pending.iter().all(|d| d.did_build);
    if rebuild_only {
        let paths: BTreeSet<&String> = pending
            .iter()
            .flat_map(|d| d.build_paths_invalidated.iter())
            .filter(|(_, invalid)| **invalid)
            .map(|(path, _)| path)
            .collect();
        return rebuild_summary(paths);
    }

    let mut lines = vec![BUILD_HEADER.to_string()];
    for desc in pending {
        if !desc.commit_msg.trim().is_empty() {
            lines.push(format!("  ✏️  {}", desc.commit_msg.trim()));
        }
        let mut files: Vec<&String> = desc.files.iter().collect();
        files.sort();
        for path in files {
            if state.contexts_by_path.contains_key(path) {
                lines.push(format!("    • edit → {path}"));
            } else {
                lines.push(format!("    • new file → {path}"));
            }
        }
    }
    lines.join("\n")
}

pub fn rebuild_summary<I, S>(paths: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut lines = vec![REBUILD_HEADER.to_string()];
    lines.extend(
        paths
            .into_iter()
            .map(|p| format!("  • rebuild → {}", p.as_ref())),
    );
    lines.join("\n")
}

/// Per-description listing of pending new files and edits with replacement summaries.
pub fn pending_changes_summary(state: &CurrentPlanState) -> String {
    let by_message = descriptions_by_message(state);
    let mut groups: BTreeMap<(Option<chrono::DateTime<chrono::Utc>>, String), Vec<_>> =
        BTreeMap::new();
    for result in state.plan_result.pending_results() {
        let desc = by_message.get(result.convo_message_id.as_str());
        // undescribed results sort last
        let key = match desc {
            Some(d) => (Some(d.created_at), d.commit_msg.clone()),
            None => (None, String::new()),
        };
        groups.entry(key).or_default().push(result);
    }

    let mut described: Vec<_> = groups.iter().filter(|((at, _), _)| at.is_some()).collect();
    described.extend(groups.iter().filter(|((at, _), _)| at.is_none()));

    let mut out = Vec::new();
    for ((at, msg), results) in described {
        out.push(if at.is_some() && !msg.is_empty() {
            format!("📝 {msg}")
        } else {
            "📝 Changes".to_string()
        });
        let new_files: BTreeSet<&str> = results
            .iter()
            .filter(|r| r.replacements.is_empty() && r.content.is_some())
            .map(|r| r.path.as_str())
            .collect();
        let mut edits: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for r in results.iter().filter(|r| !r.replacements.is_empty()) {
            edits
                .entry(r.path.as_str())
                .or_default()
                .extend(r.replacements.iter().map(|rep| rep.summary.as_str()));
        }
        if !new_files.is_empty() {
            out.push("  📄 New files:".to_string());
            out.extend(new_files.iter().map(|p| format!("  • {p}")));
        }
        if !edits.is_empty() {
            out.push("  ✏️ Edits:".to_string());
            for (path, summaries) in edits {
                out.push(format!("    • {path}"));
                out.extend(
                    summaries
                        .iter()
                        .filter(|s| !s.is_empty())
                        .map(|s| format!("      ✅ {s}")),
                );
            }
        }
    }
    out.join("\n")
}
