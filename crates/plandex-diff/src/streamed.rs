use plandex_core::{ChangeType, LineRange, PlanFileResult, Replacement, StreamedChange};
use uuid::Uuid;

use crate::BuildError;

/// Converts line-addressed changes into ordered `(old, new)` replacements.
/// `old` ranges index `context_body`; `new` ranges index `proposed`, the
/// model's rewritten text. Replacements come back in base-line order.
pub fn replacements_from_changes(
    context_body: &str,
    proposed: &str,
    changes: &[StreamedChange],
) -> Result<Vec<Replacement>, BuildError> {
    let base_lines: Vec<&str> = context_body.lines().collect();
    let proposed_lines: Vec<&str> = proposed.lines().collect();

    let mut indexed: Vec<(usize, &StreamedChange)> = changes.iter().enumerate().collect();
    indexed.sort_by_key(|(_, change)| change.old.start_line);

    let mut out = Vec::with_capacity(indexed.len());
    for (index, change) in indexed {
        if change.old.is_empty() {
            return Err(BuildError::EmptyOld { index });
        }
        let mut old = slice_lines(&base_lines, change.old, index, "base")?;
        if old.is_empty() {
            return Err(BuildError::EmptyOld { index });
        }
        let inserted = if change.new.is_empty() {
            String::new()
        } else {
            slice_lines(&proposed_lines, change.new, index, "proposed text")?
        };

        let new = match change.change_type {
            ChangeType::Replace => {
                if inserted.is_empty() {
                    // deleting whole lines also takes one line break with them
                    if change.old.end_line < base_lines.len() {
                        old.push('\n');
                    } else if change.old.start_line > 1 {
                        old.insert(0, '\n');
                    }
                }
                inserted
            }
            ChangeType::Append if inserted.is_empty() => old.clone(),
            ChangeType::Append => format!("{old}\n{inserted}"),
            ChangeType::Prepend if inserted.is_empty() => old.clone(),
            ChangeType::Prepend => format!("{inserted}\n{old}"),
        };

        out.push(Replacement {
            id: Uuid::now_v7().to_string(),
            old,
            new,
            summary: change.short_summary.clone(),
            failed: false,
            rejected_at: None,
            streamed_change: Some(change.clone()),
        });
    }
    Ok(out)
}

fn slice_lines(
    lines: &[&str],
    range: LineRange,
    index: usize,
    side: &'static str,
) -> Result<String, BuildError> {
    if range.is_empty() || range.end_line > lines.len() {
        return Err(BuildError::OutOfRange {
            index,
            side,
            start: range.start_line,
            end: range.end_line,
            len: lines.len(),
        });
    }
    Ok(lines[range.start_line - 1..range.end_line].join("\n"))
}

/// A result is either a whole-file rewrite or a replacement list, never both,
/// and replacements need a base to apply to. Line replacements and
/// anchored inserts (append or prepend) don't share a result.
pub fn validate_result(result: &PlanFileResult) -> Result<(), BuildError> {
    if result.content.is_some() && !result.replacements.is_empty() {
        return Err(BuildError::MixedModes {
            path: result.path.clone(),
        });
    }
    let kinds = result
        .replacements
        .iter()
        .filter_map(|r| r.streamed_change.as_ref())
        .map(|c| c.change_type);
    let (mut replaces, mut inserts) = (false, false);
    for kind in kinds {
        match kind {
            ChangeType::Replace => replaces = true,
            ChangeType::Append | ChangeType::Prepend => inserts = true,
        }
    }
    if replaces && inserts {
        return Err(BuildError::MixedChangeTypes {
            path: result.path.clone(),
        });
    }
    if result.content.is_none() && !result.replacements.is_empty() && result.context_sha.is_empty()
    {
        return Err(BuildError::NoContext {
            path: result.path.clone(),
        });
    }
    Ok(())
}
