use plandex_core::Replacement;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub updated: String,
    /// Indexes of replacements whose `old` was not found past the cursor.
    pub failed: Vec<usize>,
}

impl ApplyReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies `replacements` to `base` in order. Each search starts where the
/// previous insertion ended, so text that was just inserted is never matched.
///
/// With `halt_on_failure` the first miss stops the run; otherwise misses are
/// recorded and the remaining replacements are still attempted.
pub fn apply_replacements<'a, I>(base: &str, replacements: I, halt_on_failure: bool) -> ApplyReport
where
    I: IntoIterator<Item = &'a Replacement>,
{
    let mut updated = base.to_string();
    let mut cursor = 0usize;
    let mut failed = Vec::new();
    for (index, replacement) in replacements.into_iter().enumerate() {
        let found = if replacement.old.is_empty() {
            None
        } else {
            updated[cursor..].find(&replacement.old)
        };
        match found {
            Some(offset) => {
                let start = cursor + offset;
                updated.replace_range(start..start + replacement.old.len(), &replacement.new);
                cursor = start + replacement.new.len();
            }
            None => {
                debug!(index, "replacement did not match");
                failed.push(index);
                if halt_on_failure {
                    break;
                }
            }
        }
    }
    ApplyReport { updated, failed }
}

/// Applies and flags every replacement that failed to match.
pub fn apply_and_mark(base: &str, replacements: &mut [Replacement]) -> ApplyReport {
    let report = apply_replacements(base, replacements.iter(), false);
    for (index, replacement) in replacements.iter_mut().enumerate() {
        replacement.failed = report.failed.contains(&index);
    }
    report
}

/// Dry run against an arbitrary body; the indexes of replacements that no longer apply.
pub fn conflicting_replacements<'a, I>(current: &str, replacements: I) -> Vec<usize>
where
    I: IntoIterator<Item = &'a Replacement>,
{
    apply_replacements(current, replacements, false).failed
}

pub fn is_conflicted<'a, I>(current: &str, replacements: I) -> bool
where
    I: IntoIterator<Item = &'a Replacement>,
{
    !conflicting_replacements(current, replacements).is_empty()
}
