//! Turns model output into ordered replacements against a known base and
//! computes the pending content of every file in a plan.

use thiserror::Error;

pub mod files;
pub mod replace;
pub mod streamed;
pub mod summary;
pub mod unified;

pub use files::{conflicted_paths, current_plan_files, invalidate_build_paths, pending_content};
pub use replace::{ApplyReport, apply_replacements, conflicting_replacements, is_conflicted};
pub use streamed::{replacements_from_changes, validate_result};
pub use summary::{apply_summary, build_summary, pending_changes_summary, rebuild_summary};
pub use unified::{UnifiedDiff, render_plan_diffs, unified_diff};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("change {index} has an empty `old` section and can never match")]
    EmptyOld { index: usize },
    #[error("change {index} references lines {start}-{end} but the {side} has {len} lines")]
    OutOfRange {
        index: usize,
        side: &'static str,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("result for {path} mixes whole-file content with replacements")]
    MixedModes { path: String },
    #[error("result for {path} mixes line replacements with appends or prepends")]
    MixedChangeTypes { path: String },
    #[error("plan updates out of order: {path}")]
    OutOfOrder { path: String },
    #[error("no context for path: {path}")]
    NoContext { path: String },
    #[error("plan replacement failed - {path}")]
    ReplacementFailed { path: String },
}
