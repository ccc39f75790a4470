//! A `Vcs` that keeps its state in memory and records every operation.

use anyhow::Result;
use plandex_errors::PlandexError;
use plandex_tools::{StashPopOutcome, Vcs};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct VcsState {
    repo: bool,
    dirty: bool,
    modified: Vec<String>,
    stashed: bool,
    pop_conflicts: Vec<String>,
    fail_on: Option<String>,
    head: u32,
    ops: Vec<String>,
    commits: Vec<String>,
}

/// Operations are recorded as short strings: `checkout <path>`, `stash push`,
/// `stash pop`, `checkout --ours <path>`, `stash drop`, `clear`, `commit`.
#[derive(Debug, Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn repo() -> Self {
        let vcs = Self::default();
        vcs.with(|s| s.repo = true);
        vcs
    }

    pub fn not_a_repo() -> Self {
        Self::default()
    }

    /// Marks `paths` as locally modified tracked files.
    pub fn with_modified(self, paths: &[&str]) -> Self {
        self.with(|s| {
            s.dirty = !paths.is_empty();
            s.modified = paths.iter().map(|p| p.to_string()).collect();
        });
        self
    }

    /// The next stash pop reports these files as overwritten by merge.
    pub fn with_pop_conflicts(self, paths: &[&str]) -> Self {
        self.with(|s| s.pop_conflicts = paths.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Makes the first operation whose name starts with `op` fail.
    pub fn failing_on(self, op: &str) -> Self {
        self.with(|s| s.fail_on = Some(op.to_string()));
        self
    }

    pub fn ops(&self) -> Vec<String> {
        self.with(|s| s.ops.clone())
    }

    pub fn commits(&self) -> Vec<String> {
        self.with(|s| s.commits.clone())
    }

    pub fn is_stashed(&self) -> bool {
        self.with(|s| s.stashed)
    }

    fn with<T>(&self, f: impl FnOnce(&mut VcsState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    fn record(&self, op: String) -> Result<()> {
        self.with(|s| {
            if s.fail_on.as_deref().is_some_and(|f| op.starts_with(f)) {
                s.fail_on = None;
                s.ops.push(format!("{op} (failed)"));
                return Err(PlandexError::VcsConflict(format!("{op} failed")).into());
            }
            s.ops.push(op);
            Ok(())
        })
    }
}

impl Vcs for FakeVcs {
    fn is_repo(&self) -> bool {
        self.with(|s| s.repo)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(self.with(|s| s.dirty))
    }

    fn modified_tracked_paths(&self) -> Result<Vec<String>> {
        Ok(self.with(|s| s.modified.clone()))
    }

    fn checkout_paths(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.record(format!("checkout {path}"))?;
            self.with(|s| s.modified.retain(|m| m != path));
        }
        Ok(())
    }

    fn stash_push(&self, _message: &str) -> Result<()> {
        self.record("stash push".to_string())?;
        self.with(|s| {
            s.stashed = true;
            s.dirty = false;
        });
        Ok(())
    }

    fn stash_pop(&self) -> Result<StashPopOutcome> {
        self.record("stash pop".to_string())?;
        let conflicts = self.with(|s| {
            s.stashed = false;
            std::mem::take(&mut s.pop_conflicts)
        });
        if conflicts.is_empty() {
            return Ok(StashPopOutcome::Restored);
        }
        for file in &conflicts {
            self.record(format!("checkout --ours {file}"))?;
        }
        self.record("stash drop".to_string())?;
        Ok(StashPopOutcome::ResolvedConflicts(conflicts))
    }

    fn clear_uncommitted(&self) -> Result<()> {
        self.record("clear".to_string())?;
        self.with(|s| s.dirty = false);
        Ok(())
    }

    fn add_all_and_commit(&self, message: &str) -> Result<()> {
        self.record("commit".to_string())?;
        self.with(|s| {
            s.head += 1;
            s.commits.push(message.to_string());
        });
        Ok(())
    }

    fn head_sha(&self) -> Result<Option<String>> {
        Ok(self.with(|s| (s.head > 0).then(|| format!("{:07x}", s.head))))
    }
}
