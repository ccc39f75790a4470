use anyhow::{Context, Result};
use plandex_tools::fs::{atomic_write, file_mode, remove_empty_dirs, set_mode};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousFile {
    pub content: Vec<u8>,
    pub mode: Option<u32>,
}

/// What the files an apply is about to touch looked like beforehand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackPlan {
    pub previous: BTreeMap<String, PreviousFile>,
    /// Paths that did not exist and will be created.
    pub created: Vec<String>,
}

impl RollbackPlan {
    pub fn capture<'a, I>(root: &Path, paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut plan = Self::default();
        for path in paths {
            let abs = root.join(path);
            match fs::read(&abs) {
                Ok(content) => {
                    plan.previous.insert(
                        path.to_string(),
                        PreviousFile {
                            content,
                            mode: file_mode(&abs),
                        },
                    );
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    plan.created.push(path.to_string());
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to read {}", abs.display()));
                }
            }
        }
        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty() && self.created.is_empty()
    }

    /// Folds in a later capture. Paths already known keep their earliest state.
    pub fn absorb(&mut self, later: RollbackPlan) {
        for (path, prev) in later.previous {
            if self.created.contains(&path) {
                continue;
            }
            self.previous.entry(path).or_insert(prev);
        }
        for path in later.created {
            if !self.previous.contains_key(&path) && !self.created.contains(&path) {
                self.created.push(path);
            }
        }
    }

    /// Puts back previous contents and modes, deletes created files and any
    /// directories that only existed for them.
    pub fn restore(&self, root: &Path) -> Result<()> {
        for (path, prev) in &self.previous {
            let abs = root.join(path);
            atomic_write(&abs, &prev.content)?;
            if let Some(mode) = prev.mode {
                set_mode(&abs, mode)?;
            }
        }
        for path in &self.created {
            let abs = root.join(path);
            match fs::remove_file(&abs) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(path = %path, "failed to remove created file: {err}");
                    continue;
                }
            }
            if let Some(parent) = abs.parent() {
                remove_empty_dirs(root, parent)?;
            }
        }
        info!(
            restored = self.previous.len(),
            removed = self.created.len(),
            "rolled back applied files"
        );
        Ok(())
    }
}
