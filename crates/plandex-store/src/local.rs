use anyhow::Result;
use plandex_core::MAIN_BRANCH;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{StorePaths, read_json, write_json};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentPlanSettings {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanBranchSettings {
    pub branch: String,
}

/// The v2 files are keyed by user id so several accounts can share a repo.
type ByUser<T> = BTreeMap<String, T>;

/// Project, current plan and current branch for one signed-in user.
pub struct LocalFiles {
    paths: StorePaths,
    user_id: String,
}

impl LocalFiles {
    pub fn new(paths: StorePaths, user_id: impl Into<String>) -> Self {
        Self {
            paths,
            user_id: user_id.into(),
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    fn get<T: Clone + for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        let by_user: Option<ByUser<T>> = read_json(path)?;
        Ok(by_user.and_then(|m| m.get(&self.user_id).cloned()))
    }

    fn put<T: Serialize + for<'de> Deserialize<'de>>(&self, path: &Path, value: Option<T>) -> Result<()> {
        let mut by_user: ByUser<T> = read_json(path)?.unwrap_or_default();
        match value {
            Some(v) => {
                by_user.insert(self.user_id.clone(), v);
            }
            None => {
                by_user.remove(&self.user_id);
            }
        }
        write_json(path, &by_user)
    }

    pub fn project_id(&self) -> Result<Option<String>> {
        let settings: Option<ProjectSettings> = self.get(&self.paths.projects_file()?)?;
        Ok(settings.map(|s| s.id).filter(|id| !id.is_empty()))
    }

    pub fn set_project_id(&self, project_id: &str) -> Result<()> {
        self.put(
            &self.paths.projects_file()?,
            Some(ProjectSettings {
                id: project_id.to_string(),
            }),
        )
    }

    pub fn current_plan_id(&self, project_id: &str) -> Result<Option<String>> {
        let settings: Option<CurrentPlanSettings> =
            self.get(&self.paths.current_plans_file(project_id))?;
        Ok(settings.map(|s| s.id).filter(|id| !id.is_empty()))
    }

    pub fn set_current_plan(&self, project_id: &str, plan_id: &str) -> Result<()> {
        self.put(
            &self.paths.current_plans_file(project_id),
            Some(CurrentPlanSettings {
                id: plan_id.to_string(),
            }),
        )
    }

    pub fn clear_current_plan(&self, project_id: &str) -> Result<()> {
        self.put::<CurrentPlanSettings>(&self.paths.current_plans_file(project_id), None)
    }

    /// Branch selected for `plan_id`; `main` when nothing was chosen.
    pub fn current_branch(&self, project_id: &str, plan_id: &str) -> Result<String> {
        let settings: Option<PlanBranchSettings> =
            self.get(&self.paths.plan_settings_file(project_id, plan_id))?;
        Ok(settings
            .map(|s| s.branch)
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| MAIN_BRANCH.to_string()))
    }

    pub fn set_current_branch(&self, project_id: &str, plan_id: &str, branch: &str) -> Result<()> {
        self.put(
            &self.paths.plan_settings_file(project_id, plan_id),
            Some(PlanBranchSettings {
                branch: branch.to_string(),
            }),
        )
    }

    /// Moves v1 files to their v2 counterparts under the current user. A v1
    /// file is removed only after its v2 file is written, and is left alone
    /// when the v2 file already exists. Returns the v2 files written.
    pub fn migrate(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        if self.paths.repo.is_some() {
            let v1 = self.paths.legacy_project_file()?;
            let v2 = self.paths.projects_file()?;
            if self.migrate_file::<ProjectSettings>(&v1, &v2)? {
                written.push(v2);
            }
        }
        let Some(project_id) = self.project_id()? else {
            return Ok(written);
        };

        let v1 = self.paths.legacy_current_plan_file(&project_id);
        let v2 = self.paths.current_plans_file(&project_id);
        if self.migrate_file::<CurrentPlanSettings>(&v1, &v2)? {
            written.push(v2);
        }

        let project_dir = self.paths.project_dir(&project_id);
        let Ok(entries) = fs::read_dir(&project_dir) else {
            return Ok(written);
        };
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let plan_id = entry.file_name().to_string_lossy().to_string();
            let v1 = self.paths.legacy_plan_settings_file(&project_id, &plan_id);
            let v2 = self.paths.plan_settings_file(&project_id, &plan_id);
            if self.migrate_file::<PlanBranchSettings>(&v1, &v2)? {
                written.push(v2);
            }
        }
        Ok(written)
    }

    fn migrate_file<T>(&self, v1: &Path, v2: &Path) -> Result<bool>
    where
        T: Serialize + for<'de> Deserialize<'de>,
    {
        if v2.exists() {
            return Ok(false);
        }
        let Some(legacy) = read_json::<T>(v1)? else {
            return Ok(false);
        };
        let wrapped: ByUser<T> = BTreeMap::from([(self.user_id.clone(), legacy)]);
        write_json(v2, &wrapped)?;
        fs::remove_file(v1)?;
        info!(from = %v1.display(), to = %v2.display(), "migrated settings file");
        Ok(true)
    }
}
