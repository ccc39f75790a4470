//! Client-side files: repo-local project selection, per-plan branch selection,
//! the account session, provider credentials, and the JSON settings files
//! mirrored with the server.

use anyhow::{Context, Result, anyhow};
use plandex_core::{home_plandex_dir, runtime_dir};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

pub mod auth;
pub mod creds;
pub mod local;
pub mod sync;

pub use auth::AuthFile;
pub use creds::{AccountCredentials, CredentialStore, OAuthCreds};
pub use local::{CurrentPlanSettings, LocalFiles, PlanBranchSettings, ProjectSettings};
pub use sync::{SettingsFile, SyncChoice, SyncDocument, SyncOutcome, canonical_hash, validate_document};

/// Where every client file lives. `home` is `<home>/.plandex`; `repo` is the
/// repo-local `.plandex` directory when a project root is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub home: PathBuf,
    pub repo: Option<PathBuf>,
}

impl StorePaths {
    pub fn new(home: impl Into<PathBuf>, project_root: Option<&Path>) -> Self {
        Self {
            home: home.into(),
            repo: project_root.map(runtime_dir),
        }
    }

    pub fn detect(project_root: Option<&Path>) -> Result<Self> {
        let home = home_plandex_dir()
            .ok_or_else(|| anyhow!("cannot locate a home directory; set PLANDEX_HOME_DIR"))?;
        Ok(Self::new(home, project_root))
    }

    fn repo_dir(&self) -> Result<&Path> {
        self.repo
            .as_deref()
            .ok_or_else(|| anyhow!("not inside a plandex project"))
    }

    pub fn projects_file(&self) -> Result<PathBuf> {
        Ok(self.repo_dir()?.join("projects-v2.json"))
    }

    pub fn legacy_project_file(&self) -> Result<PathBuf> {
        Ok(self.repo_dir()?.join("project.json"))
    }

    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.home.join(project_id)
    }

    pub fn current_plans_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("current-plans-v2.json")
    }

    pub fn legacy_current_plan_file(&self, project_id: &str) -> PathBuf {
        self.project_dir(project_id).join("current_plan.json")
    }

    pub fn plan_settings_file(&self, project_id: &str, plan_id: &str) -> PathBuf {
        self.project_dir(project_id).join(plan_id).join("settings-v2.json")
    }

    pub fn legacy_plan_settings_file(&self, project_id: &str, plan_id: &str) -> PathBuf {
        self.project_dir(project_id).join(plan_id).join("settings.json")
    }

    pub fn creds_file(&self, user_id: &str, org_id: &str) -> PathBuf {
        self.home.join(user_id).join(org_id).join("creds.json")
    }

    pub fn auth_file(&self) -> PathBuf {
        self.home.join("auth.json")
    }

    pub fn custom_models_file(&self) -> PathBuf {
        self.home.join("custom-models.json")
    }

    pub fn default_model_settings_file(&self) -> PathBuf {
        self.home.join("default-model-settings.json")
    }

    pub fn plan_model_settings_file(&self, plan_id: &str) -> PathBuf {
        self.home.join(plan_id).join("model-settings.json")
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    plandex_tools::fs::atomic_write(path, body.as_bytes())
}
