use anyhow::{Result, anyhow};
use plandex_agent::{PlanEngine, Rebuilder};
use plandex_api::{ClientAuth, CustomModelsInput, HttpApiClient, PlanApi};
use plandex_context::ContextManager;
use plandex_core::models::default_model_pack;
use plandex_core::{AppConfig, ModelPack, ModelRole};
use plandex_errors::{EnhancedError, ErrorType, PlandexError};
use plandex_llm::{FallbackDriver, HttpModelClient, RetryPolicy};
use plandex_observe::Observer;
use plandex_router::{ClaudeMaxAuth, CredentialResolver, ModelRouter, ProcessEnv};
use plandex_store::{AuthFile, CredentialStore, LocalFiles, SettingsFile, StorePaths, SyncDocument, SyncOutcome};
use plandex_stream::StreamOptions;
use plandex_tools::{GitVcs, PlatformScriptRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::prompt::choose_sync;

/// The plan a command acts on.
#[derive(Debug, Clone)]
pub(crate) struct PlanRef {
    pub(crate) project_id: String,
    pub(crate) plan_id: String,
    pub(crate) branch: String,
}

pub(crate) struct CliContext {
    pub(crate) cwd: PathBuf,
    pub(crate) root: Option<PathBuf>,
    pub(crate) config: AppConfig,
    pub(crate) paths: StorePaths,
    pub(crate) json: bool,
    auth: Option<ClientAuth>,
}

impl CliContext {
    pub(crate) fn new(cwd: PathBuf, root: Option<PathBuf>, config: AppConfig, json: bool) -> Result<Self> {
        let paths = StorePaths::detect(root.as_deref())?;
        let auth = AuthFile::new(paths.auth_file()).load()?;
        let ctx = Self {
            cwd,
            root,
            config,
            paths,
            json,
            auth,
        };
        if let (Some(_), Some(auth)) = (&ctx.root, &ctx.auth) {
            let moved = LocalFiles::new(ctx.paths.clone(), auth.user_id.clone()).migrate()?;
            if !moved.is_empty() {
                info!(files = moved.len(), "migrated legacy settings files");
            }
        }
        Ok(ctx)
    }

    pub(crate) fn auth(&self) -> Result<&ClientAuth> {
        self.auth.as_ref().ok_or_else(|| {
            EnhancedError::new(
                "Not signed in",
                format!("no account session at {}", self.paths.auth_file().display()),
                ErrorType::Auth,
            )
            .with_suggestion("Sign in with the plandex server, then run the command again")
            .into_error()
        })
    }

    pub(crate) fn signed_in(&self) -> bool {
        self.auth.is_some()
    }

    pub(crate) fn api(&self) -> Result<Arc<dyn PlanApi>> {
        let auth = self.auth()?.clone();
        Ok(Arc::new(HttpApiClient::new(&self.config.api, Some(auth))?))
    }

    pub(crate) fn project_root(&self) -> Result<&Path> {
        self.root.as_deref().ok_or_else(|| {
            EnhancedError::new(
                "No project",
                "not inside a plandex project",
                ErrorType::Context,
            )
            .with_suggestion("Run `plandex new` to start a plan here")
            .into_error()
        })
    }

    pub(crate) fn local(&self) -> Result<LocalFiles> {
        Ok(LocalFiles::new(self.paths.clone(), self.auth()?.user_id.clone()))
    }

    /// Local files for a project root chosen after startup, e.g. by `new`.
    pub(crate) fn local_at(&self, root: &Path) -> Result<LocalFiles> {
        let paths = StorePaths::new(self.paths.home.clone(), Some(root));
        Ok(LocalFiles::new(paths, self.auth()?.user_id.clone()))
    }

    pub(crate) fn project_id(&self) -> Result<String> {
        self.project_root()?;
        self.local()?.project_id()?.ok_or_else(|| {
            EnhancedError::new(
                "No project",
                "this directory has no project selected",
                ErrorType::Context,
            )
            .with_suggestion("Run `plandex new` to create one")
            .into_error()
        })
    }

    pub(crate) fn current_plan(&self) -> Result<PlanRef> {
        let project_id = self.project_id()?;
        let local = self.local()?;
        let plan_id = local.current_plan_id(&project_id)?.ok_or_else(|| {
            EnhancedError::new("No current plan", "no plan is selected", ErrorType::Context)
                .with_suggestions(["Run `plandex new` to start one", "Run `plandex cd <plan>` to pick one"])
                .into_error()
        })?;
        let branch = local.current_branch(&project_id, &plan_id)?;
        Ok(PlanRef {
            project_id,
            plan_id,
            branch,
        })
    }

    pub(crate) fn context_manager(&self, api: Arc<dyn PlanApi>, plan: &PlanRef) -> Result<ContextManager> {
        ContextManager::new(
            api,
            plan.plan_id.clone(),
            plan.branch.clone(),
            self.project_root()?,
            &self.config.context,
        )
    }

    /// Custom models, with any local edits to `custom-models.json` pushed first.
    pub(crate) fn custom_models(&self, api: &Arc<dyn PlanApi>) -> Result<CustomModelsInput> {
        let remote = api.get_custom_models_input()?;
        let push_api = api.clone();
        self.synced(self.paths.custom_models_file(), remote, move |local| {
            push_api.update_custom_models_input(local)?;
            push_api.get_custom_models_input()
        })
    }

    /// The model pack for a plan, or the default for new plans.
    pub(crate) fn model_pack(&self, api: &Arc<dyn PlanApi>, plan: Option<&PlanRef>) -> Result<ModelPack> {
        match plan {
            Some(plan) => {
                let mut settings = api.get_settings(&plan.plan_id, &plan.branch)?;
                let push_api = api.clone();
                let (plan_id, branch) = (plan.plan_id.clone(), plan.branch.clone());
                let base = settings.clone();
                settings.model_pack = self.synced(
                    self.paths.plan_model_settings_file(&plan.plan_id),
                    settings.model_pack,
                    move |local| {
                        let mut updated = base;
                        updated.model_pack = local.clone();
                        push_api.update_settings(&plan_id, &branch, &updated)?;
                        Ok(push_api.get_settings(&plan_id, &branch)?.model_pack)
                    },
                )?;
                Ok(settings.model_pack)
            }
            None => {
                let settings = api.get_default_settings()?;
                let push_api = api.clone();
                let base = settings.clone();
                self.synced(
                    self.paths.default_model_settings_file(),
                    settings.model_pack,
                    move |local| {
                        let mut updated = base;
                        updated.model_pack = local.clone();
                        push_api.update_default_settings(&updated)?;
                        Ok(push_api.get_default_settings()?.model_pack)
                    },
                )
            }
        }
    }

    fn synced<T, P>(&self, path: PathBuf, remote: T, push: P) -> Result<T>
    where
        T: SyncDocument,
        P: FnOnce(&T) -> Result<T>,
    {
        let file = SettingsFile::<T>::new(path);
        let json = self.json;
        let shown = file.path().to_path_buf();
        match file.sync(Some(&remote), |_| choose_sync(&shown, json), push)? {
            SyncOutcome::Unchanged => Ok(remote),
            SyncOutcome::Pushed(doc) | SyncOutcome::Pulled(doc) => Ok(doc),
        }
    }

    pub(crate) fn router(&self, custom: Option<&CustomModelsInput>, pack: &ModelPack) -> Result<ModelRouter> {
        let mut resolver = CredentialResolver::new(Arc::new(ProcessEnv));
        if let Some(auth) = &self.auth {
            let store = Arc::new(CredentialStore::new(self.paths.creds_file(&auth.user_id, &auth.org_id)));
            resolver = resolver.with_claude_max(Arc::new(ClaudeMaxAuth::new(store)?));
        }
        let mut router = ModelRouter::new(resolver);
        if let Some(custom) = custom {
            router = router.with_custom(custom);
        }
        Ok(router.for_pack(pack))
    }

    /// Pack used when there is no session to ask the server.
    pub(crate) fn offline_pack(&self) -> ModelPack {
        default_model_pack()
    }

    /// Everything a turn, apply or rewind needs, wired for the current plan.
    /// With `require_credentials` a pack that no provider can serve is an error.
    pub(crate) fn engine(&self, plan: &PlanRef, require_credentials: bool) -> Result<PlanEngine> {
        let root = self.project_root()?.to_path_buf();
        let api = self.api()?;
        let custom = self.custom_models(&api)?;
        let pack = self.model_pack(&api, Some(plan))?;
        let router = self.router(Some(&custom), &pack)?;

        let check = router.check_pack(&pack)?;
        if require_credentials && !check.all_satisfied {
            return Err(PlandexError::AuthMissing {
                explanation: check.explanation(),
            }
            .into());
        }
        debug!(pack = %pack.name, vars = check.auth_vars.len(), "credentials resolved");

        let client = HttpModelClient::new(Duration::from_secs(self.config.api.timeout_seconds))?;
        let driver = FallbackDriver::new(Arc::new(client), Arc::new(router)).with_policy(RetryPolicy {
            max_retries: u32::from(self.config.api.max_retries),
            fallback_retries: 1,
            base_ms: self.config.api.retry_base_ms,
        });
        let rebuilder = Rebuilder::new(driver, pack.role_config(ModelRole::Builder).clone());
        let context = Arc::new(self.context_manager(api.clone(), plan)?);

        let engine = PlanEngine::new(
            api,
            Arc::new(GitVcs::new(&root)),
            Arc::new(PlatformScriptRunner::default()),
            root.clone(),
            plan.plan_id.clone(),
            plan.branch.clone(),
        )
        .with_stream_options(StreamOptions::from(&self.config.stream))
        .with_auth_vars(check.auth_vars)
        .with_observer(Observer::new(&root)?)
        .with_context_manager(context)
        .with_rebuilder(rebuilder);

        install_interrupt_handler(&engine)?;
        Ok(engine)
    }
}

/// First Ctrl-C cancels the running stream or script; a second one exits.
#[cfg(unix)]
fn install_interrupt_handler(engine: &PlanEngine) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::flag;

    let cancel = engine.cancel_flag();
    for sig in [SIGINT, SIGTERM] {
        flag::register_conditional_shutdown(sig, 1, cancel.clone())
            .map_err(|e| anyhow!("failed to install signal handler: {e}"))?;
        flag::register(sig, cancel.clone()).map_err(|e| anyhow!("failed to install signal handler: {e}"))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn install_interrupt_handler(_engine: &PlanEngine) -> Result<()> {
    Ok(())
}
