//! Plan execution for one plan branch: streamed turns, apply with VCS
//! rollback, the `_apply.sh` auto-debug loop, rebuilds after context
//! conflicts, and rewinding disk and plan state to an earlier commit.

use anyhow::{Result, anyhow};
use plandex_api::PlanApi;
use plandex_context::ContextManager;
use plandex_observe::{EventKind, Observer};
use plandex_stream::StreamOptions;
use plandex_tools::{ScriptRunner, Vcs};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

pub mod apply;
pub mod exec;
pub mod rebuild;
pub mod rewind;
pub mod rollback;
pub mod turn;

pub use apply::{ApplyFlags, ApplyOutcome, ApplyPrompter, AutoConfirm};
pub use exec::{ExecReport, command_debug_prompt, exec_debug_prompt};
pub use rebuild::Rebuilder;
pub use rewind::{RewindOutcome, RewindPlan, RewindTarget, applied_file_bodies};
pub use rollback::RollbackPlan;
pub use turn::{TurnOptions, TurnOutcome};

/// Everything needed to drive one `(plan, branch)` from the project root.
pub struct PlanEngine {
    api: Arc<dyn PlanApi>,
    vcs: Arc<dyn Vcs>,
    runner: Arc<dyn ScriptRunner>,
    root: PathBuf,
    plan_id: String,
    branch: String,
    stream_opts: StreamOptions,
    auth_vars: BTreeMap<String, String>,
    observer: Option<Observer>,
    context: Option<Arc<ContextManager>>,
    rebuilder: Option<Rebuilder>,
    cancel: Arc<AtomicBool>,
}

impl PlanEngine {
    pub fn new(
        api: Arc<dyn PlanApi>,
        vcs: Arc<dyn Vcs>,
        runner: Arc<dyn ScriptRunner>,
        root: impl Into<PathBuf>,
        plan_id: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            api,
            vcs,
            runner,
            root: root.into(),
            plan_id: plan_id.into(),
            branch: branch.into(),
            stream_opts: StreamOptions::default(),
            auth_vars: BTreeMap::new(),
            observer: None,
            context: None,
            rebuilder: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_stream_options(mut self, opts: StreamOptions) -> Self {
        self.stream_opts = opts;
        self
    }

    /// Provider credentials forwarded with every turn.
    pub fn with_auth_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.auth_vars = vars;
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Needed to refresh drifted context before an apply.
    pub fn with_context_manager(mut self, context: Arc<ContextManager>) -> Self {
        self.context = Some(context);
        self
    }

    /// Needed to rebuild paths invalidated by a context update.
    pub fn with_rebuilder(mut self, rebuilder: Rebuilder) -> Self {
        self.rebuilder = Some(rebuilder);
        self
    }

    pub fn api(&self) -> &Arc<dyn PlanApi> {
        &self.api
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Setting the flag cancels the stream or script currently running.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub(crate) fn canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Refuses to touch a branch that has a stream in flight.
    pub(crate) fn ensure_not_streaming(&self) -> Result<()> {
        let branches = self.api.list_branches(&self.plan_id)?;
        if let Some(active) = branches
            .iter()
            .find(|b| b.name == self.branch && b.status.is_active())
        {
            return Err(anyhow!(
                "plan is currently active on branch {}; stop it with `plandex stop` or wait for it to finish",
                active.name
            ));
        }
        Ok(())
    }

    pub(crate) fn record<T: Serialize>(&self, kind: EventKind, payload: &T) {
        if let Some(observer) = &self.observer
            && let Err(err) = observer.record(kind, payload)
        {
            warn!("failed to record event: {err}");
        }
    }
}

pub(crate) fn os_details() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}
