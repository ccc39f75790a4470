use anyhow::{Result, anyhow};
use plandex_api::{BuildMode, BuildPlanRequest, StreamBody, TellPlanRequest};
use plandex_context::ContextManager;
use plandex_core::{CurrentPlanState, PlanConfig};
use plandex_observe::EventKind;
use plandex_stream::{
    ContextLoader, StreamOutcome, StreamSession, StreamState, UiEvent, reconnect, start_stream,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tracing::info;

use crate::{PlanEngine, os_details};

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// What kind of turn to send and how the server should treat it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOptions {
    pub prompt: String,
    pub build_mode: BuildMode,
    pub chat_only: bool,
    pub user_continue: bool,
    pub user_debug: bool,
    pub application_debug: bool,
    pub auto_context: bool,
    pub smart_context: bool,
    pub exec_enabled: bool,
}

impl TurnOptions {
    pub fn tell(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Conversation only; nothing is planned or built.
    pub fn chat(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            build_mode: BuildMode::None,
            chat_only: true,
            ..Self::default()
        }
    }

    pub fn continue_plan() -> Self {
        Self {
            user_continue: true,
            ..Self::default()
        }
    }

    /// Applies the plan's automation settings. Chat turns never build.
    pub fn configured(mut self, cfg: &PlanConfig) -> Self {
        self.auto_context = cfg.auto_load_context;
        self.smart_context = cfg.smart_context;
        self.exec_enabled = cfg.can_exec;
        if !cfg.auto_build {
            self.build_mode = BuildMode::None;
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub stream: StreamOutcome,
    /// Plan state after the stream ended.
    pub state: CurrentPlanState,
}

impl TurnOutcome {
    pub fn finished(&self) -> bool {
        self.stream.state() == StreamState::Finished
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.state.plan_result.pending_paths().is_empty()
    }
}

/// Answers the server's mid-turn requests for files with the plan's context.
struct StreamContextLoader(Arc<ContextManager>);

impl ContextLoader for StreamContextLoader {
    fn load_files(&self, paths: &[String]) -> Result<String> {
        Ok(self.0.auto_load(paths)?.report())
    }
}

impl PlanEngine {
    fn stream_loader(&self) -> Option<Arc<dyn ContextLoader>> {
        self.context
            .clone()
            .map(|ctx| Arc::new(StreamContextLoader(ctx)) as Arc<dyn ContextLoader>)
    }

    /// Sends a prompt (or a continue) and follows the streamed reply to the end.
    pub fn tell(&self, opts: &TurnOptions, on_event: &mut dyn FnMut(&UiEvent)) -> Result<TurnOutcome> {
        self.ensure_not_streaming()?;
        let req = TellPlanRequest {
            prompt: opts.prompt.clone(),
            build_mode: opts.build_mode,
            auto_context: opts.auto_context,
            smart_context: opts.smart_context,
            is_chat_only: opts.chat_only,
            is_user_continue: opts.user_continue,
            is_user_debug: opts.user_debug,
            is_application_debug: opts.application_debug,
            exec_enabled: opts.exec_enabled,
            connect_stream: true,
            os_details: os_details(),
            auth_vars: self.auth_vars.clone(),
        };
        info!(plan_id = %self.plan_id, branch = %self.branch, chat_only = opts.chat_only, "sending turn");
        let body = self
            .api
            .tell_plan(&self.plan_id, &self.branch, &req)?
            .ok_or_else(|| anyhow!("server did not open a stream for this turn"))?;
        self.finish_turn(body, StreamState::Replying, on_event)
    }

    /// Builds descriptions that were planned but not built. `None` when
    /// nothing is waiting.
    pub fn build(&self, on_event: &mut dyn FnMut(&UiEvent)) -> Result<Option<TurnOutcome>> {
        let state = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
        if !state.has_pending_builds() {
            return Ok(None);
        }
        self.ensure_not_streaming()?;
        let req = BuildPlanRequest {
            connect_stream: true,
            os_details: os_details(),
            auth_vars: self.auth_vars.clone(),
        };
        let body = self
            .api
            .build_plan(&self.plan_id, &self.branch, &req)?
            .ok_or_else(|| anyhow!("server did not open a stream for the build"))?;
        self.finish_turn(body, StreamState::Describing, on_event).map(Some)
    }

    /// Rejoins the stream running on this branch.
    pub fn connect(&self, on_event: &mut dyn FnMut(&UiEvent)) -> Result<TurnOutcome> {
        let handle = reconnect(
            self.api.clone(),
            &self.plan_id,
            &self.branch,
            self.stream_loader(),
            self.stream_opts.clone(),
        )?;
        let stream = self.follow(handle, on_event)?;
        self.conclude(stream)
    }

    pub fn stop(&self) -> Result<()> {
        self.api.stop_plan(&self.plan_id, &self.branch)
    }

    fn finish_turn(
        &self,
        body: StreamBody,
        initial: StreamState,
        on_event: &mut dyn FnMut(&UiEvent),
    ) -> Result<TurnOutcome> {
        let session = StreamSession::new(self.api.clone(), self.plan_id.clone(), self.branch.clone())
            .with_loader(self.stream_loader());
        let handle = start_stream(body, session, initial, self.stream_opts.clone());
        let stream = self.follow(handle, on_event)?;
        self.conclude(stream)
    }

    pub(crate) fn follow(
        &self,
        handle: plandex_stream::StreamHandle,
        on_event: &mut dyn FnMut(&UiEvent),
    ) -> Result<StreamOutcome> {
        let mut canceled = false;
        loop {
            match handle.events().recv_timeout(CANCEL_POLL) {
                Ok(event) => on_event(&event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if !canceled && self.canceled() {
                canceled = true;
                handle.cancel();
            }
        }
        handle.wait()
    }

    fn conclude(&self, stream: StreamOutcome) -> Result<TurnOutcome> {
        self.record(
            EventKind::Stream,
            &json!({
                "planId": self.plan_id,
                "branch": self.branch,
                "state": stream.state(),
                "replyChars": stream.reply.len(),
            }),
        );
        if let Some(err) = stream.error.clone() {
            return Err(err.into());
        }
        let state = self.api.get_current_plan_state(&self.plan_id, &self.branch)?;
        Ok(TurnOutcome { stream, state })
    }
}
