use anyhow::{Result, anyhow};
use plandex_api::{PlanApi, StreamBody};
use plandex_core::{Branch, Context, ConvoMessageDescription, PlanStatus, StreamConfig};
use plandex_errors::PlandexError;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::fsm::{StreamEvent, StreamState, step};
use crate::frame::{Frame, FrameDecoder, Sentinel};
use crate::message::{BuildInfo, ModelErrorInfo, StreamMessage, StreamMessageType};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 4096;
const RAW_BUFFER: usize = 16;
const REPLY_JOIN: &str = "\n\n👇\n\n";

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    State(StreamState),
    Reply(String),
    /// The whole reply so far, replacing what was shown. Sent when a rejoined
    /// stream replays the running turn.
    ReplyReset(String),
    Description(Box<ConvoMessageDescription>),
    BuildInfo(BuildInfo),
    RepliesFinished,
    MissingFile(String),
    LoadedContext(Vec<Context>),
    /// The server is waiting while these files load into context.
    LoadingContext(Vec<String>),
    AutoLoaded(String),
    Error(String),
}

/// Loads files the server asks for in the middle of a turn. The server holds
/// the stream until the load call returns, so an implementation must reach
/// the server even when there is nothing to load.
pub trait ContextLoader: Send + Sync {
    /// Returns a short report for the user.
    fn load_files(&self, paths: &[String]) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub event_buffer: usize,
    pub heartbeat_timeout: Duration,
    pub max_reconnects: u8,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for StreamOptions {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            event_buffer: cfg.event_buffer.max(1),
            heartbeat_timeout: Duration::from_secs(cfg.heartbeat_timeout_seconds),
            max_reconnects: 3,
        }
    }
}

/// Identifies the stream on the server so the driver can stop or rejoin it.
#[derive(Clone)]
pub struct StreamSession {
    pub plan_id: String,
    pub branch: String,
    pub api: Option<Arc<dyn PlanApi>>,
    pub loader: Option<Arc<dyn ContextLoader>>,
}

impl StreamSession {
    pub fn new(api: Arc<dyn PlanApi>, plan_id: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            branch: branch.into(),
            api: Some(api),
            loader: None,
        }
    }

    pub fn detached() -> Self {
        Self {
            plan_id: String::new(),
            branch: String::new(),
            api: None,
            loader: None,
        }
    }

    pub fn with_loader(mut self, loader: Option<Arc<dyn ContextLoader>>) -> Self {
        self.loader = loader;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub final_state: Option<StreamState>,
    /// The reply as the user should see it: tokens in arrival order, reset to
    /// the server's copy when a rejoined stream replays the turn.
    pub reply: String,
    /// Prompt of the turn, when it was joined rather than started here.
    pub prompt: Option<String>,
    pub build_only: bool,
    pub auto_loaded: Vec<String>,
    /// Files the server asked for while no loader was attached.
    pub unloaded_context: Vec<String>,
    pub descriptions: Vec<ConvoMessageDescription>,
    pub build_infos: Vec<BuildInfo>,
    pub missing_file: Option<String>,
    pub model_error: Option<ModelErrorInfo>,
    pub error: Option<PlandexError>,
}

impl StreamOutcome {
    pub fn state(&self) -> StreamState {
        self.final_state.unwrap_or(StreamState::Error)
    }

    pub fn suppresses_commit(&self) -> bool {
        self.state().suppresses_commit()
    }
}

pub struct StreamHandle {
    events: Receiver<UiEvent>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<StreamState>>,
    join: JoinHandle<StreamOutcome>,
}

impl StreamHandle {
    pub fn events(&self) -> &Receiver<UiEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    /// Drains remaining events so the producer never blocks, then joins it.
    pub fn wait(self) -> Result<StreamOutcome> {
        Ok(self.collect()?.1)
    }

    pub fn collect(self) -> Result<(Vec<UiEvent>, StreamOutcome)> {
        let events: Vec<UiEvent> = self.events.iter().collect();
        let outcome = self
            .join
            .join()
            .map_err(|_| anyhow!("stream consumer panicked"))?;
        Ok((events, outcome))
    }
}

fn lock(state: &Mutex<StreamState>) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum RawChunk {
    Data(Vec<u8>),
    Eof,
    Failed(String),
}

fn spawn_reader(mut body: StreamBody) -> Receiver<RawChunk> {
    let (tx, rx) = sync_channel(RAW_BUFFER);
    // detached: a blocked read ends when the server closes the connection
    thread::spawn(move || {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match body.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.send(RawChunk::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.send(RawChunk::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = tx.send(RawChunk::Failed(err.to_string()));
                    break;
                }
            }
        }
    });
    rx
}

/// Starts consuming `body`. UI events arrive in order on the handle's bounded
/// channel; when it is full the consumer blocks.
pub fn start_stream(
    body: StreamBody,
    session: StreamSession,
    initial: StreamState,
    opts: StreamOptions,
) -> StreamHandle {
    let (ui_tx, ui_rx) = sync_channel(opts.event_buffer);
    let cancel = Arc::new(AtomicBool::new(false));
    let state = Arc::new(Mutex::new(initial));
    let mut consumer = Consumer {
        session,
        opts,
        ui_tx,
        cancel: cancel.clone(),
        state: state.clone(),
        outcome: StreamOutcome::default(),
        decoder: FrameDecoder::new(),
        reconnects: 0,
    };
    let join = thread::spawn(move || consumer.run(body));
    StreamHandle {
        events: ui_rx,
        cancel,
        state,
        join,
    }
}

/// Rejoins the active stream on `(plan_id, branch)`, resuming from the status the
/// server reports for the branch.
pub fn reconnect(
    api: Arc<dyn PlanApi>,
    plan_id: &str,
    branch: &str,
    loader: Option<Arc<dyn ContextLoader>>,
    opts: StreamOptions,
) -> Result<StreamHandle> {
    let branches = api.list_branches(plan_id)?;
    let status = branches
        .iter()
        .find(|b| b.name == branch)
        .map(|b| b.status)
        .ok_or_else(|| anyhow!("branch {branch} not found"))?;
    if !status.is_active() {
        return Err(anyhow!("no active stream on branch {branch}"));
    }
    let initial = StreamState::from_plan_status(status).unwrap_or(StreamState::Replying);
    let body = api.connect_plan(plan_id, branch)?;
    info!(plan_id, branch, ?initial, "reconnected to stream");
    Ok(start_stream(
        body,
        StreamSession::new(api, plan_id, branch).with_loader(loader),
        initial,
        opts,
    ))
}

/// Branches with a stream in flight; the caller asks the user when there are several.
pub fn active_branches(branches: &[Branch]) -> Vec<&Branch> {
    branches.iter().filter(|b| b.status.is_active()).collect()
}

struct Consumer {
    session: StreamSession,
    opts: StreamOptions,
    ui_tx: SyncSender<UiEvent>,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<StreamState>>,
    outcome: StreamOutcome,
    decoder: FrameDecoder,
    reconnects: u8,
}

impl Consumer {
    fn run(&mut self, body: StreamBody) -> StreamOutcome {
        let mut raw = spawn_reader(body);
        let mut last_activity = Instant::now();
        loop {
            if self.current().is_terminal() {
                break;
            }
            if self.cancel.load(Ordering::SeqCst) {
                self.handle_cancel();
                break;
            }
            match raw.recv_timeout(POLL_INTERVAL) {
                Ok(RawChunk::Data(bytes)) => {
                    for frame in self.decoder.push(&bytes) {
                        self.handle_frame(frame);
                        if self.current().is_terminal() {
                            break;
                        }
                    }
                    // a context load can hold the consumer for a while
                    last_activity = Instant::now();
                }
                Ok(RawChunk::Eof) => {
                    if let Some(frame) = self.decoder.finish() {
                        self.handle_frame(frame);
                    }
                    if self.current().is_terminal() {
                        break;
                    }
                    match self.try_reconnect("stream closed before finishing") {
                        Some(next) => {
                            raw = next;
                            last_activity = Instant::now();
                        }
                        None => break,
                    }
                }
                Ok(RawChunk::Failed(msg)) => {
                    match self.try_reconnect(&format!("stream read failed: {msg}")) {
                        Some(next) => {
                            raw = next;
                            last_activity = Instant::now();
                        }
                        None => break,
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    match self.try_reconnect("stream reader stopped") {
                        Some(next) => {
                            raw = next;
                            last_activity = Instant::now();
                        }
                        None => break,
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if last_activity.elapsed() >= self.opts.heartbeat_timeout {
                        match self.try_reconnect("no heartbeat from server") {
                            Some(next) => {
                                raw = next;
                                last_activity = Instant::now();
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        self.outcome.final_state = Some(self.current());
        std::mem::take(&mut self.outcome)
    }

    fn current(&self) -> StreamState {
        *lock(&self.state)
    }

    fn emit(&self, event: UiEvent) {
        // a dropped receiver means the UI went away; keep consuming
        let _ = self.ui_tx.send(event);
    }

    fn transition(&mut self, event: StreamEvent) {
        let mut guard = lock(&self.state);
        let from = *guard;
        if from == event.target() {
            // duplicate marker, e.g. `<DESC>` after a `describing` record
            return;
        }
        match step(from, event) {
            Ok(next) => {
                *guard = next;
                drop(guard);
                debug!(?from, ?next, "stream transition");
                self.emit(UiEvent::State(next));
            }
            Err(err) => {
                drop(guard);
                warn!("{err}");
                self.fail(PlandexError::StreamFatal(err.to_string()));
            }
        }
    }

    fn fail(&mut self, err: PlandexError) {
        let msg = err.to_string();
        self.outcome.error = Some(err);
        let mut guard = lock(&self.state);
        if !guard.is_terminal() {
            *guard = StreamState::Error;
            drop(guard);
            self.emit(UiEvent::Error(msg));
            self.emit(UiEvent::State(StreamState::Error));
        }
    }

    fn handle_cancel(&mut self) {
        info!(plan_id = %self.session.plan_id, branch = %self.session.branch, "stream canceled");
        self.transition(StreamEvent::Cancel);
        self.stop_server();
    }

    fn stop_server(&self) {
        if let Some(api) = &self.session.api
            && let Err(err) = api.stop_plan(&self.session.plan_id, &self.session.branch)
        {
            warn!("failed to stop plan stream: {err}");
        }
    }

    fn apply_initial_status(&mut self, status: Option<PlanStatus>) {
        if let Some(status) = status
            && let Some(state) = StreamState::from_plan_status(status)
        {
            *lock(&self.state) = state;
            self.emit(UiEvent::State(state));
        }
    }

    /// Takes over the running turn as the server reports it. The replayed
    /// replies replace anything received before a reconnect.
    fn rehydrate(&mut self, msg: StreamMessage) {
        self.apply_initial_status(msg.initial_status);
        if !msg.init_prompt.is_empty() {
            self.outcome.prompt = Some(msg.init_prompt);
        }
        self.outcome.build_only |= msg.init_build_only;
        if !msg.init_replies.is_empty() {
            let reply = msg.init_replies.join(REPLY_JOIN);
            self.outcome.reply = reply.clone();
            self.emit(UiEvent::ReplyReset(reply));
        }
        if !msg.missing_file_path.is_empty() {
            self.missing_file(msg.missing_file_path);
        }
    }

    fn missing_file(&mut self, path: String) {
        self.outcome.missing_file = Some(path.clone());
        self.emit(UiEvent::MissingFile(path));
    }

    fn load_context(&mut self, files: Vec<String>) {
        self.emit(UiEvent::LoadingContext(files.clone()));
        let Some(loader) = self.session.loader.clone() else {
            warn!(count = files.len(), "server asked for context but no loader is attached");
            self.outcome.unloaded_context.extend(files);
            return;
        };
        match loader.load_files(&files) {
            Ok(report) => {
                info!(count = files.len(), "loaded context requested by the stream");
                self.outcome.auto_loaded.extend(files);
                self.emit(UiEvent::AutoLoaded(report));
            }
            Err(err) => {
                self.fail(PlandexError::StreamFatal(format!("failed to load context: {err}")));
                self.stop_server();
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Sentinel(Sentinel::Describe) => self.transition(StreamEvent::Describe),
            Frame::Sentinel(Sentinel::Resume) => self.transition(StreamEvent::Resume),
            Frame::Sentinel(Sentinel::End) => self.transition(StreamEvent::Finish),
            Frame::Sentinel(Sentinel::Abort) => self.transition(StreamEvent::Abort),
            Frame::Text(text) => self.reply(text),
            Frame::Message(msg) => self.handle_message(*msg),
        }
    }

    fn reply(&mut self, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        if self.current() == StreamState::Describing {
            self.transition(StreamEvent::Resume);
        }
        self.outcome.reply.push_str(&chunk);
        self.emit(UiEvent::Reply(chunk));
    }

    fn handle_message(&mut self, msg: StreamMessage) {
        match msg.message_type {
            StreamMessageType::Heartbeat => {}
            StreamMessageType::Start => self.apply_initial_status(msg.initial_status),
            StreamMessageType::ConnectActive => self.rehydrate(msg),
            StreamMessageType::Multi => {
                for sub in msg.stream_messages {
                    if self.current().is_terminal() {
                        break;
                    }
                    self.handle_message(sub);
                }
            }
            StreamMessageType::LoadContext => self.load_context(msg.load_context_files),
            StreamMessageType::Reply => self.reply(msg.reply_chunk),
            StreamMessageType::Describing => {
                self.transition(StreamEvent::Describe);
                if let Some(desc) = msg.description {
                    self.outcome.descriptions.push(desc.clone());
                    self.emit(UiEvent::Description(Box::new(desc)));
                }
            }
            StreamMessageType::BuildInfo => {
                if let Some(info) = msg.build_info {
                    self.outcome.build_infos.push(info.clone());
                    self.emit(UiEvent::BuildInfo(info));
                }
            }
            StreamMessageType::RepliesFinished => self.emit(UiEvent::RepliesFinished),
            StreamMessageType::PromptMissingFile => self.missing_file(msg.missing_file_path),
            StreamMessageType::LoadedContext => {
                self.emit(UiEvent::LoadedContext(msg.loaded_contexts));
            }
            StreamMessageType::Finished => self.transition(StreamEvent::Finish),
            StreamMessageType::Aborted => self.transition(StreamEvent::Abort),
            StreamMessageType::Error => {
                let text = msg.error_message();
                self.outcome.model_error = msg.model_error;
                self.fail(PlandexError::StreamFatal(text));
            }
        }
    }

    fn try_reconnect(&mut self, reason: &str) -> Option<Receiver<RawChunk>> {
        let Some(api) = self.session.api.clone() else {
            self.fail(PlandexError::StreamTransient(reason.to_string()));
            return None;
        };
        while self.reconnects < self.opts.max_reconnects {
            self.reconnects += 1;
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            warn!(reason, attempt = self.reconnects, "reconnecting stream");
            match api.connect_plan(&self.session.plan_id, &self.session.branch) {
                Ok(body) => {
                    self.decoder = FrameDecoder::new();
                    return Some(spawn_reader(body));
                }
                Err(err) => warn!("reconnect failed: {err}"),
            }
        }
        self.fail(PlandexError::StreamTransient(reason.to_string()));
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ABORT, DESC, END, MSG_SEP, RESUME};
    use std::io::Cursor;
    use std::sync::mpsc::{Sender, channel};

    fn body(records: &[String]) -> StreamBody {
        let raw: String = records.iter().map(|r| format!("{r}{MSG_SEP}")).collect();
        Box::new(Cursor::new(raw.into_bytes()))
    }

    fn reply(text: &str) -> String {
        serde_json::to_string(&StreamMessage::reply(text)).expect("json")
    }

    struct ChannelBody {
        rx: Receiver<Vec<u8>>,
        pending: Vec<u8>,
    }

    impl Read for ChannelBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                match self.rx.recv() {
                    Ok(bytes) => self.pending = bytes,
                    Err(_) => return Ok(0),
                }
            }
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    fn channel_body() -> (Sender<Vec<u8>>, StreamBody) {
        let (tx, rx) = channel();
        (
            tx,
            Box::new(ChannelBody {
                rx,
                pending: Vec::new(),
            }),
        )
    }

    #[test]
    fn iterative_reply_describe_resume_finishes_in_order() {
        let handle = start_stream(
            body(&[
                reply("one "),
                DESC.to_string(),
                RESUME.to_string(),
                reply("two"),
                END.to_string(),
            ]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let (events, outcome) = handle.collect().expect("collect");
        assert_eq!(
            events,
            vec![
                UiEvent::Reply("one ".to_string()),
                UiEvent::State(StreamState::Describing),
                UiEvent::State(StreamState::Replying),
                UiEvent::Reply("two".to_string()),
                UiEvent::State(StreamState::Finished),
            ]
        );
        assert_eq!(outcome.reply, "one two");
        assert_eq!(outcome.state(), StreamState::Finished);
        assert!(!outcome.suppresses_commit());
    }

    #[test]
    fn duplicate_describe_marker_is_ignored() {
        let mut describing = StreamMessage::new(StreamMessageType::Describing);
        describing.description = None;
        let handle = start_stream(
            body(&[
                serde_json::to_string(&describing).expect("json"),
                DESC.to_string(),
                END.to_string(),
            ]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.state(), StreamState::Finished);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn server_abort_suppresses_commit() {
        let handle = start_stream(
            body(&[reply("partial"), ABORT.to_string()]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.state(), StreamState::Aborted);
        assert!(outcome.suppresses_commit());
    }

    #[test]
    fn error_record_is_fatal() {
        let handle = start_stream(
            body(&[
                reply("x"),
                serde_json::to_string(&StreamMessage::error("model exploded")).expect("json"),
            ]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.state(), StreamState::Error);
        assert_eq!(
            outcome.error,
            Some(PlandexError::StreamFatal("model exploded".to_string()))
        );
    }

    #[test]
    fn early_close_without_reconnect_target_is_transient() {
        let handle = start_stream(
            body(&[reply("cut off")]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.state(), StreamState::Error);
        assert!(matches!(outcome.error, Some(PlandexError::StreamTransient(_))));
    }

    #[test]
    fn cancel_moves_to_canceled_and_drains() {
        let (tx, stream) = channel_body();
        let handle = start_stream(
            stream,
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        tx.send(format!("{}{MSG_SEP}", reply("hi")).into_bytes())
            .expect("send");
        let first = handle
            .events()
            .recv_timeout(Duration::from_secs(5))
            .expect("first event");
        assert_eq!(first, UiEvent::Reply("hi".to_string()));
        handle.cancel();
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.state(), StreamState::Canceled);
        assert!(outcome.suppresses_commit());
        drop(tx);
    }

    #[test]
    fn missing_heartbeat_times_out() {
        let (tx, stream) = channel_body();
        let opts = StreamOptions {
            heartbeat_timeout: Duration::from_millis(150),
            ..StreamOptions::default()
        };
        let handle = start_stream(
            stream,
            StreamSession::detached(),
            StreamState::Replying,
            opts,
        );
        let outcome = handle.wait().expect("wait");
        assert!(matches!(outcome.error, Some(PlandexError::StreamTransient(ref m)) if m.contains("heartbeat")));
        drop(tx);
    }

    fn record(msg: &StreamMessage) -> String {
        serde_json::to_string(msg).expect("json")
    }

    struct RecordingLoader {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    impl RecordingLoader {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl ContextLoader for RecordingLoader {
        fn load_files(&self, paths: &[String]) -> Result<String> {
            self.calls.lock().expect("lock").push(paths.to_vec());
            if self.fail {
                return Err(anyhow!("disk on fire"));
            }
            Ok(format!("loaded {}", paths.len()))
        }
    }

    #[test]
    fn replayed_turn_replaces_the_reply_so_far() {
        let handle = start_stream(
            body(&[
                reply("hello "),
                record(&StreamMessage::connect_active(
                    PlanStatus::Replying,
                    "greet",
                    vec!["hello ".to_string()],
                )),
                reply("world"),
                END.to_string(),
            ]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let (events, outcome) = handle.collect().expect("collect");
        assert_eq!(outcome.reply, "hello world");
        assert_eq!(outcome.prompt.as_deref(), Some("greet"));
        assert!(events.contains(&UiEvent::ReplyReset("hello ".to_string())));
        assert_eq!(outcome.state(), StreamState::Finished);
    }

    #[test]
    fn earlier_replies_of_a_joined_turn_are_separated() {
        let handle = start_stream(
            body(&[
                record(&StreamMessage::connect_active(
                    PlanStatus::Describing,
                    "",
                    vec!["step one".to_string(), "step two".to_string()],
                )),
                END.to_string(),
            ]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let (events, outcome) = handle.collect().expect("collect");
        assert_eq!(events[0], UiEvent::State(StreamState::Describing));
        assert_eq!(outcome.reply, format!("step one{REPLY_JOIN}step two"));
    }

    #[test]
    fn batched_records_are_handled_in_order() {
        let handle = start_stream(
            body(&[
                record(&StreamMessage::multi(vec![
                    StreamMessage::reply("a"),
                    StreamMessage::reply("b"),
                    StreamMessage::new(StreamMessageType::Finished),
                    StreamMessage::reply("ignored"),
                ])),
            ]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let (events, outcome) = handle.collect().expect("collect");
        assert_eq!(
            events,
            vec![
                UiEvent::Reply("a".to_string()),
                UiEvent::Reply("b".to_string()),
                UiEvent::State(StreamState::Finished),
            ]
        );
        assert_eq!(outcome.reply, "ab");
    }

    #[test]
    fn load_context_requests_go_through_the_loader() {
        let loader = RecordingLoader::new(false);
        let files = vec!["src/a.rs".to_string(), "b.md".to_string()];
        let handle = start_stream(
            body(&[
                record(&StreamMessage::load_context(files.clone())),
                reply("done"),
                END.to_string(),
            ]),
            StreamSession::detached().with_loader(Some(loader.clone())),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let (events, outcome) = handle.collect().expect("collect");
        assert_eq!(*loader.calls.lock().expect("lock"), vec![files.clone()]);
        assert_eq!(outcome.auto_loaded, files);
        assert!(events.contains(&UiEvent::AutoLoaded("loaded 2".to_string())));
        assert_eq!(outcome.state(), StreamState::Finished);
    }

    #[test]
    fn empty_load_context_requests_still_reach_the_loader() {
        let loader = RecordingLoader::new(false);
        let handle = start_stream(
            body(&[record(&StreamMessage::load_context(Vec::new())), END.to_string()]),
            StreamSession::detached().with_loader(Some(loader.clone())),
            StreamState::Replying,
            StreamOptions::default(),
        );
        handle.wait().expect("wait");
        assert_eq!(loader.calls.lock().expect("lock").len(), 1);
    }

    #[test]
    fn failed_context_load_ends_the_stream() {
        let loader = RecordingLoader::new(true);
        let handle = start_stream(
            body(&[
                record(&StreamMessage::load_context(vec!["a.rs".to_string()])),
                reply("never shown"),
                END.to_string(),
            ]),
            StreamSession::detached().with_loader(Some(loader)),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.state(), StreamState::Error);
        assert!(matches!(outcome.error, Some(PlandexError::StreamFatal(ref m)) if m.contains("disk on fire")));
        assert!(outcome.reply.is_empty());
    }

    #[test]
    fn load_context_without_a_loader_is_recorded() {
        let handle = start_stream(
            body(&[record(&StreamMessage::load_context(vec!["a.rs".to_string()])), END.to_string()]),
            StreamSession::detached(),
            StreamState::Replying,
            StreamOptions::default(),
        );
        let outcome = handle.wait().expect("wait");
        assert_eq!(outcome.unloaded_context, vec!["a.rs".to_string()]);
        assert_eq!(outcome.state(), StreamState::Finished);
    }

    #[test]
    fn bounded_buffer_still_delivers_everything() {
        let records: Vec<String> = (0..50)
            .map(|i| reply(&format!("{i},")))
            .chain(std::iter::once(END.to_string()))
            .collect();
        let opts = StreamOptions {
            event_buffer: 1,
            ..StreamOptions::default()
        };
        let handle = start_stream(
            body(&records),
            StreamSession::detached(),
            StreamState::Replying,
            opts,
        );
        let (events, outcome) = handle.collect().expect("collect");
        assert_eq!(events.len(), 51);
        assert!(outcome.reply.starts_with("0,1,2,"));
        assert!(outcome.reply.ends_with("49,"));
    }
}
