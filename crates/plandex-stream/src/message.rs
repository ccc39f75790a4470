use plandex_api::ApiError;
use plandex_core::{Context, ConvoMessageDescription, PlanStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessageType {
    #[serde(rename = "start")]
    Start,
    /// First record on a rejoined stream: the prompt and replies so far.
    #[serde(rename = "connectActive")]
    ConnectActive,
    #[serde(rename = "reply")]
    Reply,
    #[serde(rename = "describing")]
    Describing,
    #[serde(rename = "buildInfo")]
    BuildInfo,
    #[serde(rename = "repliesFinished")]
    RepliesFinished,
    #[serde(rename = "prompt_missing_file", alias = "promptMissingFile")]
    PromptMissingFile,
    /// The server waits on the stream until the client loads these files.
    #[serde(rename = "loadContext")]
    LoadContext,
    #[serde(rename = "loaded_context")]
    LoadedContext,
    #[serde(rename = "finished")]
    Finished,
    #[serde(rename = "aborted")]
    Aborted,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    /// Several records batched into one.
    #[serde(rename = "multi")]
    Multi,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub path: String,
    #[serde(default)]
    pub num_tokens: usize,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub removed: bool,
}

/// Provider failure reported inside the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelErrorInfo {
    /// `overloaded`, `rate_limited`, `context_too_long`, `cache_support` or `other`.
    pub kind: String,
    #[serde(default)]
    pub retry_after_seconds: Option<u64>,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub message_type: StreamMessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reply_chunk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<ConvoMessageDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_info: Option<BuildInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_error: Option<ModelErrorInfo>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub missing_file_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loaded_contexts: Vec<Context>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_context_files: Vec<String>,
    /// Sent with `start` or `connectActive` so a late joiner can catch up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_status: Option<PlanStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub init_prompt: String,
    /// Every reply of the running turn, the current one last.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_replies: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub init_build_only: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stream_messages: Vec<StreamMessage>,
}

impl StreamMessage {
    pub fn new(message_type: StreamMessageType) -> Self {
        Self {
            message_type,
            reply_chunk: String::new(),
            description: None,
            build_info: None,
            error: None,
            model_error: None,
            missing_file_path: String::new(),
            loaded_contexts: Vec::new(),
            load_context_files: Vec::new(),
            initial_status: None,
            init_prompt: String::new(),
            init_replies: Vec::new(),
            init_build_only: false,
            stream_messages: Vec::new(),
        }
    }

    pub fn reply(chunk: impl Into<String>) -> Self {
        let mut msg = Self::new(StreamMessageType::Reply);
        msg.reply_chunk = chunk.into();
        msg
    }

    pub fn connect_active(status: PlanStatus, prompt: impl Into<String>, replies: Vec<String>) -> Self {
        let mut msg = Self::new(StreamMessageType::ConnectActive);
        msg.initial_status = Some(status);
        msg.init_prompt = prompt.into();
        msg.init_replies = replies;
        msg
    }

    pub fn load_context(files: Vec<String>) -> Self {
        let mut msg = Self::new(StreamMessageType::LoadContext);
        msg.load_context_files = files;
        msg
    }

    pub fn multi(messages: Vec<StreamMessage>) -> Self {
        let mut msg = Self::new(StreamMessageType::Multi);
        msg.stream_messages = messages;
        msg
    }

    pub fn error(msg: impl Into<String>) -> Self {
        let mut out = Self::new(StreamMessageType::Error);
        out.error = Some(ApiError::other(500, msg));
        out
    }

    pub fn model_error(info: ModelErrorInfo) -> Self {
        let mut out = Self::new(StreamMessageType::Error);
        out.error = Some(ApiError::other(500, info.msg.clone()));
        out.model_error = Some(info);
        out
    }

    pub fn error_message(&self) -> String {
        if let Some(err) = &self.error {
            return err.msg.clone();
        }
        if let Some(err) = &self.model_error {
            return err.msg.clone();
        }
        "stream error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_and_load_context_records_decode() {
        let raw = r#"{"type":"multi","streamMessages":[{"type":"reply","replyChunk":"a"},{"type":"loadContext","loadContextFiles":["src/a.rs","b.md"]}]}"#;
        let msg: StreamMessage = serde_json::from_str(raw).expect("decode");
        assert_eq!(msg.message_type, StreamMessageType::Multi);
        assert_eq!(msg.stream_messages.len(), 2);
        assert_eq!(msg.stream_messages[0].reply_chunk, "a");
        assert_eq!(msg.stream_messages[1].message_type, StreamMessageType::LoadContext);
        assert_eq!(msg.stream_messages[1].load_context_files, vec!["src/a.rs", "b.md"]);
    }

    #[test]
    fn connect_active_carries_the_running_turn() {
        let raw = r#"{"type":"connectActive","initPrompt":"add tests","initReplies":["first","second"],"initBuildOnly":true,"missingFilePath":"x.rs"}"#;
        let msg: StreamMessage = serde_json::from_str(raw).expect("decode");
        assert_eq!(msg.message_type, StreamMessageType::ConnectActive);
        assert_eq!(msg.init_prompt, "add tests");
        assert_eq!(msg.init_replies, vec!["first", "second"]);
        assert!(msg.init_build_only);
        assert_eq!(msg.missing_file_path, "x.rs");
    }

    #[test]
    fn missing_file_accepts_both_spellings() {
        for raw in [r#"{"type":"promptMissingFile"}"#, r#"{"type":"prompt_missing_file"}"#] {
            let msg: StreamMessage = serde_json::from_str(raw).expect("decode");
            assert_eq!(msg.message_type, StreamMessageType::PromptMissingFile);
        }
    }
}
