//! Error taxonomy for the plan execution engine and its user-facing rendering.
//!
//! Library code returns `anyhow::Result` and wraps recoverable domain failures in
//! [`PlandexError`] so callers can `downcast_ref` and branch on the class.

use anyhow::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlandexError {
    /// Credentials for the selected model are not fully satisfied.
    #[error("{explanation}")]
    AuthMissing { explanation: String },
    #[error("context limit exceeded: {reason}")]
    ContextLimit { reason: String, overage_tokens: usize },
    #[error("pending changes no longer apply to updated context: {}", .paths.join(", "))]
    ContextConflict { paths: Vec<String> },
    #[error("stream interrupted: {0}")]
    StreamTransient(String),
    #[error("stream failed: {0}")]
    StreamFatal(String),
    #[error("files changed on disk since they were loaded into context: {}", .paths.join(", "))]
    ApplyDrift { paths: Vec<String> },
    #[error("git failed: {0}")]
    VcsConflict(String),
    #[error("command failed with exit status {code}")]
    ExecFailure { code: i32, output: String },
}

impl PlandexError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, PlandexError::StreamTransient(_))
    }

    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            PlandexError::ExecFailure { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}

/// Exit code for any error; `ExecFailure` surfaces the command's own status.
pub fn exit_code(err: &Error) -> i32 {
    err.downcast_ref::<PlandexError>()
        .or_else(|| {
            err.chain()
                .find_map(|cause| cause.downcast_ref::<PlandexError>())
        })
        .map(PlandexError::exit_code)
        .unwrap_or(1)
}

/// Enhanced error with user-friendly message and recovery suggestions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedError {
    pub title: String,
    pub message: String,
    pub suggestions: Vec<String>,
    pub error_type: ErrorType,
    pub context: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorType {
    Auth,
    Context,
    Stream,
    Apply,
    Vcs,
    Exec,
    Network,
    Unknown,
}

impl EnhancedError {
    pub fn new(title: impl Into<String>, message: impl Into<String>, error_type: ErrorType) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            suggestions: Vec::new(),
            error_type,
            context: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions
            .extend(suggestions.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn into_error(self) -> Error {
        Error::new(self)
    }

    pub fn format(&self, verbose: bool) -> String {
        let mut output = String::new();
        output.push_str(&format!("{} {}\n", self.error_type.emoji(), self.title));
        for line in self.message.lines() {
            output.push_str(&format!("  {line}\n"));
        }
        if verbose && let Some(context) = &self.context {
            output.push_str(&format!("\n  Context: {context}\n"));
        }
        if !self.suggestions.is_empty() {
            output.push_str("\n  Suggestions:\n");
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("    {}. {}\n", i + 1, suggestion));
            }
        }
        output
    }
}

impl ErrorType {
    pub fn emoji(&self) -> &'static str {
        match self {
            ErrorType::Auth => "🔑",
            ErrorType::Context => "📚",
            ErrorType::Stream => "📡",
            ErrorType::Apply => "📝",
            ErrorType::Vcs => "🌱",
            ErrorType::Exec => "⚡",
            ErrorType::Network => "🌐",
            ErrorType::Unknown => "🚨",
        }
    }
}

impl fmt::Display for EnhancedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

impl std::error::Error for EnhancedError {}

impl From<&PlandexError> for EnhancedError {
    fn from(err: &PlandexError) -> Self {
        match err {
            PlandexError::AuthMissing { explanation } => {
                EnhancedError::new("Missing provider credentials", explanation, ErrorType::Auth)
                    .with_suggestions([
                        "Export the listed variables in your shell and retry",
                        "Or switch model packs with `plandex set-model`",
                    ])
            }
            PlandexError::ContextLimit { reason, .. } => {
                EnhancedError::new("Context limit exceeded", reason, ErrorType::Context)
                    .with_suggestions([
                        "Remove context you no longer need with `plandex rm`",
                        "Load directory maps or trees instead of full files",
                    ])
            }
            PlandexError::ContextConflict { .. } => {
                EnhancedError::new("Context conflict", err.to_string(), ErrorType::Context)
                    .with_suggestion("Run `plandex update` and confirm the rebuild")
            }
            PlandexError::StreamTransient(msg) => {
                EnhancedError::new("Stream interrupted", msg, ErrorType::Stream)
                    .with_suggestion("Reconnect with `plandex connect` or retry shortly")
            }
            PlandexError::StreamFatal(msg) => {
                EnhancedError::new("Stream failed", msg, ErrorType::Stream)
            }
            PlandexError::ApplyDrift { .. } => {
                EnhancedError::new("Files changed since context was loaded", err.to_string(), ErrorType::Apply)
                    .with_suggestion("Run `plandex update` to refresh context and rebuild")
            }
            PlandexError::VcsConflict(msg) => EnhancedError::new("Git error", msg, ErrorType::Vcs),
            PlandexError::ExecFailure { code, output } => EnhancedError::new(
                format!("Command failed with exit status {code}"),
                output,
                ErrorType::Exec,
            )
            .with_suggestion("Run `plandex debug` to let the model fix it"),
        }
    }
}

/// Renders any error for the terminal.
pub struct ErrorHandler {
    verbose: bool,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self { verbose: false }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn handle(&self, error: &Error) -> String {
        if let Some(domain) = error.downcast_ref::<PlandexError>() {
            return EnhancedError::from(domain).format(self.verbose);
        }
        for cause in error.chain() {
            if let Some(enhanced) = cause.downcast_ref::<EnhancedError>() {
                return enhanced.format(self.verbose);
            }
            if let Some(domain) = cause.downcast_ref::<PlandexError>() {
                let mut enhanced = EnhancedError::from(domain);
                if self.verbose {
                    enhanced = enhanced.with_context(format!("{error:#}"));
                }
                return enhanced.format(self.verbose);
            }
        }
        self.classify_error(&format!("{error:#}")).format(self.verbose)
    }

    fn classify_error(&self, error_message: &str) -> EnhancedError {
        let lower = error_message.to_lowercase();
        if lower.contains("timed out") || lower.contains("connection") || lower.contains("dns") {
            return EnhancedError::new("Network error", error_message, ErrorType::Network)
                .with_suggestions([
                    "Check your internet connection",
                    "Verify PLANDEX_API_HOST points at a reachable server",
                ]);
        }
        if lower.contains("invalid_token") || lower.contains("401") {
            return EnhancedError::new("Authentication error", error_message, ErrorType::Auth)
                .with_suggestion("Sign in again and retry");
        }
        EnhancedError::new("Error", error_message, ErrorType::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn exec_failure_surfaces_command_exit_code() {
        let err = anyhow::Error::new(PlandexError::ExecFailure {
            code: 3,
            output: "boom".to_string(),
        })
        .context("applying plan");
        assert_eq!(exit_code(&err), 3);
        assert_eq!(exit_code(&anyhow!("generic")), 1);
    }

    #[test]
    fn only_transient_stream_errors_retry() {
        assert!(PlandexError::StreamTransient("overloaded".into()).is_retriable());
        assert!(!PlandexError::StreamFatal("bad".into()).is_retriable());
    }

    #[test]
    fn handler_renders_domain_errors_with_suggestions() {
        let err = anyhow::Error::new(PlandexError::ContextConflict {
            paths: vec!["x.ts".to_string()],
        });
        let out = ErrorHandler::new().handle(&err);
        assert!(out.contains("Context conflict"));
        assert!(out.contains("x.ts"));
        assert!(out.contains("plandex update"));
    }

    #[test]
    fn handler_preserves_enhanced_errors() {
        let err = EnhancedError::new("Custom", "details", ErrorType::Apply)
            .with_suggestion("do it")
            .into_error();
        let out = ErrorHandler::new().handle(&err);
        assert!(out.contains("Custom"));
        assert!(out.contains("1. do it"));
    }

    #[test]
    fn handler_classifies_network_messages() {
        let out = ErrorHandler::new().handle(&anyhow!("request timed out"));
        assert!(out.contains("Network error"));
    }
}
