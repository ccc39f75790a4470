use plandex_stream::ModelErrorInfo;
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// A provider asking for a longer wait than this is treated as not retriable.
pub const MAX_RETRY_DELAY_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model overloaded: {0}")]
    Overloaded(String),
    #[error("rate limited: {msg}")]
    RateLimited {
        retry_after_seconds: Option<u64>,
        msg: String,
    },
    #[error("context too long: {0}")]
    ContextTooLong(String),
    #[error("cache control not supported: {0}")]
    CacheSupport(String),
    #[error("{msg}")]
    Other { msg: String, retriable: bool },
}

static RETRY_AFTER_MS_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""retry_after_ms"\s*:\s*(\d+)"#).ok());
static RETRY_AFTER_TEXT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"retry[_\-\s]?after[_\-\s]?(?:[:\s]+)?(\d+)(ms|seconds?|secs?|s)?").ok()
});
static TRY_AGAIN_IN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?:re)?try[_\-\s]+(?:again[_\-\s]+)?in[_\-\s]+(\d+)(ms|seconds?|secs?|s)?").ok()
});

const CONTEXT_TOO_LONG_HINTS: &[&str] = &[
    "maximum context length",
    "context length exceeded",
    "exceed context limit",
    "decrease input length",
    "too many tokens",
    "payload too large",
    "payload is too large",
    "input is too large",
    "input too large",
    "input is too long",
    "input too long",
];

const OVERLOADED_HINTS: &[&str] = &[
    "model_overloaded",
    "model overloaded",
    "server is overloaded",
    "model is currently overloaded",
    "overloaded_error",
    "resource has been exhausted",
];

impl ModelError {
    pub fn other(msg: impl Into<String>) -> Self {
        ModelError::Other {
            msg: msg.into(),
            retriable: true,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            ModelError::Overloaded(_) | ModelError::RateLimited { .. } => true,
            ModelError::Other { retriable, .. } => *retriable,
            ModelError::ContextTooLong(_) | ModelError::CacheSupport(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ModelError::Overloaded(_) => "overloaded",
            ModelError::RateLimited { .. } => "rate_limited",
            ModelError::ContextTooLong(_) => "context_too_long",
            ModelError::CacheSupport(_) => "cache_support",
            ModelError::Other { .. } => "other",
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            ModelError::RateLimited {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ModelError::Overloaded(msg)
            | ModelError::ContextTooLong(msg)
            | ModelError::CacheSupport(msg)
            | ModelError::RateLimited { msg, .. }
            | ModelError::Other { msg, .. } => msg,
        }
    }

    /// Classifies by message text alone; `None` when nothing matched.
    pub fn from_message(msg: &str) -> Option<Self> {
        let lower = msg.to_ascii_lowercase();
        if CONTEXT_TOO_LONG_HINTS.iter().any(|h| lower.contains(h)) {
            return Some(ModelError::ContextTooLong(msg.to_string()));
        }
        if OVERLOADED_HINTS.iter().any(|h| lower.contains(h)) {
            return Some(ModelError::Overloaded(msg.to_string()));
        }
        if lower.contains("cache control") || lower.contains("cache_control") {
            return Some(ModelError::CacheSupport(msg.to_string()));
        }
        None
    }

    /// Classifies a failed HTTP response. The message wins over the status
    /// code because providers disagree on codes for the same failure.
    pub fn from_status(status: u16, body: &str, retry_after_header: Option<u64>) -> Self {
        if let Some(err) = Self::from_message(body) {
            return err;
        }
        let msg = error_detail(body);
        let lower = body.to_ascii_lowercase();
        let err = match status {
            429 | 529 => {
                if lower.contains("exceeded your current quota") {
                    return ModelError::Other {
                        msg,
                        retriable: false,
                    };
                }
                ModelError::RateLimited {
                    retry_after_seconds: None,
                    msg,
                }
            }
            413 => return ModelError::ContextTooLong(msg),
            401 | 501 | 505 => {
                return ModelError::Other {
                    msg,
                    retriable: false,
                };
            }
            _ => ModelError::Other {
                retriable: status >= 500 || lower.contains("provider returned error"),
                msg,
            },
        };
        if !err.is_retriable() {
            return err;
        }
        let retry_after = retry_after_header.or_else(|| extract_retry_after(&lower));
        match (err, retry_after) {
            (err, Some(secs)) if secs > MAX_RETRY_DELAY_SECONDS => ModelError::Other {
                msg: err.message().to_string(),
                retriable: false,
            },
            (ModelError::RateLimited { msg, .. }, secs) => ModelError::RateLimited {
                retry_after_seconds: secs.filter(|s| *s > 0),
                msg,
            },
            (err, _) => err,
        }
    }

    /// Rebuilds the error a server reported inside a stream.
    pub fn from_info(info: &ModelErrorInfo) -> Self {
        let msg = info.msg.clone();
        match info.kind.as_str() {
            "overloaded" => ModelError::Overloaded(msg),
            "rate_limited" => ModelError::RateLimited {
                retry_after_seconds: info.retry_after_seconds,
                msg,
            },
            "context_too_long" => ModelError::ContextTooLong(msg),
            "cache_support" => ModelError::CacheSupport(msg),
            _ => ModelError::other(msg),
        }
    }

    pub fn to_info(&self) -> ModelErrorInfo {
        ModelErrorInfo {
            kind: self.kind().to_string(),
            retry_after_seconds: self.retry_after_seconds(),
            msg: self.message().to_string(),
        }
    }

    /// The `ModelError` behind an error, classifying bare messages when the
    /// chain carries none.
    pub fn of(err: &anyhow::Error) -> Self {
        if let Some(model_err) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ModelError>())
        {
            return model_err.clone();
        }
        let text = format!("{err:#}");
        Self::from_message(&text).unwrap_or_else(|| {
            let lower = text.to_ascii_lowercase();
            let retriable = !(lower.contains("status code: 401")
                || lower.contains("context deadline exceeded")
                || lower.contains("canceled"));
            ModelError::Other {
                msg: text,
                retriable,
            }
        })
    }
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// Retry hints embedded in an error body: `"retry_after_ms": N`,
/// `retry after N[s|ms]` or `try again in N seconds`.
pub fn extract_retry_after(lower_body: &str) -> Option<u64> {
    if let Some(re) = RETRY_AFTER_MS_JSON.as_ref()
        && let Some(caps) = re.captures(lower_body)
    {
        return caps[1].parse::<u64>().ok().map(|ms| ms / 1000);
    }
    for re in [RETRY_AFTER_TEXT.as_ref(), TRY_AGAIN_IN.as_ref()]
        .into_iter()
        .flatten()
    {
        if let Some(caps) = re.captures(lower_body) {
            let n = caps[1].parse::<u64>().ok()?;
            return Some(match caps.get(2).map(|m| m.as_str()) {
                Some("ms") => n / 1000,
                _ => n,
            });
        }
    }
    None
}
