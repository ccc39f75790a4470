use crate::error::ModelError;
use crate::{ChatMessage, ModelClient, ModelRequest, ModelTarget};
use anyhow::Result;
use plandex_api::StreamBody;
use plandex_api::client::retry_delay_ms;
use plandex_core::{ModelRoleConfig, Provider};
use plandex_errors::PlandexError;
use plandex_stream::{Frame, FrameDecoder, StreamMessageType};
use rand::Rng;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Retriable failures on the primary model before switching to its error
/// fallback.
pub const MAX_RETRIES_BEFORE_FALLBACK: u32 = 1;
/// Cap on large-context hops; packs are user-edited and may loop.
pub const MAX_FALLBACK_DEPTH: usize = 10;

const PEEK_CHUNK: usize = 4096;

/// Binds a role config to a concrete provider with credentials.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, cfg: &ModelRoleConfig) -> Result<ModelTarget>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries on a model with no error fallback.
    pub max_retries: u32,
    /// Retries once running on an error fallback.
    pub fallback_retries: u32,
    pub base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            fallback_retries: 1,
            base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    Error,
    LargeContext,
}

pub struct OpenedStream {
    /// Framed records, starting with whatever was read while checking the
    /// stream opened cleanly.
    pub body: StreamBody,
    pub model_id: String,
    pub provider: Provider,
    pub attempts: u32,
    pub cache_disabled: bool,
    pub fallback: Option<FallbackKind>,
}

pub struct FallbackDriver {
    client: Arc<dyn ModelClient>,
    resolver: Arc<dyn TargetResolver>,
    policy: RetryPolicy,
}

fn fatal(err: ModelError) -> anyhow::Error {
    let msg = err.message().to_string();
    anyhow::Error::new(err).context(PlandexError::StreamFatal(msg))
}

fn transient(err: ModelError) -> anyhow::Error {
    let msg = err.message().to_string();
    anyhow::Error::new(err).context(PlandexError::StreamTransient(msg))
}

/// Reads until the first record that is not an error or heartbeat. A model
/// error before any output fails the attempt; anything else is replayed in
/// front of the rest of the body.
fn peek_open(mut body: StreamBody) -> Result<StreamBody> {
    let mut decoder = FrameDecoder::new();
    let mut prefix = Vec::new();
    let mut chunk = [0_u8; PEEK_CHUNK];
    loop {
        let n = body.read(&mut chunk).map_err(|err| {
            anyhow::Error::new(ModelError::other(format!("stream read error: {err}")))
        })?;
        if n == 0 {
            return Ok(Box::new(Cursor::new(prefix)));
        }
        prefix.extend_from_slice(&chunk[..n]);
        for frame in decoder.push(&chunk[..n]) {
            match frame {
                Frame::Message(msg) if msg.message_type == StreamMessageType::Heartbeat => {}
                Frame::Message(msg) if msg.message_type == StreamMessageType::Error => {
                    let err = match &msg.model_error {
                        Some(info) => ModelError::from_info(info),
                        None => {
                            let text = msg.error_message();
                            ModelError::from_message(&text).unwrap_or_else(|| ModelError::other(text))
                        }
                    };
                    return Err(anyhow::Error::new(err));
                }
                _ => return Ok(Box::new(Cursor::new(prefix).chain(body))),
            }
        }
    }
}

impl FallbackDriver {
    pub fn new(client: Arc<dyn ModelClient>, resolver: Arc<dyn TargetResolver>) -> Self {
        Self {
            client,
            resolver,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn backoff(&self, failures: u32, retry_after: Option<u64>) -> Duration {
        if let Some(secs) = retry_after {
            return Duration::from_millis(secs.saturating_mul(1100));
        }
        let attempt = u8::try_from(failures.saturating_sub(1)).unwrap_or(u8::MAX);
        let jitter = match self.policy.base_ms / 5 {
            0 => 0,
            spread => rand::thread_rng().gen_range(0..spread),
        };
        retry_delay_ms(self.policy.base_ms, attempt, None) + Duration::from_millis(jitter)
    }

    /// Opens a reply for `role`, retrying retriable failures, moving to the
    /// error fallback after [`MAX_RETRIES_BEFORE_FALLBACK`] of them, walking
    /// large-context fallbacks on context overflow, and dropping cache
    /// control when the provider rejects it.
    pub fn open(&self, role: &ModelRoleConfig, messages: &[ChatMessage]) -> Result<OpenedStream> {
        let mut current = role.clone();
        let mut target = self.resolver.resolve(&current)?;
        let mut cache_disabled = false;
        let mut context_hops = 0_usize;
        let mut failures = 0_u32;
        let mut attempts = 0_u32;
        let mut fallback = None;

        loop {
            attempts += 1;
            let mut req = ModelRequest::for_role(&current, &target.model, messages.to_vec());
            if cache_disabled {
                req.cache_control = false;
            }
            let err = match self.client.open(&target, &req).and_then(peek_open) {
                Ok(body) => {
                    info!(
                        model_id = %current.model_id,
                        provider = %target.provider.provider,
                        attempt = attempts,
                        "model stream opened"
                    );
                    return Ok(OpenedStream {
                        body,
                        model_id: current.model_id,
                        provider: target.provider.provider,
                        attempts,
                        cache_disabled,
                        fallback,
                    });
                }
                Err(err) if err.downcast_ref::<PlandexError>().is_some() => return Err(err),
                Err(err) => ModelError::of(&err),
            };
            warn!(
                model_id = %current.model_id,
                attempt = attempts,
                kind = err.kind(),
                "model request failed: {}",
                err.message()
            );

            if matches!(err, ModelError::ContextTooLong(_)) {
                let Some(next) = current.large_context_fallback.as_deref().cloned() else {
                    return Err(fatal(err));
                };
                context_hops += 1;
                if context_hops > MAX_FALLBACK_DEPTH {
                    return Err(fatal(err));
                }
                target = self.resolver.resolve(&next)?;
                current = next;
                failures = 0;
                fallback = Some(FallbackKind::LargeContext);
                continue;
            }
            if matches!(err, ModelError::CacheSupport(_)) && req.cache_control {
                cache_disabled = true;
                continue;
            }

            let on_error_fallback = fallback == Some(FallbackKind::Error);
            if !on_error_fallback {
                let switch = !err.is_retriable() || failures + 1 > MAX_RETRIES_BEFORE_FALLBACK;
                if switch && let Some(next) = current.error_fallback.as_deref().cloned() {
                    target = self.resolver.resolve(&next)?;
                    current = next;
                    failures = 0;
                    fallback = Some(FallbackKind::Error);
                    continue;
                }
            }
            if !err.is_retriable() {
                return Err(fatal(err));
            }

            failures += 1;
            let limit = if on_error_fallback {
                self.policy.fallback_retries
            } else {
                self.policy.max_retries
            };
            if failures > limit {
                return Err(transient(err));
            }
            thread::sleep(self.backoff(failures, err.retry_after_seconds()));
        }
    }
}
