//! A `ModelClient` that replays scripted replies and failures.

use anyhow::Result;
use plandex_api::StreamBody;
use plandex_llm::{ModelClient, ModelError, ModelRequest, ModelTarget};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::reply_body;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCall {
    pub model_id: String,
    pub model_name: String,
    pub request: ModelRequest,
}

#[derive(Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<std::result::Result<String, ModelError>>>,
    calls: Mutex<Vec<ModelCall>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedModelClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a successful reply streamed as a single reply record.
    pub fn reply(&self, text: &str) -> &Self {
        lock(&self.script).push_back(Ok(reply_body(text)));
        self
    }

    /// Queues a raw framed body.
    pub fn raw(&self, body: String) -> &Self {
        lock(&self.script).push_back(Ok(body));
        self
    }

    pub fn fail(&self, err: ModelError) -> &Self {
        lock(&self.script).push_back(Err(err));
        self
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        lock(&self.calls).clone()
    }
}

impl ModelClient for ScriptedModelClient {
    fn open(&self, target: &ModelTarget, req: &ModelRequest) -> Result<StreamBody> {
        lock(&self.calls).push(ModelCall {
            model_id: target.model.model_id.clone(),
            model_name: target.model_name.clone(),
            request: req.clone(),
        });
        let next = lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Err(ModelError::Other {
                msg: "model script exhausted".to_string(),
                retriable: false,
            }));
        match next {
            Ok(body) => Ok(Box::new(Cursor::new(body.into_bytes()))),
            Err(err) => Err(anyhow::Error::new(err)),
        }
    }
}
