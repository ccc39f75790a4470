//! Settings files mirrored with the server.
//!
//! Each file has a `<file>.hash` sidecar holding the hash of the content last
//! agreed with the server. The hash is taken over the parsed, typed document,
//! so reformatting a file is not a change but editing a value is.

use anyhow::{Context, Result, anyhow, bail};
use plandex_api::CustomModelsInput;
use plandex_core::{ModelPack, sha256_hex};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFINITIONS: &str = include_str!("../schemas/definitions.json");
const DEFINITIONS_REF_PREFIX: &str = "definitions.json#";

fn embedded_schema(name: &str) -> Option<&'static str> {
    match name {
        "custom-models" => Some(include_str!("../schemas/custom-models.json")),
        "model-pack" => Some(include_str!("../schemas/model-pack.json")),
        _ => None,
    }
}

/// A document kind with an embedded schema.
pub trait SyncDocument: Serialize + DeserializeOwned + Clone {
    const SCHEMA: &'static str;
}

impl SyncDocument for CustomModelsInput {
    const SCHEMA: &'static str = "custom-models";
}

impl SyncDocument for ModelPack {
    const SCHEMA: &'static str = "model-pack";
}

/// Inlines the shared definitions into `schema` so every `$ref` is local.
fn bundle(schema: &str) -> Result<Value> {
    let mut root: Value = serde_json::from_str(schema).context("embedded schema is not JSON")?;
    let definitions: Value =
        serde_json::from_str(DEFINITIONS).context("embedded definitions are not JSON")?;
    let shared = definitions
        .get("$defs")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let Some(obj) = root.as_object_mut() else {
        bail!("embedded schema must be an object");
    };
    obj.remove("$id");
    let defs = obj
        .entry("$defs")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(defs) = defs.as_object_mut() {
        for (name, def) in shared {
            defs.entry(name).or_insert(def);
        }
    }
    rewrite_refs(&mut root);
    Ok(root)
}

fn rewrite_refs(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == "$ref"
                    && let Value::String(target) = child
                    && let Some(local) = target.strip_prefix(DEFINITIONS_REF_PREFIX)
                {
                    *target = format!("#{local}");
                    continue;
                }
                rewrite_refs(child);
            }
        }
        Value::Array(items) => items.iter_mut().for_each(rewrite_refs),
        _ => {}
    }
}

/// Checks `value` against the embedded schema `name`; all violations are
/// reported together.
pub fn validate_document(name: &str, value: &Value) -> Result<()> {
    let raw = embedded_schema(name).ok_or_else(|| anyhow!("no embedded schema named {name}"))?;
    let schema = bundle(raw)?;
    let validator = jsonschema::validator_for(&schema)
        .map_err(|e| anyhow!("embedded schema {name} does not compile: {e}"))?;
    let problems: Vec<String> = validator.iter_errors(value).map(|e| e.to_string()).collect();
    if problems.is_empty() {
        return Ok(());
    }
    bail!("{name} settings are invalid:\n  {}", problems.join("\n  "))
}

pub fn canonical_hash<T: Serialize>(doc: &T) -> Result<String> {
    let canonical = serde_json::to_string(doc)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncChoice {
    PushLocal,
    Discard,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    Unchanged,
    Pushed(T),
    Pulled(T),
}

pub struct SettingsFile<T> {
    path: PathBuf,
    _doc: PhantomData<T>,
}

impl<T: SyncDocument> SettingsFile<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".hash");
        PathBuf::from(name)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn read(&self) -> Result<Option<T>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", self.path.display()))?;
        validate_document(T::SCHEMA, &value)
            .with_context(|| format!("in {}", self.path.display()))?;
        let doc = serde_json::from_value(value)
            .with_context(|| format!("failed to load {}", self.path.display()))?;
        Ok(Some(doc))
    }

    pub fn stored_hash(&self) -> Option<String> {
        fs::read_to_string(self.hash_path())
            .ok()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
    }

    /// The document when it was edited since the last sync. A file without a
    /// sidecar counts as edited.
    pub fn local_changes(&self) -> Result<Option<T>> {
        let Some(doc) = self.read()? else {
            return Ok(None);
        };
        let hash = canonical_hash(&doc)?;
        if self.stored_hash().as_deref() == Some(hash.as_str()) {
            return Ok(None);
        }
        Ok(Some(doc))
    }

    /// Rewrites the file in canonical field order with a fresh sidecar.
    pub fn write(&self, doc: &T) -> Result<()> {
        let mut body = serde_json::to_string_pretty(doc)?;
        body.push('\n');
        plandex_tools::fs::atomic_write(&self.path, body.as_bytes())?;
        self.mark_pushed(doc)
    }

    pub fn mark_pushed(&self, doc: &T) -> Result<()> {
        let hash = canonical_hash(doc)?;
        plandex_tools::fs::atomic_write(&self.hash_path(), hash.as_bytes())?;
        debug!(path = %self.path.display(), %hash, "updated settings hash");
        Ok(())
    }

    /// Reconciles the file with the server copy. Local edits go through
    /// `choose`; pushing writes back whatever the server returns as canonical.
    pub fn sync<C, P>(&self, remote: Option<&T>, choose: C, push: P) -> Result<SyncOutcome<T>>
    where
        C: FnOnce(&T) -> SyncChoice,
        P: FnOnce(&T) -> Result<T>,
    {
        if let Some(local) = self.local_changes()? {
            match choose(&local) {
                SyncChoice::PushLocal => {
                    let canonical = push(&local)?;
                    self.write(&canonical)?;
                    info!(path = %self.path.display(), "pushed local settings");
                    return Ok(SyncOutcome::Pushed(canonical));
                }
                SyncChoice::Discard => {
                    info!(path = %self.path.display(), "discarded local settings");
                }
            }
        }

        let Some(remote) = remote else {
            return Ok(SyncOutcome::Unchanged);
        };
        let remote_hash = canonical_hash(remote)?;
        let current = match self.read() {
            Ok(Some(doc)) => Some(canonical_hash(&doc)?),
            _ => None,
        };
        if current.as_deref() == Some(remote_hash.as_str())
            && self.stored_hash().as_deref() == Some(remote_hash.as_str())
        {
            return Ok(SyncOutcome::Unchanged);
        }
        self.write(remote)?;
        Ok(SyncOutcome::Pulled(remote.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plandex_core::models::default_model_pack;
    use serde_json::json;

    #[test]
    fn builtin_pack_passes_its_schema() {
        let pack = serde_json::to_value(default_model_pack()).expect("json");
        validate_document("model-pack", &pack).expect("valid");
    }

    #[test]
    fn bad_documents_are_rejected_with_every_problem() {
        let mut pack = serde_json::to_value(default_model_pack()).expect("json");
        pack["planner"]["temperature"] = json!("hot");
        pack.as_object_mut().expect("object").remove("namer");
        let err = validate_document("model-pack", &pack).expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("model-pack settings are invalid"));
        assert!(msg.contains("hot"), "{msg}");
        assert!(msg.contains("namer"), "{msg}");
    }

    #[test]
    fn custom_models_resolve_shared_definitions() {
        let ok = json!({
            "customProviders": [{ "name": "local", "baseUrl": "http://localhost:1234/v1" }],
            "customModels": [],
            "customModelPacks": []
        });
        validate_document("custom-models", &ok).expect("valid");

        let bad = json!({
            "customProviders": [{ "name": "local", "baseUrl": "localhost" }]
        });
        assert!(validate_document("custom-models", &bad).is_err());
    }

    #[test]
    fn reformatting_is_not_a_local_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file: SettingsFile<ModelPack> = SettingsFile::new(dir.path().join("pack.json"));
        let pack = default_model_pack();
        file.write(&pack).expect("write");
        assert!(file.local_changes().expect("check").is_none());

        let compact = serde_json::to_string(&pack).expect("json");
        fs::write(file.path(), compact).expect("rewrite");
        assert!(file.local_changes().expect("check").is_none());

        let mut edited = pack.clone();
        edited.description = "mine".into();
        fs::write(file.path(), serde_json::to_string(&edited).expect("json")).expect("edit");
        assert_eq!(file.local_changes().expect("check"), Some(edited));
    }

    #[test]
    fn push_writes_back_the_server_form() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file: SettingsFile<ModelPack> = SettingsFile::new(dir.path().join("pack.json"));
        let mut local = default_model_pack();
        local.description = "local edit".into();
        fs::write(file.path(), serde_json::to_string(&local).expect("json")).expect("write");

        let outcome = file
            .sync(
                None,
                |_| SyncChoice::PushLocal,
                |doc| {
                    let mut canonical = doc.clone();
                    canonical.name = canonical.name.trim().to_string();
                    Ok(canonical)
                },
            )
            .expect("sync");
        let SyncOutcome::Pushed(pushed) = outcome else {
            panic!("expected push, got {outcome:?}");
        };
        assert_eq!(
            file.stored_hash(),
            Some(canonical_hash(&pushed).expect("hash"))
        );
        assert!(file.local_changes().expect("check").is_none());
    }

    #[test]
    fn discard_takes_the_server_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file: SettingsFile<ModelPack> = SettingsFile::new(dir.path().join("pack.json"));
        let remote = default_model_pack();
        let mut local = remote.clone();
        local.description = "stale".into();
        fs::write(file.path(), serde_json::to_string(&local).expect("json")).expect("write");

        let outcome = file
            .sync(Some(&remote), |_| SyncChoice::Discard, |_| bail!("must not push"))
            .expect("sync");
        assert_eq!(outcome, SyncOutcome::Pulled(remote.clone()));
        assert_eq!(file.read().expect("read"), Some(remote.clone()));

        let again = file
            .sync(Some(&remote), |_| SyncChoice::PushLocal, |_| bail!("must not push"))
            .expect("sync");
        assert_eq!(again, SyncOutcome::Unchanged);
    }
}
