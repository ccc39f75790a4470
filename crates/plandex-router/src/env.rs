use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Opt-in for reading AWS credentials from the shared credentials file.
pub const AWS_PROFILE_VAR: &str = "PLANDEX_AWS_PROFILE";

/// Where credential variables come from. Empty values count as unset.
pub trait AuthEnv: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;

    fn home_dir(&self) -> Option<PathBuf> {
        self.var("HOME").or_else(|| self.var("USERPROFILE")).map(PathBuf::from)
    }
}

pub struct ProcessEnv;

impl AuthEnv for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapEnv(BTreeMap<String, String>);

impl MapEnv {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_string(), value.to_string());
    }
}

impl AuthEnv for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(name).filter(|v| !v.is_empty()).cloned()
    }
}

/// Inline JSON, base64-encoded JSON, or a path to a JSON file. Always returns
/// the JSON text.
pub fn maybe_load_json(value: &str) -> Result<String> {
    if value.trim_start().starts_with('{') {
        return Ok(value.to_string());
    }
    if let Ok(decoded) = STANDARD.decode(value.trim())
        && let Ok(text) = String::from_utf8(decoded)
        && text.trim_start().starts_with('{')
    {
        return Ok(text);
    }
    fs::read_to_string(value).with_context(|| format!("failed to read {value}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub region: Option<String>,
}

impl AwsCredentials {
    pub fn into_vars(self, vars: &mut BTreeMap<String, String>) {
        vars.insert("AWS_ACCESS_KEY_ID".into(), self.access_key_id);
        vars.insert("AWS_SECRET_ACCESS_KEY".into(), self.secret_access_key);
        if let Some(region) = self.region {
            vars.insert("AWS_REGION".into(), region);
        }
        if let Some(token) = self.session_token {
            vars.insert("AWS_SESSION_TOKEN".into(), token);
        }
    }
}

fn ini_section(raw: &str, wanted: &str) -> Option<BTreeMap<String, String>> {
    let mut current: Option<String> = None;
    let mut found = None::<BTreeMap<String, String>>;
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = Some(name.trim().to_string());
            if current.as_deref() == Some(wanted) {
                found.get_or_insert_with(BTreeMap::new);
            }
            continue;
        }
        if current.as_deref() != Some(wanted) {
            continue;
        }
        if let Some((key, value)) = line.split_once('=')
            && let Some(section) = found.as_mut()
        {
            section.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    found
}

/// Reads `profile` from `~/.aws/credentials`, with the region from
/// `~/.aws/config`.
pub fn load_aws_profile(home: &Path, profile: &str) -> Option<AwsCredentials> {
    let creds_raw = fs::read_to_string(home.join(".aws").join("credentials")).ok()?;
    let section = ini_section(&creds_raw, profile)?;
    let access_key_id = section.get("aws_access_key_id")?.clone();
    let secret_access_key = section.get("aws_secret_access_key")?.clone();

    let config_name = if profile == "default" {
        "default".to_string()
    } else {
        format!("profile {profile}")
    };
    let region = fs::read_to_string(home.join(".aws").join("config"))
        .ok()
        .and_then(|raw| ini_section(&raw, &config_name))
        .and_then(|s| s.get("region").cloned())
        .or_else(|| section.get("region").cloned());

    debug!(profile, "loaded aws credentials from profile");
    Some(AwsCredentials {
        access_key_id,
        secret_access_key,
        session_token: section.get("aws_session_token").cloned(),
        region,
    })
}
