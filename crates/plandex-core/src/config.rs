use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::{Result, home_plandex_dir, runtime_dir};

pub const DEFAULT_API_HOST: &str = "https://api.plandex.ai";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub log: LogConfig,
    pub stream: StreamConfig,
    pub context: ContextConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            log: LogConfig::default(),
            stream: StreamConfig::default(),
            context: ContextConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_API_HOST.to_string(),
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Log directory; empty means `<home>/.plandex/logs`.
    pub dir: String,
    pub file_enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: String::new(),
            file_enabled: true,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        if !self.dir.trim().is_empty() {
            return Some(PathBuf::from(&self.dir));
        }
        home_plandex_dir().map(|dir| dir.join("logs"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub event_buffer: usize,
    pub heartbeat_timeout_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            heartbeat_timeout_seconds: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContextConfig {
    pub fetch_concurrency: usize,
    pub url_timeout_seconds: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 32,
            url_timeout_seconds: 20,
        }
    }
}

impl AppConfig {
    pub fn user_config_path() -> Option<PathBuf> {
        home_plandex_dir().map(|dir| dir.join("config.json"))
    }

    pub fn project_config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.json")
    }

    pub fn project_local_config_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.local.json")
    }

    /// Defaults, then user, project and local files, then env overrides.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let mut paths = Vec::new();
        if let Some(user) = Self::user_config_path() {
            paths.push(user);
        }
        paths.push(Self::project_config_path(workspace));
        paths.push(Self::project_local_config_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let value: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| anyhow!("invalid config {}: {e}", path.display()))?;
            merge_json_value(&mut merged, &value);
        }

        let mut cfg: AppConfig = serde_json::from_value(merged)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PLANDEX_API_HOST")
            && !host.trim().is_empty()
        {
            self.api.host = host.trim().trim_end_matches('/').to_string();
        }
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_config_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

pub fn merge_json_value(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #[test]
        fn merge_json_value_is_idempotent(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut base_value = json!(base);
            let overlay_value = json!(overlay);
            merge_json_value(&mut base_value, &overlay_value);
            let once = base_value.clone();
            merge_json_value(&mut base_value, &overlay_value);
            prop_assert_eq!(base_value, once);
        }
    }

    #[test]
    fn project_and_local_layers_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_dir(dir.path());
        fs::create_dir_all(&runtime).expect("mkdir");
        fs::write(
            runtime.join("config.json"),
            r#"{"api":{"timeout_seconds":5},"stream":{"event_buffer":8}}"#,
        )
        .expect("write project");
        fs::write(
            runtime.join("config.local.json"),
            r#"{"api":{"timeout_seconds":9}}"#,
        )
        .expect("write local");
        let cfg = AppConfig::load(dir.path()).expect("load");
        assert_eq!(cfg.api.timeout_seconds, 9);
        assert_eq!(cfg.api.max_retries, 3);
        assert_eq!(cfg.stream.event_buffer, 8);
        assert_eq!(cfg.stream.heartbeat_timeout_seconds, 16);
    }

    #[test]
    fn invalid_layer_reports_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = runtime_dir(dir.path());
        fs::create_dir_all(&runtime).expect("mkdir");
        fs::write(runtime.join("config.json"), "{not json").expect("write");
        let err = AppConfig::load(dir.path()).expect_err("invalid");
        assert!(err.to_string().contains("config.json"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::default();
        cfg.context.fetch_concurrency = 4;
        cfg.save(dir.path()).expect("save");
        let loaded = AppConfig::load(dir.path()).expect("load");
        assert_eq!(loaded.context.fetch_concurrency, 4);
    }
}
