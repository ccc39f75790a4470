use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub mod config;
pub mod models;
pub mod plan_config;
pub mod settings;
pub mod tokens;
pub mod types;

pub use config::{ApiConfig, AppConfig, ContextConfig, LogConfig, StreamConfig};
pub use models::{
    BaseModel, ExtraAuthVar, ModelPack, ModelProvider, ModelRole, ModelRoleConfig, Provider,
    ProviderOption, Publisher, ReasoningEffort,
};
pub use plan_config::{AutoMode, PlanConfig};
pub use types::*;

pub type Result<T> = anyhow::Result<T>;

pub const PLANDEX_DIR: &str = ".plandex";
pub const MAIN_BRANCH: &str = "main";
pub const APPLY_SCRIPT_PATH: &str = "_apply.sh";

pub const MAX_CONTEXT_BODY_SIZE: usize = 25 * 1024 * 1024;
pub const MAX_CONTEXT_COUNT: usize = 1000;
pub const MAX_TOTAL_CONTEXT_SIZE: usize = 1024 * 1024 * 1024;
pub const MAX_CONTEXT_MAP_PATHS: usize = 3000;
pub const MAX_CONTEXT_MAP_SINGLE_INPUT_SIZE: usize = 500 * 1024;
pub const MAX_CONTEXT_MAP_TOTAL_INPUT_SIZE: usize = 250 * 1024 * 1024;
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 200_000;
/// Percent added to token estimates before comparing against model limits.
pub const TOKEN_ESTIMATE_PADDING_PCT: usize = 10;

/// Repo-local runtime directory (`<repo>/.plandex`).
pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(PLANDEX_DIR)
}

/// User-level plandex directory. `PLANDEX_HOME_DIR` wins over `$HOME/.plandex`.
pub fn home_plandex_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("PLANDEX_HOME_DIR")
        && !dir.trim().is_empty()
    {
        return Some(PathBuf::from(dir));
    }
    let home = std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())?;
    Some(Path::new(&home).join(PLANDEX_DIR))
}

/// Line endings are folded to `\n` before hashing or storing a body.
pub fn normalize_body(body: &str) -> String {
    if !body.contains('\r') {
        return body.to_string();
    }
    body.replace("\r\n", "\n").replace('\r', "\n")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Sha of a context body after normalization.
pub fn body_sha(body: &str) -> String {
    sha256_hex(normalize_body(body).as_bytes())
}
