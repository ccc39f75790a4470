use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use plandex_tools::fs::set_mode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::{read_json, write_json};

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCreds {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl OAuthCreds {
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_max: Option<OAuthCreds>,
}

/// `creds.json` for one user and org. Reads are cached after the first load;
/// every save writes through.
pub struct CredentialStore {
    path: PathBuf,
    cache: Mutex<Option<AccountCredentials>>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<AccountCredentials> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(creds) = cache.as_ref() {
            return Ok(creds.clone());
        }
        let creds: AccountCredentials = read_json(&self.path)?.unwrap_or_default();
        *cache = Some(creds.clone());
        Ok(creds)
    }

    /// Drops the cached copy so the next load sees changes made by another
    /// process.
    pub fn reload(&self) -> Result<AccountCredentials> {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.load()
    }

    pub fn save(&self, creds: &AccountCredentials) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
            set_mode(dir, DIR_MODE)?;
        }
        write_json(&self.path, creds)?;
        set_mode(&self.path, FILE_MODE)?;
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(creds.clone());
        debug!(path = %self.path.display(), "saved account credentials");
        Ok(())
    }

    pub fn set_claude_max(&self, oauth: Option<OAuthCreds>) -> Result<()> {
        let mut creds = self.load()?;
        creds.claude_max = oauth;
        self.save(&creds)
    }

    pub fn claude_max(&self) -> Result<Option<OAuthCreds>> {
        Ok(self.load()?.claude_max)
    }
}
