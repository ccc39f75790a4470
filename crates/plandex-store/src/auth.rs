use anyhow::Result;
use plandex_api::ClientAuth;
use plandex_tools::fs::set_mode;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{read_json, write_json};

/// The signed-in session, `<home>/auth.json`.
pub struct AuthFile {
    path: PathBuf,
}

impl AuthFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<ClientAuth>> {
        read_json(&self.path)
    }

    pub fn save(&self, auth: &ClientAuth) -> Result<()> {
        write_json(&self.path, auth)?;
        set_mode(&self.path, 0o600)
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
