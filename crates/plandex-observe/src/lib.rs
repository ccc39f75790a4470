use anyhow::Result;
use chrono::Utc;
use plandex_core::runtime_dir;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod logging;

pub use logging::{LoggingGuard, init_logging, init_test_logging};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Stream,
    Context,
    Apply,
    Exec,
    Rewind,
    Settings,
}

impl EventKind {
    fn tag(&self) -> &'static str {
        match self {
            EventKind::Stream => "STREAM",
            EventKind::Context => "CONTEXT",
            EventKind::Apply => "APPLY",
            EventKind::Exec => "EXEC",
            EventKind::Rewind => "REWIND",
            EventKind::Settings => "SETTINGS",
        }
    }
}

/// Append-only event log at `<repo>/.plandex/observe.log`.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn record<T: Serialize>(&self, kind: EventKind, payload: &T) -> Result<()> {
        let line = format!(
            "{} {} {}",
            Utc::now().to_rfc3339(),
            kind.tag(),
            serde_json::to_string(payload)?
        );
        if self.verbose {
            eprintln!("[plandex] {line}");
        }
        tracing::debug!(kind = kind.tag(), "event recorded");
        self.append_log_line(&line)
    }

    /// Log a warning to the event log and to `tracing`.
    pub fn warn_log(&self, msg: &str) {
        tracing::warn!("{msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_are_rfc3339_prefixed_and_tagged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let observer = Observer::new(dir.path()).expect("observer");
        observer
            .record(EventKind::Apply, &json!({"files": 2}))
            .expect("record");
        observer.warn_log("stash pop conflicted");
        let raw = fs::read_to_string(observer.log_path()).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let ts = lines[0].split(' ').next().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(lines[0].contains(" APPLY {\"files\":2}"));
        assert!(lines[1].contains(" WARN stash pop conflicted"));
    }
}
