use anyhow::{Result, anyhow};
use std::path::Path;
use std::process::Command;

pub mod fs;
pub mod shell;
pub mod vcs;

pub use shell::{ExecOutcome, PlatformScriptRunner, ScriptRunner};
pub use vcs::{GitVcs, StashPopOutcome, Vcs};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Seam for spawning short-lived helper processes (git, systemctl).
pub trait CommandRunner: Send + Sync {
    fn run(&self, cwd: &Path, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cwd: &Path, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .current_dir(cwd)
            .args(args)
            .output()
            .map_err(|e| anyhow!("failed to spawn {program}: {e}"))?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Runs a process and returns stdout, or an error carrying status and both streams.
pub fn run_process(
    runner: &dyn CommandRunner,
    cwd: &Path,
    program: &str,
    args: &[&str],
) -> Result<String> {
    let output = runner.run(cwd, program, args)?;
    if !output.success() {
        return Err(anyhow!(
            "{} {:?} failed with status {}: {}",
            program,
            args,
            output
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            output.combined().trim()
        ));
    }
    Ok(output.stdout)
}

pub fn is_command_available(program: &str) -> bool {
    let locator = if cfg!(windows) { "where" } else { "which" };
    Command::new(locator)
        .arg(program)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
