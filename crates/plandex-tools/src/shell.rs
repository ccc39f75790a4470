//! Runs the plan's `_apply.sh` in its own process group so an interrupt takes
//! the shell and all of its descendants down together.

use anyhow::{Context, Result, anyhow};
use plandex_core::{APPLY_SCRIPT_PATH, runtime_dir};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(2);
#[cfg(target_os = "linux")]
const SYSTEMD_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub code: i32,
    /// Combined stdout and stderr in arrival order.
    pub output: String,
    pub interrupted: bool,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.interrupted
    }
}

pub trait ScriptRunner: Send + Sync {
    /// Runs `script` from the workspace root. Setting `cancel` interrupts the
    /// whole process group.
    fn run_script(&self, workspace: &Path, script: &str, cancel: &AtomicBool)
    -> Result<ExecOutcome>;
}

#[derive(Debug, Clone)]
pub struct PlatformScriptRunner {
    /// Mirror output to the terminal while capturing it.
    pub echo: bool,
    pub use_systemd: bool,
}

impl Default for PlatformScriptRunner {
    fn default() -> Self {
        Self {
            echo: true,
            use_systemd: true,
        }
    }
}

impl PlatformScriptRunner {
    pub fn quiet() -> Self {
        Self {
            echo: false,
            use_systemd: false,
        }
    }
}

impl ScriptRunner for PlatformScriptRunner {
    fn run_script(
        &self,
        workspace: &Path,
        script: &str,
        cancel: &AtomicBool,
    ) -> Result<ExecOutcome> {
        let script_path = write_script(workspace, script)?;
        let result = self.run_script_file(workspace, &script_path, cancel);
        if let Err(err) = std::fs::remove_file(&script_path) {
            warn!(path = %script_path.display(), "failed to remove apply script: {err}");
        }
        result
    }
}

impl PlatformScriptRunner {
    fn run_script_file(
        &self,
        workspace: &Path,
        script_path: &Path,
        cancel: &AtomicBool,
    ) -> Result<ExecOutcome> {
        let scope = if self.use_systemd { systemd_scope_unit() } else { None };
        let (reader, writer) = std::io::pipe()?;

        let mut child = {
            let mut command = match &scope {
                Some(unit) => systemd_command(unit, script_path),
                None => shell_command(script_path),
            };
            command
                .current_dir(workspace)
                .stdin(Stdio::inherit())
                .stdout(Stdio::from(writer.try_clone()?))
                .stderr(Stdio::from(writer));
            configure_process_group(&mut command);
            match command.spawn() {
                Ok(child) => child,
                Err(err) if scope.is_some() => {
                    warn!("systemd scope unavailable, running directly: {err}");
                    return PlatformScriptRunner {
                        echo: self.echo,
                        use_systemd: false,
                    }
                    .run_script_file(workspace, script_path, cancel);
                }
                Err(err) => {
                    return Err(anyhow!("failed to start {}: {err}", script_path.display()));
                }
            }
            // command drops here so the reader sees EOF once the group exits
        };
        info!(pid = child.id(), scope = ?scope, "started apply script");

        let echo = self.echo;
        let collector = thread::spawn(move || collect_output(reader, echo));
        let forwarder = SignalForwarder::install(child.id())?;

        let mut interrupted = false;
        let mut kill_deadline: Option<Instant> = None;
        let status = loop {
            if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
                break status;
            }
            let signalled = forwarder.as_ref().is_some_and(|f| f.fired());
            if (cancel.load(Ordering::SeqCst) || signalled) && !interrupted {
                interrupted = true;
                interrupt_group(&child, scope.as_deref());
                kill_deadline = Some(Instant::now() + KILL_GRACE);
            }
            if let Some(deadline) = kill_deadline
                && Instant::now() >= deadline
            {
                warn!(pid = child.id(), "script ignored interrupt, killing group");
                kill_group(&mut child, scope.as_deref());
                kill_deadline = None;
            }
        };
        if let Some(forwarder) = forwarder {
            interrupted |= forwarder.fired();
            forwarder.close();
        }
        if interrupted {
            // reap background jobs still holding the output pipe
            kill_group(&mut child, scope.as_deref());
        }

        let output = collector
            .join()
            .map_err(|_| anyhow!("output collector panicked"))??;
        let code = exit_code(&status);
        debug!(code, interrupted, "apply script finished");
        Ok(ExecOutcome {
            code,
            output,
            interrupted,
        })
    }
}

/// Writes the normalized script to `<repo>/.plandex/_apply.sh`.
pub fn write_script(workspace: &Path, script: &str) -> Result<PathBuf> {
    let dir = runtime_dir(workspace);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(APPLY_SCRIPT_PATH);
    std::fs::write(&path, normalize_script(script))
        .with_context(|| format!("failed to write {}", path.display()))?;
    crate::fs::set_mode(&path, 0o755)?;
    Ok(path)
}

/// Replaces any shebang, `set -` or `trap` lines with a strict bash header.
pub fn normalize_script(script: &str) -> String {
    let body: Vec<&str> = script
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("#!") || trimmed.starts_with("set -") || trimmed.starts_with("trap "))
        })
        .collect();
    let body = body.join("\n");
    format!(
        "#!/usr/bin/env bash\nset -euo pipefail\n\n{}\n",
        body.trim_matches('\n')
    )
}

fn collect_output(mut reader: std::io::PipeReader, echo: bool) -> Result<String> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    let stdout = std::io::stdout();
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if echo {
            let mut handle = stdout.lock();
            let _ = handle.write_all(&buf[..n]);
            let _ = handle.flush();
        }
        collected.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&collected).to_string())
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(not(windows))]
fn shell_command(script_path: &Path) -> Command {
    let mut command = Command::new("bash");
    command.arg(script_path);
    command
}

#[cfg(windows)]
fn shell_command(script_path: &Path) -> Command {
    let mut command = Command::new("bash");
    command.arg(script_path.to_string_lossy().replace('\\', "/"));
    command
}

fn systemd_command(unit: &str, script_path: &Path) -> Command {
    let mut command = Command::new("systemd-run");
    command.args([
        "--user",
        "--scope",
        "--quiet",
        &format!("--unit={unit}"),
        "-p",
        "KillMode=control-group",
        "-p",
        "CollectMode=inactive-or-failed",
        "--slice=user.slice",
        "bash",
    ]);
    command.arg(script_path);
    command
}

/// Unit name for a transient scope when the user systemd manager answers
/// within a second, `None` otherwise.
#[cfg(target_os = "linux")]
fn systemd_scope_unit() -> Option<String> {
    let mut child = Command::new("systemctl")
        .args(["--user", "is-system-running"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    let status = match child.wait_timeout(SYSTEMD_PROBE_TIMEOUT) {
        Ok(Some(status)) => status,
        _ => {
            let _ = child.kill();
            let _ = child.wait();
            debug!("systemd check timed out");
            return None;
        }
    };
    let mut state = String::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_string(&mut state);
    }
    let state = state.trim();
    if status.success() || state == "running" || state == "degraded" {
        Some(format!("plandex-{}", uuid::Uuid::now_v7()))
    } else {
        debug!(state, "systemd user manager not usable");
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn systemd_scope_unit() -> Option<String> {
    None
}

#[cfg(unix)]
fn configure_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(windows)]
fn configure_process_group(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn configure_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn interrupt_group(child: &Child, _scope: Option<&str>) {
    // the child leads its own group, so its pid is the pgid
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGINT);
    }
}

#[cfg(not(unix))]
fn interrupt_group(child: &Child, scope: Option<&str>) {
    let mut child_ref = ChildRef(child.id());
    child_ref.kill_tree(scope);
}

#[cfg(unix)]
fn kill_group(child: &mut Child, scope: Option<&str>) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    if let Some(unit) = scope {
        stop_scope(unit);
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child, scope: Option<&str>) {
    ChildRef(child.id()).kill_tree(scope);
    let _ = child.kill();
}

fn stop_scope(unit: &str) {
    let _ = Command::new("systemctl")
        .args(["--user", "stop", &format!("{unit}.scope")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
struct ChildRef(u32);

#[cfg(not(unix))]
impl ChildRef {
    fn kill_tree(&mut self, scope: Option<&str>) {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &self.0.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Some(unit) = scope {
            stop_scope(unit);
        }
    }
}

/// Forwards terminal signals to the child's process group while it runs.
#[cfg(unix)]
struct SignalForwarder {
    handle: signal_hook::iterator::Handle,
    fired: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

#[cfg(unix)]
impl SignalForwarder {
    fn install(pid: u32) -> Result<Option<Self>> {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT])?;
        let handle = signals.handle();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();
        let pgid = pid as libc::pid_t;
        let thread = thread::spawn(move || {
            for sig in signals.forever() {
                fired_flag.store(true, Ordering::SeqCst);
                unsafe {
                    libc::kill(-pgid, sig);
                }
            }
        });
        Ok(Some(Self {
            handle,
            fired,
            thread,
        }))
    }

    fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn close(self) {
        self.handle.close();
        let _ = self.thread.join();
    }
}

#[cfg(not(unix))]
struct SignalForwarder;

#[cfg(not(unix))]
impl SignalForwarder {
    fn install(_pid: u32) -> Result<Option<Self>> {
        Ok(None)
    }

    fn fired(&self) -> bool {
        false
    }

    fn close(self) {}
}
