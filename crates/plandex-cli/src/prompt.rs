use anyhow::{Result, bail};
use plandex_agent::ApplyPrompter;
use plandex_store::SyncChoice;
use plandex_stream::UiEvent;
use plandex_tools::ExecOutcome;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::Path;
use tracing::info;

use crate::output::StreamPrinter;

/// Asks a yes/no question on stderr. Fails when there is no terminal to
/// answer on, so scripted runs need the matching `--yes` style flag.
pub(crate) fn confirm(question: &str) -> Result<bool> {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        bail!("{question}\nNo terminal to answer on; rerun with --yes to confirm");
    }
    eprint!("{question} (y/n) ");
    io::stderr().flush()?;
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(is_yes(&line))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Local edits to a synced settings file: push them unless the user
/// chooses to discard. Without a terminal they are pushed.
pub(crate) fn choose_sync(path: &Path, json: bool) -> SyncChoice {
    if json || !io::stdin().is_terminal() {
        info!(path = %path.display(), "pushing local settings changes");
        return SyncChoice::PushLocal;
    }
    let question = format!(
        "⚠️  {} has changes that aren't on the server. Push them? (no discards them)",
        path.display()
    );
    match confirm(&question) {
        Ok(false) => SyncChoice::Discard,
        _ => SyncChoice::PushLocal,
    }
}

/// Apply decisions taken on the terminal.
pub(crate) struct TerminalPrompter {
    printer: StreamPrinter,
}

impl TerminalPrompter {
    pub(crate) fn new(json: bool) -> Self {
        Self {
            printer: StreamPrinter::new(json),
        }
    }
}

impl ApplyPrompter for TerminalPrompter {
    fn confirm_apply(&mut self, summary: &str) -> Result<bool> {
        eprintln!("{summary}");
        confirm("Apply these changes?")
    }

    fn confirm_update(&mut self, paths: &[String]) -> Result<bool> {
        let listed: Vec<String> = paths.iter().map(|p| format!("  • {p}")).collect();
        eprintln!("Files changed since they were loaded into context:\n{}", listed.join("\n"));
        confirm("Update context and rebuild pending changes first?")
    }

    fn confirm_commit(&mut self, message: &str) -> Result<bool> {
        eprintln!("{message}");
        confirm("Commit these changes?")
    }

    fn confirm_exec(&mut self, script: &str) -> Result<bool> {
        eprintln!("The plan wants to run:\n\n{script}");
        confirm("Run it?")
    }

    fn rollback_after_failure(&mut self, outcome: &ExecOutcome) -> Result<bool> {
        eprintln!("🚨 Command failed with exit status {}", outcome.code);
        confirm("Roll back the files this apply wrote?")
    }

    fn on_stream_event(&mut self, event: &UiEvent) {
        self.printer.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_accept_short_and_long_forms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("n"));
        assert!(!is_yes(""));
    }
}
