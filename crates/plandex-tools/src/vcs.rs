//! Narrow port over git. All operations share one process-wide lock so index
//! state is never touched by two callers at once.

use anyhow::Result;
use plandex_errors::PlandexError;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{CommandOutput, CommandRunner, SystemRunner};

pub const AUTO_STASH_MESSAGE: &str = "Plandex auto-stash";

const POP_CONFLICT_MSG: &str = "overwritten by merge";
const POP_CONFLICT_FILES_END: &str = "commit your changes";
const POP_CONFLICT_ABORTING: &str = "Aborting";

static GIT_MUTEX: Mutex<()> = Mutex::new(());

fn git_lock() -> MutexGuard<'static, ()> {
    GIT_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StashPopOutcome {
    Restored,
    /// Pop hit "overwritten by merge"; listed files were checked out from ours and the stash dropped.
    ResolvedConflicts(Vec<String>),
}

pub trait Vcs: Send + Sync {
    fn is_repo(&self) -> bool;
    fn has_uncommitted_changes(&self) -> Result<bool>;
    /// Paths with uncommitted modifications to tracked files.
    fn modified_tracked_paths(&self) -> Result<Vec<String>>;
    fn checkout_paths(&self, paths: &[String]) -> Result<()>;
    fn stash_push(&self, message: &str) -> Result<()>;
    fn stash_pop(&self) -> Result<StashPopOutcome>;
    /// `reset --hard` followed by `clean -d -f`.
    fn clear_uncommitted(&self) -> Result<()>;
    fn add_all_and_commit(&self, message: &str) -> Result<()>;
    fn head_sha(&self) -> Result<Option<String>>;
}

pub struct GitVcs {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl GitVcs {
    pub fn new(root: &Path) -> Self {
        Self::with_runner(root, Arc::new(SystemRunner))
    }

    pub fn with_runner(root: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.to_path_buf(),
            runner,
        }
    }

    fn git(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!(args = ?args, "git");
        self.runner.run(&self.root, "git", args)
    }

    fn git_ok(&self, args: &[&str], what: &str) -> Result<CommandOutput> {
        let out = self.git(args)?;
        if !out.success() {
            return Err(PlandexError::VcsConflict(format!(
                "{what}: {}",
                out.combined().trim()
            ))
            .into());
        }
        Ok(out)
    }
}

impl Vcs for GitVcs {
    fn is_repo(&self) -> bool {
        let _lock = git_lock();
        self.git(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.success() && out.stdout.trim() == "true")
            .unwrap_or(false)
    }

    fn has_uncommitted_changes(&self) -> Result<bool> {
        let _lock = git_lock();
        let out = self.git_ok(&["status", "--porcelain"], "error checking for uncommitted changes")?;
        Ok(!out.stdout.trim().is_empty())
    }

    fn modified_tracked_paths(&self) -> Result<Vec<String>> {
        let _lock = git_lock();
        let out = self.git_ok(&["status", "--porcelain"], "error reading git status")?;
        Ok(parse_porcelain_tracked(&out.stdout))
    }

    fn checkout_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let _lock = git_lock();
        for path in paths {
            self.git_ok(
                &["checkout", "--", path],
                &format!("error checking out {path}"),
            )?;
        }
        Ok(())
    }

    fn stash_push(&self, message: &str) -> Result<()> {
        let _lock = git_lock();
        self.git_ok(
            &["stash", "push", "--include-untracked", "-m", message],
            "error creating git stash",
        )?;
        Ok(())
    }

    fn stash_pop(&self) -> Result<StashPopOutcome> {
        let _lock = git_lock();
        let out = self.git(&["stash", "pop"])?;
        if out.success() {
            return Ok(StashPopOutcome::Restored);
        }
        let combined = out.combined();
        if !combined.contains(POP_CONFLICT_MSG) {
            return Err(PlandexError::VcsConflict(format!(
                "error popping git stash: {}",
                combined.trim()
            ))
            .into());
        }
        let files = parse_pop_conflict_files(&combined);
        warn!(files = ?files, "stash pop conflicted, keeping applied versions");
        for file in &files {
            self.git_ok(
                &["checkout", "--ours", file],
                &format!("error resetting file {file}"),
            )?;
        }
        self.git_ok(&["stash", "drop"], "error dropping git stash")?;
        Ok(StashPopOutcome::ResolvedConflicts(files))
    }

    fn clear_uncommitted(&self) -> Result<()> {
        let _lock = git_lock();
        self.git_ok(&["reset", "--hard"], "error resetting changes")?;
        self.git_ok(&["clean", "-d", "-f"], "error cleaning untracked files")?;
        Ok(())
    }

    fn add_all_and_commit(&self, message: &str) -> Result<()> {
        let _lock = git_lock();
        self.git_ok(&["add", "."], "error adding files to git repository")?;
        self.git_ok(
            &["commit", "-m", message, "--allow-empty"],
            "error committing files to git repository",
        )?;
        Ok(())
    }

    fn head_sha(&self) -> Result<Option<String>> {
        let _lock = git_lock();
        let out = self.git(&["rev-parse", "HEAD"])?;
        if !out.success() {
            return Ok(None);
        }
        Ok(Some(out.stdout.trim().to_string()))
    }
}

/// Files listed after the "overwritten by merge" line, up to git's closing advice.
pub fn parse_pop_conflict_files(output: &str) -> Vec<String> {
    let mut files = Vec::new();
    let mut in_files = false;
    for line in output.lines() {
        if !in_files {
            if line.contains(POP_CONFLICT_MSG) {
                in_files = true;
            }
            continue;
        }
        if line.contains(POP_CONFLICT_FILES_END) || line.trim() == POP_CONFLICT_ABORTING {
            break;
        }
        let file = line.trim();
        if !file.is_empty() {
            files.push(file.to_string());
        }
    }
    files
}

fn parse_porcelain_tracked(porcelain: &str) -> Vec<String> {
    porcelain
        .lines()
        .filter(|line| line.len() > 3 && !line.starts_with("??"))
        .map(|line| {
            let path = &line[3..];
            // renames are reported as "old -> new"
            path.rsplit(" -> ").next().unwrap_or(path).trim_matches('"').to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned outputs and records every invocation.
    struct ScriptedGit {
        responses: Mutex<VecDeque<CommandOutput>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedGit {
        fn new(responses: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl CommandRunner for ScriptedGit {
        fn run(&self, _cwd: &Path, _program: &str, args: &[&str]) -> Result<CommandOutput> {
            self.calls
                .lock()
                .expect("calls")
                .push(args.iter().map(|a| a.to_string()).collect());
            Ok(self
                .responses
                .lock()
                .expect("responses")
                .pop_front()
                .unwrap_or_else(|| CommandOutput::ok("")))
        }
    }

    const POP_CONFLICT_OUTPUT: &str = "error: Your local changes to the following files would be overwritten by merge:\n\tfoo.go\n\tsrc/bar.rs\n\tdocs/readme.md\nPlease commit your changes or stash them before you merge.\nAborting\n";

    #[test]
    fn parses_conflict_files_between_markers() {
        assert_eq!(
            parse_pop_conflict_files(POP_CONFLICT_OUTPUT),
            vec!["foo.go", "src/bar.rs", "docs/readme.md"]
        );
        assert!(parse_pop_conflict_files("nothing to see").is_empty());
    }

    #[test]
    fn pop_conflict_checks_out_each_file_then_drops_once() {
        let runner = ScriptedGit::new(vec![CommandOutput::failed(1, POP_CONFLICT_OUTPUT)]);
        let vcs = GitVcs::with_runner(Path::new("."), runner.clone());
        let outcome = vcs.stash_pop().expect("pop");
        assert_eq!(
            outcome,
            StashPopOutcome::ResolvedConflicts(vec![
                "foo.go".to_string(),
                "src/bar.rs".to_string(),
                "docs/readme.md".to_string()
            ])
        );
        let calls = runner.calls();
        let checkouts = calls
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some("checkout"))
            .count();
        let drops = calls
            .iter()
            .filter(|c| c.as_slice() == ["stash", "drop"])
            .count();
        assert_eq!(checkouts, 3);
        assert_eq!(drops, 1);
        assert_eq!(calls[1], vec!["checkout", "--ours", "foo.go"]);
    }

    #[test]
    fn other_pop_failures_surface_as_vcs_conflict() {
        let runner = ScriptedGit::new(vec![CommandOutput::failed(1, "fatal: bad stash")]);
        let vcs = GitVcs::with_runner(Path::new("."), runner);
        let err = vcs.stash_pop().expect_err("should fail");
        assert!(matches!(
            err.downcast_ref::<PlandexError>(),
            Some(PlandexError::VcsConflict(_))
        ));
    }

    #[test]
    fn stash_push_includes_untracked_files() {
        let runner = ScriptedGit::new(vec![]);
        let vcs = GitVcs::with_runner(Path::new("."), runner.clone());
        vcs.stash_push(AUTO_STASH_MESSAGE).expect("push");
        assert_eq!(
            runner.calls()[0],
            vec!["stash", "push", "--include-untracked", "-m", AUTO_STASH_MESSAGE]
        );
    }

    #[test]
    fn porcelain_parsing_skips_untracked_and_follows_renames() {
        let porcelain = " M foo.go\n?? new.txt\nR  old.rs -> new.rs\nMM \"spaced name.txt\"\n";
        assert_eq!(
            parse_porcelain_tracked(porcelain),
            vec!["foo.go", "new.rs", "spaced name.txt"]
        );
    }

    #[test]
    fn commit_adds_everything_and_allows_empty() {
        let runner = ScriptedGit::new(vec![]);
        let vcs = GitVcs::with_runner(Path::new("."), runner.clone());
        vcs.add_all_and_commit("msg").expect("commit");
        let calls = runner.calls();
        assert_eq!(calls[0], vec!["add", "."]);
        assert_eq!(calls[1], vec!["commit", "-m", "msg", "--allow-empty"]);
    }

    #[test]
    fn real_git_stash_round_trip() {
        if !crate::is_command_available("git") {
            return;
        }
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        let sys = SystemRunner;
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "t"],
        ] {
            crate::run_process(&sys, root, "git", &args).expect("git setup");
        }
        std::fs::write(root.join("a.txt"), "one\n").expect("write");
        let vcs = GitVcs::new(root);
        vcs.add_all_and_commit("init").expect("commit");
        assert!(vcs.is_repo());
        assert!(!vcs.has_uncommitted_changes().expect("status"));

        std::fs::write(root.join("a.txt"), "two\n").expect("write");
        std::fs::write(root.join("b.txt"), "new\n").expect("write");
        assert_eq!(vcs.modified_tracked_paths().expect("tracked"), vec!["a.txt"]);
        vcs.stash_push(AUTO_STASH_MESSAGE).expect("stash");
        assert!(!root.join("b.txt").exists());
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).expect("read"), "one\n");
        assert_eq!(vcs.stash_pop().expect("pop"), StashPopOutcome::Restored);
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).expect("read"), "two\n");
        assert!(root.join("b.txt").exists());
    }
}
