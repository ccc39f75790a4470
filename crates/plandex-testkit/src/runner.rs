//! Scripted stand-ins for process spawning and `_apply.sh` execution.

use anyhow::{Result, anyhow};
use plandex_tools::{CommandOutput, CommandRunner, ExecOutcome, ScriptRunner};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Answers commands by the first rule whose program and leading args match;
/// anything unmatched succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<(Vec<String>, VecDeque<CommandOutput>)>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues `output` for the next invocation starting with `prefix`
    /// (program first). The last queued output for a prefix repeats.
    pub fn respond(&self, prefix: &[&str], output: CommandOutput) -> &Self {
        let key: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        let mut rules = lock(&self.rules);
        match rules.iter_mut().find(|(k, _)| *k == key) {
            Some((_, queue)) => queue.push_back(output),
            None => rules.push((key, VecDeque::from([output]))),
        }
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }

    /// Invocations rendered as `program arg arg`.
    pub fn command_lines(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.join(" ")).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, _cwd: &Path, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut call = vec![program.to_string()];
        call.extend(args.iter().map(|a| a.to_string()));
        lock(&self.calls).push(call.clone());

        let mut rules = lock(&self.rules);
        let matched = rules
            .iter_mut()
            .filter(|(prefix, _)| call.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len());
        Ok(match matched {
            Some((_, queue)) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some((_, queue)) => queue.front().cloned().unwrap_or_default(),
            None => CommandOutput::ok(""),
        })
    }
}

/// Plays back exit outcomes for successive script runs and keeps the scripts.
#[derive(Default)]
pub struct ScriptedExec {
    outcomes: Mutex<VecDeque<ExecOutcome>>,
    scripts: Mutex<Vec<String>>,
}

impl ScriptedExec {
    pub fn new(outcomes: Vec<ExecOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            scripts: Mutex::new(Vec::new()),
        })
    }

    pub fn success() -> ExecOutcome {
        ExecOutcome {
            code: 0,
            output: String::new(),
            interrupted: false,
        }
    }

    pub fn failure(code: i32, output: &str) -> ExecOutcome {
        ExecOutcome {
            code,
            output: output.to_string(),
            interrupted: false,
        }
    }

    pub fn scripts(&self) -> Vec<String> {
        lock(&self.scripts).clone()
    }

    pub fn runs(&self) -> usize {
        lock(&self.scripts).len()
    }
}

impl ScriptRunner for ScriptedExec {
    fn run_script(&self, _workspace: &Path, script: &str, cancel: &AtomicBool) -> Result<ExecOutcome> {
        lock(&self.scripts).push(script.to_string());
        if cancel.load(Ordering::SeqCst) {
            return Ok(ExecOutcome {
                code: 130,
                output: String::new(),
                interrupted: true,
            });
        }
        lock(&self.outcomes)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted outcome for script run"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_matching_prefix_answers_and_last_output_repeats() {
        let runner = ScriptedRunner::shared();
        runner
            .respond(&["git", "status"], CommandOutput::ok(" M a.txt\n"))
            .respond(&["git"], CommandOutput::failed(1, "nope"));
        let cwd = Path::new(".");
        let out = runner.run(cwd, "git", &["status", "--porcelain"]).expect("run");
        assert_eq!(out.stdout, " M a.txt\n");
        let again = runner.run(cwd, "git", &["status", "--porcelain"]).expect("run");
        assert_eq!(again.stdout, " M a.txt\n");
        assert!(!runner.run(cwd, "git", &["add", "."]).expect("run").success());
        assert!(runner.run(cwd, "ls", &[]).expect("run").success());
        assert_eq!(runner.command_lines()[2], "git add .");
    }

    #[test]
    fn scripted_exec_plays_outcomes_in_order() {
        let exec = ScriptedExec::new(vec![
            ScriptedExec::failure(1, "boom"),
            ScriptedExec::success(),
        ]);
        let cancel = AtomicBool::new(false);
        let cwd = Path::new(".");
        assert_eq!(exec.run_script(cwd, "a", &cancel).expect("run").code, 1);
        assert!(exec.run_script(cwd, "b", &cancel).expect("run").success());
        assert!(exec.run_script(cwd, "c", &cancel).is_err());
        assert_eq!(exec.scripts(), vec!["a", "b", "c"]);
    }
}
