use assert_cmd::Command;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn plandex(cwd: &Path, home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("plandex").expect("binary");
    cmd.current_dir(cwd)
        .env_clear()
        .env("PLANDEX_HOME_DIR", home)
        .env("PLANDEX_LOG", "off");
    cmd
}

fn run_json(cmd: &mut Command) -> Value {
    let out = cmd.output().expect("run");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("json output")
}

#[test]
fn help_lists_the_core_verbs() {
    let dir = TempDir::new().expect("dir");
    let out = plandex(dir.path(), dir.path())
        .arg("--help")
        .output()
        .expect("run");
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for verb in ["new", "load", "tell", "apply", "rewind", "debug", "set-model"] {
        assert!(text.contains(verb), "missing {verb} in help:\n{text}");
    }
}

#[test]
fn version_prints_the_binary_name() {
    let dir = TempDir::new().expect("dir");
    let out = plandex(dir.path(), dir.path())
        .arg("--version")
        .output()
        .expect("run");
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("plandex "));
}

#[test]
fn models_are_listed_without_a_session() {
    let dir = TempDir::new().expect("dir");
    let home = TempDir::new().expect("home");
    let models = run_json(plandex(dir.path(), home.path()).args(["--json", "models"]));
    let ids: Vec<&str> = models
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|m| m["modelId"].as_str())
        .collect();
    assert!(ids.contains(&"anthropic/claude-sonnet-4"), "{ids:?}");
}

#[test]
fn providers_pick_up_keys_from_the_environment() {
    let dir = TempDir::new().expect("dir");
    let home = TempDir::new().expect("home");
    let out = run_json(
        plandex(dir.path(), home.path())
            .env("ANTHROPIC_API_KEY", "sk-test")
            .args(["--json", "providers"]),
    );
    let publishers = out["publishers"].as_array().expect("publishers");
    let anthropic = publishers
        .iter()
        .find(|p| p["publisher"] == "anthropic")
        .expect("anthropic publisher");
    assert_eq!(anthropic["selected"], "anthropic");
    assert_eq!(out["allSatisfied"], false);
}

#[test]
fn context_commands_need_a_project() {
    let dir = TempDir::new().expect("dir");
    let home = TempDir::new().expect("home");
    let out = plandex(dir.path(), home.path()).arg("ls").output().expect("run");
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("plandex new"), "{stderr}");
}

#[test]
fn reject_needs_paths_or_all() {
    let dir = TempDir::new().expect("dir");
    let home = TempDir::new().expect("home");
    let out = plandex(dir.path(), home.path()).arg("reject").output().expect("run");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("--all"), "{stderr}");
}
