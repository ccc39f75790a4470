use anyhow::Result;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use plandex_tools::fs::{PLANDEX_IGNORE_FILE, WalkOptions, list_paths};
use std::path::Path;

/// Display name of a tree item; `.` and `..` get readable names.
pub fn tree_name(path: &str) -> String {
    match path {
        "." | "" => "cwd".to_string(),
        ".." => "parent".to_string(),
        other => other.to_string(),
    }
}

/// Sorted, newline-joined list of every path under `dir`, directories included.
pub fn tree_body(root: &Path, dir: &str, force_skip_ignore: bool) -> Result<String> {
    let paths = list_paths(
        root,
        &root.join(dir),
        WalkOptions {
            recursive: true,
            skip_ignore: force_skip_ignore,
            include_dirs: true,
        },
    )?;
    Ok(paths.join("\n"))
}

/// Every file under `dir`, honoring ignore files unless told otherwise.
pub fn files_under(root: &Path, dir: &str, force_skip_ignore: bool) -> Result<Vec<String>> {
    list_paths(
        root,
        &root.join(dir),
        WalkOptions {
            recursive: true,
            skip_ignore: force_skip_ignore,
            include_dirs: false,
        },
    )
}

/// Matcher for the project-level `.gitignore` and `.plandexignore`, used for
/// paths named one at a time.
pub struct IgnoreRules {
    matcher: Option<Gitignore>,
}

impl IgnoreRules {
    pub fn load(root: &Path) -> Self {
        let mut builder = GitignoreBuilder::new(root);
        let mut any = false;
        for name in [".gitignore", PLANDEX_IGNORE_FILE] {
            let path = root.join(name);
            if path.is_file() && builder.add(&path).is_none() {
                any = true;
            }
        }
        let matcher = if any { builder.build().ok() } else { None };
        Self { matcher }
    }

    pub fn is_ignored(&self, rel: &str, is_dir: bool) -> bool {
        self.matcher.as_ref().is_some_and(|m| {
            m.matched_path_or_any_parents(rel, is_dir).is_ignore()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn tree_respects_ignore_files_unless_forced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("src/nested")).expect("mkdir");
        fs::create_dir_all(root.join("build")).expect("mkdir");
        fs::write(root.join("src/main.rs"), "fn main() {}").expect("write");
        fs::write(root.join("src/nested/mod.rs"), "").expect("write");
        fs::write(root.join("build/out.bin"), "x").expect("write");
        fs::write(root.join(".gitignore"), "build/\n").expect("write");
        fs::write(root.join(".plandexignore"), "*.log\n").expect("write");
        fs::write(root.join("debug.log"), "noise").expect("write");

        let body = tree_body(root, ".", false).expect("tree");
        assert!(body.contains("src/main.rs"));
        assert!(body.contains("src/nested"));
        assert!(!body.contains("build/out.bin"));
        assert!(!body.contains("debug.log"));
        let lines: Vec<&str> = body.lines().collect();
        let mut sorted = lines.clone();
        sorted.sort();
        assert_eq!(lines, sorted);

        let forced = tree_body(root, ".", true).expect("tree");
        assert!(forced.contains("build/out.bin"));
        assert!(forced.contains("debug.log"));
    }

    #[test]
    fn single_paths_are_checked_against_project_ignores() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(".gitignore"), "dist/\n*.tmp\n").expect("write");
        let rules = IgnoreRules::load(dir.path());
        assert!(rules.is_ignored("dist/app.js", false));
        assert!(rules.is_ignored("notes.tmp", false));
        assert!(!rules.is_ignored("src/app.js", false));
    }

    #[test]
    fn dot_paths_get_readable_names() {
        assert_eq!(tree_name("."), "cwd");
        assert_eq!(tree_name(".."), "parent");
        assert_eq!(tree_name("src"), "src");
    }
}
