use anyhow::{Context, Result, anyhow};
use ignore::WalkBuilder;
use plandex_core::PLANDEX_DIR;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

pub const PLANDEX_IGNORE_FILE: &str = ".plandexignore";

/// Walks up from `start` to the nearest directory holding `.plandex`.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(PLANDEX_DIR).is_dir() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

/// Nearest ancestor holding `.git`, used as the repo root for VCS calls.
pub fn find_git_root(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir.join(".git").exists() {
            return Some(dir.to_path_buf());
        }
        current = dir.parent();
    }
    None
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WalkOptions {
    pub recursive: bool,
    pub skip_ignore: bool,
    pub include_dirs: bool,
}

/// Relative, `/`-separated, sorted paths under `dir`. Honors `.gitignore` and
/// `.plandexignore` unless `skip_ignore`; `.git` and `.plandex` are always skipped.
pub fn list_paths(root: &Path, dir: &Path, opts: WalkOptions) -> Result<Vec<String>> {
    if !dir.exists() {
        return Err(anyhow!("path not found: {}", dir.display()));
    }
    let mut builder = WalkBuilder::new(dir);
    builder
        .hidden(false)
        .follow_links(false)
        .git_ignore(!opts.skip_ignore)
        .git_global(!opts.skip_ignore)
        .git_exclude(!opts.skip_ignore)
        .ignore(!opts.skip_ignore)
        .require_git(false)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            name != ".git" && name != PLANDEX_DIR
        });
    if !opts.skip_ignore {
        builder.add_custom_ignore_filename(PLANDEX_IGNORE_FILE);
    }
    if !opts.recursive {
        builder.max_depth(Some(1));
    }

    let mut out = Vec::new();
    for entry in builder.build() {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
        if is_dir && !opts.include_dirs {
            continue;
        }
        out.push(relative_slash_path(root, entry.path()));
    }
    out.sort();
    Ok(out)
}

/// Paths under `root` matching a glob pattern, relative and sorted.
pub fn glob_paths(root: &Path, pattern: &str) -> Result<Vec<String>> {
    let full = root.join(pattern);
    let full = full.to_string_lossy();
    let mut out = Vec::new();
    for entry in glob::glob(&full).with_context(|| format!("invalid glob pattern {pattern}"))? {
        let path = entry?;
        if path.is_file() {
            out.push(relative_slash_path(root, &path));
        }
    }
    out.sort();
    Ok(out)
}

pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Write through a temp file in the same directory, fsync, then rename over the
/// target. An existing file keeps its permissions.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let existing_perms = fs::metadata(path).ok().map(|m| m.permissions());

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    if let Some(perms) = existing_perms {
        fs::set_permissions(tmp.path(), perms)?;
    }
    tmp.persist(path)
        .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e.error))?;
    debug!(path = %path.display(), bytes = contents.len(), "atomic write");
    Ok(())
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode())
}

#[cfg(not(unix))]
pub fn file_mode(_path: &Path) -> Option<u32> {
    None
}

/// Removes `dir` and each now-empty ancestor, stopping before `root`.
pub fn remove_empty_dirs(root: &Path, dir: &Path) -> Result<()> {
    let mut current = dir.to_path_buf();
    while current != root && current.starts_with(root) {
        let is_empty = match fs::read_dir(&current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => break,
        };
        if !is_empty {
            break;
        }
        fs::remove_dir(&current)?;
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    Ok(())
}

/// Prunes every empty directory below `root`, deepest first.
pub fn prune_empty_dirs(root: &Path) -> Result<()> {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name != ".git" && name != PLANDEX_DIR
        })
        .map(|e| e.into_path())
        .filter(|p| {
            !p.components()
                .any(|c| c.as_os_str() == ".git" || c.as_os_str() == PLANDEX_DIR)
        })
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        if fs::read_dir(&dir).map(|mut e| e.next().is_none()).unwrap_or(false) {
            fs::remove_dir(&dir)?;
        }
    }
    Ok(())
}
