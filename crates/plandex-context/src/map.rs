//! Project maps: a compact outline of the definitions in each source file
//! under a directory. The server produces map bodies when it can; the local
//! extractor below covers the same syntax set line by line.

use crate::Limits;
use anyhow::{Context as _, Result};
use plandex_api::{GetFileMapRequest, PlanApi};
use plandex_core::{sha256_hex, tokens::estimate_text_tokens};
use rayon::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, warn};

const MAX_DEF_LINE_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Syntax {
    Bash,
    C,
    Cpp,
    CSharp,
    Css,
    Dockerfile,
    Elixir,
    Elm,
    Go,
    Html,
    Java,
    JavaScript,
    Kotlin,
    Lua,
    Markdown,
    Php,
    Python,
    Ruby,
    Rust,
    Scala,
    Svelte,
    Swift,
    TypeScript,
}

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif"];

fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn is_image_path(path: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&extension(path).as_str())
}

pub fn syntax_for(path: &str) -> Option<Syntax> {
    let file_name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if file_name == "dockerfile" {
        return Some(Syntax::Dockerfile);
    }
    let syntax = match extension(path).as_str() {
        "bash" | "sh" => Syntax::Bash,
        "c" | "h" => Syntax::C,
        "cpp" | "cc" | "hpp" => Syntax::Cpp,
        "cs" => Syntax::CSharp,
        "css" => Syntax::Css,
        "dockerfile" => Syntax::Dockerfile,
        "ex" | "exs" => Syntax::Elixir,
        "elm" => Syntax::Elm,
        "go" => Syntax::Go,
        "html" => Syntax::Html,
        "java" => Syntax::Java,
        "js" | "mjs" | "cjs" | "jsx" => Syntax::JavaScript,
        "kt" => Syntax::Kotlin,
        "lua" => Syntax::Lua,
        "md" => Syntax::Markdown,
        "php" => Syntax::Php,
        "py" => Syntax::Python,
        "rb" => Syntax::Ruby,
        "rs" => Syntax::Rust,
        "scala" => Syntax::Scala,
        "svelte" => Syntax::Svelte,
        "swift" => Syntax::Swift,
        "ts" | "tsx" => Syntax::TypeScript,
        _ => return None,
    };
    Some(syntax)
}

pub fn has_map_support(path: &str) -> bool {
    syntax_for(path).is_some()
}

const JS_DEFS: &[&str] = &[
    r"^(export\s+)?(default\s+)?(declare\s+)?(abstract\s+)?(async\s+)?(function\*?|class|interface|type|enum|namespace)\s+[\w$]+",
    r"^(export\s+)?(const|let|var)\s+[\w$]+\s*(:[^=]+)?=\s*(async\s*)?(\([^)]*\)|[\w$]+)\s*(:\s*[^=]+)?=>",
    r"^(export\s+)?(const|let|var)\s+[A-Z_][A-Z0-9_]*\s*[:=]",
    r"^\s+(public\s+|private\s+|protected\s+|static\s+|readonly\s+|async\s+|get\s+|set\s+)*[\w$]+\s*(<[^>]*>)?\([^)]*\)\s*(:\s*[^{]+)?\{\s*$",
];

const JVM_DEFS: &[&str] = &[
    r"^\s*(@\w+\s+)*((public|private|protected|internal|static|final|abstract|open|override|sealed|data|case|inline|suspend|partial|readonly|async|virtual)\s+)*(class|interface|enum|record|struct|object|trait|fun|def|func|protocol|extension|namespace)\s+\w+",
    r"^\s+((public|private|protected|static|final|abstract|override|async|virtual|synchronized)\s+)+[\w<>\[\],.?\s]+\s+\w+\s*\([^;]*$",
];

static PATTERNS: LazyLock<Vec<(Syntax, Vec<Regex>)>> = LazyLock::new(|| {
    let table: Vec<(Syntax, Vec<&str>)> = vec![
        (
            Syntax::Rust,
            vec![
                r"^\s*(pub(\([^)]*\))?\s+)?(const\s+)?(async\s+)?(unsafe\s+)?(extern\s+\S+\s+)?(fn|struct|enum|trait|impl|mod|type|union)\b",
                r"^\s*(pub(\([^)]*\))?\s+)?(const|static)\s+[A-Z_][A-Z0-9_]*\s*:",
                r"^\s*macro_rules!\s*\w+",
            ],
        ),
        (
            Syntax::Python,
            vec![r"^\s*(async\s+)?(def|class)\s+\w+", r"^[A-Z_][A-Z0-9_]*\s*="],
        ),
        (Syntax::JavaScript, JS_DEFS.to_vec()),
        (Syntax::TypeScript, JS_DEFS.to_vec()),
        (
            Syntax::Svelte,
            JS_DEFS
                .iter()
                .copied()
                .chain([r"^\s*<(script|style)\b[^>]*>"])
                .collect(),
        ),
        (
            Syntax::Go,
            vec![r"^(func|type)\s+", r"^(var|const)\s+(\w+|\()"],
        ),
        (Syntax::Java, JVM_DEFS.to_vec()),
        (Syntax::Kotlin, JVM_DEFS.to_vec()),
        (Syntax::Scala, JVM_DEFS.to_vec()),
        (Syntax::CSharp, JVM_DEFS.to_vec()),
        (Syntax::Swift, JVM_DEFS.to_vec()),
        (
            Syntax::C,
            vec![
                r"^\s*(typedef\s+)?(struct|enum|union)\s+\w+",
                r"^#define\s+\w+",
                r"^[A-Za-z_][\w\s\*]*\s+\**[A-Za-z_]\w*\s*\([^;]*$",
            ],
        ),
        (
            Syntax::Cpp,
            vec![
                r"^\s*(template\s*<[^>]*>\s*)?(typedef\s+)?(struct|class|enum|union|namespace)\s+\w+",
                r"^#define\s+\w+",
                r"^[A-Za-z_][\w\s\*&:<>,]*\s+[\*&]*[A-Za-z_][\w:~]*\s*\([^;]*$",
            ],
        ),
        (Syntax::Ruby, vec![r"^\s*(def|class|module)\s+\S+"]),
        (
            Syntax::Php,
            vec![r"^\s*((public|private|protected|static|abstract|final)\s+)*(function|class|interface|trait|enum)\s+\w+"],
        ),
        (Syntax::Lua, vec![r"^\s*(local\s+)?function\s+[\w.:]+"]),
        (
            Syntax::Elixir,
            vec![r"^\s*(defmodule|defprotocol|defimpl|def|defp|defmacro|defstruct)\b"],
        ),
        (
            Syntax::Elm,
            vec![r"^(module|type|port)\s+", r"^[a-z]\w*\s*:"],
        ),
        (
            Syntax::Bash,
            vec![r"^\s*function\s+[\w-]+", r"^\s*[A-Za-z_][\w-]*\s*\(\)\s*\{?"],
        ),
        (Syntax::Css, vec![r"^[^\s{}/][^{]*\{", r"^@(media|keyframes|font-face|layer)\b"]),
        (
            Syntax::Html,
            vec![
                r"^\s*<(head|body|main|header|footer|nav|section|article|form|template|script|style)\b",
                r#"^\s*<[\w-]+[^>]*\bid="[^"]+""#,
            ],
        ),
        (Syntax::Markdown, vec![r"^#{1,6}\s+\S"]),
        (
            Syntax::Dockerfile,
            vec![r"^(FROM|ENTRYPOINT|CMD|EXPOSE|WORKDIR|ARG|ENV|VOLUME|USER)\b"],
        ),
    ];
    table
        .into_iter()
        .map(|(syntax, patterns)| {
            let compiled = patterns
                .into_iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect();
            (syntax, compiled)
        })
        .collect()
});

fn patterns_for(syntax: Syntax) -> &'static [Regex] {
    PATTERNS
        .iter()
        .find(|(s, _)| *s == syntax)
        .map(|(_, p)| p.as_slice())
        .unwrap_or(&[])
}

/// Definition lines of `content`, trimmed and capped in width.
pub fn map_definitions(path: &str, content: &str) -> String {
    let Some(syntax) = syntax_for(path) else {
        return String::new();
    };
    let patterns = patterns_for(syntax);
    let mut defs = Vec::new();
    for line in content.lines() {
        if !patterns.iter().any(|re| re.is_match(line)) {
            continue;
        }
        let trimmed = line.trim_end().trim_end_matches('{').trim_end();
        let shown: String = trimmed.chars().take(MAX_DEF_LINE_CHARS).collect();
        defs.push(shown);
    }
    defs.join("\n")
}

/// Joins per-path parts into the stored map body. Paths without a part are
/// listed by name only.
pub fn compose_map_body(parts: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (path, part) in parts {
        out.push_str(path);
        if part.is_empty() {
            out.push('\n');
        } else {
            out.push_str(":\n");
            out.push_str(part);
            out.push_str("\n\n");
        }
    }
    out
}

pub fn part_tokens(path: &str, part: &str) -> usize {
    estimate_text_tokens(path) + estimate_text_tokens(part) + 1
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapBuild {
    pub parts: BTreeMap<String, String>,
    pub shas: BTreeMap<String, String>,
    pub tokens: BTreeMap<String, usize>,
    /// Mapped from a prefix because the file exceeded the single-input limit.
    pub truncated: Vec<String>,
    /// Listed without a body because the running input total was exhausted.
    pub paths_only: Vec<String>,
    /// Dropped because the map path limit was reached.
    pub omitted: usize,
}

impl MapBuild {
    pub fn body(&self) -> String {
        compose_map_body(&self.parts)
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.values().sum()
    }
}

struct MapInput {
    path: String,
    content: String,
    truncated: bool,
}

fn read_prefix(path: &Path, limit: usize) -> Result<(String, bool)> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut buf = Vec::new();
    file.take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let truncated = buf.len() > limit;
    buf.truncate(limit);
    Ok((String::from_utf8_lossy(&buf).into_owned(), truncated))
}

/// Builds map parts for `paths` (root-relative). Sizes are budgeted in path
/// order before anything is read; reads then fan out on the current rayon pool.
pub fn build_map(
    root: &Path,
    paths: &[String],
    limits: &Limits,
    api: Option<&dyn PlanApi>,
) -> Result<MapBuild> {
    let mut out = MapBuild::default();
    let mut selected = paths.to_vec();
    if selected.len() > limits.max_map_paths {
        out.omitted = selected.len() - limits.max_map_paths;
        selected.truncate(limits.max_map_paths);
    }

    let mut to_read = Vec::new();
    let mut running = 0usize;
    for path in &selected {
        if !has_map_support(path) {
            out.paths_only.push(path.clone());
            continue;
        }
        let size = std::fs::metadata(root.join(path))
            .with_context(|| format!("failed to stat {path}"))?
            .len() as usize;
        let charged = size.min(limits.max_map_single_input_size);
        if running + charged > limits.max_map_total_input_size {
            out.paths_only.push(path.clone());
            continue;
        }
        running += charged;
        to_read.push(path.clone());
    }

    let inputs: Vec<MapInput> = to_read
        .par_iter()
        .map(|path| {
            let (content, truncated) =
                read_prefix(&root.join(path), limits.max_map_single_input_size)?;
            Ok(MapInput {
                path: path.clone(),
                content,
                truncated,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut server_bodies = BTreeMap::new();
    if let Some(api) = api
        && !inputs.is_empty()
    {
        let req = GetFileMapRequest {
            map_inputs: inputs
                .iter()
                .map(|i| (i.path.clone(), i.content.clone()))
                .collect(),
        };
        match api.get_file_map(&req) {
            Ok(resp) => server_bodies = resp.map_bodies,
            Err(err) => warn!(error = %err, "server map failed; mapping locally"),
        }
    }

    for input in inputs {
        let part = match server_bodies.remove(&input.path) {
            Some(body) => body,
            None => map_definitions(&input.path, &input.content),
        };
        if input.truncated {
            out.truncated.push(input.path.clone());
        }
        out.shas
            .insert(input.path.clone(), sha256_hex(input.content.as_bytes()));
        out.tokens
            .insert(input.path.clone(), part_tokens(&input.path, &part));
        out.parts.insert(input.path, part);
    }
    for path in &out.paths_only {
        out.tokens.insert(path.clone(), part_tokens(path, ""));
        out.parts.insert(path.clone(), String::new());
    }
    debug!(
        mapped = out.shas.len(),
        paths_only = out.paths_only.len(),
        truncated = out.truncated.len(),
        "built map"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rust_definitions_are_extracted() {
        let src = "use std::io;\n\npub struct Config {\n    a: u8,\n}\n\nimpl Config {\n    pub fn new() -> Self {\n        Self { a: 0 }\n    }\n}\n\nconst LIMIT: usize = 3;\n";
        let defs = map_definitions("src/lib.rs", src);
        assert_eq!(
            defs,
            "pub struct Config\nimpl Config\n    pub fn new() -> Self\nconst LIMIT: usize = 3;"
        );
    }

    #[test]
    fn python_and_typescript_definitions_are_extracted() {
        let py = "import os\n\nclass Worker:\n    def run(self):\n        pass\n";
        assert_eq!(map_definitions("w.py", py), "class Worker:\n    def run(self):");
        let ts = "import x from 'y';\nexport interface Props {\n}\nexport const handler = async (req) => {\n};\nlet local = 1;\n";
        assert_eq!(
            map_definitions("h.ts", ts),
            "export interface Props\nexport const handler = async (req) =>"
        );
    }

    #[test]
    fn unknown_extensions_have_no_map() {
        assert!(!has_map_support("data.csv"));
        assert!(has_map_support("Dockerfile"));
        assert!(has_map_support("app/views/page.svelte"));
        assert!(is_image_path("logo.PNG"));
        assert_eq!(map_definitions("data.csv", "a,b"), "");
    }

    #[test]
    fn map_limits_truncate_and_fall_back_to_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::write(root.join("a.rs"), "fn a() {}\n".repeat(10)).expect("write");
        fs::write(root.join("b.rs"), "fn b() {}\n").expect("write");
        fs::write(root.join("c.rs"), "fn c() {}\n").expect("write");
        fs::write(root.join("notes.txt"), "plain").expect("write");
        let limits = Limits {
            max_map_single_input_size: 20,
            max_map_total_input_size: 30,
            ..Limits::default()
        };
        let paths: Vec<String> = ["a.rs", "b.rs", "c.rs", "notes.txt"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let built = build_map(root, &paths, &limits, None).expect("map");
        assert_eq!(built.truncated, vec!["a.rs".to_string()]);
        assert_eq!(built.parts["a.rs"], "fn a() {}\nfn a() {}");
        assert_eq!(built.parts["b.rs"], "fn b() {}");
        assert_eq!(built.paths_only, vec!["c.rs".to_string(), "notes.txt".to_string()]);
        assert_eq!(built.parts["c.rs"], "");
        assert!(!built.shas.contains_key("c.rs"));
        assert_eq!(built.num_tokens(), built.tokens.values().sum::<usize>());
        assert!(built.body().contains("c.rs\n"));
    }

    #[test]
    fn map_path_limit_omits_the_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a.go", "b.go", "c.go"] {
            fs::write(dir.path().join(name), "func X() {}\n").expect("write");
        }
        let limits = Limits {
            max_map_paths: 2,
            ..Limits::default()
        };
        let paths: Vec<String> = ["a.go", "b.go", "c.go"].iter().map(|s| s.to_string()).collect();
        let built = build_map(dir.path(), &paths, &limits, None).expect("map");
        assert_eq!(built.omitted, 1);
        assert_eq!(built.parts.len(), 2);
    }
}
