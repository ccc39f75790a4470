//! Context management for plans: loading files, trees, maps, urls, notes,
//! piped data and images into a plan branch, detecting drift against their
//! sources, and keeping the stored set within its limits.

use anyhow::{Context as _, Result};
use plandex_api::PlanApi;
use plandex_core::{
    Context, ContextConfig, ImageDetail, MAX_CONTEXT_BODY_SIZE, MAX_CONTEXT_COUNT,
    MAX_CONTEXT_MAP_PATHS, MAX_CONTEXT_MAP_SINGLE_INPUT_SIZE, MAX_CONTEXT_MAP_TOTAL_INPUT_SIZE,
    MAX_TOTAL_CONTEXT_SIZE,
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub mod autoload;
pub mod listing;
pub mod load;
pub mod map;
pub mod outdated;
pub mod remove;
pub mod tree;
pub mod url;

pub use autoload::AutoLoadOutcome;
pub use listing::{format_context_table, sort_contexts};
pub use load::{LoadOutcome, SkipReason, SkippedItem};
pub use map::{MapBuild, build_map, has_map_support, is_image_path, map_definitions};
pub use outdated::{ConflictChoice, OutdatedReport, UpdateOutcome};
pub use remove::{RemoveOutcome, select_for_removal};
pub use tree::{IgnoreRules, tree_body, tree_name};
pub use url::{HttpFetcher, UrlFetcher, html_to_text, is_url, url_name};

/// Size and count caps enforced before anything is sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_context_count: usize,
    pub max_body_size: usize,
    pub max_total_size: usize,
    pub max_map_paths: usize,
    pub max_map_single_input_size: usize,
    pub max_map_total_input_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_context_count: MAX_CONTEXT_COUNT,
            max_body_size: MAX_CONTEXT_BODY_SIZE,
            max_total_size: MAX_TOTAL_CONTEXT_SIZE,
            max_map_paths: MAX_CONTEXT_MAP_PATHS,
            max_map_single_input_size: MAX_CONTEXT_MAP_SINGLE_INPUT_SIZE,
            max_map_total_input_size: MAX_CONTEXT_MAP_TOTAL_INPUT_SIZE,
        }
    }
}

/// One thing to load. Paths are relative to the project root or absolute.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadItem {
    File {
        path: String,
        force_skip_ignore: bool,
    },
    DirectoryTree {
        path: String,
        recursive: bool,
        names_only: bool,
        defs_only: bool,
        force_skip_ignore: bool,
    },
    Url(String),
    Note(String),
    Image {
        path: String,
        detail: ImageDetail,
    },
    PipedData(Vec<u8>),
}

/// Flags given alongside paths on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags {
    pub recursive: bool,
    pub names_only: bool,
    pub defs_only: bool,
    pub force_skip_ignore: bool,
    pub detail: ImageDetail,
}

impl LoadItem {
    /// Classifies a command-line argument as a url, directory, image or file.
    pub fn from_arg(root: &Path, arg: &str, flags: LoadFlags) -> Self {
        if is_url(arg) {
            return LoadItem::Url(arg.to_string());
        }
        let is_dir = root.join(arg).is_dir();
        if is_dir || flags.names_only || flags.defs_only {
            return LoadItem::DirectoryTree {
                path: arg.to_string(),
                recursive: flags.recursive,
                names_only: flags.names_only,
                defs_only: flags.defs_only,
                force_skip_ignore: flags.force_skip_ignore,
            };
        }
        if is_image_path(arg) {
            return LoadItem::Image {
                path: arg.to_string(),
                detail: flags.detail,
            };
        }
        LoadItem::File {
            path: arg.to_string(),
            force_skip_ignore: flags.force_skip_ignore,
        }
    }
}

/// Context operations for one plan branch.
pub struct ContextManager {
    api: Arc<dyn PlanApi>,
    plan_id: String,
    branch: String,
    root: PathBuf,
    limits: Limits,
    fetcher: Arc<dyn UrlFetcher>,
    pool: ThreadPool,
}

impl ContextManager {
    pub fn new(
        api: Arc<dyn PlanApi>,
        plan_id: impl Into<String>,
        branch: impl Into<String>,
        root: impl Into<PathBuf>,
        cfg: &ContextConfig,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new(Duration::from_secs(cfg.url_timeout_seconds))?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(cfg.fetch_concurrency.max(1))
            .thread_name(|i| format!("plandex-context-{i}"))
            .build()
            .context("failed to start context worker pool")?;
        Ok(Self {
            api,
            plan_id: plan_id.into(),
            branch: branch.into(),
            root: root.into(),
            limits: Limits::default(),
            fetcher: Arc::new(fetcher),
            pool,
        })
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn UrlFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Stored items in creation order. Bodies are only kept when requested.
    pub fn list(&self, include_bodies: bool) -> Result<Vec<Context>> {
        let mut contexts = self.api.list_context(&self.plan_id, &self.branch)?;
        sort_contexts(&mut contexts);
        for ctx in &mut contexts {
            if !include_bodies {
                ctx.body.clear();
            } else if ctx.body.is_empty() && ctx.body_size > 0 {
                ctx.body = self
                    .api
                    .get_context_body(&self.plan_id, &self.branch, &ctx.id)?;
            }
        }
        Ok(contexts)
    }

    /// Root-relative, `/`-separated form of a user-supplied path.
    pub(crate) fn rel_path(&self, path: &str) -> String {
        let p = Path::new(path);
        if p.is_absolute() {
            plandex_tools::fs::relative_slash_path(&self.root, p)
        } else {
            let rel = plandex_tools::fs::relative_slash_path(Path::new(""), p);
            let rel = rel.trim_start_matches("./");
            if rel.is_empty() { ".".to_string() } else { rel.to_string() }
        }
    }

    pub(crate) fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use plandex_testkit::FakeServer;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    pub struct StaticFetcher {
        pub pages: Mutex<BTreeMap<String, String>>,
    }

    impl StaticFetcher {
        pub fn new(pages: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(
                    pages
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
            })
        }

        pub fn set(&self, url: &str, body: &str) {
            if let Ok(mut pages) = self.pages.lock() {
                pages.insert(url.to_string(), body.to_string());
            }
        }
    }

    impl UrlFetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> Result<String> {
            self.pages
                .lock()
                .ok()
                .and_then(|p| p.get(url).cloned())
                .ok_or_else(|| anyhow::anyhow!("failed to fetch {url}: HTTP 404 Not Found"))
        }
    }

    pub fn manager(server: &Arc<FakeServer>, root: &Path) -> ContextManager {
        let plan_id = server.seed_plan("test plan");
        let cfg = ContextConfig {
            fetch_concurrency: 4,
            url_timeout_seconds: 5,
        };
        let api: Arc<dyn PlanApi> = server.clone();
        ContextManager::new(api, plan_id, plandex_core::MAIN_BRANCH, root, &cfg)
            .expect("manager")
            .with_fetcher(StaticFetcher::new(&[]))
    }
}
