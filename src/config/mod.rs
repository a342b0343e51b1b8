//! Configuration — hard-coded defaults overlaid with the repo's TOML file.
//!
//! The two layers are explicit: `Config::default_config()` is the complete
//! baseline, the TOML file deserializes into an all-optional overlay, and the
//! overlay is applied exactly once at startup. The resolved `RunContext` is
//! immutable and passed by reference; nothing reads configuration ambiently.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CONFIG_DIR: &str = ".crew";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const STATE_DIR_ENV: &str = "CREW_STATE_DIR";

const LAUNCH_BACKENDS: [&str; 3] = ["auto", "tmux", "codex-exec"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid TOML in {path}: {message}")]
    InvalidToml { path: PathBuf, message: String },
    #[error("[owners] must be a non-empty table")]
    EmptyOwners,
    #[error("board.{key} must be an integer >= 1")]
    BadColumn { key: &'static str },
    #[error("board.done_keywords must be a non-empty list")]
    EmptyDoneKeywords,
    #[error("board.gate_regex is not a valid pattern: {source}")]
    BadGateRegex { source: regex::Error },
    #[error("runtime.launch_backend must be one of: auto, tmux, codex-exec (got {value:?})")]
    BadBackend { value: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RepoConfig {
    pub base_branch: String,
    pub board_file: String,
    pub state_dir: String,
    /// `<repo>` expands to the repository directory name.
    pub worktree_parent: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeConfig {
    pub max_start: usize,
    pub launch_backend: String,
    pub auto_no_launch: bool,
    pub agent_flags: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardConfig {
    pub id_col: usize,
    pub title_col: usize,
    pub owner_col: usize,
    pub deps_col: usize,
    pub status_col: usize,
    pub gate_regex: String,
    pub done_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub repo: RepoConfig,
    pub owners: BTreeMap<String, String>,
    pub runtime: RuntimeConfig,
    pub board: BoardConfig,
}

/// Compiled column schema handed to the board parser.
#[derive(Debug, Clone)]
pub struct BoardSchema {
    pub id_col: usize,
    pub title_col: usize,
    pub owner_col: usize,
    pub deps_col: usize,
    pub status_col: usize,
    pub gate_regex: Regex,
    /// Lowercased.
    pub done_keywords: HashSet<String>,
}

// The overlay mirrors Config with every field optional; absent keys keep the
// default layer's value.

#[derive(Debug, Default, Deserialize)]
struct RepoOverlay {
    base_branch: Option<String>,
    board_file: Option<String>,
    state_dir: Option<String>,
    worktree_parent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimeOverlay {
    max_start: Option<usize>,
    launch_backend: Option<String>,
    auto_no_launch: Option<bool>,
    agent_flags: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BoardOverlay {
    id_col: Option<usize>,
    title_col: Option<usize>,
    owner_col: Option<usize>,
    deps_col: Option<usize>,
    status_col: Option<usize>,
    gate_regex: Option<String>,
    done_keywords: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    #[serde(default)]
    repo: RepoOverlay,
    #[serde(default)]
    owners: Option<BTreeMap<String, String>>,
    #[serde(default)]
    runtime: RuntimeOverlay,
    #[serde(default)]
    board: BoardOverlay,
}

/// Normalize an owner display name to its map key: lowercase alphanumerics.
pub fn owner_key(owner: &str) -> String {
    owner
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl Config {
    /// The defaults layer, complete on its own.
    pub fn default_config() -> Self {
        Self {
            repo: RepoConfig {
                base_branch: "main".to_string(),
                board_file: "BOARD.md".to_string(),
                state_dir: CONFIG_DIR.to_string(),
                worktree_parent: "../<repo>-worktrees".to_string(),
            },
            owners: [
                ("AgentA", "app-shell"),
                ("AgentB", "domain-core"),
                ("AgentC", "provider-openai"),
                ("AgentD", "ui-popover"),
                ("AgentE", "ci-release"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            runtime: RuntimeConfig {
                max_start: 0,
                launch_backend: "tmux".to_string(),
                auto_no_launch: false,
                agent_flags: "--full-auto".to_string(),
            },
            board: BoardConfig {
                id_col: 2,
                title_col: 3,
                owner_col: 4,
                deps_col: 5,
                status_col: 7,
                gate_regex: r"`(G[0-9]+ \([^)]+\))`".to_string(),
                done_keywords: vec![
                    "DONE".to_string(),
                    "완료".to_string(),
                    "Complete".to_string(),
                    "complete".to_string(),
                ],
            },
        }
    }

    fn apply(&mut self, overlay: ConfigOverlay) {
        let repo = overlay.repo;
        if let Some(v) = repo.base_branch {
            self.repo.base_branch = v;
        }
        if let Some(v) = repo.board_file {
            self.repo.board_file = v;
        }
        if let Some(v) = repo.state_dir {
            self.repo.state_dir = v;
        }
        if let Some(v) = repo.worktree_parent {
            self.repo.worktree_parent = v;
        }
        if let Some(owners) = overlay.owners {
            self.owners = owners;
        }
        let runtime = overlay.runtime;
        if let Some(v) = runtime.max_start {
            self.runtime.max_start = v;
        }
        if let Some(v) = runtime.launch_backend {
            self.runtime.launch_backend = v.trim().to_lowercase();
        }
        if let Some(v) = runtime.auto_no_launch {
            self.runtime.auto_no_launch = v;
        }
        if let Some(v) = runtime.agent_flags {
            self.runtime.agent_flags = v;
        }
        let board = overlay.board;
        if let Some(v) = board.id_col {
            self.board.id_col = v;
        }
        if let Some(v) = board.title_col {
            self.board.title_col = v;
        }
        if let Some(v) = board.owner_col {
            self.board.owner_col = v;
        }
        if let Some(v) = board.deps_col {
            self.board.deps_col = v;
        }
        if let Some(v) = board.status_col {
            self.board.status_col = v;
        }
        if let Some(v) = board.gate_regex {
            self.board.gate_regex = v;
        }
        if let Some(v) = board.done_keywords {
            self.board.done_keywords = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.owners.is_empty() {
            return Err(ConfigError::EmptyOwners);
        }
        for (key, value) in [
            ("id_col", self.board.id_col),
            ("title_col", self.board.title_col),
            ("owner_col", self.board.owner_col),
            ("deps_col", self.board.deps_col),
            ("status_col", self.board.status_col),
        ] {
            if value < 1 {
                return Err(ConfigError::BadColumn { key });
            }
        }
        if self.board.done_keywords.is_empty() {
            return Err(ConfigError::EmptyDoneKeywords);
        }
        if !LAUNCH_BACKENDS.contains(&self.runtime.launch_backend.as_str()) {
            return Err(ConfigError::BadBackend {
                value: self.runtime.launch_backend.clone(),
            });
        }
        self.board_schema().map(|_| ())
    }

    /// Compile the board section into the parser's schema.
    pub fn board_schema(&self) -> Result<BoardSchema, ConfigError> {
        let gate_regex = Regex::new(&self.board.gate_regex)
            .map_err(|source| ConfigError::BadGateRegex { source })?;
        Ok(BoardSchema {
            id_col: self.board.id_col,
            title_col: self.board.title_col,
            owner_col: self.board.owner_col,
            deps_col: self.board.deps_col,
            status_col: self.board.status_col,
            gate_regex,
            done_keywords: self
                .board
                .done_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        })
    }

    /// Normalized owner key → scope.
    pub fn owners_by_key(&self) -> BTreeMap<String, String> {
        self.owners
            .iter()
            .map(|(name, scope)| (owner_key(name), scope.clone()))
            .collect()
    }

    /// Load the repo's config, bootstrapping the default file when missing.
    pub fn load(
        repo_root: &Path,
        override_path: Option<&Path>,
    ) -> Result<(Self, PathBuf), ConfigError> {
        let cfg_path = match override_path {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => repo_root.join(p),
            None => repo_root.join(CONFIG_DIR).join(CONFIG_FILENAME),
        };

        bootstrap_if_missing(&cfg_path, repo_root)?;

        let text = std::fs::read_to_string(&cfg_path).map_err(|source| ConfigError::Io {
            path: cfg_path.clone(),
            source,
        })?;
        let overlay: ConfigOverlay =
            toml::from_str(&text).map_err(|err| ConfigError::InvalidToml {
                path: cfg_path.clone(),
                message: err.to_string(),
            })?;

        let mut config = Self::default_config();
        config.apply(overlay);
        config.validate()?;

        let config_repo_root = repo_root_from_config_path(&cfg_path, repo_root);
        config.repo.worktree_parent = config
            .repo
            .worktree_parent
            .replace("<repo>", &dir_name(&config_repo_root));

        Ok((config, cfg_path))
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// A config stored at `<repo>/.crew/config.toml` pins that repo root for
/// relative paths, even when the process was pointed somewhere else.
fn repo_root_from_config_path(cfg_path: &Path, fallback: &Path) -> PathBuf {
    match cfg_path.parent() {
        Some(parent) if parent.file_name().is_some_and(|n| n == CONFIG_DIR) => parent
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fallback.to_path_buf()),
        _ => fallback.to_path_buf(),
    }
}

fn bootstrap_if_missing(cfg_path: &Path, repo_root: &Path) -> Result<(), ConfigError> {
    if cfg_path.exists() {
        return Ok(());
    }
    let io_err = |source| ConfigError::Io {
        path: cfg_path.to_path_buf(),
        source,
    };

    if let Some(parent) = cfg_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }

    let mut defaults = Config::default_config();
    let config_repo_root = repo_root_from_config_path(cfg_path, repo_root);
    defaults.repo.worktree_parent = defaults
        .repo
        .worktree_parent
        .replace("<repo>", &dir_name(&config_repo_root));

    // Serialization of the defaults struct is the template; the written file
    // round-trips through the overlay unchanged.
    let rendered =
        toml::to_string_pretty(&defaults).map_err(|err| ConfigError::InvalidToml {
            path: cfg_path.to_path_buf(),
            message: err.to_string(),
        })?;
    std::fs::write(cfg_path, rendered).map_err(io_err)?;
    info!(path = %cfg_path.display(), "bootstrapped default config");
    Ok(())
}

/// Resolved, immutable invocation context.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub repo_root: PathBuf,
    pub repo_name: String,
    pub base_branch: String,
    pub board_file: PathBuf,
    pub state_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub worker_dir: PathBuf,
    pub updates_file: PathBuf,
    pub worktree_parent: PathBuf,
    pub runtime: RuntimeConfig,
    pub owners: BTreeMap<String, String>,
    pub owners_by_key: BTreeMap<String, String>,
    pub board_schema: BoardSchema,
    pub config_path: PathBuf,
}

fn to_abs(base: &Path, value: &str) -> PathBuf {
    let p = PathBuf::from(value);
    if p.is_absolute() { p } else { base.join(p) }
}

/// Resolve all paths and maps once. State-dir priority: explicit argument,
/// then the environment override, then the config value.
pub fn resolve_context(
    repo_root: &Path,
    config: &Config,
    config_path: &Path,
    state_dir_arg: Option<&str>,
) -> Result<RunContext, ConfigError> {
    let config_repo_root = repo_root_from_config_path(config_path, repo_root);

    let board_file = to_abs(&config_repo_root, &config.repo.board_file);
    let worktree_parent = to_abs(&config_repo_root, &config.repo.worktree_parent);

    let env_state = std::env::var(STATE_DIR_ENV).ok().filter(|s| !s.is_empty());
    let (state_src, state_base) = match (state_dir_arg, env_state) {
        (Some(arg), _) => (arg.to_string(), repo_root.to_path_buf()),
        (None, Some(env)) => (env, repo_root.to_path_buf()),
        (None, None) => (config.repo.state_dir.clone(), config_repo_root.clone()),
    };
    let state_dir = to_abs(&state_base, &state_src);

    Ok(RunContext {
        repo_root: repo_root.to_path_buf(),
        repo_name: dir_name(repo_root),
        base_branch: config.repo.base_branch.clone(),
        board_file,
        lock_dir: state_dir.join("locks"),
        worker_dir: state_dir.join("workers"),
        updates_file: state_dir.join("UPDATES.md"),
        state_dir,
        worktree_parent,
        runtime: config.runtime.clone(),
        owners: config.owners.clone(),
        owners_by_key: config.owners_by_key(),
        board_schema: config.board_schema()?,
        config_path: config_path.to_path_buf(),
    })
}
