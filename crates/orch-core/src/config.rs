//! Configuration for the `orch` CLI.
//!
//! Every section has serde defaults, so an empty or missing config file
//! yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::types::{AgentId, Deliverable, ModelKind};

pub const DEFAULT_STATE_DIR: &str = ".orch";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OrchConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub skills: BTreeMap<String, SkillConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registry file; defaults to `~/.orch/registry.json`.
    pub path: Option<PathBuf>,
    pub lock_timeout_ms: u64,
    /// A lock held longer than this is assumed to belong to a dead process.
    pub stale_lock_secs: u64,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_timeout_ms: 5_000,
            stale_lock_secs: 120,
            retry_initial_ms: 20,
            retry_max_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    pub binary: String,
    /// Sessions are named `<prefix>-<project-slug>`.
    pub session_prefix: String,
    /// Input sent to ask an interactive agent to exit.
    pub exit_input: String,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            session_prefix: "orch".to_string(),
            exit_input: "/exit".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long a graceful shutdown may take before a forced kill.
    pub grace_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_secs: 10,
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub enabled: bool,
    pub binary: String,
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "bd".to_string(),
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub default_model: ModelKind,
    /// Relative to the project root.
    pub workspace_dir: PathBuf,
    pub shell: String,
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_model: ModelKind::Claude,
            workspace_dir: PathBuf::from(DEFAULT_STATE_DIR).join("workspace"),
            shell: "bash".to_string(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Auto-managed paths ignored by the uncommitted-work check.
    pub excluded_paths: Vec<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            excluded_paths: vec![".beads/".to_string(), ".kb/".to_string(), ".orch/".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Event log file; defaults to `~/.orch/events.jsonl`.
    pub path: Option<PathBuf>,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SkillConfig {
    #[serde(default)]
    pub deliverables: Vec<DeliverableTemplate>,
}

/// A deliverable declaration whose path may use `{workspace}`, `{project}`
/// and `{id}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableTemplate {
    pub name: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl DeliverableTemplate {
    pub fn resolve(&self, id: &AgentId, project_path: &Path, workspace_dir: &Path) -> Deliverable {
        let rendered = self
            .path
            .replace("{workspace}", &workspace_dir.to_string_lossy())
            .replace("{project}", &project_path.to_string_lossy())
            .replace("{id}", id.as_str());
        let path = PathBuf::from(rendered);
        let path = if path.is_absolute() {
            path
        } else {
            project_path.join(path)
        };
        Deliverable {
            name: self.name.clone(),
            path,
            required: self.required,
        }
    }
}

impl OrchConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.registry
            .path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| default_state_dir().join("registry.json"))
    }

    pub fn events_path(&self) -> PathBuf {
        self.events
            .path
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| default_state_dir().join("events.jsonl"))
    }

    pub fn session_name(&self, project_slug: &str) -> String {
        format!("{}-{}", self.tmux.session_prefix, project_slug)
    }

    pub fn deliverables_for(
        &self,
        skill: Option<&str>,
        id: &AgentId,
        project_path: &Path,
        workspace_dir: &Path,
    ) -> Vec<Deliverable> {
        skill
            .and_then(|name| self.skills.get(name))
            .map(|skill| {
                skill
                    .deliverables
                    .iter()
                    .map(|template| template.resolve(id, project_path, workspace_dir))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// `~/.orch`, or `.orch` relative to the working directory without a home.
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_STATE_DIR))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

pub fn default_config_path() -> PathBuf {
    default_state_dir().join("config.toml")
}

pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

pub fn parse_config(contents: &str) -> Result<OrchConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<OrchConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

/// Load the config, treating a missing file as the default configuration.
pub fn load_or_default_config(path: impl AsRef<Path>) -> Result<OrchConfig, ConfigError> {
    let path_ref = path.as_ref();
    if !path_ref.exists() {
        return Ok(OrchConfig::default());
    }
    load_config(path_ref)
}

pub fn save_config(path: impl AsRef<Path>, config: &OrchConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent_dir) = path_ref.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}
