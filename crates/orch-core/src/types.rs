//! Core types for agent lifecycle tracking.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::state::AgentStatus;

const MAX_TASK_SLUG_WORDS: usize = 4;
const MAX_TASK_SLUG_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a fresh id of the form
    /// `<project-slug>-<path-hash>-<task-slug>-<yyyymmdd>-<rand>`.
    ///
    /// Two projects that share a directory name still get distinct ids because
    /// the path hash is part of the discriminator.
    pub fn generate(project_path: &Path, task: &str, at: DateTime<Utc>) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}-{}-{}",
            project_discriminator(project_path),
            slugify(task),
            at.format("%Y%m%d"),
            &nonce[..4]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Slug of the project directory name, used for session names and ids.
pub fn project_slug(project_path: &Path) -> String {
    let name = project_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let slug = slugify_words(&name, usize::MAX, MAX_TASK_SLUG_LEN);
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug
    }
}

/// Project slug plus the first four hex digits of the path's SHA-256.
pub fn project_discriminator(project_path: &Path) -> String {
    let digest = Sha256::digest(project_path.to_string_lossy().as_bytes());
    format!(
        "{}-{:02x}{:02x}",
        project_slug(project_path),
        digest[0],
        digest[1]
    )
}

/// Lowercase ascii slug of the first few words of a task description.
pub fn slugify(text: &str) -> String {
    let slug = slugify_words(text, MAX_TASK_SLUG_WORDS, MAX_TASK_SLUG_LEN);
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

fn slugify_words(text: &str, max_words: usize, max_len: usize) -> String {
    let mut out = String::new();
    let words = text
        .split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .take(max_words);
    for word in words {
        let word = word.to_ascii_lowercase();
        let extra = if out.is_empty() { 0 } else { 1 };
        if out.len() + extra + word.len() > max_len {
            if out.is_empty() {
                out.push_str(&word[..max_len]);
            }
            break;
        }
        if extra == 1 {
            out.push('-');
        }
        out.push_str(&word);
    }
    out
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Claude => "claude",
            ModelKind::Codex => "codex",
            ModelKind::Gemini => "gemini",
        }
    }
}

impl std::str::FromStr for ModelKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "claude" => Ok(ModelKind::Claude),
            "codex" => Ok(ModelKind::Codex),
            "gemini" => Ok(ModelKind::Gemini),
            other => Err(format!(
                "invalid model '{other}'. valid values: claude, codex, gemini"
            )),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tmux window inside a named session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub session: String,
    pub window: String,
}

impl ProcessHandle {
    pub fn new(session: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            window: window.into(),
        }
    }

    /// Window ids (`@N`) are unique across the tmux server and survive
    /// session renames and window moves.
    pub fn has_window_id(&self) -> bool {
        self.window.starts_with('@')
    }

    /// Whether both handles name the same window. Id-addressed windows
    /// match on the id alone; named windows also need the same session.
    pub fn same_window(&self, other: &ProcessHandle) -> bool {
        if self.has_window_id() || other.has_window_id() {
            self.window == other.window
        } else {
            self == other
        }
    }
}

impl std::fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.session, self.window)
    }
}

/// How an agent is hosted. Reconciliation dispatches on this tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentBackend {
    /// Interactive agent running in a multiplexer window.
    Process { handle: ProcessHandle },
    /// Agent without a window; liveness comes from a backend status query.
    Api { session_ref: String },
}

impl AgentBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentBackend::Process { .. } => "process",
            AgentBackend::Api { .. } => "api",
        }
    }
}

impl std::fmt::Display for AgentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentBackend::Process { handle } => write!(f, "tmux {handle}"),
            AgentBackend::Api { session_ref } => write!(f, "api {session_ref}"),
        }
    }
}

/// A deliverable the agent is expected to leave on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deliverable {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub status: AgentStatus,
    pub backend: AgentBackend,
    #[serde(default)]
    pub external_ref: Option<String>,
    pub project_path: PathBuf,
    #[serde(default)]
    pub workspace_ref: Option<PathBuf>,
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default)]
    pub model: ModelKind,
    #[serde(default)]
    pub deliverables: Vec<Deliverable>,
    /// HEAD of the project repository when the agent was spawned.
    #[serde(default)]
    pub base_commit: Option<String>,
    /// Completion was verified but the window could not be closed by the
    /// process that verified it.
    #[serde(default)]
    pub teardown_pending: bool,
    #[serde(default)]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: String,
}

impl AgentRecord {
    pub fn new(
        id: AgentId,
        backend: AgentBackend,
        project_path: PathBuf,
        model: ModelKind,
        at: DateTime<Utc>,
        writer: impl Into<String>,
    ) -> Self {
        Self {
            id,
            status: AgentStatus::Active,
            backend,
            external_ref: None,
            project_path,
            workspace_ref: None,
            skill: None,
            model,
            deliverables: Vec::new(),
            base_commit: None,
            teardown_pending: false,
            status_reason: None,
            created_at: at,
            updated_at: at,
            updated_by: writer.into(),
        }
    }

    pub fn process_handle(&self) -> Option<&ProcessHandle> {
        match &self.backend {
            AgentBackend::Process { handle } => Some(handle),
            AgentBackend::Api { .. } => None,
        }
    }

    /// Advance `updated_at` so it is strictly greater than its previous value,
    /// even if the wall clock stalled or went backwards.
    pub fn touch(&mut self, at: DateTime<Utc>, writer: &str) {
        let floor = self.updated_at + Duration::microseconds(1);
        self.updated_at = if at > self.updated_at { at } else { floor };
        self.updated_by = writer.to_string();
    }

    pub fn is_deleted(&self) -> bool {
        self.status == AgentStatus::Deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn mk_record() -> AgentRecord {
        AgentRecord::new(
            AgentId::new("api-1a2b-fix-login-20260101-abcd"),
            AgentBackend::Process {
                handle: ProcessHandle::new("orch-api", "@3"),
            },
            PathBuf::from("/src/api"),
            ModelKind::Claude,
            at(1_000),
            "host:1",
        )
    }

    #[test]
    fn window_ids_identify_windows_across_sessions() {
        let original = ProcessHandle::new("orch-api", "@3");
        assert!(original.same_window(&ProcessHandle::new("renamed", "@3")));
        assert!(!original.same_window(&ProcessHandle::new("orch-api", "@4")));

        let named = ProcessHandle::new("orch-api", "agent");
        assert!(named.same_window(&ProcessHandle::new("orch-api", "agent")));
        assert!(!named.same_window(&ProcessHandle::new("orch-web", "agent")));
    }

    #[test]
    fn generated_ids_differ_for_same_task_in_projects_with_same_name() {
        let now = at(1_700_000_000);
        let a = AgentId::generate(Path::new("/work/a/api"), "Fix login bug", now);
        let b = AgentId::generate(Path::new("/work/b/api"), "Fix login bug", now);

        assert!(a.as_str().starts_with("api-"));
        assert!(b.as_str().starts_with("api-"));
        assert_ne!(
            &a.as_str()[..8],
            &b.as_str()[..8],
            "path hash must separate same-named projects"
        );
        assert!(a.as_str().contains("-fix-login-bug-20231114-"));
    }

    #[test]
    fn generated_ids_are_unique_for_repeated_calls() {
        let now = at(1_700_000_000);
        let a = AgentId::generate(Path::new("/work/api"), "same task", now);
        let b = AgentId::generate(Path::new("/work/api"), "same task", now);
        assert_ne!(a, b);
    }

    #[test]
    fn slugify_keeps_first_words_and_falls_back() {
        assert_eq!(
            slugify("Investigate: why does spawn fail?"),
            "investigate-why-does-spawn"
        );
        assert_eq!(slugify("!!!"), "task");
        assert_eq!(project_slug(Path::new("/")), "project");
        assert_eq!(project_slug(Path::new("/src/My_App")), "my-app");
    }

    #[test]
    fn slugify_truncates_single_long_word() {
        let long = "a".repeat(80);
        assert_eq!(slugify(&long).len(), MAX_TASK_SLUG_LEN);
    }

    #[test]
    fn touch_is_strictly_monotonic_even_with_stale_clock() {
        let mut record = mk_record();
        let before = record.updated_at;

        record.touch(at(500), "host:2");
        assert!(record.updated_at > before);
        assert_eq!(record.updated_by, "host:2");

        let second = record.updated_at;
        record.touch(at(2_000), "host:3");
        assert_eq!(record.updated_at, at(2_000));
        assert!(record.updated_at > second);
    }

    #[test]
    fn backend_tag_serializes_with_kind() {
        let record = mk_record();
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["backend"]["kind"], "process");
        assert_eq!(json["backend"]["handle"]["window"], "@3");

        let api = AgentBackend::Api {
            session_ref: "pid:42".to_string(),
        };
        let json = serde_json::to_value(&api).expect("serialize");
        assert_eq!(json["kind"], "api");
        assert!(record.process_handle().is_some());
    }

    #[test]
    fn model_kind_parses_case_insensitively() {
        assert_eq!("Codex".parse::<ModelKind>(), Ok(ModelKind::Codex));
        assert!("gpt".parse::<ModelKind>().is_err());
    }
}
