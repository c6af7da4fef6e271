use orch_core::types::{AgentId, ModelKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A fully resolved agent command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub executable: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Everything an adapter needs to build the command for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub agent_id: AgentId,
    pub model: ModelKind,
    pub project_path: PathBuf,
    pub workspace_path: PathBuf,
    pub prompt: String,
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchRequest {
    /// Environment every agent sees, followed by caller-provided entries.
    pub fn agent_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("ORCH_AGENT_ID".to_string(), self.agent_id.to_string()),
            (
                "ORCH_WORKSPACE".to_string(),
                self.workspace_path.display().to_string(),
            ),
        ];
        env.extend(self.env.iter().cloned());
        env
    }
}
