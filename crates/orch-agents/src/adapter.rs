use orch_core::types::ModelKind;

use crate::types::{AgentCommand, LaunchRequest};

/// Builds the interactive command line for one model's CLI.
pub trait AgentAdapter: Send + Sync {
    fn model(&self) -> ModelKind;
    fn build_command(&self, request: &LaunchRequest) -> AgentCommand;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaudeAdapter {
    pub executable: String,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
        }
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn model(&self) -> ModelKind {
        ModelKind::Claude
    }

    fn build_command(&self, request: &LaunchRequest) -> AgentCommand {
        let mut args = request.extra_args.clone();
        args.push(request.prompt.clone());
        AgentCommand {
            executable: self.executable.clone(),
            args,
            env: request.agent_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodexAdapter {
    pub executable: String,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self {
            executable: "codex".to_string(),
        }
    }
}

impl AgentAdapter for CodexAdapter {
    fn model(&self) -> ModelKind {
        ModelKind::Codex
    }

    fn build_command(&self, request: &LaunchRequest) -> AgentCommand {
        let mut args = vec![
            "--cd".to_string(),
            request.project_path.display().to_string(),
        ];
        args.extend(request.extra_args.iter().cloned());
        args.push(request.prompt.clone());
        AgentCommand {
            executable: self.executable.clone(),
            args,
            env: request.agent_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiAdapter {
    pub executable: String,
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self {
            executable: "gemini".to_string(),
        }
    }
}

impl AgentAdapter for GeminiAdapter {
    fn model(&self) -> ModelKind {
        ModelKind::Gemini
    }

    fn build_command(&self, request: &LaunchRequest) -> AgentCommand {
        let mut args = request.extra_args.clone();
        args.push("--prompt-interactive".to_string());
        args.push(request.prompt.clone());
        AgentCommand {
            executable: self.executable.clone(),
            args,
            env: request.agent_env(),
        }
    }
}

pub fn default_adapter_for(model: ModelKind) -> Box<dyn AgentAdapter> {
    match model {
        ModelKind::Claude => Box::new(ClaudeAdapter::default()),
        ModelKind::Codex => Box::new(CodexAdapter::default()),
        ModelKind::Gemini => Box::new(GeminiAdapter::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::types::AgentId;
    use std::path::PathBuf;

    fn mk_request(model: ModelKind) -> LaunchRequest {
        LaunchRequest {
            agent_id: AgentId::new("api-0a1b-fix-login-20260201-beef"),
            model,
            project_path: PathBuf::from("/src/api"),
            workspace_path: PathBuf::from("/src/api/.orch/workspace/api-0a1b-fix-login-20260201-beef"),
            prompt: "fix the login bug".to_string(),
            extra_args: vec!["--verbose".to_string()],
            env: vec![("EXTRA".to_string(), "1".to_string())],
        }
    }

    #[test]
    fn claude_places_prompt_last_and_sets_agent_env() {
        let command = ClaudeAdapter::default().build_command(&mk_request(ModelKind::Claude));
        assert_eq!(command.executable, "claude");
        assert_eq!(command.args, vec!["--verbose", "fix the login bug"]);
        assert_eq!(command.env[0].0, "ORCH_AGENT_ID");
        assert_eq!(command.env[0].1, "api-0a1b-fix-login-20260201-beef");
        assert_eq!(command.env[1].0, "ORCH_WORKSPACE");
        assert_eq!(command.env[2], ("EXTRA".to_string(), "1".to_string()));
    }

    #[test]
    fn codex_runs_in_project_directory() {
        let command = CodexAdapter::default().build_command(&mk_request(ModelKind::Codex));
        assert_eq!(command.args[..2], ["--cd".to_string(), "/src/api".to_string()]);
        assert_eq!(command.args.last().map(String::as_str), Some("fix the login bug"));
    }

    #[test]
    fn default_adapter_matches_requested_model() {
        for model in [ModelKind::Claude, ModelKind::Codex, ModelKind::Gemini] {
            assert_eq!(default_adapter_for(model).model(), model);
        }
    }
}
