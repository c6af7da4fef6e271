use std::path::Path;

use crate::types::AgentCommand;

/// Shell-quote a value using POSIX single-quote escaping.
pub(crate) fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// `cd <dir> && KEY=value ... exec <cmd> <args>` for `sh -c` style launchers.
pub fn render_shell_invocation(cwd: &Path, command: &AgentCommand) -> String {
    let mut rendered = String::new();
    rendered.push_str("cd ");
    rendered.push_str(&shell_quote(&cwd.display().to_string()));
    rendered.push_str(" && ");

    for (key, value) in &command.env {
        if key.trim().is_empty() {
            continue;
        }
        rendered.push_str(key);
        rendered.push('=');
        rendered.push_str(&shell_quote(value));
        rendered.push(' ');
    }

    rendered.push_str("exec ");
    rendered.push_str(&shell_quote(&command.executable));
    for arg in &command.args {
        rendered.push(' ');
        rendered.push_str(&shell_quote(arg));
    }
    rendered
}
