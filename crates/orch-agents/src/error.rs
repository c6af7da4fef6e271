use std::string::FromUtf8Error;

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("probe command returned non-zero exit ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("probe command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("invalid probe output: {context}")]
    Parse { context: String },
    #[error("invalid session reference {session_ref:?}: expected pid:<n>[:<start>]")]
    InvalidSessionRef { session_ref: String },
    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("agent spawn failed: {message}")]
    Spawn { message: String },
}

#[cfg(test)]
mod tests {
    use super::ProbeError;
    use std::error::Error;

    #[test]
    fn io_variant_includes_command_and_io_message() {
        let err = ProbeError::Io {
            command: "tmux list-windows -a".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary"),
        };

        let rendered = err.to_string();
        assert!(rendered.contains("probe command failed to start (tmux list-windows -a)"));
        assert!(rendered.contains("missing binary"));
        assert!(err.source().is_some());
    }

    #[test]
    fn command_failed_variant_mentions_stderr() {
        let err = ProbeError::CommandFailed {
            command: "tmux kill-window -t orch-api:@4".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "can't find window: @4".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("status=Some(1)"));
        assert!(rendered.contains("can't find window"));
    }

    #[test]
    fn session_ref_variant_names_expected_format() {
        let err = ProbeError::InvalidSessionRef {
            session_ref: "1234".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid session reference \"1234\": expected pid:<n>[:<start>]"
        );
    }
}
