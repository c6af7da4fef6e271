use std::string::FromUtf8Error;
use std::time::Duration;

/// Every variant means the tracker could not answer; callers treat them as
/// "tracker unavailable" and never as a negative answer.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("tracker command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tracker command returned non-zero exit ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("tracker command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
    #[error("tracker command timed out after {timeout:?} ({command})")]
    Timeout { command: String, timeout: Duration },
    #[error("tracker contract violation: {message}")]
    ContractViolation { message: String },
    #[error("unable to parse tracker output: {message}")]
    Parse { message: String },
}

impl TrackerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TrackerError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::TrackerError;
    use std::time::Duration;

    #[test]
    fn timeout_variant_mentions_duration_and_command() {
        let err = TrackerError::Timeout {
            command: "bd show orch-12 --json".to_string(),
            timeout: Duration::from_secs(15),
        };
        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "tracker command timed out after 15s (bd show orch-12 --json)"
        );
    }

    #[test]
    fn command_failed_variant_carries_stderr() {
        let err = TrackerError::CommandFailed {
            command: "bd close orch-12 --reason done".to_string(),
            status: Some(1),
            stdout: String::new(),
            stderr: "issue not found".to_string(),
        };
        assert!(!err.is_timeout());
        assert!(err.to_string().ends_with("status=Some(1): issue not found"));
    }
}
