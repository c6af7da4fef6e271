use chrono::{DateTime, Utc};
use orch_core::phase::{is_complete_phase, latest_phase};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TrackerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    Other(String),
}

impl IssueStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => IssueStatus::Open,
            "in_progress" => IssueStatus::InProgress,
            "blocked" => IssueStatus::Blocked,
            "closed" => IssueStatus::Closed,
            other => IssueStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::InProgress => "in_progress",
            IssueStatus::Blocked => "blocked",
            IssueStatus::Closed => "closed",
            IssueStatus::Other(other) => other,
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerComment {
    pub author: Option<String>,
    pub text: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerIssue {
    pub id: String,
    pub title: Option<String>,
    pub status: IssueStatus,
    /// Oldest first.
    pub comments: Vec<TrackerComment>,
}

impl TrackerIssue {
    pub fn is_closed(&self) -> bool {
        self.status == IssueStatus::Closed
    }

    /// Phase from the most recent comment that reports one.
    pub fn latest_phase(&self) -> Option<String> {
        self.comments
            .iter()
            .rev()
            .find_map(|comment| latest_phase(&comment.text))
    }

    /// Closed, or the agent's last reported phase is complete.
    pub fn reports_completion(&self) -> bool {
        self.is_closed()
            || self
                .latest_phase()
                .is_some_and(|phase| is_complete_phase(&phase))
    }
}

/// Parse `bd show <id> --json`, which prints either one object or a
/// one-element array depending on the bd version.
pub fn parse_issue_json(raw: &str) -> Result<TrackerIssue, TrackerError> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|err| TrackerError::Parse {
        message: format!("bd show output is not JSON: {err}"),
    })?;
    let object = match value {
        Value::Array(items) => items.into_iter().next().ok_or_else(|| TrackerError::Parse {
            message: "bd show returned no issue".to_string(),
        })?,
        object @ Value::Object(_) => object,
        other => {
            return Err(TrackerError::Parse {
                message: format!("expected an issue object, got {other}"),
            })
        }
    };

    let id = string_field(&object, "id").ok_or_else(|| TrackerError::Parse {
        message: "issue has no id".to_string(),
    })?;
    let status = string_field(&object, "status")
        .map(|status| IssueStatus::parse(&status))
        .ok_or_else(|| TrackerError::Parse {
            message: format!("issue {id} has no status"),
        })?;
    let comments = match object.get("comments") {
        Some(Value::Array(items)) => parse_comment_values(items)?,
        _ => Vec::new(),
    };

    Ok(TrackerIssue {
        id,
        title: string_field(&object, "title"),
        status,
        comments,
    })
}

/// Parse `bd comments <id> --json`.
pub fn parse_comments_json(raw: &str) -> Result<Vec<TrackerComment>, TrackerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed).map_err(|err| TrackerError::Parse {
        message: format!("bd comments output is not JSON: {err}"),
    })?;
    match value {
        Value::Array(items) => parse_comment_values(&items),
        other => Err(TrackerError::Parse {
            message: format!("expected a comment array, got {other}"),
        }),
    }
}

fn parse_comment_values(items: &[Value]) -> Result<Vec<TrackerComment>, TrackerError> {
    let mut comments = items
        .iter()
        .map(|item| {
            let text = string_field(item, "text")
                .or_else(|| string_field(item, "body"))
                .ok_or_else(|| TrackerError::Parse {
                    message: format!("comment without text: {item}"),
                })?;
            Ok(TrackerComment {
                author: string_field(item, "author"),
                text,
                created_at: string_field(item, "created_at")
                    .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                    .map(|at| at.with_timezone(&Utc)),
            })
        })
        .collect::<Result<Vec<_>, TrackerError>>()?;
    // Stable, so comments without timestamps keep their printed order.
    comments.sort_by_key(|comment| comment.created_at);
    Ok(comments)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
