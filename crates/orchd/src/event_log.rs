use orch_core::events::Event;
use orch_core::types::AgentId;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read log file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only lifecycle history, one JSON event per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlEventLog {
    pub path: PathBuf,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &Event) -> Result<(), EventLogError> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| EventLogError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        append_json_line(&self.path, event)
    }

    /// Append, logging instead of failing. Lifecycle history never blocks
    /// the operation it describes.
    pub fn record(&self, event: Event) {
        if let Err(err) = self.append(&event) {
            warn!(event = event.kind.name(), error = %err, "failed to record lifecycle event");
        }
    }

    /// Events in file order, optionally only those about one agent.
    ///
    /// Lines that do not parse (a torn final write, for instance) are skipped.
    pub fn read(&self, agent: Option<&AgentId>) -> Result<Vec<Event>, EventLogError> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(EventLogError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|source| EventLogError::Read {
                path: self.path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(event) if agent.map_or(true, |id| event.agent_id.as_ref() == Some(id)) => {
                    events.push(event)
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %self.path.display(), line = idx + 1, error = %err, "skipping malformed event line")
                }
            }
        }
        Ok(events)
    }
}

fn append_json_line(path: &Path, event: &Event) -> Result<(), EventLogError> {
    let mut line =
        serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;

    // Single write so concurrent appenders do not interleave within a line.
    file.write_all(line.as_bytes())
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}
