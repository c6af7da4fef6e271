use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::AgentStatus;
use crate::types::AgentId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentSpawned {
        backend: String,
    },
    StatusChanged {
        from: AgentStatus,
        to: AgentStatus,
        reason: Option<String>,
    },
    VerificationRefused {
        missing: Vec<String>,
    },
    TeardownDeferred,
    TornDown {
        forced: bool,
    },
    Tombstoned,
    Purged,
    TrackerUnavailable {
        message: String,
    },
    StaleLockBroken {
        holder: Option<String>,
    },
    RegistryMerged {
        added: usize,
        updated: usize,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AgentSpawned { .. } => "agent_spawned",
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::VerificationRefused { .. } => "verification_refused",
            EventKind::TeardownDeferred => "teardown_deferred",
            EventKind::TornDown { .. } => "torn_down",
            EventKind::Tombstoned => "tombstoned",
            EventKind::Purged => "purged",
            EventKind::TrackerUnavailable { .. } => "tracker_unavailable",
            EventKind::StaleLockBroken { .. } => "stale_lock_broken",
            EventKind::RegistryMerged { .. } => "registry_merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub agent_id: Option<AgentId>,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(agent_id: Option<AgentId>, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            id: EventId::generate(),
            agent_id,
            at,
            kind,
        }
    }

    pub fn for_agent(agent_id: &AgentId, at: DateTime<Utc>, kind: EventKind) -> Self {
        Self::new(Some(agent_id.clone()), at, kind)
    }
}
