//! File-backed agent registry shared by every `orch` process on the host.
//!
//! Reads are lock-free snapshots. Every write runs under [`RegistryLock`]:
//! read the file, apply one mutation, write the whole file back atomically.
//! Nothing is cached between operations, so each command sees the latest
//! state written by any other process.

use chrono::{DateTime, Utc};
use orch_core::config::OrchConfig;
use orch_core::events::{Event, EventKind};
use orch_core::state::{is_transition_allowed, AgentStatus, StatusError, StatusTransition};
use orch_core::types::{AgentId, AgentRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::event_log::JsonlEventLog;
use crate::lock::{LockError, LockOptions, RegistryLock};
use crate::merge::{merge_snapshots, MergeReport};

pub const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize registry: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write registry {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error(
        "registry is locked by another orch process (waited {}ms{}); retry shortly or remove {path} if no orch process is running",
        .waited.as_millis(),
        .holder.as_ref().map(|holder| format!(", holder {holder}")).unwrap_or_default()
    )]
    Locked {
        path: PathBuf,
        waited: Duration,
        holder: Option<String>,
    },
    #[error(transparent)]
    Lock(LockError),
    #[error("agent {id} is already registered")]
    DuplicateId { id: AgentId },
    #[error("agent {id} is tombstoned and cannot be modified")]
    Tombstoned { id: AgentId },
    #[error("agent {id} not found")]
    NotFound { id: AgentId },
    #[error("agent {id} is {status}; only tombstoned agents can be purged")]
    NotTombstoned { id: AgentId, status: AgentStatus },
    #[error(transparent)]
    Transition(#[from] StatusError),
}

impl From<LockError> for RegistryError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                path,
                waited,
                holder,
            } => RegistryError::Locked {
                path,
                waited,
                holder: holder.map(|holder| holder.to_string()),
            },
            other => RegistryError::Lock(other),
        }
    }
}

/// On-disk registry document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u32,
    #[serde(default)]
    pub records: BTreeMap<String, AgentRecord>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            records: BTreeMap::new(),
        }
    }
}

/// Which records `list` returns. Tombstones are never listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentFilter {
    /// Empty means any non-deleted status.
    pub statuses: Vec<AgentStatus>,
    pub project: Option<PathBuf>,
    /// Empty means every id.
    pub ids: Vec<AgentId>,
}

impl AgentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active() -> Self {
        Self {
            statuses: vec![AgentStatus::Active],
            ..Self::default()
        }
    }

    pub fn only(id: &AgentId) -> Self {
        Self {
            ids: vec![id.clone()],
            ..Self::default()
        }
    }

    pub fn with_project(mut self, project: impl Into<PathBuf>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn matches(&self, record: &AgentRecord) -> bool {
        !record.is_deleted()
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self
                .project
                .as_deref()
                .map_or(true, |project| record.project_path == project)
            && (self.ids.is_empty() || self.ids.contains(&record.id))
    }
}

enum Loaded {
    Missing,
    Parsed(RegistrySnapshot, Vec<u8>),
    Corrupt(serde_json::Error),
}

pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    lock_options: LockOptions,
    writer: String,
    events: Option<JsonlEventLog>,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, "lock");
        Self {
            path,
            lock_path,
            lock_options,
            writer: default_writer(),
            events: None,
        }
    }

    pub fn from_config(config: &OrchConfig) -> Self {
        let registry = Self::open(
            config.registry_path(),
            LockOptions::from(&config.registry),
        );
        if config.events.enabled {
            registry.with_event_log(JsonlEventLog::new(config.events_path()))
        } else {
            registry
        }
    }

    pub fn with_writer(mut self, writer: impl Into<String>) -> Self {
        self.writer = writer.into();
        self
    }

    pub fn with_event_log(mut self, log: JsonlEventLog) -> Self {
        self.events = Some(log);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Identity stamped into `updated_by` on every write.
    pub fn writer(&self) -> &str {
        &self.writer
    }

    pub fn event_log(&self) -> Option<&JsonlEventLog> {
        self.events.as_ref()
    }

    pub fn record_event(&self, event: Event) {
        if let Some(log) = &self.events {
            log.record(event);
        }
    }

    /// Current contents without taking the lock.
    ///
    /// A corrupt file falls back to the backup copy of the last good write.
    pub fn snapshot(&self) -> Result<RegistrySnapshot, RegistryError> {
        match read_file(&self.path)? {
            Loaded::Missing => Ok(RegistrySnapshot::default()),
            Loaded::Parsed(snapshot, _) => Ok(snapshot),
            Loaded::Corrupt(source) => {
                error!(path = %self.path.display(), error = %source, "registry file is corrupt; reading backup");
                match read_file(&self.backup_path())? {
                    Loaded::Parsed(snapshot, _) => Ok(snapshot),
                    _ => Err(RegistryError::Parse {
                        path: self.path.clone(),
                        source,
                    }),
                }
            }
        }
    }

    /// Lookup by id, tombstones included.
    pub fn get(&self, id: &AgentId) -> Result<Option<AgentRecord>, RegistryError> {
        Ok(self.snapshot()?.records.remove(id.as_str()))
    }

    pub fn list(
        &self,
        filter: &AgentFilter,
    ) -> Result<std::vec::IntoIter<AgentRecord>, RegistryError> {
        let records = self
            .snapshot()?
            .records
            .into_values()
            .filter(|record| filter.matches(record))
            .collect::<Vec<_>>();
        Ok(records.into_iter())
    }

    pub fn register(&self, mut record: AgentRecord) -> Result<AgentRecord, RegistryError> {
        if record.updated_by.is_empty() {
            record.updated_by = self.writer.clone();
        }
        self.locked(|snapshot, _events| {
            if let Some(existing) = snapshot.records.get(record.id.as_str()) {
                return Err(if existing.is_deleted() {
                    RegistryError::Tombstoned {
                        id: record.id.clone(),
                    }
                } else {
                    RegistryError::DuplicateId {
                        id: record.id.clone(),
                    }
                });
            }
            snapshot
                .records
                .insert(record.id.to_string(), record.clone());
            info!(agent_id = %record.id, backend = %record.backend, "registered agent");
            Ok((record, true))
        })
    }

    /// Apply `mutation` to one record under the lock.
    ///
    /// The status change it makes must follow the lifecycle order, and
    /// tombstones cannot be mutated. A mutation that changes nothing does
    /// not rewrite the file.
    pub fn update<F>(&self, id: &AgentId, mutation: F) -> Result<AgentRecord, RegistryError>
    where
        F: FnOnce(&mut AgentRecord) -> Result<(), RegistryError>,
    {
        self.update_detailed(id, mutation).map(|(_, record)| record)
    }

    /// Move `id` from `expected` to `to`, re-checked under the lock.
    ///
    /// Returns `None` when another process already moved the record on.
    pub fn transition(
        &self,
        id: &AgentId,
        expected: AgentStatus,
        to: AgentStatus,
        reason: Option<String>,
    ) -> Result<Option<StatusTransition>, RegistryError> {
        let (before, record) = self.update_detailed(id, |record| {
            if record.status == expected {
                record.status = to;
                if reason.is_some() {
                    record.status_reason = reason;
                }
            }
            Ok(())
        })?;
        if before == expected && record.status == to && before != to {
            Ok(Some(StatusTransition {
                from: before,
                to,
                at: record.updated_at,
            }))
        } else {
            debug!(agent_id = %id, expected = %expected, actual = %before, "transition skipped");
            Ok(None)
        }
    }

    /// Mark a finished record deleted. Tombstoning a tombstone is a no-op.
    pub fn tombstone(&self, id: &AgentId) -> Result<AgentRecord, RegistryError> {
        let result = self.update(id, |record| {
            record.status = AgentStatus::Deleted;
            record.teardown_pending = false;
            Ok(())
        });
        match result {
            Err(RegistryError::Tombstoned { .. }) => self
                .get(id)?
                .ok_or_else(|| RegistryError::NotFound { id: id.clone() }),
            other => other,
        }
    }

    /// Physically remove one tombstone.
    pub fn purge(&self, id: &AgentId) -> Result<AgentRecord, RegistryError> {
        self.locked(|snapshot, events| {
            let status = snapshot
                .records
                .get(id.as_str())
                .map(|record| record.status)
                .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;
            if !status.is_deleted() {
                return Err(RegistryError::NotTombstoned {
                    id: id.clone(),
                    status,
                });
            }
            let removed = snapshot
                .records
                .remove(id.as_str())
                .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;
            events.push(Event::for_agent(id, Utc::now(), EventKind::Purged));
            Ok((removed, true))
        })
    }

    /// Remove every tombstone last written before `older_than`.
    pub fn purge_tombstones(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<AgentId>, RegistryError> {
        self.locked(|snapshot, events| {
            let doomed = snapshot
                .records
                .values()
                .filter(|record| record.is_deleted() && record.updated_at < older_than)
                .map(|record| record.id.clone())
                .collect::<Vec<_>>();
            let now = Utc::now();
            for id in &doomed {
                snapshot.records.remove(id.as_str());
                events.push(Event::for_agent(id, now, EventKind::Purged));
            }
            let dirty = !doomed.is_empty();
            Ok((doomed, dirty))
        })
    }

    /// Fold a foreign snapshot into this registry using the record merge rule.
    pub fn merge(&self, external: RegistrySnapshot) -> Result<MergeReport, RegistryError> {
        self.locked(|snapshot, events| {
            let report = merge_snapshots(&mut snapshot.records, external.records);
            info!(
                added = report.added.len(),
                updated = report.updated.len(),
                unchanged = report.unchanged,
                "merged registry snapshot"
            );
            let dirty = !report.is_noop();
            if dirty {
                events.push(Event::new(
                    None,
                    Utc::now(),
                    EventKind::RegistryMerged {
                        added: report.added.len(),
                        updated: report.updated.len(),
                    },
                ));
            }
            Ok((report, dirty))
        })
    }

    fn update_detailed<F>(
        &self,
        id: &AgentId,
        mutation: F,
    ) -> Result<(AgentStatus, AgentRecord), RegistryError>
    where
        F: FnOnce(&mut AgentRecord) -> Result<(), RegistryError>,
    {
        self.locked(|snapshot, events| {
            let current = snapshot
                .records
                .get(id.as_str())
                .ok_or_else(|| RegistryError::NotFound { id: id.clone() })?;
            if current.is_deleted() {
                return Err(RegistryError::Tombstoned { id: id.clone() });
            }

            let mut next = current.clone();
            mutation(&mut next)?;
            next.id = current.id.clone();
            let (from, to) = (current.status, next.status);
            if !is_transition_allowed(from, to) {
                return Err(StatusError::InvalidTransition { from, to }.into());
            }
            if &next == current {
                return Ok(((from, next), false));
            }

            next.updated_at = current.updated_at;
            next.touch(Utc::now(), &self.writer);
            if from != to {
                info!(agent_id = %id, from = %from, to = %to, reason = ?next.status_reason, "agent status changed");
                let kind = if to.is_deleted() {
                    EventKind::Tombstoned
                } else {
                    EventKind::StatusChanged {
                        from,
                        to,
                        reason: next.status_reason.clone(),
                    }
                };
                events.push(Event::for_agent(id, next.updated_at, kind));
            }
            snapshot.records.insert(id.to_string(), next.clone());
            Ok(((from, next), true))
        })
    }

    /// Lock, load, mutate, write back when `op` reports a change, unlock.
    fn locked<T, F>(&self, op: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut RegistrySnapshot, &mut Vec<Event>) -> Result<(T, bool), RegistryError>,
    {
        let lock = RegistryLock::acquire(&self.lock_path, &self.lock_options)?;
        for broken in lock.broken() {
            self.record_event(Event::new(
                None,
                Utc::now(),
                EventKind::StaleLockBroken {
                    holder: broken.holder.as_ref().map(ToString::to_string),
                },
            ));
        }

        let (mut snapshot, previous) = self.load_for_write()?;
        let mut events = Vec::new();
        let (value, dirty) = op(&mut snapshot, &mut events)?;
        if dirty {
            self.persist(&snapshot, previous.as_deref())?;
        }
        drop(lock);

        for event in events {
            self.record_event(event);
        }
        Ok(value)
    }

    fn load_for_write(&self) -> Result<(RegistrySnapshot, Option<Vec<u8>>), RegistryError> {
        match read_file(&self.path)? {
            Loaded::Missing => Ok((RegistrySnapshot::default(), None)),
            Loaded::Parsed(snapshot, bytes) => Ok((snapshot, Some(bytes))),
            Loaded::Corrupt(source) => {
                let quarantine = self.quarantine()?;
                error!(
                    path = %self.path.display(),
                    moved_to = %quarantine.display(),
                    error = %source,
                    "registry file is corrupt; moved aside"
                );
                match read_file(&self.backup_path())? {
                    Loaded::Parsed(snapshot, _) => {
                        warn!(backup = %self.backup_path().display(), "restoring registry from backup");
                        Ok((snapshot, None))
                    }
                    _ => {
                        error!("no usable registry backup; starting empty");
                        Ok((RegistrySnapshot::default(), None))
                    }
                }
            }
        }
    }

    fn persist(
        &self,
        snapshot: &RegistrySnapshot,
        previous: Option<&[u8]>,
    ) -> Result<(), RegistryError> {
        if let Some(previous) = previous {
            atomic_write(&self.backup_path(), previous)?;
        }
        let payload = serde_json::to_vec_pretty(snapshot)
            .map_err(|source| RegistryError::Serialize { source })?;
        atomic_write(&self.path, &payload)?;
        debug!(path = %self.path.display(), records = snapshot.records.len(), "registry written");
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        sibling(&self.path, "bak")
    }

    fn quarantine(&self) -> Result<PathBuf, RegistryError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let target = sibling(&self.path, &format!("corrupt-{stamp}"));
        fs::rename(&self.path, &target).map_err(|source| RegistryError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

/// Read a registry file strictly, as `orch merge` does for foreign snapshots.
pub fn read_snapshot_file(path: &Path) -> Result<RegistrySnapshot, RegistryError> {
    match read_file(path)? {
        Loaded::Parsed(snapshot, _) => Ok(snapshot),
        Loaded::Missing => Err(RegistryError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::NotFound, "no such file"),
        }),
        Loaded::Corrupt(source) => Err(RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_file(path: &Path) -> Result<Loaded, RegistryError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(source) => {
            return Err(RegistryError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    match serde_json::from_slice::<RegistrySnapshot>(&bytes) {
        Ok(snapshot) if snapshot.version != REGISTRY_VERSION => {
            Err(RegistryError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: snapshot.version,
            })
        }
        Ok(snapshot) => Ok(Loaded::Parsed(snapshot, bytes)),
        Err(err) => Ok(Loaded::Corrupt(err)),
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let write_err = |source: std::io::Error| RegistryError::Write {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(parent).map_err(write_err)?;
    let mut temp = NamedTempFile::new_in(parent).map_err(write_err)?;
    temp.write_all(bytes).map_err(write_err)?;
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;
    Ok(())
}

/// `registry.json` -> `registry.json.<suffix>`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{suffix}"));
    path.with_file_name(name)
}

fn default_writer() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:{}", std::process::id())
}
