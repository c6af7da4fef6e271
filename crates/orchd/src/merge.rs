//! Merging two views of the same agent record.
//!
//! The newer record wins. Ties on `updated_at` fall back to status rank, then
//! the writer name, then the canonical JSON of the whole record, which makes
//! the choice a total order. The winner never ends up with a lower status
//! rank than the loser had, so a stale snapshot cannot resurrect a finished
//! or tombstoned agent.

use orch_core::types::AgentRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

fn canonical_json(record: &AgentRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

fn precedence(a: &AgentRecord, b: &AgentRecord) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| a.status.rank().cmp(&b.status.rank()))
        .then_with(|| a.updated_by.cmp(&b.updated_by))
        .then_with(|| canonical_json(a).cmp(&canonical_json(b)))
}

/// Merge two versions of one record. Commutative and idempotent.
pub fn merge_records(a: &AgentRecord, b: &AgentRecord) -> AgentRecord {
    let (winner, loser) = match precedence(a, b) {
        Ordering::Less => (b, a),
        _ => (a, b),
    };
    let mut merged = winner.clone();
    if loser.status.rank() > merged.status.rank() {
        merged.status = loser.status;
        merged.status_reason = loser.status_reason.clone();
        merged.teardown_pending = loser.teardown_pending;
    }
    merged
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty()
    }
}

/// Fold `external` records into `local`, keyed by agent id.
pub fn merge_snapshots(
    local: &mut BTreeMap<String, AgentRecord>,
    external: BTreeMap<String, AgentRecord>,
) -> MergeReport {
    let mut report = MergeReport::default();
    for (id, theirs) in external {
        match local.get(&id) {
            None => {
                local.insert(id.clone(), theirs);
                report.added.push(id);
            }
            Some(ours) => {
                let merged = merge_records(ours, &theirs);
                if &merged == ours {
                    report.unchanged += 1;
                } else {
                    local.insert(id.clone(), merged);
                    report.updated.push(id);
                }
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use orch_core::state::AgentStatus;
    use orch_core::types::{AgentBackend, AgentId, ModelKind, ProcessHandle};
    use proptest::prelude::*;
    use std::path::PathBuf;

    const STATUSES: [AgentStatus; 5] = [
        AgentStatus::Active,
        AgentStatus::Completed,
        AgentStatus::Terminated,
        AgentStatus::Abandoned,
        AgentStatus::Deleted,
    ];

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn mk_record(status: AgentStatus, updated: i64, writer: &str) -> AgentRecord {
        let mut record = AgentRecord::new(
            AgentId::new("api-0000-fix-20260101-abcd"),
            AgentBackend::Process {
                handle: ProcessHandle::new("orch-api", "@1"),
            },
            PathBuf::from("/src/api"),
            ModelKind::Claude,
            at(100),
            writer,
        );
        record.status = status;
        record.updated_at = at(updated);
        record
    }

    #[test]
    fn newer_record_wins() {
        let old = mk_record(AgentStatus::Active, 200, "a");
        let mut new = mk_record(AgentStatus::Active, 300, "b");
        new.status_reason = Some("note".to_string());

        assert_eq!(merge_records(&old, &new), new);
        assert_eq!(merge_records(&new, &old), new);
    }

    #[test]
    fn stale_active_copy_cannot_revive_tombstone() {
        let tombstone = mk_record(AgentStatus::Deleted, 200, "a");
        let mut newer_active = mk_record(AgentStatus::Active, 300, "b");
        newer_active.external_ref = Some("bd-12".to_string());

        let merged = merge_records(&newer_active, &tombstone);
        assert_eq!(merged.status, AgentStatus::Deleted);
        assert_eq!(merged.external_ref.as_deref(), Some("bd-12"));
        assert_eq!(merged.updated_at, at(300));
    }

    #[test]
    fn equal_timestamps_prefer_higher_rank_then_writer() {
        let active = mk_record(AgentStatus::Active, 200, "z");
        let completed = mk_record(AgentStatus::Completed, 200, "a");
        assert_eq!(merge_records(&active, &completed).status, AgentStatus::Completed);

        let terminated = mk_record(AgentStatus::Terminated, 200, "b");
        let merged = merge_records(&completed, &terminated);
        assert_eq!(merged, terminated);
        assert_eq!(merge_records(&terminated, &completed), terminated);
    }

    #[test]
    fn snapshot_merge_reports_added_and_updated() {
        let mut local = BTreeMap::new();
        let mut ours = mk_record(AgentStatus::Active, 200, "a");
        ours.id = AgentId::new("one");
        local.insert("one".to_string(), ours.clone());
        let mut same = mk_record(AgentStatus::Active, 200, "a");
        same.id = AgentId::new("same");
        local.insert("same".to_string(), same.clone());

        let mut external = BTreeMap::new();
        let mut theirs = ours.clone();
        theirs.status = AgentStatus::Completed;
        theirs.updated_at = at(400);
        external.insert("one".to_string(), theirs.clone());
        external.insert("same".to_string(), same);
        let mut fresh = mk_record(AgentStatus::Active, 100, "c");
        fresh.id = AgentId::new("two");
        external.insert("two".to_string(), fresh);

        let report = merge_snapshots(&mut local, external);
        assert_eq!(report.added, vec!["two".to_string()]);
        assert_eq!(report.updated, vec!["one".to_string()]);
        assert_eq!(report.unchanged, 1);
        assert_eq!(local["one"], theirs);
        assert!(!report.is_noop());
    }

    fn arb_record() -> impl Strategy<Value = AgentRecord> {
        (
            0usize..5,
            0i64..4,
            prop_oneof![Just("a"), Just("b"), Just("c")],
            proptest::option::of("[a-z]{0,3}"),
            any::<bool>(),
        )
            .prop_map(|(status, updated, writer, reason, pending)| {
                let mut record = mk_record(STATUSES[status], 1_000 + updated, writer);
                record.status_reason = reason;
                record.teardown_pending = pending;
                record
            })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_record(), b in arb_record()) {
            prop_assert_eq!(merge_records(&a, &b), merge_records(&b, &a));
        }

        #[test]
        fn merge_is_idempotent(a in arb_record(), b in arb_record()) {
            prop_assert_eq!(merge_records(&a, &a), a.clone());
            let once = merge_records(&a, &b);
            prop_assert_eq!(merge_records(&once, &b), once.clone());
        }

        #[test]
        fn merge_keeps_highest_rank(a in arb_record(), b in arb_record()) {
            let merged = merge_records(&a, &b);
            prop_assert_eq!(merged.status.rank(), a.status.rank().max(b.status.rank()));
            prop_assert_eq!(merged.updated_at, a.updated_at.max(b.updated_at));
        }
    }
}
