//! Field-level conflict detection and resolution.
//!
//! A conflict exists only when a critical field differs after
//! normalisation; non-critical divergence is upstream-wins by definition.
//! Conflicts are memoised by `table:sys_id` so operators can inspect what
//! happened; resolved entries are pruned after each full sync cycle.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::models::{normalized_field, parse_sys_timestamp, TicketTable};

/// Critical fields compared for conflict detection. Configurable per
/// resolver; this is the default set.
pub const DEFAULT_CRITICAL_FIELDS: [&str; 4] =
    ["state", "priority", "short_description", "assignment_group"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    UpstreamWins,
    StoredWins,
    #[default]
    NewestWins,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSide {
    Stored,
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

/// A detected divergence, kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct Conflict {
    pub sys_id: String,
    pub table: TicketTable,
    pub stored: Value,
    pub upstream: Value,
    pub divergent_fields: Vec<String>,
    pub status: ConflictStatus,
    pub winner: Option<ConflictSide>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("manual resolution required for {table}/{sys_id}")]
    ManualResolutionRequired { table: TicketTable, sys_id: String },
}

/// Outcome of running a record through the resolver.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// No critical divergence; upstream overwrites as usual.
    Clean,
    /// Divergence resolved by policy; write `payload`.
    Resolved { winner: ConflictSide, payload: Value },
}

pub struct ConflictResolver {
    critical_fields: Vec<String>,
    policy: ConflictPolicy,
    conflicts: Mutex<HashMap<String, Conflict>>,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self::with_critical_fields(
            policy,
            DEFAULT_CRITICAL_FIELDS.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn with_critical_fields(policy: ConflictPolicy, critical_fields: Vec<String>) -> Self {
        Self {
            critical_fields,
            policy,
            conflicts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn critical_fields(&self) -> &[String] {
        &self.critical_fields
    }

    /// Critical fields that differ between the two payloads after
    /// normalisation.
    pub fn divergent_fields(&self, stored: &Value, upstream: &Value) -> Vec<String> {
        self.critical_fields
            .iter()
            .filter(|field| normalized_field(stored, field) != normalized_field(upstream, field))
            .cloned()
            .collect()
    }

    /// Detect and resolve divergence between the stored and upstream
    /// snapshots of one record.
    pub fn resolve(
        &self,
        table: TicketTable,
        sys_id: &str,
        stored: &Value,
        upstream: &Value,
    ) -> Result<Resolution, ConflictError> {
        let divergent = self.divergent_fields(stored, upstream);
        if divergent.is_empty() {
            return Ok(Resolution::Clean);
        }

        let winner = match self.policy {
            ConflictPolicy::UpstreamWins => Some(ConflictSide::Upstream),
            ConflictPolicy::StoredWins => Some(ConflictSide::Stored),
            ConflictPolicy::NewestWins => Some(newest_side(stored, upstream)),
            ConflictPolicy::Manual => None,
        };

        self.remember(Conflict {
            sys_id: sys_id.to_string(),
            table,
            stored: stored.clone(),
            upstream: upstream.clone(),
            divergent_fields: divergent,
            status: if winner.is_some() {
                ConflictStatus::Resolved
            } else {
                ConflictStatus::Pending
            },
            winner,
            detected_at: Utc::now(),
        });

        match winner {
            Some(ConflictSide::Upstream) => Ok(Resolution::Resolved {
                winner: ConflictSide::Upstream,
                payload: upstream.clone(),
            }),
            Some(ConflictSide::Stored) => Ok(Resolution::Resolved {
                winner: ConflictSide::Stored,
                payload: stored.clone(),
            }),
            None => Err(ConflictError::ManualResolutionRequired {
                table,
                sys_id: sys_id.to_string(),
            }),
        }
    }

    fn remember(&self, conflict: Conflict) {
        let key = format!("{}:{}", conflict.table, conflict.sys_id);
        self.conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, conflict);
    }

    /// Conflicts currently memoised, pending first.
    pub fn conflicts(&self) -> Vec<Conflict> {
        let mut all: Vec<Conflict> = self
            .conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| (c.status == ConflictStatus::Resolved, c.detected_at));
        all
    }

    pub fn pending_count(&self) -> usize {
        self.conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|c| c.status == ConflictStatus::Pending)
            .count()
    }

    /// Drop resolved entries to bound memory; pending ones stay for the
    /// operator.
    pub fn prune_resolved(&self) -> usize {
        let mut conflicts = self.conflicts.lock().unwrap_or_else(|e| e.into_inner());
        let before = conflicts.len();
        conflicts.retain(|_, c| c.status == ConflictStatus::Pending);
        before - conflicts.len()
    }
}

/// Newest-wins comparison on `sys_updated_on`; ties and unparseable
/// timestamps go upstream.
fn newest_side(stored: &Value, upstream: &Value) -> ConflictSide {
    let stored_at = normalized_field(stored, "sys_updated_on")
        .as_deref()
        .and_then(parse_sys_timestamp);
    let upstream_at = normalized_field(upstream, "sys_updated_on")
        .as_deref()
        .and_then(parse_sys_timestamp);

    match (stored_at, upstream_at) {
        (Some(stored_at), Some(upstream_at)) if stored_at > upstream_at => ConflictSide::Stored,
        _ => ConflictSide::Upstream,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(state: &str, updated: &str) -> Value {
        json!({
            "sys_id": "aaa",
            "state": state,
            "priority": "3",
            "short_description": "x",
            "assignment_group": "ops",
            "sys_updated_on": updated
        })
    }

    #[test]
    fn identical_critical_fields_are_clean() {
        let resolver = ConflictResolver::new(ConflictPolicy::NewestWins);
        let a = stored("2", "2025-01-01 10:00:00");
        // Non-critical divergence only.
        let mut b = a.clone();
        b["comments"] = json!("new note");
        b["sys_updated_on"] = json!("2025-01-01 11:00:00");

        assert!(matches!(
            resolver.resolve(TicketTable::Incident, "aaa", &a, &b).unwrap(),
            Resolution::Clean
        ));
        assert_eq!(resolver.conflicts().len(), 0);
    }

    #[test]
    fn container_normalisation_prevents_false_conflicts() {
        let resolver = ConflictResolver::new(ConflictPolicy::NewestWins);
        let a = json!({"state": "2", "priority": "3"});
        let b = json!({"state": {"value": "2", "display_value": "In Progress"}, "priority": " 3 "});
        assert!(resolver.divergent_fields(&a, &b).is_empty());
    }

    #[test]
    fn newest_wins_prefers_fresher_upstream() {
        let resolver = ConflictResolver::new(ConflictPolicy::NewestWins);
        let old = stored("2", "2025-01-01 10:00:00");
        let new = {
            let mut v = stored("6", "2025-01-01 11:00:00");
            v["sys_id"] = json!("aaa");
            v
        };

        match resolver.resolve(TicketTable::Incident, "aaa", &old, &new).unwrap() {
            Resolution::Resolved { winner, payload } => {
                assert_eq!(winner, ConflictSide::Upstream);
                assert_eq!(payload["state"], "6");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn newest_wins_keeps_fresher_stored() {
        let resolver = ConflictResolver::new(ConflictPolicy::NewestWins);
        let fresh_stored = stored("2", "2025-01-02 09:00:00");
        let stale_upstream = stored("6", "2025-01-01 11:00:00");

        match resolver
            .resolve(TicketTable::Incident, "aaa", &fresh_stored, &stale_upstream)
            .unwrap()
        {
            Resolution::Resolved { winner, payload } => {
                assert_eq!(winner, ConflictSide::Stored);
                assert_eq!(payload["state"], "2");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn newest_wins_tie_goes_upstream() {
        let resolver = ConflictResolver::new(ConflictPolicy::NewestWins);
        let a = stored("2", "2025-01-01 10:00:00");
        let b = stored("6", "2025-01-01 10:00:00");

        match resolver.resolve(TicketTable::Incident, "aaa", &a, &b).unwrap() {
            Resolution::Resolved { winner, .. } => assert_eq!(winner, ConflictSide::Upstream),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn fixed_policies_ignore_timestamps() {
        let fresh_stored = stored("2", "2025-01-02 09:00:00");
        let stale_upstream = stored("6", "2025-01-01 11:00:00");

        let resolver = ConflictResolver::new(ConflictPolicy::UpstreamWins);
        match resolver
            .resolve(TicketTable::Incident, "aaa", &fresh_stored, &stale_upstream)
            .unwrap()
        {
            Resolution::Resolved { winner, .. } => assert_eq!(winner, ConflictSide::Upstream),
            other => panic!("unexpected resolution: {other:?}"),
        }

        let resolver = ConflictResolver::new(ConflictPolicy::StoredWins);
        match resolver
            .resolve(TicketTable::Incident, "aaa", &fresh_stored, &stale_upstream)
            .unwrap()
        {
            Resolution::Resolved { winner, .. } => assert_eq!(winner, ConflictSide::Stored),
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn manual_policy_keeps_conflict_pending() {
        let resolver = ConflictResolver::new(ConflictPolicy::Manual);
        let a = stored("2", "2025-01-01 10:00:00");
        let b = stored("6", "2025-01-01 11:00:00");

        let err = resolver
            .resolve(TicketTable::Incident, "aaa", &a, &b)
            .unwrap_err();
        assert!(matches!(err, ConflictError::ManualResolutionRequired { .. }));
        assert_eq!(resolver.pending_count(), 1);

        // Pending conflicts survive pruning.
        assert_eq!(resolver.prune_resolved(), 0);
        assert_eq!(resolver.pending_count(), 1);
    }

    #[test]
    fn prune_drops_resolved_conflicts() {
        let resolver = ConflictResolver::new(ConflictPolicy::NewestWins);
        let a = stored("2", "2025-01-01 10:00:00");
        let b = stored("6", "2025-01-01 11:00:00");
        resolver.resolve(TicketTable::Incident, "aaa", &a, &b).unwrap();

        assert_eq!(resolver.conflicts().len(), 1);
        assert_eq!(resolver.prune_resolved(), 1);
        assert!(resolver.conflicts().is_empty());
    }

    #[test]
    fn custom_critical_field_set_is_honoured() {
        let resolver = ConflictResolver::with_critical_fields(
            ConflictPolicy::UpstreamWins,
            vec!["state".to_string()],
        );
        let a = json!({"state": "1", "priority": "1"});
        let b = json!({"state": "1", "priority": "5"});
        assert!(resolver.divergent_fields(&a, &b).is_empty());

        let c = json!({"state": "2", "priority": "5"});
        assert_eq!(resolver.divergent_fields(&a, &c), vec!["state"]);
    }
}
