//! Ticket envelope and related models.
//!
//! Upstream records arrive as raw JSON with reference fields wrapped in
//! `{value, display_value}` containers. Normalisation happens once at
//! ingress; the envelope keeps the raw payload plus flattened critical
//! fields for indexing.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Entity tables tracked by the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketTable {
    Incident,
    ChangeTask,
    CatalogTask,
}

impl TicketTable {
    pub const ALL: [TicketTable; 3] = [
        TicketTable::Incident,
        TicketTable::ChangeTask,
        TicketTable::CatalogTask,
    ];

    /// Upstream table name; doubles as the change-log topic.
    pub fn upstream_table(&self) -> &'static str {
        match self {
            TicketTable::Incident => "incident",
            TicketTable::ChangeTask => "change_task",
            TicketTable::CatalogTask => "sc_task",
        }
    }

    /// Local collection name.
    pub fn collection(&self) -> &'static str {
        match self {
            TicketTable::Incident => "sn_incidents_collection",
            TicketTable::ChangeTask => "sn_ctasks_collection",
            TicketTable::CatalogTask => "sn_sctasks_collection",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incident" => Some(TicketTable::Incident),
            "change_task" => Some(TicketTable::ChangeTask),
            "sc_task" => Some(TicketTable::CatalogTask),
            _ => None,
        }
    }
}

impl std::fmt::Display for TicketTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.upstream_table())
    }
}

/// SLA record subordinate to a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedSlaEntry {
    pub sys_id: String,
    pub ticket_number: String,
    /// 0-100 in normal operation; exceeds 100 on breach.
    pub business_percentage: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub stage: String,
    pub breached: bool,
    pub assignment_group: Option<String>,
}

/// Stored ticket wrapper: raw upstream payload plus sync metadata and the
/// flattened critical fields the collections index on.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct TicketEnvelope {
    pub sys_id: String,
    pub number: String,
    pub state: Option<String>,
    pub priority: Option<String>,
    pub short_description: Option<String>,
    pub assignment_group: Option<String>,
    pub entity_payload: Value,
    #[sqlx(json)]
    pub related_sla_entries: Vec<RelatedSlaEntry>,
    pub sync_timestamp: DateTime<Utc>,
    pub schema_version: i32,
    pub partition_prefix: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const ENVELOPE_SCHEMA_VERSION: i32 = 1;

impl TicketEnvelope {
    /// Build an envelope from a raw upstream record. Returns `None` when the
    /// record has no sys_id (nothing to key on).
    pub fn from_upstream(payload: Value) -> Option<Self> {
        let sys_id = normalized_field(&payload, "sys_id")?;
        let now = Utc::now();
        Some(Self {
            partition_prefix: partition_prefix(&sys_id),
            number: normalized_field(&payload, "number").unwrap_or_default(),
            state: normalized_field(&payload, "state"),
            priority: normalized_field(&payload, "priority"),
            short_description: normalized_field(&payload, "short_description"),
            assignment_group: normalized_field(&payload, "assignment_group"),
            related_sla_entries: Vec::new(),
            sync_timestamp: now,
            schema_version: ENVELOPE_SCHEMA_VERSION,
            created_at: now,
            updated_at: now,
            entity_payload: payload,
            sys_id,
        })
    }

    /// Upstream modification timestamp, when present and parseable.
    pub fn sys_updated_on(&self) -> Option<DateTime<Utc>> {
        normalized_field(&self.entity_payload, "sys_updated_on")
            .as_deref()
            .and_then(parse_sys_timestamp)
    }
}

/// Deterministic partition key: first 8 characters of the sys_id.
pub fn partition_prefix(sys_id: &str) -> String {
    sys_id.chars().take(8).collect()
}

/// Extract a field as a trimmed string, unwrapping `{value}` /
/// `{display_value}` containers and coercing scalars.
pub fn normalized_field(payload: &Value, name: &str) -> Option<String> {
    let raw = payload.get(name)?;
    normalize_value(raw)
}

fn normalize_value(raw: &Value) -> Option<String> {
    match raw {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(map) => map
            .get("value")
            .or_else(|| map.get("display_value"))
            .and_then(normalize_value),
        Value::Array(_) => None,
    }
}

/// Parse the upstream `sys_updated_on` format (`YYYY-MM-DD HH:MM:SS`,
/// instance-local but treated as UTC), falling back to RFC 3339.
pub fn parse_sys_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
