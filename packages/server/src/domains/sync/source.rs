//! Upstream ticket source abstraction.
//!
//! The production implementation wraps the `servicenow` client; tests use
//! the scripted mock. The sync engine only relies on three capabilities:
//! windowed pagination by `sys_updated_on`, single-record fetch, and
//! partial write-back.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use servicenow::{ServiceNowError, ServiceNowService};
use thiserror::Error;

use super::models::{normalized_field, TicketTable};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream transport failure: {0}")]
    Transport(String),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream authentication rejected")]
    Unauthorized,
    #[error("upstream error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Transport(_) | SourceError::RateLimited => true,
            SourceError::Api { status, .. } => *status >= 500,
            SourceError::Unauthorized => false,
        }
    }
}

impl From<ServiceNowError> for SourceError {
    fn from(err: ServiceNowError) -> Self {
        match err {
            ServiceNowError::RateLimited => SourceError::RateLimited,
            ServiceNowError::Unauthorized => SourceError::Unauthorized,
            ServiceNowError::Api { status, message } => SourceError::Api { status, message },
            ServiceNowError::Transport(e) => SourceError::Transport(e.to_string()),
            ServiceNowError::NotFound { table, sys_id } => SourceError::Api {
                status: 404,
                message: format!("{table}/{sys_id} not found"),
            },
        }
    }
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    /// One page of records with `sys_updated_on >= since`, ordered by
    /// update time.
    async fn fetch_updated(
        &self,
        table: TicketTable,
        since: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Value>, SourceError>;

    /// A single full record, or `None` when it no longer exists upstream.
    async fn fetch_record(
        &self,
        table: TicketTable,
        sys_id: &str,
    ) -> Result<Option<Value>, SourceError>;

    /// Push a partial update upstream; returns the updated record view.
    async fn push_update(
        &self,
        table: TicketTable,
        sys_id: &str,
        patch: &Value,
    ) -> Result<Value, SourceError>;
}

/// Production source backed by the ServiceNow Table API.
pub struct ServiceNowSource {
    service: ServiceNowService,
}

impl ServiceNowSource {
    pub fn new(service: ServiceNowService) -> Self {
        Self { service }
    }

    fn delta_query(since: DateTime<Utc>) -> String {
        format!(
            "sys_updated_on>={}^ORDERBYsys_updated_on",
            since.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[async_trait]
impl TicketSource for ServiceNowSource {
    async fn fetch_updated(
        &self,
        table: TicketTable,
        since: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Value>, SourceError> {
        let query = Self::delta_query(since);
        let records = self
            .service
            .query_table(table.upstream_table(), &query, offset, limit)
            .await?;
        Ok(records)
    }

    async fn fetch_record(
        &self,
        table: TicketTable,
        sys_id: &str,
    ) -> Result<Option<Value>, SourceError> {
        let record = self
            .service
            .get_record(table.upstream_table(), sys_id)
            .await?;
        Ok(record)
    }

    async fn push_update(
        &self,
        table: TicketTable,
        sys_id: &str,
        patch: &Value,
    ) -> Result<Value, SourceError> {
        let record = self
            .service
            .update_record(table.upstream_table(), sys_id, patch)
            .await?;
        Ok(record)
    }
}

// ============================================================================
// Scripted mock
// ============================================================================

/// Scripted source for tests: holds per-table record sets and counts calls.
#[derive(Default)]
pub struct MockTicketSource {
    inner: Mutex<MockSourceInner>,
}

#[derive(Default)]
struct MockSourceInner {
    records: HashMap<TicketTable, Vec<Value>>,
    fetch_calls: u32,
    record_calls: u32,
    pushed: Vec<(TicketTable, String, Value)>,
    fail_next: Option<SourceError>,
}

impl MockTicketSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, table: TicketTable, records: Vec<Value>) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .insert(table, records);
    }

    pub fn fail_next(&self, error: SourceError) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fail_next = Some(error);
    }

    pub fn fetch_calls(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).fetch_calls
    }

    pub fn pushed_updates(&self) -> Vec<(TicketTable, String, Value)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pushed
            .clone()
    }
}

#[async_trait]
impl TicketSource for MockTicketSource {
    async fn fetch_updated(
        &self,
        table: TicketTable,
        _since: DateTime<Utc>,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Value>, SourceError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.fetch_calls += 1;
        if let Some(error) = inner.fail_next.take() {
            return Err(error);
        }
        let records = inner.records.get(&table).cloned().unwrap_or_default();
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn fetch_record(
        &self,
        table: TicketTable,
        sys_id: &str,
    ) -> Result<Option<Value>, SourceError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.record_calls += 1;
        if let Some(error) = inner.fail_next.take() {
            return Err(error);
        }
        Ok(inner
            .records
            .get(&table)
            .and_then(|records| {
                records
                    .iter()
                    .find(|r| normalized_field(r, "sys_id").as_deref() == Some(sys_id))
            })
            .cloned())
    }

    async fn push_update(
        &self,
        table: TicketTable,
        sys_id: &str,
        patch: &Value,
    ) -> Result<Value, SourceError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(error) = inner.fail_next.take() {
            return Err(error);
        }
        inner
            .pushed
            .push((table, sys_id.to_string(), patch.clone()));

        let records = inner.records.entry(table).or_default();
        let record = records
            .iter_mut()
            .find(|r| normalized_field(r, "sys_id").as_deref() == Some(sys_id));
        match record {
            Some(record) => {
                if let (Some(target), Some(fields)) = (record.as_object_mut(), patch.as_object()) {
                    for (key, value) in fields {
                        target.insert(key.clone(), value.clone());
                    }
                }
                Ok(record.clone())
            }
            None => Err(SourceError::Api {
                status: 404,
                message: format!("{}/{} not found", table, sys_id),
            }),
        }
    }
}
