//! Minimal ServiceNow Table API client.
//!
//! Covers the three operations the sync layer needs: paginated table queries,
//! single-record fetch by sys_id, and partial record updates. Responses are
//! returned as raw JSON values; callers own the mapping to typed records.

pub mod models;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ApiErrorBody, TableQueryResponse, TableRecordResponse};

#[derive(Debug, Error)]
pub enum ServiceNowError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rate limited by instance")]
    RateLimited,
    #[error("authentication rejected")]
    Unauthorized,
    #[error("record not found: {table}/{sys_id}")]
    NotFound { table: String, sys_id: String },
    #[error("instance error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl ServiceNowError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceNowError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ServiceNowError::RateLimited => true,
            ServiceNowError::Api { status, .. } => *status >= 500,
            ServiceNowError::Unauthorized | ServiceNowError::NotFound { .. } => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceNowOptions {
    /// Base instance URL, e.g. `https://dev12345.service-now.com`.
    pub instance_url: String,
    pub username: String,
    pub password: String,
}

/// Thin client over the Table API (`/api/now/table/{table}`).
#[derive(Debug, Clone)]
pub struct ServiceNowService {
    options: ServiceNowOptions,
    client: Client,
}

impl ServiceNowService {
    pub fn new(options: ServiceNowOptions) -> Self {
        Self {
            options,
            client: Client::new(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/api/now/table/{}",
            self.options.instance_url.trim_end_matches('/'),
            table
        )
    }

    /// Query a table with an encoded query, returning one page of records.
    pub async fn query_table(
        &self,
        table: &str,
        query: &str,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Value>, ServiceNowError> {
        let response = self
            .client
            .get(self.table_url(table))
            .basic_auth(&self.options.username, Some(&self.options.password))
            .query(&[
                ("sysparm_query", query),
                ("sysparm_offset", &offset.to_string()),
                ("sysparm_limit", &limit.to_string()),
                ("sysparm_display_value", "all"),
                ("sysparm_exclude_reference_link", "true"),
            ])
            .send()
            .await?;

        let response = Self::check_status(response, table, None).await?;
        let body: TableQueryResponse = response.json().await?;
        Ok(body.result)
    }

    /// Fetch a single record by sys_id. Returns `None` when the record does
    /// not exist (deleted upstream is a normal sync outcome, not an error).
    pub async fn get_record(
        &self,
        table: &str,
        sys_id: &str,
    ) -> Result<Option<Value>, ServiceNowError> {
        let url = format!("{}/{}", self.table_url(table), sys_id);
        let response = self
            .client
            .get(url)
            .basic_auth(&self.options.username, Some(&self.options.password))
            .query(&[
                ("sysparm_display_value", "all"),
                ("sysparm_exclude_reference_link", "true"),
            ])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = Self::check_status(response, table, Some(sys_id)).await?;
        let body: TableRecordResponse = response.json().await?;
        Ok(Some(body.result))
    }

    /// Apply a partial update to a record and return the updated view.
    pub async fn update_record(
        &self,
        table: &str,
        sys_id: &str,
        patch: &Value,
    ) -> Result<Value, ServiceNowError> {
        let url = format!("{}/{}", self.table_url(table), sys_id);
        let response = self
            .client
            .patch(url)
            .basic_auth(&self.options.username, Some(&self.options.password))
            .json(patch)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ServiceNowError::NotFound {
                table: table.to_string(),
                sys_id: sys_id.to_string(),
            });
        }

        let response = Self::check_status(response, table, Some(sys_id)).await?;
        let body: TableRecordResponse = response.json().await?;
        Ok(body.result)
    }

    async fn check_status(
        response: reqwest::Response,
        table: &str,
        sys_id: Option<&str>,
    ) -> Result<reqwest::Response, ServiceNowError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ServiceNowError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ServiceNowError::Unauthorized),
            StatusCode::NOT_FOUND => Err(ServiceNowError::NotFound {
                table: table.to_string(),
                sys_id: sys_id.unwrap_or("?").to_string(),
            }),
            _ => {
                let message = response
                    .json::<ApiErrorBody>()
                    .await
                    .map(|b| b.error.message)
                    .unwrap_or_default();
                Err(ServiceNowError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceNowService {
        ServiceNowService::new(ServiceNowOptions {
            instance_url: "https://dev0.service-now.com/".to_string(),
            username: "bridge".to_string(),
            password: "secret".to_string(),
        })
    }

    #[test]
    fn table_url_strips_trailing_slash() {
        let svc = service();
        assert_eq!(
            svc.table_url("incident"),
            "https://dev0.service-now.com/api/now/table/incident"
        );
    }

    #[test]
    fn rate_limit_is_retryable() {
        assert!(ServiceNowError::RateLimited.is_retryable());
    }

    #[test]
    fn auth_failure_is_not_retryable() {
        assert!(!ServiceNowError::Unauthorized.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = ServiceNowError::Api {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert!(err.is_retryable());

        let err = ServiceNowError::Api {
            status: 400,
            message: "bad query".to_string(),
        };
        assert!(!err.is_retryable());
    }
}
