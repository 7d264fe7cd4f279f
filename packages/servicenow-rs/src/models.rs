use serde::Deserialize;
use serde_json::Value;

/// Envelope returned by the Table API for collection queries.
#[derive(Debug, Deserialize)]
pub struct TableQueryResponse {
    pub result: Vec<Value>,
}

/// Envelope returned by the Table API for single-record fetches.
#[derive(Debug, Deserialize)]
pub struct TableRecordResponse {
    pub result: Value,
}

/// Error body ServiceNow attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: ApiErrorDetail,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub detail: Option<String>,
}
