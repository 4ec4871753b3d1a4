//! Wire request/response types for the explorer backend.
//!
//! Shapes match the backend contract; the backend itself is an external
//! collaborator and its semantics are not modeled here.

use serde::{Deserialize, Serialize};

use crate::filters::Filters;

/// `POST /query` request body. Filters are passed through verbatim; the
/// backend performs all filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub filters: Filters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub rows: Vec<serde_json::Value>,
    pub total: i64,
}

/// `POST /stream` request body for the NDJSON export stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRequest {
    pub filters: Filters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// `POST /upload` response. `skipped` means the file was already ingested
/// and no processing job was started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub job_id: String,
    #[serde(default)]
    pub skipped: bool,
}

/// A distinct column value with its occurrence count, for filter pickers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetValue {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetsRequest {
    pub filters: Filters,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetsResponse {
    pub values: Vec<FacetValue>,
}

/// `POST /delete` request body. `expected_min`/`expected_max` are
/// optimistic-concurrency guards: the server refuses with 409 if the match
/// count moved outside the expected range since the dry run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub filters: Filters,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_max: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub matched: u64,
    #[serde(default)]
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}
