//! Data models shared between the client, the CLI, and tests.

pub mod job;
pub mod query;

pub use job::{JobState, JobStatus};
pub use query::{
    DeleteRequest, DeleteResponse, FacetValue, FacetsRequest, FacetsResponse, QueryRequest,
    QueryResponse, StreamRequest, TokenRefreshRequest, TokenRefreshResponse, UploadResponse,
};
