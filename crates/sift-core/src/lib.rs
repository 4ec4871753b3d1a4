//! Core models and policies for the Sift data explorer client.
//!
//! Everything in this crate is I/O-free: wire models, the filter value
//! object, CSV assembly, pre-flight upload validation, the retry policy,
//! and configuration. The `sift-client` crate layers transport on top.

pub mod config;
pub mod csv;
pub mod error;
pub mod filters;
pub mod models;
pub mod retry;
pub mod validation;

pub use config::{ClientConfig, UploadConfig};
pub use error::ClientError;
pub use filters::Filters;
pub use models::{JobState, JobStatus};
pub use retry::RetryPolicy;
