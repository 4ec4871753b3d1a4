//! Async client for the Sift data explorer backend.
//!
//! Layers, bottom up: [`token`] holds the credential pair with single-flight
//! refresh, [`api`] wraps the HTTP transport with auth and error mapping,
//! and [`watcher`], [`uploader`], and [`export`] build the long-running
//! flows (job tracking, batch upload, streaming CSV export) on top of it.
//! User-facing messages flow through the [`notify`] seam.

pub mod api;
pub mod export;
pub mod notify;
#[cfg(test)]
pub(crate) mod testutil;
pub mod token;
pub mod uploader;
pub mod watcher;

pub use api::ApiClient;
pub use export::{DownloadJob, DownloadState, ExportHandle, Exporter};
pub use notify::{Notifier, NotifyLevel, TracingNotifier};
pub use token::{decode_claims, Claims, TokenManager};
pub use uploader::{BatchStats, UploadFile, UploadState, Uploader};
pub use watcher::JobWatcher;
