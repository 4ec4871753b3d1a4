//! Job status watcher.
//!
//! Tracks one ingestion job to its terminal state. The preferred transport
//! is a WebSocket status stream; if the socket cannot be established, errors,
//! or closes early, the watcher falls back to fixed-interval polling of the
//! status endpoint. Both branches share the same terminal predicate
//! (`JobStatus::is_terminal`), so completion detection is defined once.
//!
//! A server-signaled auth close (code 4401) is terminal with an error and
//! does not fall back to polling; polling an endpoint that just rejected our
//! credentials would only produce a retry storm.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use sift_core::models::job::JobState;
use sift_core::{ClientError, JobStatus};

use crate::api::ApiClient;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Non-standard close code the server uses to signal an auth failure.
const AUTH_CLOSE_CODE: u16 = 4401;

enum SocketOutcome {
    /// Terminal snapshot delivered (or watcher stopped); do not poll.
    Terminal,
    /// Socket unavailable or dropped early; degrade to polling.
    Fallback,
}

/// Handle to a running watcher. Dropping or stopping it closes the socket
/// and cancels any pending poll timer.
pub struct JobWatcher {
    job_id: String,
    rx: watch::Receiver<Option<JobStatus>>,
    cancel: CancellationToken,
}

impl JobWatcher {
    /// Start watching `job_id` until it reaches a terminal state.
    pub fn watch(api: Arc<ApiClient>, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        tokio::spawn(run(api, job_id.clone(), tx, cancel.clone()));
        Self { job_id, rx, cancel }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<JobStatus>> {
        self.rx.clone()
    }

    /// Latest snapshot seen, if any.
    pub fn latest(&self) -> Option<JobStatus> {
        self.rx.borrow().clone()
    }

    /// Stop watching. Idempotent; releases the socket or timer synchronously
    /// with the underlying task's next poll.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for a terminal snapshot. Returns the last snapshot seen if the
    /// watcher stops before the job finishes.
    pub async fn wait_terminal(&mut self) -> Option<JobStatus> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if current.as_ref().map(|s| s.is_terminal()).unwrap_or(false) {
                return current;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

impl Drop for JobWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Synthetic terminal snapshot for a server-signaled auth failure.
fn auth_failed_status() -> JobStatus {
    JobStatus {
        status: JobState::Failed,
        stage: None,
        bytes_uploaded: 0,
        bytes_total: 0,
        rows_total: 0,
        rows_processed: 0,
        rows_inserted: 0,
        rows_skipped: 0,
        progress: 0.0,
        error: Some("authentication failed".to_string()),
    }
}

async fn run(
    api: Arc<ApiClient>,
    job_id: String,
    tx: watch::Sender<Option<JobStatus>>,
    cancel: CancellationToken,
) {
    match socket_phase(&api, &job_id, &tx, &cancel).await {
        SocketOutcome::Terminal => {}
        SocketOutcome::Fallback => poll_phase(&api, &job_id, &tx, &cancel).await,
    }
}

async fn socket_phase(
    api: &ApiClient,
    job_id: &str,
    tx: &watch::Sender<Option<JobStatus>>,
    cancel: &CancellationToken,
) -> SocketOutcome {
    let url = api.ws_url(&format!("/ws/status/{}", job_id));
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return SocketOutcome::Terminal,
        conn = connect_async(url) => match conn {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::debug!(job_id, error = %err, "Status socket connect failed, falling back to polling");
                return SocketOutcome::Fallback;
            }
        },
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.close(None).await;
                return SocketOutcome::Terminal;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<JobStatus>(&text) {
                        Ok(status) => {
                            let terminal = status.is_terminal();
                            let _ = tx.send(Some(status));
                            if terminal {
                                let _ = stream.close(None).await;
                                return SocketOutcome::Terminal;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(job_id, error = %err, "Ignoring malformed status message");
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(frame) = &frame {
                        if u16::from(frame.code) == AUTH_CLOSE_CODE {
                            tracing::warn!(job_id, "Status socket closed: authentication failed");
                            let _ = tx.send(Some(auth_failed_status()));
                            return SocketOutcome::Terminal;
                        }
                    }
                    tracing::debug!(job_id, "Status socket closed early, falling back to polling");
                    return SocketOutcome::Fallback;
                }
                Some(Ok(_)) => {} // ping/pong/binary frames carry no status
                Some(Err(err)) => {
                    tracing::debug!(job_id, error = %err, "Status socket error, falling back to polling");
                    return SocketOutcome::Fallback;
                }
                None => return SocketOutcome::Fallback,
            }
        }
    }
}

async fn poll_phase(
    api: &ApiClient,
    job_id: &str,
    tx: &watch::Sender<Option<JobStatus>>,
    cancel: &CancellationToken,
) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                match api.job_status(job_id).await {
                    Ok(status) => {
                        let terminal = status.is_terminal();
                        let _ = tx.send(Some(status));
                        if terminal {
                            return;
                        }
                    }
                    Err(ClientError::Unauthorized(_)) => {
                        let _ = tx.send(Some(auth_failed_status()));
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(job_id, error = %err, "Status poll failed");
                    }
                }
            }
        }
    }
}
