//! Batch upload orchestrator.
//!
//! Validates a batch client-side, then uploads the accepted files with
//! bounded concurrency. Each file moves through a small state machine
//! (pending → uploading → processing → terminal); transient failures retry
//! with exponential backoff, and cancellation is honored at every await
//! point, including mid-backoff.
//!
//! Progress is tracked per file from the bytes the request body stream has
//! handed to the transport, with a sliding-window speed estimate. Reported
//! progress never moves backwards; a retry resets the counter internally but
//! the visible number holds until the retry passes it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sift_core::models::{JobStatus, UploadResponse};
use sift_core::validation::{validate_batch, FileMeta};
use sift_core::{ClientError, RetryPolicy, UploadConfig};

use crate::api::ApiClient;
use crate::notify::NotifyLevel;
use crate::watcher::JobWatcher;

/// Window over which upload speed is averaged.
const SPEED_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Validating,
    Uploading,
    Retrying,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Completed | UploadState::Failed | UploadState::Cancelled
        )
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadState::Pending => "pending",
            UploadState::Validating => "validating",
            UploadState::Uploading => "uploading",
            UploadState::Retrying => "retrying",
            UploadState::Processing => "processing",
            UploadState::Completed => "completed",
            UploadState::Failed => "failed",
            UploadState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Tracked state for one file in the batch.
#[derive(Debug, Clone, Serialize)]
pub struct UploadFile {
    pub id: Uuid,
    #[serde(skip)]
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub job_id: Option<String>,
    pub state: UploadState,
    /// Fraction of bytes handed to the transport, 0.0..=1.0, monotonic.
    pub upload_progress: f64,
    /// Server-side ingestion progress, 0.0..=1.0, monotonic.
    pub processing_progress: f64,
    pub speed_bps: f64,
    pub eta_secs: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub last_status: Option<JobStatus>,
    pub bytes_sent: u64,
}

impl UploadFile {
    fn new(path: PathBuf, name: String, size: u64, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            name,
            size,
            job_id: None,
            state: UploadState::Pending,
            upload_progress: 0.0,
            processing_progress: 0.0,
            speed_bps: 0.0,
            eta_secs: None,
            retry_count: 0,
            max_retries,
            started_at: None,
            finished_at: None,
            error: None,
            warnings: Vec::new(),
            last_status: None,
            bytes_sent: 0,
        }
    }

    /// Combined progress across both phases; a completed file is always 1.0.
    pub fn progress(&self) -> f64 {
        match self.state {
            UploadState::Completed => 1.0,
            UploadState::Processing => 0.5 + self.processing_progress * 0.5,
            _ => self.upload_progress * 0.5,
        }
    }
}

/// Aggregate view over the batch, byte-weighted so a large file does not
/// read as done just because the small ones finished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub in_flight: usize,
    pub overall_progress: f64,
    pub total_bytes: u64,
    pub bytes_sent: u64,
    pub avg_throughput_bps: f64,
    pub eta_secs: Option<u64>,
}

/// Sliding-window throughput estimate over (instant, cumulative-bytes)
/// samples. Instants are injected so the math is testable.
#[derive(Debug)]
pub struct SpeedTracker {
    window: Duration,
    samples: std::collections::VecDeque<(Instant, u64)>,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: std::collections::VecDeque::new(),
        }
    }

    /// Record the cumulative byte count at `now` and return the current
    /// bytes-per-second estimate.
    pub fn record(&mut self, now: Instant, total_bytes: u64) -> f64 {
        self.samples.push_back((now, total_bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.bps()
    }

    pub fn bps(&self) -> f64 {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) if l.0 > f.0 => (f, l),
            _ => return 0.0,
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        let bytes = last.1.saturating_sub(first.1) as f64;
        bytes / elapsed
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[derive(Clone)]
pub struct Uploader {
    api: Arc<ApiClient>,
    config: UploadConfig,
    policy: RetryPolicy,
    files: Arc<Mutex<Vec<UploadFile>>>,
    cancels: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    tasks: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    semaphore: Arc<Semaphore>,
    /// Bumped on every visible state change; subscribers re-read `files()`.
    changed: watch::Sender<u64>,
    batch_done_notified: Arc<AtomicBool>,
}

impl Uploader {
    pub fn new(api: Arc<ApiClient>, config: UploadConfig) -> Self {
        let policy = RetryPolicy::from(&config);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let (changed, _) = watch::channel(0);
        Self {
            api,
            config,
            policy,
            files: Arc::new(Mutex::new(Vec::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(Vec::new())),
            semaphore,
            changed,
            batch_done_notified: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshot of every tracked file.
    pub fn files(&self) -> Vec<UploadFile> {
        self.files.lock().unwrap().clone()
    }

    /// Receiver that ticks whenever any file's visible state changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Validate and enqueue a batch. A batch-level validation error rejects
    /// the whole call; per-file errors mark that file failed and the rest
    /// proceed. Returns the ids of the files accepted for upload.
    pub async fn upload_batch(&self, paths: Vec<PathBuf>) -> Result<Vec<Uuid>, ClientError> {
        let mut metas = Vec::with_capacity(paths.len());
        for path in &paths {
            let size = tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .map_err(|e| {
                    ClientError::Validation(format!("{}: cannot read file: {}", path.display(), e))
                })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let content_type = name
                .rsplit('.')
                .next()
                .filter(|ext| ext.eq_ignore_ascii_case("csv"))
                .map(|_| "text/csv".to_string());
            metas.push(FileMeta {
                name,
                size,
                content_type,
            });
        }

        let report = validate_batch(&metas, &self.config);
        if !report.batch_ok() {
            let message = report.errors.join("; ");
            self.api
                .notifier()
                .notify(NotifyLevel::Error, &message)
                .await;
            return Err(ClientError::Validation(message));
        }
        for warning in &report.warnings {
            self.api
                .notifier()
                .notify(NotifyLevel::Warning, warning)
                .await;
        }

        self.batch_done_notified.store(false, Ordering::SeqCst);
        let mut accepted = Vec::new();
        for ((path, meta), file_report) in
            paths.into_iter().zip(metas).zip(report.files.into_iter())
        {
            let mut file = UploadFile::new(
                path,
                meta.name.clone(),
                meta.size,
                self.policy.max_retries,
            );
            file.state = UploadState::Validating;
            file.warnings = file_report.warnings.clone();
            let id = file.id;

            if !file_report.is_valid() {
                let message = file_report.errors.join("; ");
                file.state = UploadState::Failed;
                file.error = Some(message.clone());
                file.finished_at = Some(Utc::now());
                self.files.lock().unwrap().push(file);
                self.changed.send_modify(|v| *v += 1);
                self.api
                    .notifier()
                    .notify(NotifyLevel::Error, &message)
                    .await;
                continue;
            }

            file.state = UploadState::Pending;
            self.files.lock().unwrap().push(file);
            self.changed.send_modify(|v| *v += 1);
            // Token created at enqueue time so a pending file can be
            // cancelled before its upload ever starts.
            let cancel = CancellationToken::new();
            self.cancels.lock().unwrap().insert(id, cancel.clone());
            accepted.push(id);

            let this = self.clone();
            let handle = tokio::spawn(async move {
                this.run_one(id, cancel).await;
            });
            self.tasks.lock().unwrap().push(handle);
        }

        // A batch that enqueued nothing runnable may already be complete.
        self.check_batch_complete().await;
        Ok(accepted)
    }

    /// Cancel one file, whatever phase it is in. Idempotent.
    pub fn cancel_file(&self, id: Uuid) {
        if let Some(token) = self.cancels.lock().unwrap().get(&id) {
            token.cancel();
        }
    }

    /// Cancel everything still in flight.
    pub fn cancel_all(&self) {
        for token in self.cancels.lock().unwrap().values() {
            token.cancel();
        }
    }

    /// Drop all tracked files and abort their tasks. The next batch starts
    /// with a clean slate.
    pub fn clear(&self) {
        self.cancel_all();
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.files.lock().unwrap().clear();
        self.cancels.lock().unwrap().clear();
        self.batch_done_notified.store(false, Ordering::SeqCst);
        self.changed.send_modify(|v| *v += 1);
    }

    /// Wait for every spawned upload task to finish.
    pub async fn wait(&self) {
        loop {
            let handle = self.tasks.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => return,
            }
        }
    }

    /// Byte-weighted aggregate statistics over the current batch.
    pub fn stats(&self) -> BatchStats {
        let files = self.files.lock().unwrap();
        let mut stats = BatchStats {
            total: files.len(),
            ..Default::default()
        };
        let mut weighted = 0.0f64;
        let mut throughput = 0.0f64;
        let mut active_bytes_left = 0u64;
        for file in files.iter() {
            stats.total_bytes += file.size;
            stats.bytes_sent += file.bytes_sent;
            weighted += file.progress() * file.size as f64;
            match file.state {
                UploadState::Completed => stats.completed += 1,
                UploadState::Failed => stats.failed += 1,
                UploadState::Cancelled => stats.cancelled += 1,
                _ => {
                    stats.in_flight += 1;
                    throughput += file.speed_bps;
                    active_bytes_left += file.size.saturating_sub(file.bytes_sent);
                }
            }
        }
        if stats.total_bytes > 0 {
            stats.overall_progress = weighted / stats.total_bytes as f64;
        }
        if stats.in_flight > 0 {
            stats.avg_throughput_bps = throughput / stats.in_flight as f64;
        }
        // ETA divides remaining bytes by the combined transfer rate, not the
        // per-file average.
        if throughput > 0.0 && active_bytes_left > 0 {
            stats.eta_secs = Some((active_bytes_left as f64 / throughput).ceil() as u64);
        }
        stats
    }

    fn with_file(&self, id: Uuid, f: impl FnOnce(&mut UploadFile)) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.iter_mut().find(|f| f.id == id) {
            f(file);
        }
        drop(files);
        self.changed.send_modify(|v| *v += 1);
    }

    fn file_snapshot(&self, id: Uuid) -> Option<UploadFile> {
        self.files.lock().unwrap().iter().find(|f| f.id == id).cloned()
    }

    async fn mark_terminal(&self, id: Uuid, state: UploadState, error: Option<String>) {
        self.with_file(id, |file| {
            file.state = state;
            file.error = error;
            file.finished_at = Some(Utc::now());
            if state == UploadState::Completed {
                file.upload_progress = 1.0;
                file.processing_progress = 1.0;
            }
            file.speed_bps = 0.0;
            file.eta_secs = None;
        });
        self.cancels.lock().unwrap().remove(&id);
        self.check_batch_complete().await;
    }

    /// Emit the batch-completion notification exactly once, when the last
    /// file reaches a terminal state.
    async fn check_batch_complete(&self) {
        let (summary, failed) = {
            let files = self.files.lock().unwrap();
            if files.is_empty() || files.iter().any(|f| !f.state.is_terminal()) {
                return;
            }
            let completed = files.iter().filter(|f| f.state == UploadState::Completed).count();
            let failed = files.iter().filter(|f| f.state == UploadState::Failed).count();
            let cancelled = files.iter().filter(|f| f.state == UploadState::Cancelled).count();
            (
                format!(
                    "Batch finished: {} completed, {} failed, {} cancelled",
                    completed, failed, cancelled
                ),
                failed,
            )
        };
        if self.batch_done_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        let level = if failed == 0 {
            NotifyLevel::Info
        } else {
            NotifyLevel::Warning
        };
        self.api.notifier().notify(level, &summary).await;
    }

    async fn run_one(&self, id: Uuid, cancel: CancellationToken) {
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                self.mark_terminal(id, UploadState::Cancelled, None).await;
                return;
            }
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed: uploader shut down
            },
        };
        let (path, name, size) = match self.file_snapshot(id) {
            Some(file) => (file.path, file.name, file.size),
            None => return, // cleared while pending
        };

        self.with_file(id, |file| {
            file.state = UploadState::Uploading;
            file.started_at = Some(Utc::now());
        });

        let mut attempt = 0u32;
        loop {
            let result = self.try_upload(id, &path, &name, size, &cancel).await;
            match result {
                Ok(response) => {
                    if response.skipped {
                        tracing::info!(name = %name, "Duplicate file skipped by server");
                        self.mark_terminal(id, UploadState::Completed, None).await;
                        return;
                    }
                    let job_id = response.job_id;
                    self.with_file(id, |file| {
                        file.state = UploadState::Processing;
                        file.upload_progress = 1.0;
                        file.job_id = Some(job_id.clone());
                        file.speed_bps = 0.0;
                        file.eta_secs = None;
                    });
                    // The concurrency bound covers byte transfer only; a
                    // file waiting on server-side ingestion must not hold a
                    // slot another upload could use.
                    drop(permit);
                    self.track_processing(id, &job_id, &cancel).await;
                    return;
                }
                Err(ClientError::Cancelled) => {
                    self.mark_terminal(id, UploadState::Cancelled, None).await;
                    return;
                }
                Err(err) if self.policy.should_retry(&err, attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        name = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Upload failed, retrying"
                    );
                    self.with_file(id, |file| {
                        file.state = UploadState::Retrying;
                        file.retry_count = attempt;
                        file.speed_bps = 0.0;
                        file.eta_secs = None;
                        file.bytes_sent = 0;
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.mark_terminal(id, UploadState::Cancelled, None).await;
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.with_file(id, |file| {
                        file.state = UploadState::Uploading;
                    });
                }
                Err(err) => {
                    tracing::error!(name = %name, error = %err, "Upload failed");
                    self.api
                        .notifier()
                        .notify(
                            NotifyLevel::Error,
                            &format!("{}: {}", name, err.user_message()),
                        )
                        .await;
                    self.mark_terminal(id, UploadState::Failed, Some(err.to_string()))
                        .await;
                    return;
                }
            }
        }
    }

    /// One upload attempt. The multipart body streams from disk, counting
    /// bytes as the transport consumes them; the form factory re-opens the
    /// file if the auth layer needs to replay the request.
    async fn try_upload(
        &self,
        id: Uuid,
        path: &Path,
        name: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<UploadResponse, ClientError> {
        let bytes_sent = Arc::new(AtomicU64::new(0));
        let speed = Arc::new(Mutex::new(SpeedTracker::new(SPEED_WINDOW)));
        let files = self.files.clone();
        let changed = self.changed.clone();
        let path = path.to_path_buf();
        let name = name.to_string();

        let make_form = move || {
            let path = path.clone();
            let name = name.clone();
            let bytes_sent = bytes_sent.clone();
            let speed = speed.clone();
            let files = files.clone();
            let changed = changed.clone();
            async move {
                bytes_sent.store(0, Ordering::SeqCst);
                speed.lock().unwrap().reset();
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    ClientError::Internal(format!("{}: cannot open file: {}", path.display(), e))
                })?;

                let stream = ReaderStream::new(file).map(move |chunk| {
                    if let Ok(bytes) = &chunk {
                        let total =
                            bytes_sent.fetch_add(bytes.len() as u64, Ordering::SeqCst)
                                + bytes.len() as u64;
                        let bps = speed.lock().unwrap().record(Instant::now(), total);
                        let mut files = files.lock().unwrap();
                        if let Some(entry) = files.iter_mut().find(|f| f.id == id) {
                            entry.bytes_sent = total;
                            if size > 0 {
                                let fraction = (total as f64 / size as f64).min(1.0);
                                if fraction > entry.upload_progress {
                                    entry.upload_progress = fraction;
                                }
                            }
                            entry.speed_bps = bps;
                            entry.eta_secs = if bps > 0.0 && total < size {
                                Some(((size - total) as f64 / bps).ceil() as u64)
                            } else {
                                None
                            };
                        }
                        drop(files);
                        changed.send_modify(|v| *v += 1);
                    }
                    chunk
                });

                let body = reqwest::Body::wrap_stream(stream);
                let part = Part::stream_with_length(body, size)
                    .file_name(name)
                    .mime_str("text/csv")
                    .map_err(|e| ClientError::Internal(format!("Invalid mime type: {}", e)))?;
                Ok(Form::new().part("file", part))
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = self.api.post_multipart::<UploadResponse, _, _>("/upload", make_form) => result,
        }
    }

    /// Follow the ingestion job to its terminal state, mirroring snapshots
    /// into the file entry. Server-side progress is monotonic here even if
    /// the snapshots are not.
    async fn track_processing(&self, id: Uuid, job_id: &str, cancel: &CancellationToken) {
        let watcher = JobWatcher::watch(self.api.clone(), job_id);
        let mut rx = watcher.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    watcher.stop();
                    self.mark_terminal(id, UploadState::Cancelled, None).await;
                    return;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        // Watcher task gone without a terminal snapshot.
                        self.mark_terminal(
                            id,
                            UploadState::Failed,
                            Some("status stream ended unexpectedly".to_string()),
                        )
                        .await;
                        return;
                    }
                    let status = match rx.borrow_and_update().clone() {
                        Some(status) => status,
                        None => continue,
                    };
                    let terminal = status.is_terminal();
                    let failed = status.is_failed();
                    let error = status.error.clone();
                    self.with_file(id, |file| {
                        let fraction = status.progress_percent() / 100.0;
                        if fraction > file.processing_progress {
                            file.processing_progress = fraction;
                        }
                        file.last_status = Some(status);
                    });
                    if terminal {
                        if failed {
                            let message = error
                                .unwrap_or_else(|| "ingestion failed".to_string());
                            self.api
                                .notifier()
                                .notify(NotifyLevel::Error, &message)
                                .await;
                            self.mark_terminal(id, UploadState::Failed, Some(message)).await;
                        } else {
                            self.mark_terminal(id, UploadState::Completed, None).await;
                        }
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::testutil::{json_response, spawn_stub_server};
    use crate::token::TokenManager;
    use async_trait::async_trait;
    use sift_core::ClientConfig;
    use std::io::Write as _;

    struct RecordingNotifier {
        messages: Mutex<Vec<(NotifyLevel, String)>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Vec::new()),
            })
        }

        fn messages(&self) -> Vec<(NotifyLevel, String)> {
            self.messages.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, level: NotifyLevel, message: &str) {
            self.messages.lock().unwrap().push((level, message.to_string()));
        }
    }

    fn uploader_with(
        base_url: &str,
        config: UploadConfig,
        notifier: Arc<RecordingNotifier>,
    ) -> Uploader {
        let client_config = ClientConfig {
            base_url: base_url.to_string(),
            request_timeout: Duration::from_secs(2),
        };
        let api = ApiClient::new(client_config, Arc::new(TokenManager::new()))
            .unwrap()
            .with_notifier(notifier);
        Uploader::new(Arc::new(api), config)
    }

    fn temp_csv(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[tokio::test]
    async fn empty_file_fails_validation_and_batch_completes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_csv(&dir, "empty.csv", b"");
        let notifier = RecordingNotifier::new();
        let uploader = uploader_with("http://127.0.0.1:9", UploadConfig::default(), notifier.clone());

        let accepted = uploader.upload_batch(vec![path]).await.unwrap();
        assert!(accepted.is_empty());

        let files = uploader.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].state, UploadState::Failed);
        assert!(files[0].error.as_deref().unwrap().contains("empty"));

        let batch_messages: Vec<_> = notifier
            .messages()
            .into_iter()
            .filter(|(_, m)| m.starts_with("Batch finished"))
            .collect();
        assert_eq!(batch_messages.len(), 1);
    }

    #[tokio::test]
    async fn aggregate_cap_rejects_the_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let a = temp_csv(&dir, "a.csv", &[b'x'; 60]);
        let b = temp_csv(&dir, "b.csv", &[b'x'; 60]);
        let notifier = RecordingNotifier::new();
        let config = UploadConfig {
            max_total_size: 100,
            ..UploadConfig::default()
        };
        let uploader = uploader_with("http://127.0.0.1:9", config, notifier);

        let result = uploader.upload_batch(vec![a, b]).await;
        assert!(matches!(result, Err(ClientError::Validation(_))));
        assert!(uploader.files().is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_fails_the_file_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_csv(&dir, "data.csv", b"a,b\n1,2\n");
        let notifier = RecordingNotifier::new();
        let config = UploadConfig {
            max_retries: 0,
            ..UploadConfig::default()
        };
        // Port 9 (discard) is unassigned locally; connects are refused.
        let uploader = uploader_with("http://127.0.0.1:9", config, notifier.clone());

        let accepted = uploader.upload_batch(vec![path]).await.unwrap();
        assert_eq!(accepted.len(), 1);
        uploader.wait().await;

        let files = uploader.files();
        assert_eq!(files[0].state, UploadState::Failed);
        assert!(files[0].error.is_some());
        assert!(notifier
            .messages()
            .iter()
            .any(|(_, m)| m.starts_with("Batch finished")));
    }

    #[tokio::test]
    async fn cancellation_during_backoff_ends_as_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_csv(&dir, "data.csv", b"a,b\n1,2\n");
        let notifier = RecordingNotifier::new();
        let config = UploadConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(120),
            ..UploadConfig::default()
        };
        let uploader = uploader_with("http://127.0.0.1:9", config, notifier);

        let accepted = uploader.upload_batch(vec![path]).await.unwrap();
        let id = accepted[0];
        // Let the first attempt fail and the backoff sleep begin.
        tokio::time::sleep(Duration::from_millis(500)).await;
        uploader.cancel_file(id);
        uploader.cancel_file(id); // idempotent
        uploader.wait().await;

        let files = uploader.files();
        assert_eq!(files[0].state, UploadState::Cancelled);
        assert!(files[0].retry_count >= 1);
    }

    #[tokio::test]
    async fn cancel_all_stops_pending_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..4)
            .map(|i| temp_csv(&dir, &format!("f{}.csv", i), b"a\n1\n"))
            .collect();
        let notifier = RecordingNotifier::new();
        let config = UploadConfig {
            max_concurrent: 1,
            retry_base_delay: Duration::from_secs(60),
            ..UploadConfig::default()
        };
        let uploader = uploader_with("http://127.0.0.1:9", config, notifier);

        uploader.upload_batch(paths).await.unwrap();
        uploader.cancel_all();
        uploader.wait().await;

        for file in uploader.files() {
            assert!(matches!(
                file.state,
                UploadState::Cancelled | UploadState::Failed
            ));
        }
    }

    #[tokio::test]
    async fn processing_file_releases_its_upload_slot() {
        // Upload succeeds immediately; the ingestion job never finishes, so
        // the file parks in the processing state while the watcher polls.
        let base = spawn_stub_server(|path, _| {
            if path == "/upload" {
                json_response("200 OK", r#"{"job_id": "job-1"}"#)
            } else if path.starts_with("/status/") {
                json_response("200 OK", r#"{"status": "processing", "progress": 0.2}"#)
            } else {
                json_response("404 Not Found", "{}")
            }
        });
        let dir = tempfile::tempdir().unwrap();
        let path = temp_csv(&dir, "data.csv", b"a,b\n1,2\n");
        let notifier = RecordingNotifier::new();
        let config = UploadConfig {
            max_concurrent: 1,
            ..UploadConfig::default()
        };
        let uploader = uploader_with(&base, config, notifier);

        uploader.upload_batch(vec![path]).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let files = uploader.files();
            if files[0].state == UploadState::Processing {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "file never reached processing: {:?}",
                files[0]
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // The slot only bounds byte transfer: once the file is waiting on
        // ingestion the single permit must be free for the next upload.
        assert_eq!(uploader.semaphore.available_permits(), 1);

        uploader.cancel_all();
        uploader.wait().await;
        assert_eq!(uploader.files()[0].state, UploadState::Cancelled);
    }

    #[test]
    fn speed_tracker_measures_bytes_per_second() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        tracker.record(t0, 0);
        let bps = tracker.record(t0 + Duration::from_secs(2), 2_000_000);
        assert!((bps - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn speed_tracker_drops_samples_outside_the_window() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        let t0 = Instant::now();
        tracker.record(t0, 0);
        tracker.record(t0 + Duration::from_secs(1), 100);
        // A burst well after the window should not be averaged against t0.
        let bps = tracker.record(t0 + Duration::from_secs(10), 10_100);
        assert!(bps > 1_000.0, "stale samples skew the estimate: {}", bps);
    }

    #[test]
    fn speed_tracker_with_one_sample_reports_zero() {
        let mut tracker = SpeedTracker::new(Duration::from_secs(5));
        assert_eq!(tracker.record(Instant::now(), 100), 0.0);
    }

    #[test]
    fn stats_report_mean_throughput_and_combined_rate_eta() {
        let notifier = RecordingNotifier::new();
        let uploader = uploader_with("http://127.0.0.1:9", UploadConfig::default(), notifier);
        {
            let mut files = uploader.files.lock().unwrap();
            let mut a = UploadFile::new(PathBuf::from("a.csv"), "a.csv".into(), 100, 3);
            a.state = UploadState::Uploading;
            a.speed_bps = 1000.0;
            let mut b = UploadFile::new(PathBuf::from("b.csv"), "b.csv".into(), 100, 3);
            b.state = UploadState::Uploading;
            b.speed_bps = 3000.0;
            files.push(a);
            files.push(b);
        }
        let stats = uploader.stats();
        assert_eq!(stats.in_flight, 2);
        assert!((stats.avg_throughput_bps - 2000.0).abs() < f64::EPSILON);
        // ETA divides the 200 outstanding bytes by the combined 4000 B/s.
        assert_eq!(stats.eta_secs, Some(1));
    }

    #[test]
    fn terminal_states() {
        assert!(!UploadState::Pending.is_terminal());
        assert!(!UploadState::Uploading.is_terminal());
        assert!(!UploadState::Retrying.is_terminal());
        assert!(!UploadState::Processing.is_terminal());
        assert!(UploadState::Completed.is_terminal());
        assert!(UploadState::Failed.is_terminal());
        assert!(UploadState::Cancelled.is_terminal());
    }

    #[test]
    fn file_progress_spans_both_phases() {
        let mut file = UploadFile::new(PathBuf::from("x.csv"), "x.csv".into(), 100, 3);
        file.state = UploadState::Uploading;
        file.upload_progress = 0.5;
        assert!((file.progress() - 0.25).abs() < f64::EPSILON);
        file.state = UploadState::Processing;
        file.processing_progress = 0.5;
        assert!((file.progress() - 0.75).abs() < f64::EPSILON);
        file.state = UploadState::Completed;
        assert_eq!(file.progress(), 1.0);
    }
}
