//! Streaming export pipeline.
//!
//! Issues a streaming query, decodes the NDJSON response incrementally, and
//! assembles a CSV file without buffering the whole result set through a
//! single parse pass. One asynchronous read loop per export — output row
//! order is exactly input arrival order.
//!
//! Decoding is an explicit buffer-and-delimiter-scan loop: append the chunk,
//! split on newlines, parse each complete line, keep the partial tail. A
//! non-empty remainder at end of stream is parsed as the final record, so a
//! missing trailing newline loses nothing.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sift_core::csv::CsvBuilder;
use sift_core::models::StreamRequest;
use sift_core::{ClientError, Filters};

use crate::api::ApiClient;
use crate::notify::NotifyLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadState::Downloading)
    }
}

/// One in-flight or finished export.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: Uuid,
    pub filename: String,
    pub filters: Filters,
    pub fields: Option<Vec<String>>,
    pub state: DownloadState,
    pub rows: u64,
    pub error: Option<String>,
}

/// Handle to a running export: live row count, cancellation, final outcome.
pub struct ExportHandle {
    job: Arc<Mutex<DownloadJob>>,
    rows_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl ExportHandle {
    pub fn job(&self) -> DownloadJob {
        self.job.lock().unwrap().clone()
    }

    /// Rows decoded so far.
    pub fn rows(&self) -> u64 {
        *self.rows_rx.borrow()
    }

    pub fn subscribe_rows(&self) -> watch::Receiver<u64> {
        self.rows_rx.clone()
    }

    /// Abort the stream. Idempotent; the export ends as `Cancelled` and no
    /// file is written.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the export to finish and return the final job record.
    pub async fn wait(self) -> DownloadJob {
        let _ = self.handle.await;
        self.job.lock().unwrap().clone()
    }
}

/// Creates export jobs and owns the output directory.
pub struct Exporter {
    api: Arc<ApiClient>,
    out_dir: PathBuf,
}

impl Exporter {
    pub fn new(api: Arc<ApiClient>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            api,
            out_dir: out_dir.into(),
        }
    }

    /// Start one export with the current filter set and optional field
    /// projection. The output file is named from the start timestamp.
    pub fn start(&self, filters: Filters, fields: Option<Vec<String>>) -> ExportHandle {
        let filename = format!("export_{}.csv", Utc::now().format("%Y%m%d_%H%M%S"));
        let job = Arc::new(Mutex::new(DownloadJob {
            id: Uuid::new_v4(),
            filename: filename.clone(),
            filters: filters.clone(),
            fields: fields.clone(),
            state: DownloadState::Downloading,
            rows: 0,
            error: None,
        }));
        let (rows_tx, rows_rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_export(
            self.api.clone(),
            self.out_dir.join(&filename),
            filters,
            fields,
            job.clone(),
            rows_tx,
            cancel.clone(),
        ));
        ExportHandle {
            job,
            rows_rx,
            cancel,
            handle,
        }
    }
}

async fn run_export(
    api: Arc<ApiClient>,
    path: PathBuf,
    filters: Filters,
    fields: Option<Vec<String>>,
    job: Arc<Mutex<DownloadJob>>,
    rows_tx: watch::Sender<u64>,
    cancel: CancellationToken,
) {
    let result = export_to_file(&api, &path, filters, fields, &rows_tx, &cancel).await;
    let rows_seen = *rows_tx.borrow();
    match result {
        Ok(rows) => {
            {
                let mut job = job.lock().unwrap();
                job.state = DownloadState::Completed;
                job.rows = rows;
            }
            tracing::info!(rows, path = %path.display(), "Export completed");
        }
        Err(ClientError::Cancelled) => {
            {
                let mut job = job.lock().unwrap();
                job.state = DownloadState::Cancelled;
                job.rows = rows_seen;
            }
            tracing::info!(rows = rows_seen, "Export cancelled");
        }
        Err(err) => {
            {
                let mut job = job.lock().unwrap();
                job.state = DownloadState::Failed;
                job.rows = rows_seen;
                job.error = Some(err.to_string());
            }
            tracing::error!(error = %err, "Export failed");
            api.notifier()
                .notify(NotifyLevel::Error, &err.user_message())
                .await;
        }
    }
}

async fn export_to_file(
    api: &ApiClient,
    path: &std::path::Path,
    filters: Filters,
    fields: Option<Vec<String>>,
    rows_tx: &watch::Sender<u64>,
    cancel: &CancellationToken,
) -> Result<u64, ClientError> {
    let request = StreamRequest {
        filters,
        fields: fields.clone(),
    };
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        response = api.post_stream("/stream", &request) => response?,
    };

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| ClientError::Network(e.to_string())));
    let mut builder = CsvBuilder::new(fields);
    drain_ndjson(stream, &mut builder, rows_tx, cancel).await?;

    let rows = builder.rows();
    let csv = builder.finish();
    tokio::fs::write(path, csv)
        .await
        .map_err(|e| ClientError::Internal(format!("Failed to write export file: {}", e)))?;
    Ok(rows)
}

/// Drive the decode loop over any byte-chunk stream. Cancellation wins the
/// race against the next chunk and surfaces as `ClientError::Cancelled`.
async fn drain_ndjson<S, B>(
    mut stream: S,
    builder: &mut CsvBuilder,
    rows_tx: &watch::Sender<u64>,
    cancel: &CancellationToken,
) -> Result<(), ClientError>
where
    S: Stream<Item = Result<B, ClientError>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut decoder = NdjsonDecoder::new();
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                decoder.push(bytes.as_ref(), |record| builder.push_record(&record))?;
                let _ = rows_tx.send(builder.rows());
            }
            Some(Err(err)) => return Err(err),
            None => break,
        }
    }
    decoder.finish(|record| builder.push_record(&record))?;
    let _ = rows_tx.send(builder.rows());
    Ok(())
}

/// Splits a byte stream into newline-delimited JSON records, holding the
/// partial tail line across chunk boundaries.
struct NdjsonDecoder {
    buf: Vec<u8>,
}

impl NdjsonDecoder {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn parse(line: &[u8]) -> Result<serde_json::Value, ClientError> {
        serde_json::from_slice(line)
            .map_err(|e| ClientError::InvalidResponse(format!("Malformed NDJSON record: {}", e)))
    }

    fn push(
        &mut self,
        chunk: &[u8],
        mut on_record: impl FnMut(serde_json::Value) -> Result<(), ClientError>,
    ) -> Result<(), ClientError> {
        self.buf.extend_from_slice(chunk);
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let mut line = &self.buf[start..start + pos];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            if !line.is_empty() {
                let record = Self::parse(line)?;
                on_record(record)?;
            }
            start += pos + 1;
        }
        if start > 0 {
            self.buf.drain(..start);
        }
        Ok(())
    }

    /// End of stream: a non-empty remainder is the final record.
    fn finish(
        &mut self,
        mut on_record: impl FnMut(serde_json::Value) -> Result<(), ClientError>,
    ) -> Result<(), ClientError> {
        let mut line = self.buf.as_slice();
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        if !line.is_empty() {
            let record = Self::parse(line)?;
            on_record(record)?;
        }
        self.buf.clear();
        Ok(())
    }
}
