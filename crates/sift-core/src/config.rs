//! Configuration module
//!
//! Env-var driven configuration with constant defaults, shared by the client
//! and the CLI.

use std::env;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

const DEFAULT_MAX_FILE_SIZE: u64 = 512 * 1024 * 1024; // 512 MB
const DEFAULT_MAX_TOTAL_SIZE: u64 = 2 * 1024 * 1024 * 1024; // 2 GB
const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;
const DEFAULT_MAX_FILENAME_LEN: usize = 255;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const LARGE_FILE_WARN_BYTES: u64 = 100 * 1024 * 1024; // 100 MB
const LARGE_BATCH_WARN_COUNT: usize = 20;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Transport-level configuration for the API client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    /// Read from environment: SIFT_API_URL (or API_URL) and
    /// SIFT_REQUEST_TIMEOUT_SECS.
    pub fn from_env() -> Self {
        let base_url = env::var("SIFT_API_URL")
            .or_else(|_| env::var("API_URL"))
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(env_parse(
                "SIFT_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )),
        }
    }
}

/// Upload orchestration configuration: validation bounds, concurrency, and
/// retry knobs.
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub max_total_size: u64,
    pub max_concurrent: usize,
    pub max_filename_len: usize,
    pub allowed_content_types: Vec<String>,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub large_file_warn_bytes: u64,
    pub large_batch_warn_count: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT_UPLOADS,
            max_filename_len: DEFAULT_MAX_FILENAME_LEN,
            allowed_content_types: vec![
                "text/csv".to_string(),
                "application/csv".to_string(),
                "application/vnd.ms-excel".to_string(),
                "text/plain".to_string(),
            ],
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            large_file_warn_bytes: LARGE_FILE_WARN_BYTES,
            large_batch_warn_count: LARGE_BATCH_WARN_COUNT,
        }
    }
}

impl UploadConfig {
    /// Read overrides from environment: SIFT_MAX_FILE_SIZE,
    /// SIFT_MAX_TOTAL_SIZE, SIFT_MAX_CONCURRENT_UPLOADS, SIFT_MAX_RETRIES.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_file_size: env_parse("SIFT_MAX_FILE_SIZE", defaults.max_file_size),
            max_total_size: env_parse("SIFT_MAX_TOTAL_SIZE", defaults.max_total_size),
            max_concurrent: env_parse("SIFT_MAX_CONCURRENT_UPLOADS", defaults.max_concurrent)
                .max(1),
            max_retries: env_parse("SIFT_MAX_RETRIES", defaults.max_retries),
            ..defaults
        }
    }
}
