//! Pre-flight upload validation.
//!
//! Runs entirely client-side before any network call. Errors block the
//! offending file only; warnings are surfaced but never block. Batch-level
//! errors (aggregate size cap) block the whole batch.

use serde::Serialize;

use crate::config::UploadConfig;

/// Filename characters that commonly break downstream tooling.
const SUSPICIOUS_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\', '/'];

/// Metadata the validator needs about one candidate file. Callers stat the
/// file; the validator never touches the filesystem.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Validation outcome for one file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl FileReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validation outcome for a batch: one report per file plus batch-level
/// errors and warnings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl BatchReport {
    /// Whether the batch as a whole may proceed. Individual file errors do
    /// not block the batch; only batch-level errors do.
    pub fn batch_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn has_csv_extension(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
        && name.contains('.')
}

/// Validate a single file against the configured bounds.
pub fn validate_file(meta: &FileMeta, config: &UploadConfig) -> FileReport {
    let mut report = FileReport::default();

    if meta.size == 0 {
        report.errors.push(format!("{}: file is empty", meta.name));
    }
    if meta.size > config.max_file_size {
        report.errors.push(format!(
            "{}: file size {} exceeds the maximum of {} bytes",
            meta.name, meta.size, config.max_file_size
        ));
    }
    if meta.name.len() > config.max_filename_len {
        report.errors.push(format!(
            "filename exceeds {} characters",
            config.max_filename_len
        ));
    }

    let type_allowed = meta
        .content_type
        .as_deref()
        .map(|ct| {
            let ct = ct.split(';').next().unwrap_or(ct).trim();
            config.allowed_content_types.iter().any(|a| a == ct)
        })
        .unwrap_or(false);
    if !type_allowed && !has_csv_extension(&meta.name) {
        report.errors.push(format!(
            "{}: not a CSV file (content type {:?})",
            meta.name, meta.content_type
        ));
    }

    if meta.name.chars().any(|c| SUSPICIOUS_CHARS.contains(&c) || c.is_control()) {
        report.warnings.push(format!(
            "{}: filename contains characters that may cause problems",
            meta.name
        ));
    }
    if meta.size > config.large_file_warn_bytes && meta.size <= config.max_file_size {
        report.warnings.push(format!(
            "{}: large file ({} bytes), upload may take a while",
            meta.name, meta.size
        ));
    }

    report
}

/// Validate a batch: per-file checks plus aggregate size, duplicate names,
/// and batch-count checks.
pub fn validate_batch(metas: &[FileMeta], config: &UploadConfig) -> BatchReport {
    let mut report = BatchReport {
        files: metas.iter().map(|m| validate_file(m, config)).collect(),
        ..Default::default()
    };

    let total: u64 = metas.iter().map(|m| m.size).sum();
    if total > config.max_total_size {
        report.errors.push(format!(
            "batch size {} exceeds the total cap of {} bytes",
            total, config.max_total_size
        ));
    }

    let mut seen = std::collections::HashSet::new();
    for meta in metas {
        if !seen.insert(meta.name.as_str()) {
            report
                .warnings
                .push(format!("duplicate filename in batch: {}", meta.name));
        }
    }

    if metas.len() > config.large_batch_warn_count {
        report
            .warnings
            .push(format!("large batch of {} files", metas.len()));
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, size: u64, content_type: Option<&str>) -> FileMeta {
        FileMeta {
            name: name.to_string(),
            size,
            content_type: content_type.map(String::from),
        }
    }

    #[test]
    fn zero_byte_file_is_always_rejected() {
        let report = validate_file(&meta("data.csv", 0, Some("text/csv")), &UploadConfig::default());
        assert!(!report.is_valid());
    }

    #[test]
    fn oversized_file_is_rejected() {
        let config = UploadConfig {
            max_file_size: 100,
            ..UploadConfig::default()
        };
        let report = validate_file(&meta("data.csv", 101, Some("text/csv")), &config);
        assert!(!report.is_valid());
        let report = validate_file(&meta("data.csv", 100, Some("text/csv")), &config);
        assert!(report.is_valid());
    }

    #[test]
    fn non_csv_type_and_extension_is_rejected() {
        let config = UploadConfig::default();
        let report = validate_file(&meta("image.png", 10, Some("image/png")), &config);
        assert!(!report.is_valid());
    }

    #[test]
    fn csv_extension_rescues_unknown_content_type() {
        let config = UploadConfig::default();
        let report = validate_file(&meta("data.csv", 10, None), &config);
        assert!(report.is_valid());
        let report = validate_file(&meta("DATA.CSV", 10, Some("application/octet-stream")), &config);
        assert!(report.is_valid());
    }

    #[test]
    fn allowed_content_type_rescues_non_csv_extension() {
        let config = UploadConfig::default();
        let report = validate_file(&meta("data.txt", 10, Some("text/csv")), &config);
        assert!(report.is_valid());
    }

    #[test]
    fn long_filename_is_rejected() {
        let config = UploadConfig::default();
        let name = format!("{}.csv", "a".repeat(300));
        let report = validate_file(&meta(&name, 10, Some("text/csv")), &config);
        assert!(!report.is_valid());
    }

    #[test]
    fn suspicious_filename_warns_but_does_not_reject() {
        let config = UploadConfig::default();
        let report = validate_file(&meta("we?ird.csv", 10, Some("text/csv")), &config);
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn large_file_warns_under_the_cap() {
        let config = UploadConfig {
            large_file_warn_bytes: 50,
            max_file_size: 200,
            ..UploadConfig::default()
        };
        let report = validate_file(&meta("data.csv", 100, Some("text/csv")), &config);
        assert!(report.is_valid());
        assert!(!report.warnings.is_empty());
    }

    #[test]
    fn invalid_file_does_not_block_the_batch() {
        let config = UploadConfig::default();
        let report = validate_batch(
            &[
                meta("empty.csv", 0, Some("text/csv")),
                meta("good.csv", 10, Some("text/csv")),
            ],
            &config,
        );
        assert!(report.batch_ok());
        assert!(!report.files[0].is_valid());
        assert!(report.files[1].is_valid());
    }

    #[test]
    fn aggregate_size_cap_blocks_the_batch() {
        let config = UploadConfig {
            max_total_size: 100,
            ..UploadConfig::default()
        };
        let report = validate_batch(
            &[
                meta("a.csv", 60, Some("text/csv")),
                meta("b.csv", 60, Some("text/csv")),
            ],
            &config,
        );
        assert!(!report.batch_ok());
    }

    #[test]
    fn duplicate_names_warn() {
        let config = UploadConfig::default();
        let report = validate_batch(
            &[
                meta("a.csv", 10, Some("text/csv")),
                meta("a.csv", 20, Some("text/csv")),
            ],
            &config,
        );
        assert!(report.batch_ok());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn large_batch_warns() {
        let config = UploadConfig {
            large_batch_warn_count: 2,
            ..UploadConfig::default()
        };
        let metas: Vec<FileMeta> = (0..3)
            .map(|i| meta(&format!("f{}.csv", i), 10, Some("text/csv")))
            .collect();
        let report = validate_batch(&metas, &config);
        assert!(report.warnings.iter().any(|w| w.contains("large batch")));
    }
}
