//! Sift CLI — command-line client for the Sift data explorer API.
//!
//! Set SIFT_API_URL (or API_URL) plus SIFT_ACCESS_TOKEN and
//! SIFT_REFRESH_TOKEN for authenticated endpoints.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use sift_cli::{format_bytes, init_tracing, parse_filter};
use sift_client::{ApiClient, Exporter, JobWatcher, TokenManager, Uploader};
use sift_core::models::{DeleteRequest, FacetsRequest, QueryRequest};
use sift_core::{ClientConfig, Filters, UploadConfig};

#[derive(Parser)]
#[command(name = "sift", about = "Sift data explorer CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more CSV files
    Upload {
        /// Paths of the CSV files to upload
        files: Vec<PathBuf>,
        /// Maximum concurrent uploads
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Watch an ingestion job until it finishes
    Status {
        /// Job identifier returned by upload
        job_id: String,
    },
    /// Query rows with optional filters and field projection
    Query {
        /// Filter as column=v1,v2 (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Comma-separated field projection
        #[arg(long)]
        fields: Option<String>,
        /// Maximum number of rows
        #[arg(long, default_value = "50")]
        limit: i64,
        /// Offset for pagination
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Stream matching rows into a CSV file
    Export {
        /// Filter as column=v1,v2 (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Comma-separated field projection
        #[arg(long)]
        fields: Option<String>,
        /// Directory the export file is written to
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Distinct values with counts for one column
    Facets {
        /// Column name
        column: String,
        /// Filter as column=v1,v2 (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Verify credentials by forcing a token refresh and printing the claims
    Login,
    /// Delete rows by uploaded file or by filter (dry run unless --yes)
    Delete {
        /// Uploaded file identifier
        #[arg(long, conflicts_with = "filters")]
        file_id: Option<String>,
        /// Filter as column=v1,v2 (repeatable)
        #[arg(long = "filter")]
        filters: Vec<String>,
        /// Actually delete instead of reporting the match count
        #[arg(long)]
        yes: bool,
    },
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("Serialize response")?;
    println!("{}", out);
    Ok(())
}

fn build_filters(args: &[String]) -> anyhow::Result<Filters> {
    let mut filters = Filters::new();
    for arg in args {
        let (column, values) = parse_filter(arg)?;
        filters.set_values(&column, values);
    }
    Ok(filters)
}

fn parse_fields(fields: Option<String>) -> Option<Vec<String>> {
    fields.map(|f| {
        f.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
}

fn client_from_env() -> anyhow::Result<Arc<ApiClient>> {
    let tokens = Arc::new(TokenManager::new());
    if let (Ok(access), Ok(refresh)) = (
        std::env::var("SIFT_ACCESS_TOKEN"),
        std::env::var("SIFT_REFRESH_TOKEN"),
    ) {
        tokens.set_tokens(&access, &refresh);
    }
    let api = ApiClient::new(ClientConfig::from_env(), tokens)
        .context("Failed to create API client. Set SIFT_API_URL (or API_URL)")?;
    Ok(Arc::new(api))
}

async fn run_upload(
    api: Arc<ApiClient>,
    files: Vec<PathBuf>,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    anyhow::ensure!(!files.is_empty(), "No files given");
    let mut config = UploadConfig::from_env();
    if let Some(concurrency) = concurrency {
        config.max_concurrent = concurrency.max(1);
    }
    let uploader = Uploader::new(api, config);
    uploader.upload_batch(files).await?;

    let mut changed = uploader.subscribe();
    loop {
        let stats = uploader.stats();
        eprintln!(
            "{:>5.1}% | {}/{} done | {}/s",
            stats.overall_progress * 100.0,
            stats.completed,
            stats.total,
            format_bytes(stats.avg_throughput_bps as u64),
        );
        if stats.completed + stats.failed + stats.cancelled == stats.total {
            break;
        }
        tokio::select! {
            _ = changed.changed() => {}
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    uploader.wait().await;
    print_json(&uploader.files())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let api = client_from_env()?;

    match cli.command {
        Commands::Upload { files, concurrency } => {
            run_upload(api, files, concurrency).await?;
        }
        Commands::Status { job_id } => {
            let mut watcher = JobWatcher::watch(api, job_id);
            let status = watcher
                .wait_terminal()
                .await
                .context("Watcher stopped before the job finished")?;
            print_json(&status)?;
        }
        Commands::Query {
            filters,
            fields,
            limit,
            offset,
        } => {
            let request = QueryRequest {
                filters: build_filters(&filters)?,
                fields: parse_fields(fields),
                limit,
                offset,
            };
            let response = api.query(&request).await?;
            print_json(&response)?;
        }
        Commands::Export {
            filters,
            fields,
            out_dir,
        } => {
            let exporter = Exporter::new(api, out_dir);
            let handle = exporter.start(build_filters(&filters)?, parse_fields(fields));
            let job = handle.wait().await;
            print_json(&job)?;
        }
        Commands::Facets { column, filters } => {
            let request = FacetsRequest {
                filters: build_filters(&filters)?,
                column,
            };
            let response = api.facets(&request).await?;
            print_json(&response)?;
        }
        Commands::Login => {
            api.refresh_tokens()
                .await
                .context("Set SIFT_ACCESS_TOKEN and SIFT_REFRESH_TOKEN")?;
            let claims = api.tokens().claims();
            print_json(&serde_json::json!({
                "sub": claims.as_ref().and_then(|c| c.sub.clone()),
                "tenant": claims.as_ref().and_then(|c| c.tenant.clone()),
                "role": claims.as_ref().and_then(|c| c.role.clone()),
            }))?;
        }
        Commands::Delete {
            file_id,
            filters,
            yes,
        } => {
            if let Some(file_id) = file_id {
                let response = api.delete_file(&file_id, !yes).await?;
                print_json(&response)?;
                return Ok(());
            }
            anyhow::ensure!(!filters.is_empty(), "Give --file-id or at least one --filter");
            let filters = build_filters(&filters)?;
            let dry = api
                .bulk_delete(&DeleteRequest {
                    filters: filters.clone(),
                    dry_run: true,
                    expected_min: None,
                    expected_max: None,
                })
                .await?;
            if !yes {
                eprintln!("{} rows match; re-run with --yes to delete", dry.matched);
                print_json(&dry)?;
                return Ok(());
            }
            // Guard the confirm with the dry-run count so a concurrent
            // change to the dataset aborts the delete with a conflict.
            let response = api
                .bulk_delete(&DeleteRequest {
                    filters,
                    dry_run: false,
                    expected_min: Some(dry.matched),
                    expected_max: Some(dry.matched),
                })
                .await?;
            print_json(&response)?;
        }
    }

    Ok(())
}
