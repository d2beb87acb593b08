//! SIRI-VM Ingest - vehicle location snapshot ingestion tool

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::{Args, Parser, Subcommand};
use sirivm_common::logging::{init_logging, LogConfig, LogLevel};
use sirivm_ingest::{
    config::IngestConfig,
    db::SqliteStore,
    pipeline::{Pipeline, RunContext},
    siri::{SiriVmParser, SiriVmValidator},
    storage::{S3ObjectStore, StorageConfig},
    window::WindowSelector,
    IngestError,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sirivm-ingest")]
#[command(author, version, about = "SIRI-VM vehicle location ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every snapshot in the current window
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Write the run summary as JSON to this file
        #[arg(long, env = "SIRIVM_SUMMARY_OUT")]
        summary_out: Option<PathBuf>,
    },

    /// List the objects the current window selects, without fetching them
    Window {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command line values that take precedence over the environment
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Source bucket
    #[arg(long)]
    bucket: Option<String>,

    /// Key prefix of snapshot objects
    #[arg(long)]
    prefix: Option<String>,

    /// Extraction window in hours
    #[arg(long)]
    lookback_hours: Option<f64>,

    /// SQLite database file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Stamp the database file name with the run start time
    #[arg(long)]
    timestamped_db: bool,

    #[arg(long)]
    fetch_workers: Option<usize>,

    #[arg(long)]
    parse_workers: Option<usize>,

    #[arg(long)]
    validate_workers: Option<usize>,

    /// Depth of the parse/validate/insert queues
    #[arg(long)]
    queue_depth: Option<usize>,
}

impl Overrides {
    fn apply(self, config: &mut IngestConfig) {
        if let Some(bucket) = self.bucket {
            config.bucket = bucket;
        }
        if let Some(prefix) = self.prefix {
            config.prefix = prefix;
        }
        if let Some(hours) = self.lookback_hours {
            config.lookback_hours = hours;
        }
        if let Some(path) = self.db_path {
            config.db_path = path;
        }
        if self.timestamped_db {
            config.timestamped_db = true;
        }

        let c = &mut config.concurrency;
        if let Some(n) = self.fetch_workers {
            c.fetch_workers = n;
        }
        if let Some(n) = self.parse_workers {
            c.parse_workers = n;
        }
        if let Some(n) = self.validate_workers {
            c.validate_workers = n;
        }
        if let Some(n) = self.queue_depth {
            c.queue_depth = n;
        }
    }

    fn into_config(self) -> Result<IngestConfig> {
        let mut config = IngestConfig::load()?;
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }
}

async fn connect_source(config: &IngestConfig) -> S3ObjectStore {
    S3ObjectStore::connect(&StorageConfig::from_env(), &config.bucket)
        .await
        .with_page_size(config.list_page_size)
}

async fn run(config: IngestConfig, summary_out: Option<PathBuf>) -> Result<()> {
    let db_path = config.resolved_db_path(Local::now());
    let store = Arc::new(SqliteStore::open(&db_path).await.map_err(IngestError::Store)?);

    let context = RunContext {
        objects: Arc::new(connect_source(&config).await),
        parser: Arc::new(SiriVmParser),
        validator: Arc::new(SiriVmValidator::default()),
        store: store.clone(),
    };
    let selector = WindowSelector::new(&config.prefix, config.lookback());
    let pipeline = Pipeline::new(context, selector, config.concurrency)?;

    let outcome = pipeline.run().await;
    store.close().await;
    let summary = outcome?;

    info!(
        db = %db_path.display(),
        found = summary.found,
        processed = summary.processed(),
        inserted = summary.inserted,
        duplicate = summary.duplicate,
        failed = summary.failed,
        "Ingestion complete"
    );

    if let Some(path) = summary_out {
        let json = serde_json::to_vec_pretty(&summary)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!(path = %path.display(), "Wrote run summary");
    }

    Ok(())
}

async fn list_window(config: IngestConfig) -> Result<()> {
    let source = connect_source(&config).await;
    let selector = WindowSelector::new(&config.prefix, config.lookback());

    let window = selector.select(&source, Utc::now()).await?;
    for object in &window.objects {
        info!(source = %object.key, last_modified = %object.last_modified, "Selected");
    }
    info!(
        bucket = %source.bucket(),
        cutoff = %window.cutoff,
        listed = window.listed,
        selected = window.objects.len(),
        "Window listed"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the flag
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("sirivm-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    match cli.command {
        Command::Run {
            overrides,
            summary_out,
        } => run(overrides.into_config()?, summary_out).await,
        Command::Window { overrides } => list_window(overrides.into_config()?).await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use sirivm_ingest::config::StageConcurrency;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply() {
        let cli = Cli::try_parse_from([
            "sirivm-ingest",
            "run",
            "--bucket",
            "bods",
            "--lookback-hours",
            "0.5",
            "--fetch-workers",
            "8",
            "--summary-out",
            "summary.json",
        ])
        .unwrap();

        let Command::Run {
            overrides,
            summary_out,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(summary_out, Some(PathBuf::from("summary.json")));

        let mut config = IngestConfig {
            bucket: String::new(),
            prefix: "sirivm".to_string(),
            lookback_hours: 1.0,
            db_path: PathBuf::from("vehicles.db"),
            timestamped_db: false,
            list_page_size: None,
            concurrency: StageConcurrency::default(),
        };
        overrides.apply(&mut config);

        assert_eq!(config.bucket, "bods");
        assert_eq!(config.lookback_hours, 0.5);
        assert_eq!(config.concurrency.fetch_workers, 8);
        assert_eq!(config.concurrency.parse_workers, StageConcurrency::default().parse_workers);
        config.validate().unwrap();
    }
}
