// ABOUTME: Entry point for the jobserver binary.
// ABOUTME: Loads configuration, opens the store, runs jobs until Ctrl-C, then pauses them and shuts down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use jobserver_api::JobServer;
use jobserver_core::{ConfigClient, ServerConfig};
use jobserver_jobs::{JobManager, JobParameters};
use jobserver_store::Database;

/// Durable job server: runs multi-stage jobs and records every transition in SQLite.
#[derive(Parser, Debug)]
#[command(name = "jobserver", version, about)]
struct Cli {
    /// Path to the JSON or YAML configuration file.
    #[arg(long, default_value = "jobserver.json")]
    config: PathBuf,

    /// Create an empty configuration file if none exists.
    #[arg(long)]
    create_config: bool,

    /// Override the configured worker budget.
    #[arg(long)]
    workers: Option<usize>,

    /// Submit and start a job from this template at start-up.
    #[arg(long)]
    submit: Option<String>,

    /// Parameters for --submit, as a JSON object.
    #[arg(long, default_value = "{}")]
    params: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jobserver=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut client = ConfigClient::load(&cli.config, cli.create_config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let overrides = client.apply_env_overrides();
    let mut config = ServerConfig::from_client(&client)?;
    if let Some(workers) = cli.workers {
        config.max_workers = workers;
    }
    tracing::info!(
        database = %config.database_path.display(),
        workers = config.max_workers,
        overrides,
        "jobserver starting up"
    );

    let db = Arc::new(
        Database::connect(&config.database_path, config.create_database)
            .with_context(|| format!("opening database {}", config.database_path.display()))?,
    );
    let manager = JobManager::from_config(db, &config);
    for template in manager.list_job_templates() {
        tracing::info!(template = %template.name, stages = ?template.stages, "template available");
    }
    let archiver = (config.archive_interval_secs > 0)
        .then(|| manager.spawn_archiver(Duration::from_secs(config.archive_interval_secs)));
    let server = JobServer::new(manager);

    if let Some(template) = cli.submit {
        let values: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&cli.params).context("--params must be a JSON object")?;
        let params = JobParameters {
            template,
            values,
        };
        let job = server.submit_job(None, params).await?;
        let admission = server.start_job(&job.job_id).await?;
        tracing::info!(job_id = %job.job_id, ?admission, "submitted job");
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");

    if let Some(archiver) = archiver {
        archiver.abort();
    }

    let report = server.shutdown().await?;
    if !report.is_clean() {
        tracing::warn!(failures = report.failures.len(), "shut down with unpaused jobs");
    }
    Ok(())
}
