use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use finfo_adapters::{Extractor, FetchOutcome, FinfoExtractor};
use finfo_storage::MySqlGateway;
use finfo_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "finfo")]
#[command(about = "Incremental updater for the finfo.tw insurance forum")]
struct Cli {
    /// YAML config file (defaults to ./finfo.yaml when present)
    #[arg(short = 'f', long = "file", global = true)]
    file: Option<PathBuf>,

    /// Number of concurrent fetch workers
    #[arg(short = 't', long = "threads", global = true,
          value_parser = clap::value_parser!(u16).range(1..))]
    threads: Option<u16>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch posts newer than the stored head and append them
    Update,
    /// Create the posts and users tables
    Migrate,
    /// Fetch one post and print its record as JSON
    Show { id: u64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("finfo=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::load(cli.file.as_deref())?;
    if let Some(threads) = cli.threads {
        config.max_workers = usize::from(threads);
    }
    info!(
        database = %config.database.redacted(),
        base_url = %config.base_url,
        max_workers = config.max_workers,
        assumed_year = config.assumed_year,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Update) {
        Commands::Update => {
            let summary = finfo_sync::run_update(&config).await?;
            if summary.is_up_to_date() {
                println!("database is up to date (head post {})", summary.local_max);
            } else {
                println!(
                    "update complete: run_id={} range={}..={} fetched={} missing={} failed={} dropped={} users+={} posts+={}",
                    summary.run_id,
                    summary.local_max,
                    summary.remote_max,
                    summary.fetched,
                    summary.not_found.len(),
                    summary.failed.len(),
                    summary.dropped_records.len(),
                    summary.ingest.users_inserted,
                    summary.ingest.posts_inserted
                );
            }
        }
        Commands::Migrate => {
            let storage = MySqlGateway::connect(&config.database)
                .await
                .context("unable to log into database")?;
            storage.migrate().await?;
            println!("migrations applied");
        }
        Commands::Show { id } => {
            let extractor =
                FinfoExtractor::new(config.base_url.clone(), config.http_client_config())?;
            match extractor.fetch(id).await? {
                FetchOutcome::Found(article) => {
                    println!("{}", serde_json::to_string_pretty(&article)?);
                }
                FetchOutcome::NotFound => {
                    anyhow::bail!("post {id} does not exist or was deleted");
                }
            }
        }
    }

    Ok(())
}
