//! Environment manager CLI: database branch helpers and the
//! storage/data sync commands that move files and rows between the
//! local, staging and production environments.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gallery_service::config::{Config, EnvName};
use gallery_service::data_sync::copy_tables;
use gallery_service::object_store::ObjectStore;
use gallery_service::storage_sync::{download_bucket, sync_bucket, upload_dir};
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::process::Command as ProcessCommand;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gallery-env", version, about = "Gallery environment manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new branch in the local database
    CreateBranch { name: String },
    /// Switch to a branch in the local database
    SwitchBranch { name: String },
    /// List all branches in the local database
    ListBranches,
    /// Copy table rows from one environment to another
    SyncData {
        source: EnvName,
        target: EnvName,
        #[arg(required = true)]
        tables: Vec<String>,
    },
    /// Mirror a storage bucket from one environment to another
    SyncStorage {
        source: EnvName,
        target: EnvName,
        /// Bucket to sync (defaults to the configured bucket)
        bucket: Option<String>,
    },
    /// Download a bucket into the local storage directory
    Download {
        env: EnvName,
        /// Bucket to download (defaults to the configured bucket)
        bucket: Option<String>,
        /// Local directory holding one subdirectory per bucket
        #[arg(long, default_value = "storage")]
        dir: String,
    },
    /// Upload the local storage directory into a bucket
    Upload {
        env: EnvName,
        /// Bucket to upload into (defaults to the configured bucket)
        bucket: Option<String>,
        /// Local directory holding one subdirectory per bucket
        #[arg(long, default_value = "storage")]
        dir: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gallery_service=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    match cli.command {
        Command::CreateBranch { name } => {
            supabase_command(&["db", "branch", "create", &name])?;
            println!("Branch {name} created successfully");
        }
        Command::SwitchBranch { name } => {
            supabase_command(&["db", "branch", "switch", &name])?;
            println!("Switched to branch {name} successfully");
        }
        Command::ListBranches => {
            supabase_command(&["db", "branches", "list"])?;
        }
        Command::SyncData {
            source,
            target,
            tables,
        } => {
            sync_data(&config, source, target, &tables).await?;
        }
        Command::SyncStorage {
            source,
            target,
            bucket,
        } => {
            let bucket = bucket.unwrap_or_else(|| config.sync.bucket.clone());
            sync_storage(&config, source, target, &bucket).await?;
        }
        Command::Download { env, bucket, dir } => {
            let bucket = bucket.unwrap_or_else(|| config.sync.bucket.clone());
            download_storage(&config, env, &bucket, &dir).await?;
        }
        Command::Upload { env, bucket, dir } => {
            let bucket = bucket.unwrap_or_else(|| config.sync.bucket.clone());
            upload_storage(&config, env, &bucket, &dir).await?;
        }
    }

    Ok(())
}

/// Run the local `supabase` CLI; a non-zero exit is fatal.
fn supabase_command(args: &[&str]) -> Result<()> {
    let status = ProcessCommand::new("supabase")
        .args(args)
        .status()
        .context("Failed to run the supabase CLI (is it installed?)")?;

    if !status.success() {
        bail!("supabase {} exited with {status}", args.join(" "));
    }
    Ok(())
}

/// Copy the named tables from the source environment's database to the
/// target's. Per-table failures are reported but do not fail the run.
async fn sync_data(
    config: &Config,
    source: EnvName,
    target: EnvName,
    tables: &[String],
) -> Result<()> {
    info!(source = %source, target = %target, "Syncing data");

    let source_url = config.environments.get(source).database_url(source)?;
    let target_url = config.environments.get(target).database_url(target)?;

    let source_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(source_url)
        .await
        .with_context(|| format!("Failed to connect to {source} database"))?;
    let target_pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(target_url)
        .await
        .with_context(|| format!("Failed to connect to {target} database"))?;

    let report = copy_tables(&source_pool, &target_pool, tables).await;

    println!("Data sync completed!");
    println!(
        "Synced {} tables ({} rows); {} tables failed",
        report.tables_synced, report.rows_copied, report.tables_failed
    );
    Ok(())
}

/// Mirror the bucket from the source environment into the target one.
/// Per-object failures are reported but do not fail the run.
async fn sync_storage(
    config: &Config,
    source: EnvName,
    target: EnvName,
    bucket: &str,
) -> Result<()> {
    info!(source = %source, target = %target, bucket = %bucket, "Syncing storage");

    let source_store =
        ObjectStore::connect(source, config.environments.get(source), bucket).await?;
    let target_store =
        ObjectStore::connect(target, config.environments.get(target), bucket).await?;

    let staging = Path::new(&config.sync.staging_dir);
    let report = sync_bucket(
        &source_store,
        &target_store,
        bucket,
        staging,
        config.sync.file_size_limit_bytes,
    )
    .await?;

    println!("Storage sync completed!");
    println!("Successfully synced {} files.", report.succeeded);
    if report.failed > 0 {
        println!(
            "Failed to sync {} files. Check the logs for details.",
            report.failed
        );
    }
    Ok(())
}

/// Fetch the bucket into `<dir>/<bucket>/` on the local filesystem.
/// Per-file failures are reported but do not fail the run.
async fn download_storage(config: &Config, env: EnvName, bucket: &str, dir: &str) -> Result<()> {
    info!(env = %env, bucket = %bucket, "Downloading storage");

    let store = ObjectStore::connect(env, config.environments.get(env), bucket).await?;
    let dest = Path::new(dir).join(bucket);
    let report = download_bucket(&store, bucket, &dest).await?;

    println!("Download completed!");
    println!(
        "Downloaded {} files to {}.",
        report.succeeded,
        dest.display()
    );
    if report.failed > 0 {
        println!(
            "Failed to download {} files. Check the logs for details.",
            report.failed
        );
    }
    Ok(())
}

/// Push `<dir>/<bucket>/` from the local filesystem into the bucket.
/// Per-file failures are reported but do not fail the run.
async fn upload_storage(config: &Config, env: EnvName, bucket: &str, dir: &str) -> Result<()> {
    info!(env = %env, bucket = %bucket, "Uploading storage");

    let store = ObjectStore::connect(env, config.environments.get(env), bucket).await?;
    let src = Path::new(dir).join(bucket);
    let report = upload_dir(&src, &store, bucket).await?;

    println!("Upload completed!");
    println!("Uploaded {} files from {}.", report.succeeded, src.display());
    if report.failed > 0 {
        println!(
            "Failed to upload {} files. Check the logs for details.",
            report.failed
        );
    }
    Ok(())
}
