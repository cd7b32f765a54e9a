//! CloudKit Migration CLI
//!
//! Moves CloudKit records and their assets into Firestore and Cloud Storage.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cloudkit_migrate::config::SourceConfig;
use cloudkit_migrate::source::cloudkit::{CloudKitClient, QueryRequest};
use cloudkit_migrate::source::create_source;
use cloudkit_migrate::{MigrationConfig, Pipeline, RequestSigner};

#[derive(Parser)]
#[command(name = "cloudkit-migrate")]
#[command(version)]
#[command(about = "Migrate CloudKit records and assets to Firestore and Cloud Storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Dry run mode (read everything, write nothing)
    #[arg(long, global = true)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Concurrent records override
    #[arg(long, global = true)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate every configured record type
    Run,

    /// Re-host the configured asset fields of already migrated documents
    Assets,

    /// Validate configuration file
    Validate,

    /// Issue a single query and print the raw response
    Inspect {
        /// Record type to query
        #[arg(short, long)]
        record_type: String,

        /// Maximum number of records
        #[arg(short, long, default_value_t = 1)]
        limit: usize,

        /// Only return these fields (repeatable)
        #[arg(short, long = "desired-key")]
        desired_keys: Vec<String>,
    },

    /// Generate example configuration
    Init {
        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Some(Commands::Init { output }) => generate_config(&output),
        Some(Commands::Validate) => validate_config(&require_config(cli.config.as_deref())?),
        Some(Commands::Inspect {
            record_type,
            limit,
            desired_keys,
        }) => {
            inspect(
                &require_config(cli.config.as_deref())?,
                &record_type,
                limit,
                desired_keys,
            )
            .await
        }
        Some(Commands::Assets) => {
            let config = load_config(&require_config(cli.config.as_deref())?, cli.dry_run, cli.workers)?;
            run_assets(config).await
        }
        Some(Commands::Run) | None => {
            let Some(path) = cli.config else {
                eprintln!("Usage: cloudkit-migrate --config <FILE> [COMMAND]");
                eprintln!("Try 'cloudkit-migrate --help' for more information.");
                std::process::exit(1);
            };
            let config = load_config(&path, cli.dry_run, cli.workers)?;
            run_migration(config).await
        }
    }
}

fn require_config(config: Option<&Path>) -> anyhow::Result<PathBuf> {
    config
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow::anyhow!("--config <FILE> is required for this command"))
}

fn load_config(path: &Path, dry_run: bool, workers: Option<usize>) -> anyhow::Result<MigrationConfig> {
    info!("Loading configuration from {:?}", path);

    let mut config = MigrationConfig::from_file(path)?;
    if dry_run {
        config.options.dry_run = true;
    }
    if let Some(workers) = workers {
        config.options.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

async fn run_migration(config: MigrationConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let stats = pipeline.run().await?;

    println!("\nMigration complete");
    println!("   Fetched:   {}", stats.fetched);
    println!("   Migrated:  {}", stats.migrated);
    println!("   Degraded:  {}", stats.degraded);
    println!("   Failed:    {}", stats.failed);
    if stats.skipped > 0 {
        println!("   Dry run:   {}", stats.skipped);
    }
    for (record_type, type_stats) in &stats.per_type {
        match &type_stats.fetch_error {
            Some(error) => println!("   {}: not fetched ({})", record_type, error),
            None => println!(
                "   {}: {}/{} written",
                record_type,
                type_stats.migrated + type_stats.degraded,
                type_stats.fetched
            ),
        }
    }
    println!("   Duration:  {:.2}s", stats.duration_secs);
    println!("   Throughput: {:.0} records/sec", stats.throughput());

    if !stats.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}

async fn run_assets(config: MigrationConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::from_config(config).await?;
    let stats = pipeline.run_assets().await?;

    println!("\nAsset migration complete");
    println!("   Uploaded:  {}/{}", stats.uploaded, stats.total);
    println!("   Documents updated: {}", stats.documents_updated);
    if stats.write_failures > 0 {
        println!("   Update failures:   {}", stats.write_failures);
    }
    if !stats.failed_types.is_empty() {
        println!("   Not fetched: {}", stats.failed_types.join(", "));
    }
    println!("   Duration:  {:.2}s", stats.duration_secs);

    Ok(())
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    info!("Validating configuration from {:?}", config_path);

    let config = MigrationConfig::from_file(config_path)?;
    config.validate()?;

    println!("Configuration is valid");
    match &config.source {
        SourceConfig::CloudKit(ck) => {
            println!("   Source: CloudKit {} ({}/{})", ck.container, ck.environment, ck.database);
        }
        SourceConfig::Export(export) => println!("   Source: export {:?}", export.path),
    }
    println!(
        "   Destination: {} / gs://{}",
        config.destination.project_id, config.destination.bucket
    );
    for mapping in &config.record_types {
        println!(
            "   {} -> {} ({} asset fields)",
            mapping.record_type,
            mapping.collection_name(),
            mapping.asset_fields.len()
        );
    }

    Ok(())
}

async fn inspect(
    config_path: &Path,
    record_type: &str,
    limit: usize,
    desired_keys: Vec<String>,
) -> anyhow::Result<()> {
    let config = MigrationConfig::from_file(config_path)?;

    let response = match &config.source {
        SourceConfig::CloudKit(ck) => {
            let signer = RequestSigner::from_pem_file(ck.key_id.clone(), &ck.key_file)?;
            let client = CloudKitClient::new(ck.clone(), signer)?;
            info!("Querying {}", client.query_url());

            let request = QueryRequest::new(record_type)
                .with_limit(limit)
                .with_desired_keys(desired_keys);
            client.query_raw(&request).await?
        }
        SourceConfig::Export(_) => {
            let source = create_source(&config.source)?;
            let records: Vec<_> = source
                .fetch_all(record_type)
                .await?
                .into_iter()
                .take(limit)
                .collect();
            serde_json::json!({ "records": records })
        }
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn generate_config(output: &Path) -> anyhow::Result<()> {
    std::fs::write(output, CONFIG_TEMPLATE)?;
    println!("Generated configuration: {:?}", output);
    println!(
        "   Edit the file and run: cloudkit-migrate --config {:?} run --dry-run",
        output
    );

    Ok(())
}

const CONFIG_TEMPLATE: &str = r#"# CloudKit to Firestore migration configuration

source:
  type: cloudkit
  container: iCloud.com.example.App
  environment: production
  database: public
  key_id: ${CLOUDKIT_KEY_ID}
  key_file: ./eckey.pem

destination:
  project_id: my-project
  bucket: my-project.appspot.com
  credentials:
    service_account: ./service-account.json

record_types:
  - record_type: Products
    collection: products
    asset_fields: [imageURL1, modelURL]
  - record_type: Orders

options:
  dry_run: false
  workers: 1
  asset_timeout_secs: 30
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cloudkit-migrate",
            "--config",
            "f.yaml",
            "run",
            "--workers",
            "4",
            "--dry-run",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.workers, Some(4));
        assert!(cli.dry_run);
        assert_eq!(cli.config, Some(PathBuf::from("f.yaml")));
    }

    #[test]
    fn test_workers_before_subcommand() {
        let cli = Cli::try_parse_from(["cloudkit-migrate", "--workers", "2", "assets"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Assets)));
        assert_eq!(cli.workers, Some(2));
    }
}
