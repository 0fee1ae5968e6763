use anyhow::Result;
use clap::{Parser, Subcommand};
use orgsync_sync::{RowFailurePolicy, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "orgsync")]
#[command(about = "One-way reconciliation of organizations, staff and invoices into the destination database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run all phases once (default).
    Sync {
        /// `abort` stops at the first bad row; `skip` rolls it back, reports it and continues.
        #[arg(long, default_value_t = RowFailurePolicy::Abort)]
        on_row_error: RowFailurePolicy,
        /// Roll everything back at the end instead of committing each phase.
        #[arg(long)]
        dry_run: bool,
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Create the destination tables if they do not exist.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orgsync=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        on_row_error: RowFailurePolicy::Abort,
        dry_run: false,
        json: false,
    }) {
        Commands::Sync {
            on_row_error,
            dry_run,
            json,
        } => {
            let mut config = SyncConfig::from_env()?;
            config.options.row_failure_policy = on_row_error;
            config.options.dry_run = dry_run;
            let summary = orgsync_sync::run_sync(&config).await?;
            if json {
                println!("{}", summary.to_json()?);
            } else {
                println!(
                    "sync complete: run_id={} rows_written={} failures={} dry_run={}",
                    summary.run_id,
                    summary.rows_written(),
                    summary.failures.len(),
                    summary.dry_run
                );
            }
        }
        Commands::Migrate => {
            let destination_url = SyncConfig::destination_url_from_env()?;
            orgsync_sync::migrate_destination(&destination_url).await?;
            tracing::info!("destination schema is up to date");
        }
    }

    Ok(())
}
