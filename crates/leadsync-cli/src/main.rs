use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use leadsync_storage::{LeadStore, PgLeadStore};
use leadsync_sync::{CycleOutcome, SyncConfig, SyncOrchestrator};
use leadsync_web::AppState;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "leadsync-cli")]
#[command(about = "Partner lead sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one mailbox sync cycle.
    Sync,
    /// Serve the JSON API, with the cron scheduler when enabled.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Normalize and reconcile a local workbook.
    Import { file: PathBuf },
    /// Write leads.parquet and manifest.json.
    Export {
        #[arg(long, default_value = "./exports")]
        out: PathBuf,
    },
    /// Show recent sync runs.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Open and close a mailbox session.
    TestConnection,
    /// Delete every lead and run log.
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

async fn open_store(config: &SyncConfig) -> Result<Arc<PgLeadStore>> {
    let store = PgLeadStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

fn print_outcome(outcome: CycleOutcome) {
    match outcome {
        CycleOutcome::Completed(log) => {
            println!(
                "sync {}: run_id={} messages={} created={} updated={} unchanged={} duplicates={} skipped={} files={} errors={}",
                log.status.as_str(),
                log.run_id,
                log.messages_scanned,
                log.records_created,
                log.records_updated,
                log.records_unchanged,
                log.duplicate_versions,
                log.rows_skipped,
                log.files_processed.len(),
                log.errors.len()
            );
            for err in &log.errors {
                println!("  error [{}]: {}", err.context, err.message);
            }
        }
        CycleOutcome::AlreadyRunning => println!("sync already running; nothing done"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            print_outcome(leadsync_sync::run_sync_once_from_env().await?);
        }
        Commands::Serve => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let orchestrator = Arc::new(SyncOrchestrator::from_config(&config, store));
            tracing::info!(policy = %config.policy, scheduler = config.scheduler_enabled, "starting leadsync api");
            let scheduler = leadsync_sync::maybe_build_scheduler(Arc::clone(&orchestrator), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            leadsync_web::serve(AppState::new(orchestrator), config.web_port).await?;
            if let Some(mut sched) = scheduler {
                sched.shutdown().await.context("stopping scheduler")?;
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            open_store(&config).await?;
            println!("migrations applied");
        }
        Commands::Import { file } => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let orchestrator = SyncOrchestrator::from_config(&config, store);
            let summary = orchestrator.import_file(&file).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.outcome.errors.is_empty() {
                anyhow::bail!("import finished with {} errors", summary.outcome.errors.len());
            }
        }
        Commands::Export { out } => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let manifest = leadsync_sync::export_leads(store.as_ref(), &out).await?;
            println!("export complete: manifest={}", manifest.display());
        }
        Commands::History { limit } => {
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            for log in store.recent_run_logs(limit).await? {
                println!(
                    "{} {} {:<7} policy={} created={} updated={} duplicates={} files={} errors={}",
                    log.run_time.to_rfc3339(),
                    log.run_id,
                    log.status.as_str(),
                    log.policy,
                    log.records_created,
                    log.records_updated,
                    log.duplicate_versions,
                    log.files_processed.len(),
                    log.errors.len()
                );
            }
        }
        Commands::TestConnection => {
            let config = SyncConfig::from_env()?;
            let retriever = leadsync_adapters::AttachmentRetriever::new(
                Arc::new(leadsync_adapters::ImapConnector::new(config.imap.clone())),
                config.mail_query(),
                config.max_messages_per_run,
            );
            retriever.test_connection().await?;
            println!("mail connection ok: {}:{}", config.imap.host, config.imap.port);
        }
        Commands::Purge { yes } => {
            if !yes {
                anyhow::bail!("purge deletes every lead and run log; re-run with --yes to confirm");
            }
            let config = SyncConfig::from_env()?;
            let store = open_store(&config).await?;
            let counts = store.purge().await?;
            println!("purged {} leads and {} run logs", counts.leads, counts.run_logs);
        }
    }

    Ok(())
}
