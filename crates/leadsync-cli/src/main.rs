use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use leadsync_adapters::FixtureGraph;
use leadsync_core::RecordId;
use leadsync_storage::{LeadStore, MemoryStore, PgStore};
use leadsync_sync::{load_page_registry, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Lead form sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull new leads for every configured form.
    Sync {
        /// Serve the Graph API from a JSON fixture into an in-memory store.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    Migrate,
    Serve,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
    DiscoverForms {
        page_id: RecordId,
    },
    DiscoverFields {
        form_id: RecordId,
    },
    /// Create pages listed in the page registry file.
    ImportPages {
        path: Option<PathBuf>,
    },
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("leadsync=info"))
        .context("building log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixture: None }) {
        Commands::Sync { fixture: None } => {
            report(leadsync_sync::run_sync_once_from_env().await?)?;
        }
        Commands::Sync {
            fixture: Some(path),
        } => {
            let graph = FixtureGraph::load(&path)?;
            let registry = load_page_registry(&config.page_registry).await?;
            let pipeline = SyncPipeline::new(config, Arc::new(MemoryStore::new()), Arc::new(graph));
            for page in pipeline.import_pages(registry).await? {
                pipeline.discover_forms(page.id).await?;
            }
            report(pipeline.run_once().await?)?;
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            leadsync_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::DiscoverForms { page_id } => {
            let pipeline = SyncPipeline::connect(config).await?;
            for form in pipeline.discover_forms(page_id).await? {
                println!("{}\t{}\t{}", form.id, form.external_form_id, form.name);
            }
        }
        Commands::DiscoverFields { form_id } => {
            let pipeline = SyncPipeline::connect(config).await?;
            for mapping in pipeline.discover_fields(form_id).await? {
                println!("{}\t{}\t{}", mapping.id, mapping.external_key, mapping.label);
            }
        }
        Commands::ImportPages { path } => {
            let path = path.unwrap_or_else(|| config.page_registry.clone());
            let registry = load_page_registry(&path).await?;
            let pipeline = SyncPipeline::connect(config).await?;
            let created = pipeline.import_pages(registry).await?;
            let total = pipeline.store().list_pages().await?.len();
            println!("imported {} page(s), {} configured", created.len(), total);
        }
    }

    Ok(())
}

fn report(summary: SyncRunSummary) -> Result<()> {
    println!(
        "sync complete: run_id={} forms={} pages={} created={} skipped={} form_failures={} lead_failures={}",
        summary.run_id,
        summary.forms_processed,
        summary.pages_fetched,
        summary.leads_created,
        summary.leads_skipped,
        summary.form_failures.len(),
        summary.lead_failures.len()
    );
    if !summary.truncated_forms.is_empty() {
        warn!(forms = ?summary.truncated_forms, "some forms hit the page ceiling");
    }
    if summary.has_failures() {
        bail!("sync finished with failures");
    }
    Ok(())
}
