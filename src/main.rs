use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use vault_ingest::api::{self, ConsistencyCheckRequest, ImportRequest};
use vault_ingest::config::{self, Config};
use vault_ingest::consistency::{
    ConsistencyCheckTaskFactory, DueConsistencyChecks, LayerIdsCheckManager,
};
use vault_ingest::db;
use vault_ingest::metadata::VersionPropertiesReader;
use vault_ingest::model::{CheckType, ConsistencyCheck, ImportJob};
use vault_ingest::orchestrator::{
    ImportJobOrchestrator, ImportJobTaskFactory, ImportSettings, PendingImportJobs,
};
use vault_ingest::scheduler::SerialPoller;
use vault_ingest::store::FsRepositoryProvider;

const INTERRUPTED_MESSAGE: &str = "Import job was interrupted by a service restart.";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the import and consistency-check pollers until Ctrl-C
    Serve,
    /// Queue an import job for a batch (or one object) in the inbox
    Import {
        path: String,
        /// Treat PATH as a single object directory
        #[arg(long)]
        single_object: bool,
        /// Version directories are named by timestamp instead of vN
        #[arg(long)]
        timestamps: bool,
    },
    /// Show one import job, or all of them
    Status { id: Option<Uuid> },
    /// Queue a consistency check
    Check {
        #[arg(value_parser = parse_check_type)]
        check_type: CheckType,
        #[arg(long)]
        layer_id: Option<i64>,
    },
    /// Show a consistency check
    CheckStatus { id: Uuid },
    /// Run a layer-ids check right away and print its outcome
    VerifyLayers,
    /// List the storage layer ids
    Layers,
    /// Show the size of one storage layer
    Layer { id: i64 },
    /// Show the id and size of the current top layer
    TopLayer,
    /// Start a new top layer now
    NewLayer,
    /// Print an example configuration
    ExampleConfig,
}

fn parse_check_type(s: &str) -> Result<CheckType, String> {
    CheckType::parse_type(&s.to_ascii_uppercase().replace('-', "_"))
        .ok_or_else(|| format!("unknown check type: {s} (expected LAYER_IDS or LISTING_RECORDS)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::ExampleConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    match args.command {
        Command::Serve => serve(cfg, pool).await,
        Command::Import {
            path,
            single_object,
            timestamps,
        } => {
            let job = api::submit_import(
                &pool,
                &cfg.ingest.inbox,
                ImportRequest {
                    path,
                    single_object,
                    accept_timestamp_version_directories: timestamps,
                },
            )
            .await?;
            print_json(&api::import_job_status(&job))
        }
        Command::Status { id: Some(id) } => {
            let job = api::get_import(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no import job with id {id}"))?;
            print_json(&api::import_job_status(&job))
        }
        Command::Status { id: None } => {
            let jobs: Vec<_> = api::list_imports(&pool)
                .await?
                .iter()
                .map(api::import_job_status)
                .collect();
            print_json(&jobs)
        }
        Command::Check {
            check_type,
            layer_id,
        } => {
            let check = api::submit_consistency_check(
                &pool,
                ConsistencyCheckRequest {
                    check_type,
                    layer_id,
                },
            )
            .await?;
            print_json(&api::consistency_check_status(&check))
        }
        Command::CheckStatus { id } => {
            let check = api::get_consistency_check(&pool, id)
                .await?
                .ok_or_else(|| anyhow!("no consistency check with id {id}"))?;
            print_json(&api::consistency_check_status(&check))
        }
        Command::VerifyLayers => verify_layers(&cfg).await,
        Command::Layers => print_json(&open_store(&cfg).await?.layer_ids().await?),
        Command::Layer { id } => {
            let layer = open_store(&cfg)
                .await?
                .layer_info(id)
                .await?
                .ok_or_else(|| anyhow!("no layer with id {id}"))?;
            print_json(&layer)
        }
        Command::TopLayer => print_json(&open_store(&cfg).await?.top_layer_info().await?),
        Command::NewLayer => {
            warn!("a running `serve` keeps its own top layer until restarted");
            print_json(&open_store(&cfg).await?.new_top_layer().await?)
        }
        Command::ExampleConfig => Ok(()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(cfg: &Config) -> Result<FsRepositoryProvider> {
    FsRepositoryProvider::open(&cfg.store.root, cfg.store.layer_threshold_bytes).await
}

async fn serve(cfg: Config, pool: db::Pool) -> Result<()> {
    let interrupted = db::fail_interrupted_import_jobs(&pool, INTERRUPTED_MESSAGE).await?;
    if interrupted > 0 {
        warn!(interrupted, "failed import jobs left RUNNING by a previous run");
    }

    let store = Arc::new(open_store(&cfg).await?);
    let orchestrator = ImportJobOrchestrator::new(
        pool.clone(),
        store.clone(),
        store.registry(),
        VersionPropertiesReader::new(cfg.ingest.default_version_info.clone()),
        ImportSettings {
            inbox: cfg.ingest.inbox.clone(),
            outbox: cfg.ingest.outbox.clone(),
            valid_object_identifier_pattern: cfg.ingest.valid_object_identifier_pattern.clone(),
            autoclean: cfg.ingest.autoclean,
        },
        cfg.ingest.worker_threads,
    )
    .with_maintenance(store.clone());

    let imports = SerialPoller::<ImportJob>::new(
        "import-jobs",
        Arc::new(PendingImportJobs::new(pool.clone())),
        Arc::new(ImportJobTaskFactory::new(Arc::new(orchestrator))),
        Duration::from_millis(cfg.job_polling.interval_ms),
    )
    .start();
    let checks = SerialPoller::<ConsistencyCheck>::new(
        "consistency-checks",
        Arc::new(DueConsistencyChecks::new(
            pool.clone(),
            Duration::from_secs(cfg.consistency_checks.settle_seconds),
        )),
        Arc::new(ConsistencyCheckTaskFactory::new(pool.clone(), store.clone())),
        Duration::from_millis(cfg.consistency_checks.interval_ms),
    )
    .start();

    info!(inbox = %cfg.ingest.inbox.display(), "vault ingest running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    imports.stop().await;
    checks.stop().await;
    Ok(())
}

async fn verify_layers(cfg: &Config) -> Result<()> {
    let store = Arc::new(open_store(cfg).await?);
    let manager = LayerIdsCheckManager::new(store);
    let id = manager
        .try_schedule()
        .ok_or_else(|| anyhow!("a layer-ids check is already running"))?;
    loop {
        match manager.status(id) {
            Some(status) if status.is_terminal() => return print_json(&status),
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}
