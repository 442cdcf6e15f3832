//! sync-engine entry point.
//!
//! Thin on purpose: loads configuration, wires up connections, and starts
//! whichever subcommand was asked for. The cycle logic lives in
//! `sync-orchestrator`; this file only assembles it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sync_config::EngineConfig;
use sync_db::PgDriver;
use sync_dispatch::DispatchTarget;
use sync_monitor::{FileMonitorSink, MonitorSink};
use sync_orchestrator::{CycleConfig, Engine, ExtractionSource};
use sync_types::ConnectionGroup;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "sync-engine")]
#[command(about = "Impayés synchronization engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: extract, centralize, check integrity, dispatch, forever.
    Run,
    /// Print the current contents of the monitoring artifact.
    Status,
    /// Provision the reference schema against every configured connection.
    Migrate,
    /// Drop a force-run flag so the running engine starts its next cycle immediately.
    Force,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();
    let cfg = EngineConfig::from_env().context("loading engine configuration")?;

    match cli.cmd {
        Commands::Run => run(cfg).await,
        Commands::Status => status(&cfg).await,
        Commands::Migrate => migrate(&cfg).await,
        Commands::Force => force(&cfg).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn run(cfg: EngineConfig) -> Result<()> {
    let crm_pool = sync_db::connect(&cfg.crm.database_url)
        .await
        .context("connecting to the CRM database")?;
    let crm_driver: Arc<dyn sync_db::DbDriver> = Arc::new(PgDriver::new(crm_pool));
    let crm_schema = cfg
        .crm
        .schemas
        .first()
        .cloned()
        .unwrap_or_else(|| "CRM".to_string());
    let qualified_crm_table = sync_db::qualified_table(&crm_schema);

    let mut sources = Vec::new();
    let mut dispatch_targets = Vec::new();
    for group in [&cfg.group_1, &cfg.group_2] {
        let pool = sync_db::connect(&group.database_url)
            .await
            .with_context(|| format!("connecting to {}", group.name))?;
        for schema in &group.schemas {
            let driver: Arc<dyn sync_db::DbDriver> = Arc::new(PgDriver::new(pool.clone()));
            sources.push(ExtractionSource {
                schema: schema.clone(),
                driver: Arc::clone(&driver),
            });
            dispatch_targets.push(DispatchTarget {
                name: schema.clone(),
                driver,
                qualified_table: sync_db::qualified_table(schema),
            });
        }
    }

    let sink: Arc<dyn MonitorSink> = Arc::new(
        FileMonitorSink::open(&cfg.monitoring_file)
            .await
            .context("opening monitoring artifact")?,
    );

    let engine = Engine {
        sink,
        sources,
        crm_driver,
        qualified_crm_table,
        dispatch_targets,
        cfg: CycleConfig {
            max_retries: cfg.max_retries,
            retry_delay: cfg.retry_delay,
            integrity_scope: cfg.integrity_scope,
        },
        sync_interval: cfg.sync_interval,
        force_run_file: PathBuf::from(&cfg.force_run_file),
    };

    info!("sync-engine starting");

    tokio::select! {
        _ = engine.run_forever() => unreachable!("run_forever never returns"),
        _ = wait_for_termination() => {
            info!("termination signal received, stopping");
            sync_orchestrator::publish_stopped(engine.sink.as_ref()).await?;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn status(cfg: &EngineConfig) -> Result<()> {
    let raw = tokio::fs::read_to_string(&cfg.monitoring_file)
        .await
        .with_context(|| format!("reading {}", cfg.monitoring_file))?;
    println!("{raw}");
    Ok(())
}

async fn migrate(cfg: &EngineConfig) -> Result<()> {
    for (group, is_crm) in [
        (&cfg.group_1, false),
        (&cfg.group_2, false),
        (&cfg.crm, true),
    ] {
        let pool = sync_db::connect(&group.database_url)
            .await
            .with_context(|| format!("connecting to {}", group.name))?;
        for schema in provisioned_schemas(group) {
            sync_db::provision_schema(&pool, schema).await?;
            if !is_crm {
                sync_db::provision_source_table(&pool, schema).await?;
            }
            println!("provisioned {schema}");
        }
    }
    Ok(())
}

fn provisioned_schemas(group: &ConnectionGroup) -> &[String] {
    &group.schemas
}

async fn force(cfg: &EngineConfig) -> Result<()> {
    tokio::fs::write(&cfg.force_run_file, b"")
        .await
        .with_context(|| format!("writing {}", cfg.force_run_file))?;
    println!("force-run flag written to {}", cfg.force_run_file);
    Ok(())
}

