//! Audience Engine: resolves segmentation rules into a reuse DAG and keeps
//! their segments materialized on schedule.
//!
//! Main entry point that wires the engine, scheduler, workers and HTTP API.

mod demo;

use audience_api::ApiServer;
use audience_core::config::AppConfig;
use audience_materializer::{ClickHouseWarehouse, InMemoryWarehouse, MaterializationWriter, SegmentWarehouse};
use audience_scheduler::{BatchEngine, Dispatcher, JobScheduler, LocalBatchEngine, SparkSubmitEngine, WorkerPool};
use audience_segmentation::{NewRule, SegmentationEngine};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "audience-engine")]
#[command(about = "Rule-driven audience segmentation with segment reuse")]
#[command(version)]
struct Cli {
    /// TOML config file, overlaid by AUDIENCE_ENGINE__* variables
    #[arg(long, env = "AUDIENCE_ENGINE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Number of materialization workers (overrides config)
    #[arg(long, env = "AUDIENCE_ENGINE__SCHEDULER__WORKER_COUNT")]
    workers: Option<usize>,

    /// JSON array of rules to register at startup
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Newline-delimited JSON transactions for the local batch engine
    #[arg(long)]
    transactions: Option<PathBuf>,

    /// Seed synthetic transactions and a starter rule set
    #[arg(long, default_value_t = false)]
    demo: bool,

    /// Users generated in demo mode
    #[arg(long, default_value_t = 1000)]
    demo_users: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "audience_engine=info,audience_scheduler=info,audience_segmentation=info,\
                 audience_materializer=info,tower_http=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Audience Engine starting up");

    // Load configuration
    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Apply CLI overrides
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(workers) = cli.workers {
        config.scheduler.worker_count = workers;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        workers = config.scheduler.worker_count,
        warehouse = %config.warehouse.backend,
        batch_engine = %config.batch.engine,
        "Configuration loaded"
    );

    // Warehouse
    let warehouse: Arc<dyn SegmentWarehouse> = match config.warehouse.backend.as_str() {
        "clickhouse" => Arc::new(ClickHouseWarehouse::connect(&config.warehouse).await?),
        "memory" => Arc::new(InMemoryWarehouse::new()),
        other => anyhow::bail!("unknown warehouse backend '{other}'"),
    };

    // Rules
    let segmentation = Arc::new(SegmentationEngine::from_config(&config));
    let mut rules: Vec<NewRule> = Vec::new();
    if cli.demo {
        rules.extend(demo::starter_rules());
    }
    if let Some(path) = &cli.rules {
        let raw = std::fs::read_to_string(path)?;
        rules.extend(serde_json::from_str::<Vec<NewRule>>(&raw)?);
    }
    for rule in rules {
        let name = rule.name.clone();
        match segmentation.create_rule(rule) {
            Ok(def) => info!(
                rule_id = def.id,
                name = %def.name,
                depends_on = ?def.depends_on,
                operation = ?def.operation,
                extra_predicate = def.extra_predicate.as_deref().unwrap_or(""),
                "Rule registered"
            ),
            Err(e) => error!(name = %name, error = %e, "Rule rejected"),
        }
    }

    // Batch engine
    let engine: Arc<dyn BatchEngine> = match config.batch.engine.as_str() {
        "spark" => Arc::new(SparkSubmitEngine::new(config.batch.clone())),
        "local" => {
            let mut records = match &cli.transactions {
                Some(path) => LocalBatchEngine::load_ndjson(path)?,
                None => Vec::new(),
            };
            if cli.demo {
                records.extend(demo::synthetic_transactions(cli.demo_users, 12, 42));
            }
            info!(count = records.len(), "Local batch engine loaded transactions");
            Arc::new(LocalBatchEngine::new(warehouse.clone(), records))
        }
        other => anyhow::bail!("unknown batch engine '{other}'"),
    };

    // Scheduler, workers and dispatcher
    let writer = MaterializationWriter::new(warehouse, config.warehouse.staging_prefix.clone());
    let scheduler = Arc::new(JobScheduler::new(
        &config.scheduler,
        &config.batch,
        segmentation,
        writer,
    ));
    let mut workers = WorkerPool::new(scheduler.clone(), engine, config.scheduler.worker_count);
    workers.start();
    let _dispatcher = Dispatcher::new(
        scheduler.clone(),
        Duration::from_millis(config.scheduler.tick_interval_ms),
    )
    .spawn();

    // Start API server
    let api_server = ApiServer::new(config.clone(), scheduler);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Audience Engine is ready to serve traffic");

    // Start HTTP server (blocks until shutdown)
    let served = api_server.start_http().await;
    workers.shutdown();
    served
}
