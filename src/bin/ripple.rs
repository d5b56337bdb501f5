//! Ripple CLI: graph-enrichment coordinator
//!
//! Usage:
//!   ripple run [--config ripple.yaml] [--db path] [--json-logs]
//!   ripple demo --seed name:Ada [--adapters hello,reverse]
//!   ripple jobs list|show <id> [--db path]
//!   ripple adapters list [--db path]

use clap::{Parser, Subcommand};
use ripple::{
    logging, node, AdapterStore, Coordinator, CoordinatorContext, JobConfig, JobId, JobStatus, JobStore,
    MemoryGraph, MemoryTransport, OpenStore, Seed, Settings, SqliteStore, WorkerFactory,
    WorkerHost,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "ripple",
    version,
    about = "Coordinator for distributed graph-enrichment jobs"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator with the built-in workers until Ctrl-C
    Run {
        /// Settings file
        #[arg(long, default_value = "ripple.yaml")]
        config: PathBuf,
        /// Path to SQLite database file
        #[arg(long)]
        db: Option<PathBuf>,
        /// Workers to host in-process
        #[arg(long, value_delimiter = ',', default_value = "hello,reverse")]
        workers: Vec<String>,
        /// Log as JSON lines
        #[arg(long)]
        json_logs: bool,
    },
    /// Run one job to completion in-process and print its summary
    Demo {
        /// Seed nodes as type:value
        #[arg(long, required = true)]
        seed: Vec<String>,
        /// Adapters approved for the job
        #[arg(long, value_delimiter = ',', default_value = "hello,reverse")]
        adapters: Vec<String>,
        /// Global depth bound
        #[arg(long)]
        depth: Option<u32>,
        /// Path to SQLite database file; in-memory when omitted
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Inspect jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
        /// Path to SQLite database file
        #[arg(long, global = true)]
        db: Option<PathBuf>,
    },
    /// Inspect registered adapters
    Adapters {
        #[command(subcommand)]
        action: AdaptersAction,
        /// Path to SQLite database file
        #[arg(long, global = true)]
        db: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job with its history and errors
    Show {
        /// Job id
        id: String,
    },
}

#[derive(Subcommand)]
enum AdaptersAction {
    /// List adapter instances
    List,
}

fn open_store(db: Option<PathBuf>) -> Result<SqliteStore, String> {
    let db_path = db.unwrap_or_else(|| Settings::default().database_path());
    SqliteStore::open(&db_path).map_err(|e| format!("Failed to open database: {}", e))
}

fn parse_seed(raw: &str) -> Result<ripple::NodeData, String> {
    match raw.split_once(':') {
        Some((kind, value)) if !kind.is_empty() && !value.is_empty() => Ok(node(kind, value)),
        _ => Err(format!("seed '{}' is not type:value", raw)),
    }
}

async fn cmd_run(config: PathBuf, db: Option<PathBuf>, workers: Vec<String>) -> Result<(), String> {
    let mut settings = Settings::load(&config).map_err(|e| format!("Failed to load settings: {}", e))?;
    if db.is_some() {
        settings.database = db;
    }
    let store = Arc::new(
        SqliteStore::open(settings.database_path())
            .map_err(|e| format!("Failed to open database: {}", e))?,
    );
    let ctx = CoordinatorContext::new(
        settings,
        store,
        Arc::new(MemoryGraph::new()),
        Arc::new(MemoryTransport::new()),
    );
    let coordinator = Coordinator::new(ctx.clone());
    let handle = coordinator.start().await.map_err(|e| e.to_string())?;

    let factory = WorkerFactory::with_builtins();
    let mut hosts = Vec::new();
    for name in &workers {
        let worker = factory.create(name).map_err(|e| e.to_string())?;
        let host = Arc::new(WorkerHost::new(worker, &ctx));
        hosts.push(tokio::spawn(host.run(handle.cancel_token())));
    }

    tokio::signal::ctrl_c().await.map_err(|e| e.to_string())?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    for host in hosts {
        match host.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "worker exited with an error"),
            Err(e) => tracing::warn!(error = %e, "worker task failed"),
            Ok(Ok(())) => {}
        }
    }
    Ok(())
}

async fn cmd_demo(
    seeds: Vec<String>,
    adapters: Vec<String>,
    depth: Option<u32>,
    db: Option<PathBuf>,
) -> Result<(), String> {
    let nodes = seeds.iter().map(|s| parse_seed(s)).collect::<Result<Vec<_>, _>>()?;
    let store = Arc::new(match db {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_in_memory(),
    }
    .map_err(|e| format!("Failed to open database: {}", e))?);

    let ctx = CoordinatorContext::new(
        Settings::default(),
        store.clone(),
        Arc::new(MemoryGraph::new()),
        Arc::new(MemoryTransport::new()),
    );
    ctx.declare_queues().await.map_err(|e| e.to_string())?;
    let coordinator = Coordinator::new(ctx.clone());

    let factory = WorkerFactory::with_builtins();
    let mut hosts = Vec::new();
    for name in &adapters {
        let host = WorkerHost::new(factory.create(name).map_err(|e| e.to_string())?, &ctx);
        host.register().await.map_err(|e| e.to_string())?;
        hosts.push(host);
    }

    let mut config = JobConfig::new().with_description("demo");
    config.depth = depth;
    let seed = Seed {
        nodes,
        edges: Vec::new(),
        config,
    };
    let job_id = coordinator
        .submitter()
        .submit_new(adapters.clone(), seed)
        .await
        .map_err(|e| e.to_string())?;

    loop {
        let mut handled = coordinator.pump().await.map_err(|e| e.to_string())?;
        for host in &hosts {
            handled += host.pump().await.map_err(|e| e.to_string())?;
        }
        if handled == 0 {
            break;
        }
    }

    let job = store
        .get_job(&job_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("job {} disappeared", job_id))?;
    let summary = serde_json::to_string_pretty(&job.summary()).map_err(|e| e.to_string())?;
    println!("{}", summary);
    Ok(())
}

fn cmd_jobs_list(store: &SqliteStore, status: Option<String>) -> Result<(), String> {
    let ids = match status {
        Some(raw) => {
            let status = JobStatus::from_str(&raw).map_err(|e| e.to_string())?;
            store.jobs_by_status(status)
        }
        None => store.list_jobs(),
    }
    .map_err(|e| e.to_string())?;

    if ids.is_empty() {
        println!("No jobs found");
        return Ok(());
    }
    for id in ids {
        if let Some(job) = store.get_job(&id).map_err(|e| e.to_string())? {
            println!(
                "{}  {:<22} {}  tasks={} adapters={}",
                job.id,
                job.status.as_str(),
                job.create_time.format("%Y-%m-%d %H:%M:%S"),
                job.tasks.len(),
                job.approved_adapters.iter().cloned().collect::<Vec<_>>().join(",")
            );
        }
    }
    Ok(())
}

fn cmd_jobs_show(store: &SqliteStore, id: &str) -> Result<(), String> {
    let job = store
        .get_job(&JobId::new(id))
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("job '{}' not found", id))?;
    let summary = serde_json::to_string_pretty(&job.summary()).map_err(|e| e.to_string())?;
    println!("{}", summary);
    println!("\nHistory:");
    for entry in &job.history {
        println!("  {}  {:<11} {}", entry.at.format("%H:%M:%S%.3f"), entry.kind.as_str(), entry.message);
    }
    if !job.errors.is_empty() {
        println!("\nErrors:");
        for error in &job.errors {
            println!("  {}  {}", error.at.format("%H:%M:%S%.3f"), error.message);
        }
    }
    Ok(())
}

fn cmd_adapters_list(store: &SqliteStore) -> Result<(), String> {
    let records = store.adapters().map_err(|e| e.to_string())?;
    if records.is_empty() {
        println!("No adapters registered");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<12} {:<9} last_heartbeat={} tasks={}",
            record.id,
            record.name,
            record.status.as_str(),
            record.last_heartbeat.format("%Y-%m-%d %H:%M:%S"),
            record.task_count
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            config,
            db,
            workers,
            json_logs,
        } => {
            logging::init(None, json_logs);
            cmd_run(config, db, workers).await
        }
        Commands::Demo {
            seed,
            adapters,
            depth,
            db,
        } => {
            logging::init(Some("ripple=warn"), false);
            cmd_demo(seed, adapters, depth, db).await
        }
        Commands::Jobs { action, db } => open_store(db).and_then(|store| match action {
            JobsAction::List { status } => cmd_jobs_list(&store, status),
            JobsAction::Show { id } => cmd_jobs_show(&store, &id),
        }),
        Commands::Adapters { action, db } => open_store(db).and_then(|store| match action {
            AdaptersAction::List => cmd_adapters_list(&store),
        }),
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
