use anyhow::Context as _;
use clap::Parser;
use meshflow_daemon::config::{Config, LoggingConfig, SchedulerMode};
use meshflow_daemon::db::SqliteStore;
use meshflow_daemon::inventory::StaticInventory;
use meshflow_daemon::metrics::MetricsCollector;
use meshflow_daemon::scheduler::delegating::DelegatingScheduler;
use meshflow_daemon::scheduler::primary::PrimaryScheduler;
use meshflow_daemon::scheduler::Scheduler;
use meshflow_daemon::server::{self, AppState};
use meshflow_daemon::store::{Lookup, Store};
use meshflow_daemon::{recovery, Context};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (.yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config)?;
    setup_logging(&config.logging)?;
    log::info!("Starting meshflow-daemon...");

    let store: Arc<dyn Store> = Arc::new(open_store(&config.server.db_path)?);
    let metrics = Arc::new(MetricsCollector::new());

    let mut primary = None;
    let scheduler: Arc<dyn Scheduler> = match config.scheduler.mode {
        SchedulerMode::Primary => {
            let p = Arc::new(PrimaryScheduler::new(config.scheduler.clone(), store.clone(), metrics.clone()));
            primary = Some(p.clone());
            p
        }
        SchedulerMode::Delegating => {
            log::info!("Delegating scheduling to {}", config.scheduler.primary_url);
            Arc::new(DelegatingScheduler::new(&config.scheduler, config.server.api_key.clone())?)
        }
    };

    let inventory: StaticInventory = config.inventory.clone();
    let ctx = Context::builder(store)
        .config(config.clone())
        .inventory(inventory)
        .metrics(metrics.clone())
        .scheduler(scheduler.clone())
        .build();

    ctx.ensure_sentinels()?;
    seed_jobs(&ctx, &config);

    // Before any scheduler fires.
    let recovered = recovery::recover(&ctx)?;
    if recovered > 0 {
        log::warn!("Recovered {} job(s) interrupted by the previous shutdown", recovered);
    }

    if let Err(e) = scheduler.start().await {
        match config.scheduler.mode {
            SchedulerMode::Primary => return Err(e).context("Failed to start scheduler"),
            SchedulerMode::Delegating => log::warn!("Primary scheduler not reachable yet: {}", e),
        }
    }

    let state = AppState::new(scheduler, metrics, config.server.api_key.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    log::info!("Listening on {}", config.server.listen_addr);
    if config.server.api_key.is_none() {
        log::warn!("No API key configured, scheduler endpoints are unauthenticated");
    }

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    log::info!("Shutting down...");
    ctx.shutdown();
    if let Some(primary) = primary {
        primary.shutdown();
    }
    Ok(())
}

/// `--config`, then `MESHFLOW_CONFIG`, then the system path if it exists.
fn load_config(flag: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = flag.or_else(|| std::env::var("MESHFLOW_CONFIG").ok().map(PathBuf::from));
    let mut config = match path {
        Some(path) => Config::from_file(&path)?,
        None => {
            let system = PathBuf::from(common::DEFAULT_CONFIG_PATH);
            if system.exists() {
                Config::from_file(&system)?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env();
    Ok(config)
}

fn open_store(path: &Path) -> anyhow::Result<SqliteStore> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match SqliteStore::open(path) {
        Ok(store) => Ok(store),
        Err(e) => {
            eprintln!("Failed to open database at {:?}: {}", path, e);
            eprintln!("Falling back to {}", common::USER_DB_PATH);
            SqliteStore::open(common::USER_DB_PATH)
                .with_context(|| format!("Failed to open database at {}", common::USER_DB_PATH))
        }
    }
}

/// Define configured jobs whose names are not known yet.
fn seed_jobs(ctx: &Context, config: &Config) {
    for job in &config.jobs {
        match ctx.store.fetch_job(Lookup::Name(&job.name)) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                log::error!("Failed to look up job {}: {}", job.name, e);
                continue;
            }
        }
        match ctx.define_job(job.clone()) {
            Ok(job) => log::info!("Seeded job {} from configuration", job.name),
            Err(e) => log::error!("Failed to seed job {}: {}", job.name, e),
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

fn setup_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(logging.level_filter());

    // Main log: filter OUT job_output
    let mut main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "job_output")
        .chain(std::io::stdout());
    if let Some(path) = &logging.output {
        main_log = main_log.chain(fern::log_file(path)?);
    }

    // Jobs log: filter IN job_output
    let jobs_log = fern::Dispatch::new().filter(|metadata| metadata.target() == "job_output");
    let jobs_log = match &logging.jobs_output {
        Some(path) => jobs_log.chain(fern::log_file(path)?),
        None => jobs_log.chain(std::io::stdout()),
    };

    base_config
        .chain(main_log)
        .chain(jobs_log)
        .apply()?;

    Ok(())
}
