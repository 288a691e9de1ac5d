use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tango_server::{
    api::{self, AppState},
    config::TangoConfig,
    execution::JobManager,
    jobs::JobQueue,
    notify::Notifier,
    pool::Preallocator,
    storage::FileStore,
    vmms,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tango-server")]
#[command(version)]
#[command(about = "Job-execution broker", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            TangoConfig::from_file(path)?
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            TangoConfig::default()
        }
    };
    let config = Arc::new(config);

    tracing::info!(driver = %config.vmms.driver, "Initializing vmms driver...");
    let driver = vmms::create_driver(&config.vmms).await?;

    tracing::info!("Initializing pools...");
    let pool = Preallocator::new(
        driver.clone(),
        &config.pool,
        &config.vmms.instance_prefix,
    );
    pool.reconcile().await.context("pool reconciliation failed")?;
    for image in &config.pool.images {
        pool.update(&image.name, image.target).await;
    }

    let queue = Arc::new(JobQueue::new(config.jobs.dead_ring_capacity));
    let notifier = Arc::new(Notifier::new());
    let store = Arc::new(FileStore::new(&config.server.files_dir));

    let manager = JobManager::new(
        queue.clone(),
        pool.clone(),
        driver.clone(),
        notifier,
        &config.scheduler,
    );
    manager.start().await;

    let state = AppState {
        queue,
        pool,
        driver,
        store,
        config: config.clone(),
        started_at: Instant::now(),
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.address))?;

    tracing::info!("Listening on {}", config.server.address);
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        "tango_server=debug,tango_server_bin=debug"
    } else {
        "tango_server=info,tango_server_bin=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
