/*
feedkeeper - single-binary main.rs
Starts the scheduler loop (or runs a single tick with `--once`) in-process.
*/

use std::sync::Arc;

use clap::Parser;
use common::{init_db_pool, Config};
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use feedkeeper::fetch::HostSemaphores;
use feedkeeper::scheduler;
use feedkeeper::sink::{LoggingSink, PublisherSink};
use feedkeeper::store;
use feedkeeper::worker::{self, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "feedkeeper", about = "Feed aggregator engine: scheduler + command facade")]
struct Args {
    /// Override FEEDKEEPER_LOG_LEVEL for this run.
    #[arg(long)]
    log_level: Option<String>,

    /// Run a single scheduler tick and exit, instead of looping forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet; this is the one place we print directly.
            eprintln!("failed to load configuration: {e:#}");
            return Err(e);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    info!(config = %config.redacted_summary(), "configuration loaded");

    let db_pool = init_db_pool(&config.database_path).await?;
    store::initialise(&db_pool, config.default_poll_interval).await?;
    info!(database_path = %config.database_path, "store initialized");

    let client = reqwest::Client::new();
    let semaphores = Arc::new(HostSemaphores::new());
    let sink: Arc<dyn PublisherSink> = Arc::new(LoggingSink);
    let worker_config = WorkerConfig {
        max_items_per_poll: config.max_items_per_poll,
        min_interval: config.min_poll_interval,
        max_interval: config.max_poll_interval,
        default_interval: config.default_poll_interval,
        user_agent: config.user_agent.clone(),
    };

    if args.once {
        info!("running a single scheduler tick (--once)");
        let due = store::due_subscriptions(&db_pool, chrono::Utc::now()).await?;
        info!(count = due.len(), "due subscriptions for single tick");
        for subscription in due {
            let id = subscription.id;
            if let Err(e) = worker::poll_subscription(
                &db_pool,
                &client,
                &semaphores,
                sink.as_ref(),
                &worker_config,
                subscription,
            )
            .await
            {
                error!(subscription_id = id, error = %e, "worker failed during single tick");
            }
        }
        return Ok(());
    }

    let shutdown_notify = Arc::new(Notify::new());
    let scheduler_notify = shutdown_notify.clone();
    let mut scheduler_handle = tokio::spawn(scheduler::run(
        db_pool,
        client,
        semaphores,
        sink,
        worker_config,
        scheduler_notify,
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, notifying scheduler to shut down");
            shutdown_notify.notify_waiters();
            match tokio::time::timeout(Duration::from_secs(20), &mut scheduler_handle).await {
                Ok(Ok(())) => info!("scheduler exited cleanly"),
                Ok(Err(join_err)) => error!(error = %join_err, "scheduler task panicked"),
                Err(_) => info!("timed out waiting for scheduler to exit; continuing shutdown"),
            }
        }
        res = &mut scheduler_handle => {
            if let Err(join_err) = res {
                error!(error = %join_err, "scheduler task panicked");
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}
