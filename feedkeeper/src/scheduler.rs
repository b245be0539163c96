//! The top-level scheduling loop: finds due subscriptions, fans a worker out
//! per subscription via a `JoinSet`, and prunes the posted-items journal
//! once a day.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use reqwest::Client;
use sqlx::SqlitePool;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::fetch::HostSemaphores;
use crate::sink::PublisherSink;
use crate::store;
use crate::worker::{self, WorkerConfig};

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(30);
const JOURNAL_PRUNE_INTERVAL_SECS: i64 = 24 * 60 * 60;
const JOURNAL_RETENTION_DAYS: i64 = 90;

/// Runs until `shutdown_notify` fires. Each tick spawns one worker task per
/// due subscription and waits for them all to finish before sleeping again;
/// a single worker panicking or failing never stops the loop.
pub async fn run(
    pool: SqlitePool,
    client: Client,
    semaphores: Arc<HostSemaphores>,
    sink: Arc<dyn PublisherSink>,
    worker_config: WorkerConfig,
    shutdown_notify: Arc<Notify>,
) {
    let mut last_prune = Utc::now();

    loop {
        if let Err(e) = tick(&pool, &client, &semaphores, &sink, &worker_config).await {
            error!(error = %e, "scheduler tick failed");
        }

        if (Utc::now() - last_prune).num_seconds() >= JOURNAL_PRUNE_INTERVAL_SECS {
            match store::prune_journal(&pool, JOURNAL_RETENTION_DAYS).await {
                Ok(pruned) => info!(pruned, "pruned posted-items journal"),
                Err(e) => warn!(error = %e, "failed to prune posted-items journal"),
            }
            last_prune = Utc::now();
        }

        select! {
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
            _ = shutdown_notify.notified() => {
                info!("scheduler: shutdown requested, exiting loop");
                break;
            }
        }
    }
}

async fn tick(
    pool: &SqlitePool,
    client: &Client,
    semaphores: &Arc<HostSemaphores>,
    sink: &Arc<dyn PublisherSink>,
    worker_config: &WorkerConfig,
) -> anyhow::Result<()> {
    let due = store::due_subscriptions(pool, Utc::now()).await?;
    if due.is_empty() {
        return Ok(());
    }
    info!(count = due.len(), "polling due subscriptions");

    let mut set: JoinSet<anyhow::Result<()>> = JoinSet::new();
    for subscription in due {
        let pool = pool.clone();
        let client = client.clone();
        let semaphores = Arc::clone(semaphores);
        let sink = Arc::clone(sink);
        let worker_config = worker_config.clone();
        set.spawn(async move {
            worker::poll_subscription(&pool, &client, &semaphores, sink.as_ref(), &worker_config, subscription)
                .await
        });
    }

    while let Some(result) = set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "worker failed"),
            Err(join_err) => error!(error = %join_err, "worker task panicked"),
        }
    }

    Ok(())
}
