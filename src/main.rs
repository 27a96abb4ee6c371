use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use pseudo_exec::jobs::{JobDispatcher, JobReply};
use pseudo_exec::redis_manager::{keys, RedisManager, ResultStore};
use pseudo_exec::{ExecutionService, ExecutorConfig, RedisQueue, StatelessExecutionOps};

/// How long shutdown waits for replies still in flight
const REPLY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pseudo_exec=info".parse()?),
        )
        .init();

    let config = ExecutorConfig::from_env();
    info!(
        "Starting execution worker (engine: {}, scratch dir: {})",
        config.engine,
        config.scratch_dir.display()
    );

    let mut redis = RedisManager::with_url(&config.redis_url).await?;
    let worker_id = redis.worker_id();

    let queue = RedisQueue::connect(redis.client())
        .await
        .context("Failed to open session queue connection")?;
    let results = redis.result_store(config.result_ttl_secs).await;

    let reap_every = config.max_session_duration;
    let service = ExecutionService::new(config, Arc::new(queue));
    let reaper = spawn_reaper(service.stateless(), reap_every);

    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let writer = spawn_reply_writer(results, reply_rx);
    let mut dispatcher = JobDispatcher::new(service.clone(), worker_id, reply_tx);

    info!(
        "Waiting for jobs on {} and {}...",
        keys::worker_queue(worker_id),
        keys::JOB_QUEUE
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let job = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            job = redis.pop_job() => job?,
        };
        if let Some(job) = job {
            dispatcher.dispatch(job);
        }
    }

    // lanes finish their current job, then the writer sees the channel close
    drop(dispatcher);
    reaper.abort();
    service.shutdown().await;
    if tokio::time::timeout(REPLY_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("Gave up on replies still pending after {:?}", REPLY_DRAIN_TIMEOUT);
    }
    Ok(())
}

/// Store replies in arrival order
fn spawn_reply_writer(
    mut results: ResultStore,
    mut replies: mpsc::UnboundedReceiver<JobReply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reply) = replies.recv().await {
            if let Err(e) = results.store(&reply.result_key, &reply.payload).await {
                error!("Failed to store result for {}: {:#}", reply.result_key, e);
            }
        }
    })
}

/// Periodically clean up stateless processes nobody came back for
fn spawn_reaper(ops: StatelessExecutionOps, every: Duration) -> JoinHandle<()> {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = ops.reap_expired().await;
            if reaped > 0 {
                info!("Reaped {} expired processes", reaped);
            }
        }
    })
}
