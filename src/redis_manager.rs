//! Worker side of the Redis job protocol
//!
//! A worker leases one of a fixed set of numeric ids, serves its own
//! affinity queue ahead of the shared queue, and answers each job under the
//! key the job names. Session input/output lists go through
//! [`crate::session::RedisQueue`] instead.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::jobs::WorkerJob;

/// Redis key layout
pub mod keys {
    /// Shared job queue, served by any worker
    pub const JOB_QUEUE: &str = "exec:queue";

    const LEASE_PREFIX: &str = "exec:worker:lease:";

    /// Affinity queue of one worker; stateless ops on its processes land here
    pub fn worker_queue(worker_id: u32) -> String {
        format!("{}:{}", JOB_QUEUE, worker_id)
    }

    pub fn worker_lease(worker_id: u32) -> String {
        format!("{}{}", LEASE_PREFIX, worker_id)
    }
}

const WORKER_SLOTS: u32 = 10;
const LEASE_TTL_SECS: u64 = 120;
const LEASE_RENEW_EVERY: Duration = Duration::from_secs(LEASE_TTL_SECS / 3);
const CONNECT_RETRY: Duration = Duration::from_secs(3);
/// BLPOP bound; the intake loop gets control back at least this often
const JOB_WAIT_SECS: f64 = 5.0;

pub struct RedisManager {
    worker_id: u32,
    client: redis::Client,
    intake: MultiplexedConnection,
    lease: JoinHandle<()>,
}

impl RedisManager {
    /// Connect, lease a worker id and keep renewing it in the background
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid REDIS_URL")?;
        let intake = connect(&client).await;
        info!("Connected to Redis at {}", redis_url);

        let worker_id = lease_worker_id(&client).await?;
        info!(
            "Leased {} for {}s",
            keys::worker_lease(worker_id),
            LEASE_TTL_SECS
        );

        Ok(Self {
            worker_id,
            lease: renew_lease(client.clone(), worker_id),
            client,
            intake,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    /// Writer for job replies, on its own connection so replies never queue
    /// behind a blocking BLPOP
    pub async fn result_store(&self, ttl_secs: u64) -> ResultStore {
        ResultStore {
            client: self.client.clone(),
            conn: connect(&self.client).await,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    /// Next job from the affinity queue, else the shared queue. `None` when
    /// nothing arrived within the wait bound.
    ///
    /// Malformed jobs are logged and skipped.
    pub async fn pop_job(&mut self) -> Result<Option<WorkerJob>> {
        let queues = [
            keys::worker_queue(self.worker_id),
            keys::JOB_QUEUE.to_string(),
        ];

        loop {
            let popped: Option<(String, String)> =
                match self.intake.blpop(&queues, JOB_WAIT_SECS).await {
                    Ok(popped) => popped,
                    Err(e) => {
                        warn!("Job intake lost its connection: {}", e);
                        self.intake = connect(&self.client).await;
                        continue;
                    }
                };

            let Some((queue, raw)) = popped else {
                return Ok(None);
            };
            match serde_json::from_str::<WorkerJob>(&raw) {
                Ok(job) => {
                    debug!(
                        "Took {} job for {} from {}",
                        job_kind(&job),
                        job.session_id(),
                        queue
                    );
                    return Ok(Some(job));
                }
                Err(e) => warn!("Skipping malformed job on {}: {} ({})", queue, e, raw),
            }
        }
    }
}

impl Drop for RedisManager {
    fn drop(&mut self) {
        self.lease.abort();
    }
}

/// Pushes job replies where the requesting client BLPOPs for them
pub struct ResultStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    ttl_secs: i64,
}

impl ResultStore {
    /// RPUSH `value` to `key` and let the key expire if nobody collects it.
    /// Retries once on a fresh connection.
    pub async fn store<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).context("Unserializable reply")?;

        if let Err(e) = self.push(key, &json).await {
            warn!("Reply to {} failed, reconnecting: {}", key, e);
            self.conn = connect(&self.client).await;
            self.push(key, &json)
                .await
                .with_context(|| format!("Reply to {} failed after reconnect", key))?;
        }
        Ok(())
    }

    async fn push(&mut self, key: &str, json: &str) -> redis::RedisResult<()> {
        redis::pipe()
            .atomic()
            .rpush(key, json)
            .ignore()
            .expire(key, self.ttl_secs)
            .ignore()
            .query_async(&mut self.conn)
            .await
    }
}

fn job_kind(job: &WorkerJob) -> &'static str {
    match job {
        WorkerJob::Session(_) => "session",
        WorkerJob::Create(_) => "create",
        WorkerJob::Write(_) => "write",
        WorkerJob::Read(_) => "read",
        WorkerJob::Cancel(_) => "cancel",
    }
}

/// Keeps trying until Redis answers
async fn connect(client: &redis::Client) -> MultiplexedConnection {
    let mut attempt: u32 = 0;
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return conn,
            Err(e) => {
                attempt += 1;
                warn!(
                    "Redis unreachable (attempt {}): {}. Retrying in {:?}",
                    attempt, e, CONNECT_RETRY
                );
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    }
}

/// SET NX EX on the first free slot; waits while all slots are leased
async fn lease_worker_id(client: &redis::Client) -> Result<u32> {
    let holder = std::process::id().to_string();
    loop {
        let mut conn = connect(client).await;
        for worker_id in 0..WORKER_SLOTS {
            if try_lease(&mut conn, worker_id, &holder).await? {
                return Ok(worker_id);
            }
        }
        warn!("All {} worker slots are leased, waiting", WORKER_SLOTS);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn try_lease(
    conn: &mut MultiplexedConnection,
    worker_id: u32,
    holder: &str,
) -> redis::RedisResult<bool> {
    let reply: Option<String> = redis::cmd("SET")
        .arg(keys::worker_lease(worker_id))
        .arg(holder)
        .arg("NX")
        .arg("EX")
        .arg(LEASE_TTL_SECS)
        .query_async(conn)
        .await?;
    Ok(reply.is_some())
}

/// Extend the lease every third of its TTL. If it lapsed anyway, try to take
/// it back.
fn renew_lease(client: redis::Client, worker_id: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let key = keys::worker_lease(worker_id);
        let holder = std::process::id().to_string();
        let mut ticker = tokio::time::interval(LEASE_RENEW_EVERY);
        ticker.tick().await;
        let mut conn: Option<MultiplexedConnection> = None;

        loop {
            ticker.tick().await;
            let live = match conn.as_mut() {
                Some(live) => live,
                None => conn.insert(connect(&client).await),
            };

            let renewed: redis::RedisResult<bool> =
                live.expire(&key, LEASE_TTL_SECS as i64).await;
            match renewed {
                Ok(true) => debug!("Renewed {}", key),
                Ok(false) => match try_lease(live, worker_id, &holder).await {
                    Ok(true) => warn!("{} had lapsed, leased it again", key),
                    Ok(false) => error!("{} lapsed and was taken by another worker", key),
                    Err(e) => {
                        warn!("Could not re-lease {}: {}", key, e);
                        conn = None;
                    }
                },
                Err(e) => {
                    warn!("Could not renew {}: {}", key, e);
                    conn = None;
                }
            }
        }
    })
}
