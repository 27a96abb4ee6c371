//! Worker jobs
//!
//! Jobs arrive as JSON tagged by `job_type`. Stateless ops answer on the
//! job's `result_key`; a `create` answer names the queue that reaches this
//! worker again, since the process pipes only exist here.
//!
//! [`JobDispatcher`] keeps the intake loop free: every session gets a lane
//! that runs its jobs in arrival order, and lanes run side by side.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::SessionId;
use crate::executor::StopSummary;
use crate::redis_manager::keys;
use crate::service::ExecutionService;
use crate::stateless::CommunicateResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "job_type", rename_all = "snake_case")]
pub enum WorkerJob {
    /// Run a queue-bridged session
    Session(SessionJob),
    Create(CreateJob),
    Write(WriteJob),
    Read(ReadJob),
    Cancel(CancelJob),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJob {
    pub session_id: SessionId,
    pub source: String,
    /// Where to push the final summary, if anyone wants it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJob {
    pub session_id: SessionId,
    pub source: String,
    pub result_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteJob {
    pub session_id: SessionId,
    pub data: String,
    pub result_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadJob {
    pub session_id: SessionId,
    pub result_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelJob {
    pub session_id: SessionId,
}

/// Answer to a stateless op
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub session_id: SessionId,
    pub worker_id: u32,
    /// Queue that reaches the worker holding this session
    pub route_key: String,
    #[serde(flatten)]
    pub result: CommunicateResult,
}

/// Final report of a queue-bridged session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: SessionId,
    pub worker_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<StopSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload to store under `result_key`
#[derive(Debug, Clone)]
pub struct JobReply {
    pub result_key: String,
    pub payload: serde_json::Value,
}

impl WorkerJob {
    pub fn session_id(&self) -> &SessionId {
        match self {
            WorkerJob::Session(job) => &job.session_id,
            WorkerJob::Create(job) => &job.session_id,
            WorkerJob::Write(job) => &job.session_id,
            WorkerJob::Read(job) => &job.session_id,
            WorkerJob::Cancel(job) => &job.session_id,
        }
    }
}

/// Run one job. Returns the reply to store, if the job expects one now.
pub async fn handle_job(
    service: &ExecutionService,
    worker_id: u32,
    job: WorkerJob,
) -> Option<JobReply> {
    match job {
        WorkerJob::Session(job) => {
            info!("Received session job: session_id={}", job.session_id);
            start_session(service, worker_id, job)
        }
        WorkerJob::Create(job) => {
            info!("Received create job: session_id={}", job.session_id);
            let result = service.stateless().create(&job.session_id, &job.source).await;
            op_reply(worker_id, job.session_id, job.result_key, result)
        }
        WorkerJob::Write(job) => {
            let result = service
                .stateless()
                .write_input(&job.session_id, &job.data)
                .await;
            op_reply(worker_id, job.session_id, job.result_key, result)
        }
        WorkerJob::Read(job) => {
            let result = service.stateless().read_output(&job.session_id).await;
            op_reply(worker_id, job.session_id, job.result_key, result)
        }
        WorkerJob::Cancel(job) => {
            if !service.cancel_session(&job.session_id).await {
                info!("Cancel for unknown session {}", job.session_id);
            }
            None
        }
    }
}

/// A lane retires after this long without jobs
const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Lane {
    jobs: mpsc::UnboundedSender<WorkerJob>,
    task: JoinHandle<()>,
}

/// Fans jobs out to per-session lanes and collects their replies
pub struct JobDispatcher {
    service: ExecutionService,
    worker_id: u32,
    replies: mpsc::UnboundedSender<JobReply>,
    lanes: HashMap<SessionId, Lane>,
    idle_timeout: Duration,
}

impl JobDispatcher {
    pub fn new(
        service: ExecutionService,
        worker_id: u32,
        replies: mpsc::UnboundedSender<JobReply>,
    ) -> Self {
        Self {
            service,
            worker_id,
            replies,
            lanes: HashMap::new(),
            idle_timeout: LANE_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Queue `job` behind earlier jobs of the same session. Never waits on
    /// the job itself.
    pub fn dispatch(&mut self, job: WorkerJob) {
        let session_id = job.session_id().clone();

        let (job, previous) = match self.lanes.remove(&session_id) {
            Some(lane) => match lane.jobs.send(job) {
                Ok(()) => {
                    self.lanes.insert(session_id, lane);
                    return;
                }
                // retired while idle; the new lane waits for its leftovers
                Err(mpsc::error::SendError(job)) => (job, Some(lane.task)),
            },
            None => (job, None),
        };

        self.lanes.retain(|_, lane| !lane.jobs.is_closed());
        let lane = self.open_lane(session_id.clone(), previous);
        if lane.jobs.send(job).is_err() {
            warn!("Job lane for {} closed before its first job", session_id);
        }
        self.lanes.insert(session_id, lane);
    }

    /// Lanes still accepting jobs
    pub fn lane_count(&self) -> usize {
        self.lanes
            .values()
            .filter(|lane| !lane.jobs.is_closed())
            .count()
    }

    fn open_lane(&self, session_id: SessionId, previous: Option<JoinHandle<()>>) -> Lane {
        let (jobs, mut rx) = mpsc::unbounded_channel::<WorkerJob>();
        let service = self.service.clone();
        let replies = self.replies.clone();
        let worker_id = self.worker_id;
        let idle_timeout = self.idle_timeout;

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            loop {
                let job = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(_) => {
                        rx.close();
                        while let Some(job) = rx.recv().await {
                            run_in_lane(&service, worker_id, job, &replies).await;
                        }
                        break;
                    }
                };
                run_in_lane(&service, worker_id, job, &replies).await;
            }
            debug!("Job lane for {} retired", session_id);
        });

        Lane { jobs, task }
    }
}

async fn run_in_lane(
    service: &ExecutionService,
    worker_id: u32,
    job: WorkerJob,
    replies: &mpsc::UnboundedSender<JobReply>,
) {
    if let Some(reply) = handle_job(service, worker_id, job).await {
        if let Err(mpsc::error::SendError(reply)) = replies.send(reply) {
            warn!("Reply for {} dropped, writer is gone", reply.result_key);
        }
    }
}

fn start_session(service: &ExecutionService, worker_id: u32, job: SessionJob) -> Option<JobReply> {
    let SessionJob {
        session_id,
        source,
        result_key,
    } = job;

    let task = match service.start_detached(session_id.clone(), &source) {
        Ok(task) => task,
        Err(e) => {
            warn!("Session job {} rejected: {}", session_id, e);
            let report = SessionResult {
                session_id,
                worker_id,
                summary: None,
                error: Some(e.to_string()),
            };
            return result_key.and_then(|key| to_reply(key, &report));
        }
    };

    // the summary is pushed from the session's own task once it ends
    if let Some(key) = result_key {
        let queue = service.queue().clone();
        tokio::spawn(async move {
            let report = match task.await {
                Ok(summary) => SessionResult {
                    session_id,
                    worker_id,
                    summary: Some(summary),
                    error: None,
                },
                Err(e) => SessionResult {
                    session_id,
                    worker_id,
                    summary: None,
                    error: Some(e.to_string()),
                },
            };
            match serde_json::to_string(&report) {
                Ok(json) => {
                    if let Err(e) = queue.push(&key, &json).await {
                        warn!("Failed to push session result to {}: {}", key, e);
                    }
                }
                Err(e) => warn!("Failed to serialize session result: {}", e),
            }
        });
    }
    None
}

fn op_reply(
    worker_id: u32,
    session_id: SessionId,
    result_key: String,
    result: CommunicateResult,
) -> Option<JobReply> {
    let answer = OpResult {
        session_id,
        worker_id,
        route_key: keys::worker_queue(worker_id),
        result,
    };
    to_reply(result_key, &answer)
}

fn to_reply<T: Serialize>(result_key: String, value: &T) -> Option<JobReply> {
    match serde_json::to_value(value) {
        Ok(payload) => Some(JobReply {
            result_key,
            payload,
        }),
        Err(e) => {
            warn!("Failed to serialize reply for {}: {}", result_key, e);
            None
        }
    }
}
