//! Queue bridge
//!
//! An `ExecutionSession` pumps one executor: queued input from `input_<id>`
//! goes to stdin, stdout lines go to `output_<id>`, and every signal goes to
//! an optional in-process sink. It owns the wall-clock limit and reacts to
//! cancellation between iterations.

mod queue;

pub use queue::{MemoryQueue, QueueBackend, RedisQueue};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::core::SessionId;
use crate::error::{ExecError, ExecResult};
use crate::executor::{InteractiveExecutor, Interaction, Signal, StopReason, StopSummary};
use crate::process::ProcessRegistry;

const FINAL_FLUSH_ATTEMPTS: usize = 3;

pub struct ExecutionSession {
    session_id: SessionId,
    executor: InteractiveExecutor,
    queue: Arc<dyn QueueBackend>,
    config: Arc<ExecutorConfig>,
    cancel: CancellationToken,
    sink: Option<mpsc::UnboundedSender<Signal>>,
    /// Input drained from the queue, applied one per iteration
    pending: VecDeque<String>,
    /// Output lines the queue has not accepted yet, at most `outbox_limit`
    outbox: VecDeque<String>,
    outbox_dropped: u64,
    running_forwarded: bool,
}

impl ExecutionSession {
    pub fn new(
        session_id: SessionId,
        source: impl Into<String>,
        config: Arc<ExecutorConfig>,
        registry: ProcessRegistry,
        queue: Arc<dyn QueueBackend>,
        cancel: CancellationToken,
    ) -> Self {
        let executor =
            InteractiveExecutor::new(session_id.clone(), source, Arc::clone(&config), registry);
        Self {
            session_id,
            executor,
            queue,
            config,
            cancel,
            sink: None,
            pending: VecDeque::new(),
            outbox: VecDeque::new(),
            outbox_dropped: 0,
            running_forwarded: false,
        }
    }

    /// Forward signals to `sink`. Dropping the receiver cancels the session.
    pub fn with_signal_sink(mut self, sink: mpsc::UnboundedSender<Signal>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Pump until the executor stops. Always ends with the `Stopped` summary.
    pub async fn run(mut self) -> StopSummary {
        let started = Instant::now();
        let limit = self.config.max_session_duration;
        let input_key = self.session_id.input_key();
        let output_key = self.session_id.output_key();
        info!(
            "Session {} bridging {} -> {} (limit {}s)",
            self.session_id,
            input_key,
            output_key,
            limit.as_secs()
        );

        loop {
            let signals = if self.cancel.is_cancelled() {
                info!("Session {} cancelled", self.session_id);
                self.executor.stop(StopReason::Cancelled).await
            } else if let Err(e) = check_deadline(started, limit) {
                warn!("Session {}: {}", self.session_id, e);
                self.executor
                    .stop(StopReason::Timeout {
                        limit_secs: limit.as_secs(),
                    })
                    .await
            } else {
                self.drain_input(&input_key).await;
                let interaction = self.pending.pop_front().map(Interaction::input);
                self.executor.advance(interaction).await
            };

            let stopped = self.dispatch(signals);
            self.flush_outbox(&output_key).await;

            if let Some(summary) = stopped {
                self.final_flush(&output_key).await;
                if !self.pending.is_empty() {
                    debug!(
                        "Session {} ended with {} unapplied inputs",
                        self.session_id,
                        self.pending.len()
                    );
                }
                return summary;
            }
        }
    }

    async fn drain_input(&mut self, key: &str) {
        let room = self
            .config
            .input_batch_limit
            .saturating_sub(self.pending.len());
        if room == 0 {
            return;
        }
        match self.queue.pop_batch(key, room).await {
            Ok(items) => self.pending.extend(items),
            Err(e) if e.is_transient() => {
                warn!("Session {} skipped input drain: {}", self.session_id, e)
            }
            Err(e) => error!("Session {} cannot drain {}: {}", self.session_id, key, e),
        }
    }

    /// Route one batch; returns the summary if the batch ended the session
    fn dispatch(&mut self, signals: Vec<Signal>) -> Option<StopSummary> {
        let mut stopped = None;
        for signal in signals {
            match &signal {
                Signal::Running { .. } if self.running_forwarded => continue,
                Signal::Running { .. } => self.running_forwarded = true,
                Signal::Output { line } => self.enqueue_output(line.clone()),
                Signal::Exception { .. } => {}
                Signal::Stopped { summary } => stopped = Some(summary.clone()),
            }

            let delivered = match &self.sink {
                Some(sink) => sink.send(signal).is_ok(),
                None => true,
            };
            if !delivered {
                debug!("Session {} lost its signal receiver", self.session_id);
                self.sink = None;
                self.cancel.cancel();
            }
        }
        stopped
    }

    /// Hold a line for the output queue. Past `outbox_limit` the oldest
    /// held line is dropped.
    fn enqueue_output(&mut self, line: String) {
        self.outbox.push_back(line);
        if self.outbox.len() > self.config.outbox_limit {
            self.outbox.pop_front();
            self.outbox_dropped += 1;
            if self.outbox_dropped == 1 || self.outbox_dropped % 1000 == 0 {
                warn!(
                    "Session {} outbox full, {} output lines dropped so far",
                    self.session_id, self.outbox_dropped
                );
            }
        }
    }

    /// Push queued output in order, stopping at the first failure
    async fn flush_outbox(&mut self, key: &str) -> bool {
        while let Some(line) = self.outbox.front() {
            if let Err(e) = self.queue.push(key, line).await {
                if e.is_transient() {
                    warn!(
                        "Session {} holding {} output lines: {}",
                        self.session_id,
                        self.outbox.len(),
                        e
                    );
                } else {
                    error!("Session {} cannot push to {}: {}", self.session_id, key, e);
                }
                return false;
            }
            self.outbox.pop_front();
        }
        true
    }

    async fn final_flush(&mut self, key: &str) {
        for attempt in 1..=FINAL_FLUSH_ATTEMPTS {
            if self.flush_outbox(key).await {
                return;
            }
            if attempt < FINAL_FLUSH_ATTEMPTS {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
        error!(
            "Session {} dropped {} output lines, queue unreachable",
            self.session_id,
            self.outbox.len()
        );
    }
}

fn check_deadline(started: Instant, limit: Duration) -> ExecResult<()> {
    if started.elapsed() >= limit {
        Err(ExecError::Timeout(limit))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pseudo_config, shell_config};

    fn session(
        config: ExecutorConfig,
        source: &str,
        queue: &MemoryQueue,
    ) -> (ExecutionSession, ProcessRegistry, CancellationToken) {
        let registry = ProcessRegistry::new();
        let cancel = CancellationToken::new();
        let session = ExecutionSession::new(
            SessionId::generate(),
            source,
            Arc::new(config),
            registry.clone(),
            Arc::new(queue.clone()),
            cancel.clone(),
        );
        (session, registry, cancel)
    }

    #[test]
    fn test_check_deadline() {
        let now = Instant::now();
        assert!(check_deadline(now, Duration::from_secs(60)).is_ok());
        let err = check_deadline(now, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_output_lines_reach_queue_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let (session, registry, _) = session(
            shell_config(dir.path()),
            "echo one\necho two\necho three\n",
            &queue,
        );
        let output_key = session.session_id().output_key();

        let summary = session.run().await;

        assert_eq!(queue.snapshot(&output_key), vec!["one", "two", "three"]);
        assert_eq!(summary.output, vec!["one", "two", "three"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_queued_input_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let (session, _, _) = session(
            pseudo_config(dir.path()),
            "DECLARE A:INTEGER\nINPUT A\nOUTPUT A",
            &queue,
        );
        let id = session.session_id().clone();
        queue.push(&id.input_key(), "7").await.unwrap();

        let summary = session.run().await;

        assert_eq!(queue.snapshot(&id.output_key()), vec!["7"]);
        assert_eq!(summary.reason, StopReason::Exited);
        assert_eq!(queue.len(&id.input_key()), 0);
    }

    #[tokio::test]
    async fn test_signal_sink_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let (session, _, _) = session(
            shell_config(dir.path()),
            "echo x\nsleep 0.2\necho y\n",
            &queue,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        session.with_signal_sink(tx).run().await;

        let mut signals = Vec::new();
        while let Some(signal) = rx.recv().await {
            signals.push(signal);
        }
        assert!(signals[0].is_running());
        assert_eq!(signals.iter().filter(|s| s.is_running()).count(), 1);
        assert_eq!(signals.iter().filter(|s| s.is_stopped()).count(), 1);
        assert!(signals.last().unwrap().is_stopped());
    }

    #[tokio::test]
    async fn test_timeout_kills_term_ignoring_process() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let config = shell_config(dir.path()).with_max_session_duration(Duration::from_secs(1));
        let poll = config.poll_interval;
        let grace = config.terminate_grace;
        let (session, registry, _) = session(config, "trap '' TERM\nexec sleep 30\n", &queue);

        let started = Instant::now();
        let summary = session.run().await;
        let elapsed = started.elapsed();

        assert_eq!(summary.reason, StopReason::Timeout { limit_secs: 1 });
        // limit + one poll interval; a SIGTERM grace period would blow this
        let slack = Duration::from_millis(250);
        assert!(slack < grace);
        assert!(
            elapsed < Duration::from_secs(1) + poll + slack,
            "took {:?}",
            elapsed
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_outbox_keeps_newest_lines() {
        let queue = MemoryQueue::new();
        let config = ExecutorConfig::default().with_outbox_limit(2);
        let (mut session, _, _) = session(config, "", &queue);

        let signals = ["a", "b", "c"].into_iter().map(Signal::output).collect();
        assert!(session.dispatch(signals).is_none());

        assert_eq!(session.outbox, VecDeque::from(vec!["b".to_string(), "c".to_string()]));
        assert_eq!(session.outbox_dropped, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let (session, registry, cancel) = session(shell_config(dir.path()), "exec sleep 30\n", &queue);

        let task = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_receiver_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let (session, _, _) = session(shell_config(dir.path()), "exec sleep 30\n", &queue);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let summary = tokio::time::timeout(Duration::from_secs(3), session.with_signal_sink(tx).run())
            .await
            .unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_queue_outage_delays_but_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        queue.set_available(false);
        let (session, _, _) = session(
            shell_config(dir.path()),
            "echo a\necho b\nsleep 0.6\necho c\n",
            &queue,
        );
        let output_key = session.session_id().output_key();

        let task = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(queue.len(&output_key), 0);
        queue.set_available(true);

        task.await.unwrap();
        assert_eq!(queue.snapshot(&output_key), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_drain() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MemoryQueue::new();
        let config = shell_config(dir.path()).with_input_batch_limit(2);
        let (mut session, _, _) = session(config, "exec sleep 30\n", &queue);
        let input_key = session.session_id().input_key();
        for i in 0..5 {
            queue.push(&input_key, &i.to_string()).await.unwrap();
        }

        session.drain_input(&input_key).await;
        assert_eq!(session.pending.len(), 2);
        assert_eq!(queue.len(&input_key), 3);

        session.drain_input(&input_key).await;
        assert_eq!(session.pending.len(), 2);
    }
}
