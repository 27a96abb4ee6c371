//! Inbound boundary: start, feed and cancel sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::core::SessionId;
use crate::error::{ExecError, ExecResult};
use crate::executor::{Signal, StopSummary};
use crate::process::ProcessRegistry;
use crate::session::{ExecutionSession, QueueBackend};
use crate::stateless::StatelessExecutionOps;

type ActiveMap = Arc<Mutex<HashMap<SessionId, CancellationToken>>>;

/// A session that has been handed to its bridge task
#[derive(Debug)]
pub struct StartedSession {
    pub session_id: SessionId,
    /// Ordered signals: one `Running` first, one `Stopped` last. Dropping the
    /// receiver cancels the session.
    pub signals: mpsc::UnboundedReceiver<Signal>,
}

#[derive(Clone)]
pub struct ExecutionService {
    config: Arc<ExecutorConfig>,
    registry: ProcessRegistry,
    queue: Arc<dyn QueueBackend>,
    active: ActiveMap,
    shutdown: CancellationToken,
}

impl ExecutionService {
    pub fn new(config: ExecutorConfig, queue: Arc<dyn QueueBackend>) -> Self {
        Self {
            config: Arc::new(config),
            registry: ProcessRegistry::new(),
            queue,
            active: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn QueueBackend> {
        &self.queue
    }

    pub fn stateless(&self) -> StatelessExecutionOps {
        StatelessExecutionOps::new(self.registry.clone(), Arc::clone(&self.config))
    }

    /// Ids of sessions whose bridge is still running
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = lock(&self.active).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a session under a fresh id
    pub fn start_session(&self, source: &str) -> ExecResult<StartedSession> {
        self.start_session_with_id(SessionId::generate(), source)
    }

    pub fn start_session_with_id(
        &self,
        session_id: SessionId,
        source: &str,
    ) -> ExecResult<StartedSession> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_session(session_id.clone(), source, Some(tx))?;
        Ok(StartedSession {
            session_id,
            signals: rx,
        })
    }

    /// Start a session whose only consumer is the output queue
    pub fn start_detached(
        &self,
        session_id: SessionId,
        source: &str,
    ) -> ExecResult<JoinHandle<StopSummary>> {
        self.spawn_session(session_id, source, None)
    }

    fn spawn_session(
        &self,
        session_id: SessionId,
        source: &str,
        sink: Option<mpsc::UnboundedSender<Signal>>,
    ) -> ExecResult<JoinHandle<StopSummary>> {
        let cancel = self.shutdown.child_token();
        {
            let mut active = lock(&self.active);
            if active.contains_key(&session_id) || self.registry.contains(&session_id) {
                return Err(ExecError::SessionActive(session_id));
            }
            active.insert(session_id.clone(), cancel.clone());
        }

        let mut session = ExecutionSession::new(
            session_id.clone(),
            source,
            Arc::clone(&self.config),
            self.registry.clone(),
            Arc::clone(&self.queue),
            cancel,
        );
        if let Some(sink) = sink {
            session = session.with_signal_sink(sink);
        }

        let active = Arc::clone(&self.active);
        info!("Starting session {}", session_id);
        Ok(tokio::spawn(async move {
            let summary = session.run().await;
            lock(&active).remove(&session_id);
            debug!("Session {} released", session_id);
            summary
        }))
    }

    /// Queue one line of input for a session
    pub async fn submit_input(&self, session_id: &SessionId, text: &str) -> ExecResult<()> {
        self.queue.push(&session_id.input_key(), text).await
    }

    /// Stop a session. Returns `false` if nothing was running under the id.
    pub async fn cancel_session(&self, session_id: &SessionId) -> bool {
        let token = lock(&self.active).get(session_id).cloned();
        match token {
            Some(token) => {
                info!("Cancelling session {}", session_id);
                token.cancel();
                true
            }
            None => self.stateless().cleanup(session_id).await,
        }
    }

    /// Cancel every session, wait briefly for bridges to finish, then clean
    /// up whatever is still registered.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let deadline = self.config.terminate_grace * 2 + Duration::from_secs(1);
        let drained = tokio::time::timeout(deadline, async {
            while !lock(&self.active).is_empty() {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} sessions still running after shutdown wait",
                lock(&self.active).len()
            );
        }

        let stateless = self.stateless();
        for entry in self.registry.list_entries() {
            stateless.cleanup(&entry.session_id).await;
        }
        info!("Execution service stopped");
    }
}

fn lock(active: &ActiveMap) -> MutexGuard<'_, HashMap<SessionId, CancellationToken>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StopReason;
    use crate::session::MemoryQueue;
    use crate::testing::{pseudo_config, shell_config};

    fn service(config: ExecutorConfig) -> (ExecutionService, MemoryQueue) {
        let queue = MemoryQueue::new();
        (ExecutionService::new(config, Arc::new(queue.clone())), queue)
    }

    async fn collect(started: &mut StartedSession) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Some(signal) = tokio::time::timeout(Duration::from_secs(5), started.signals.recv())
            .await
            .unwrap()
        {
            signals.push(signal);
        }
        signals
    }

    fn stop_reason(signals: &[Signal]) -> StopReason {
        match signals.last() {
            Some(Signal::Stopped { summary }) => summary.reason.clone(),
            other => panic!("expected Stopped, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_session_streams_signals() {
        let dir = tempfile::tempdir().unwrap();
        let (service, queue) = service(shell_config(dir.path()));

        let mut started = service.start_session("echo hello\n").unwrap();
        let signals = collect(&mut started).await;

        assert!(signals[0].is_running());
        assert!(signals.contains(&Signal::output("hello")));
        assert_eq!(stop_reason(&signals), StopReason::Exited);
        assert_eq!(queue.snapshot(&started.session_id.output_key()), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_submit_input() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(pseudo_config(dir.path()));
        let id = SessionId::from("svc-input");

        service.submit_input(&id, "7").await.unwrap();
        let mut started = service
            .start_session_with_id(id, "DECLARE A:INTEGER\nINPUT A\nOUTPUT A")
            .unwrap();
        let signals = collect(&mut started).await;

        assert!(signals.contains(&Signal::output("7")));
    }

    #[tokio::test]
    async fn test_duplicate_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(shell_config(dir.path()));
        let id = SessionId::from("svc-dup");

        let _first = service
            .start_session_with_id(id.clone(), "exec sleep 30\n")
            .unwrap();
        let err = service
            .start_session_with_id(id.clone(), "exec sleep 30\n")
            .unwrap_err();
        assert!(matches!(err, ExecError::SessionActive(_)));

        assert!(service.cancel_session(&id).await);
    }

    #[tokio::test]
    async fn test_cancel_session() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(shell_config(dir.path()));

        let mut started = service.start_session("exec sleep 30\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.cancel_session(&started.session_id).await);

        let signals = collect(&mut started).await;
        assert_eq!(stop_reason(&signals), StopReason::Cancelled);
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(shell_config(dir.path()));
        assert!(!service.cancel_session(&SessionId::from("nobody")).await);
    }

    #[tokio::test]
    async fn test_cancel_stateless_session() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(shell_config(dir.path()));
        let id = SessionId::from("svc-stateless");

        assert!(service.stateless().create(&id, "exec sleep 30\n").await.ok);
        assert!(service.cancel_session(&id).await);
        assert!(service.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(shell_config(dir.path()));

        let mut a = service.start_session("exec sleep 30\n").unwrap();
        let _b = service.start_session("exec sleep 30\n").unwrap();
        service
            .stateless()
            .create(&SessionId::from("svc-loose"), "exec sleep 30\n")
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        service.shutdown().await;

        assert!(service.active_sessions().is_empty());
        assert!(service.registry().is_empty());
        let signals = collect(&mut a).await;
        assert_eq!(stop_reason(&signals), StopReason::Cancelled);
    }
}
