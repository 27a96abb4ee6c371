//! Session id -> process handle map shared by every executor, the stateless
//! ops and the service.
//!
//! The map sits behind one std mutex that is only held for map operations.
//! Each handle carries its own async lock for I/O, so a slow read on one
//! session never blocks lookups of another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing::debug;

use super::handle::ProcessHandle;
use crate::core::SessionId;
use crate::error::{ExecError, ExecResult};

pub type SharedHandle = Arc<tokio::sync::Mutex<ProcessHandle>>;

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub session_id: SessionId,
    pub pid: u32,
    pub created_at: SystemTime,
    pub handle: SharedHandle,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<Mutex<HashMap<SessionId, RegistryEntry>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly spawned handle under its session id.
    ///
    /// Fails with `SessionActive` if the id is taken; the rejected handle is
    /// dropped, which kills its process.
    pub fn put(&self, handle: ProcessHandle) -> ExecResult<SharedHandle> {
        let session_id = handle.session_id().clone();
        let mut entries = self.lock();
        if entries.contains_key(&session_id) {
            return Err(ExecError::SessionActive(session_id));
        }

        let entry = RegistryEntry {
            session_id: session_id.clone(),
            pid: handle.pid(),
            created_at: handle.created_at(),
            handle: Arc::new(tokio::sync::Mutex::new(handle)),
        };
        let shared = Arc::clone(&entry.handle);
        debug!("Registered session {} (pid {})", session_id, entry.pid);
        entries.insert(session_id, entry);
        Ok(shared)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SharedHandle> {
        self.lock()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.handle))
    }

    /// Entry of a registered session, `RegistryMiss` if there is none
    pub fn lookup(&self, session_id: &SessionId) -> ExecResult<RegistryEntry> {
        self.lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| ExecError::RegistryMiss(session_id.clone()))
    }

    /// Remove an entry. Removing an absent id is a no-op.
    pub fn remove(&self, session_id: &SessionId) -> Option<SharedHandle> {
        let removed = self.lock().remove(session_id);
        if let Some(entry) = &removed {
            debug!("Unregistered session {} (pid {})", session_id, entry.pid);
        }
        removed.map(|entry| entry.handle)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of all entries, oldest first
    pub fn list_entries(&self) -> Vec<RegistryEntry> {
        let mut entries: Vec<RegistryEntry> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::shell_engine;
    use std::time::Duration;

    async fn spawn_sleeper(dir: &std::path::Path, id: &str) -> ProcessHandle {
        ProcessHandle::spawn(SessionId::from(id), "exec sleep 30\n", &shell_engine(), dir)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        let id = SessionId::from("reg-1");

        let shared = registry.put(spawn_sleeper(dir.path(), "reg-1").await).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        let looked_up = registry.get(&id).unwrap();
        assert!(Arc::ptr_eq(&shared, &looked_up));

        let removed = registry.remove(&id).unwrap();
        removed
            .lock()
            .await
            .terminate(Duration::from_millis(500))
            .await
            .unwrap();
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_remove_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        let id = SessionId::from("reg-twice");
        registry.put(spawn_sleeper(dir.path(), "reg-twice").await).unwrap();

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_reports_miss() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        let id = SessionId::from("reg-lookup");

        let err = registry.lookup(&id).unwrap_err();
        assert!(matches!(err, ExecError::RegistryMiss(ref missing) if *missing == id));
        assert!(!err.is_transient());

        registry.put(spawn_sleeper(dir.path(), "reg-lookup").await).unwrap();
        let entry = registry.lookup(&id).unwrap();
        assert_eq!(entry.session_id, id);
        assert!(entry.pid > 0);
        registry.remove(&id);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = ProcessRegistry::new();
        assert!(registry.remove(&SessionId::from("never-registered")).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        registry.put(spawn_sleeper(dir.path(), "dup").await).unwrap();

        let err = registry
            .put(spawn_sleeper(dir.path(), "dup").await)
            .unwrap_err();
        assert!(matches!(err, ExecError::SessionActive(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_list_entries_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new();
        registry.put(spawn_sleeper(dir.path(), "a").await).unwrap();
        registry.put(spawn_sleeper(dir.path(), "b").await).unwrap();

        let snapshot = registry.list_entries();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].session_id.as_str(), "a");

        // snapshot is detached from later mutation
        registry.remove(&SessionId::from("a"));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}
