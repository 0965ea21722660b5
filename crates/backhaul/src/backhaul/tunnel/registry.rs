use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use serde::Serialize;

use crate::backhaul::tunnel::{
    frame::ConnectionId,
    session::{Session, SessionState},
};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub started_at_unix_ms: u64,
}

/// Side-local map from connection id to live session.
///
/// Every insert, lookup and removal goes through the map's shard locks, so the
/// accept path, the stream reader and the per-session forwarders can touch it
/// concurrently.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<ConnectionId, Arc<Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Inserts `session` under its id. An id held by a session that has not
    /// reached `Closed` is never overwritten.
    pub fn register(&self, session: Arc<Session>) -> Result<(), RegistryError> {
        match self.sessions.entry(session.id().clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().state() != SessionState::Closed {
                    return Err(RegistryError::Duplicate(session.id().clone()));
                }
                slot.insert(session);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    /// Removes the entry for `id`, whatever session holds it.
    pub fn remove_id(&self, id: &ConnectionId) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Removes `session` only if it still owns its slot. Returns true for the
    /// one caller that actually removed it.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(session.id(), |_, cur| Arc::ptr_eq(cur, session))
            .is_some()
    }

    /// Empties the registry and returns everything that was in it.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.remove_id(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|e| SessionInfo {
                id: e.key().to_string(),
                state: e.value().state(),
                started_at_unix_ms: e.value().started_at_unix_ms(),
            })
            .collect();
        out.sort_by_key(|s| s.started_at_unix_ms);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backhaul::tunnel::session::{CloseReason, SessionOptions};

    #[test]
    fn duplicate_live_id_is_rejected() {
        let reg = Registry::new();
        let id = ConnectionId::from("dup");
        let (first, _l1) = Session::new(id.clone(), SessionOptions::default());
        let (second, _l2) = Session::new(id.clone(), SessionOptions::default());

        reg.register(first.clone()).unwrap();
        assert!(matches!(
            reg.register(second.clone()),
            Err(RegistryError::Duplicate(_))
        ));

        // The original entry is untouched.
        assert!(Arc::ptr_eq(&reg.lookup(&id).unwrap(), &first));

        // Closing is not enough; only a Closed session frees its slot.
        first.close(CloseReason::LocalEof);
        assert!(reg.register(second.clone()).is_err());
        first.finish();
        reg.register(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&reg.lookup(&id).unwrap(), &second));
    }

    #[test]
    fn remove_only_evicts_the_owner() {
        let reg = Registry::new();
        let id = ConnectionId::from("owner");
        let (old, _l1) = Session::new(id.clone(), SessionOptions::default());
        old.finish();
        reg.register(old.clone()).unwrap();

        let (new, _l2) = Session::new(id.clone(), SessionOptions::default());
        reg.register(new.clone()).unwrap();

        assert!(!reg.remove(&old));
        assert_eq!(reg.len(), 1);
        assert!(reg.remove(&new));
        assert!(!reg.remove(&new));
        assert!(reg.is_empty());
    }

    #[test]
    fn drain_empties_and_returns_everything() {
        let reg = Registry::new();
        for _ in 0..5 {
            let (s, _l) = Session::new(ConnectionId::generate(), SessionOptions::default());
            reg.register(s).unwrap();
        }
        assert_eq!(reg.snapshot().len(), 5);
        assert_eq!(reg.drain().len(), 5);
        assert!(reg.is_empty());
        assert!(reg.drain().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_removal_happens_once() {
        let reg = Arc::new(Registry::new());
        let (s, _l) = Session::new(ConnectionId::generate(), SessionOptions::default());
        reg.register(s.clone()).unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let reg = reg.clone();
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    reg.remove(&s)
                } else {
                    reg.remove_id(s.id()).is_some()
                }
            }));
        }

        let mut removed = 0;
        for t in tasks {
            if t.await.unwrap() {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }
}
