//! Registry of live sessions keyed by connection ID

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use rt_core::SessionError;
use rt_protocol::ConnectionId;

/// Concurrency-safe map from connection ID to session
///
/// The map itself is never handed out; everything goes through
/// [`create`](Self::create), [`get`](Self::get), [`remove`](Self::remove)
/// and [`list_all`](Self::list_all).
pub struct SessionTable<S: Clone> {
    sessions: DashMap<ConnectionId, S>,
}

impl<S: Clone> SessionTable<S> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Insert a session built by `factory`, unless `id` is already present
    ///
    /// The slot for `id` stays locked while `factory` runs, so concurrent
    /// creates for the same ID have exactly one winner and the losers never
    /// run their factory. `factory` must not call back into the table.
    pub fn create<F>(&self, id: ConnectionId, factory: F) -> Result<S, SessionError>
    where
        F: FnOnce() -> Result<S, SessionError>,
    {
        match self.sessions.entry(id) {
            Entry::Occupied(entry) => Err(SessionError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                let session = factory()?;
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    /// Get a session by connection ID
    pub fn get(&self, id: &ConnectionId) -> Option<S> {
        self.sessions.get(id).map(|r| r.value().clone())
    }

    /// Remove a session; no-op if absent
    pub fn remove(&self, id: &ConnectionId) -> Option<S> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Remove a session only if `predicate` holds for it
    pub fn remove_if<P>(&self, id: &ConnectionId, predicate: P) -> Option<S>
    where
        P: FnOnce(&S) -> bool,
    {
        self.sessions
            .remove_if(id, |_, session| predicate(session))
            .map(|(_, session)| session)
    }

    /// Snapshot of all sessions
    pub fn list_all(&self) -> Vec<(ConnectionId, S)> {
        self.sessions
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<S: Clone> Default for SessionTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_create_and_get() {
        let table = SessionTable::new();
        let id = ConnectionId::new("A");

        table.create(id.clone(), || Ok(1u32)).unwrap();
        assert_eq!(table.get(&id), Some(1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_create_duplicate_fails() {
        let table = SessionTable::new();
        let id = ConnectionId::new("A");

        table.create(id.clone(), || Ok(1u32)).unwrap();
        let result = table.create(id.clone(), || panic!("factory must not run"));

        assert!(matches!(result, Err(SessionError::AlreadyExists(ref dup)) if *dup == id));
        assert_eq!(table.get(&id), Some(1));
    }

    #[test]
    fn test_factory_failure_leaves_no_entry() {
        let table: SessionTable<u32> = SessionTable::new();
        let id = ConnectionId::new("A");

        let result = table.create(id.clone(), || {
            Err(SessionError::PtyAllocation("no ptys".to_string()))
        });

        assert!(result.is_err());
        assert!(table.get(&id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let table: SessionTable<u32> = SessionTable::new();
        assert!(table.remove(&ConnectionId::new("missing")).is_none());
    }

    #[test]
    fn test_remove_if() {
        let table = SessionTable::new();
        let id = ConnectionId::new("A");
        table.create(id.clone(), || Ok(7u32)).unwrap();

        assert!(table.remove_if(&id, |v| *v == 8).is_none());
        assert_eq!(table.remove_if(&id, |v| *v == 7), Some(7));
        assert!(table.is_empty());
    }

    #[test]
    fn test_list_all() {
        let table = SessionTable::new();
        table.create(ConnectionId::new("A"), || Ok(1u32)).unwrap();
        table.create(ConnectionId::new("B"), || Ok(2u32)).unwrap();

        let mut all = table.list_all();
        all.sort();
        assert_eq!(
            all,
            vec![(ConnectionId::new("A"), 1), (ConnectionId::new("B"), 2)]
        );
    }

    #[test]
    fn test_concurrent_create_single_winner() {
        let table = Arc::new(SessionTable::new());
        let built = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let table = table.clone();
                let built = built.clone();
                std::thread::spawn(move || {
                    table
                        .create(ConnectionId::new("same"), || {
                            built.fetch_add(1, Ordering::SeqCst);
                            Ok(i)
                        })
                        .is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 1);
    }
}
