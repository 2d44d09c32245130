//! # Registry
//!
//! Scope-keyed index of live sessions. One `RwLock` guards both the forward
//! map (scope to sessions) and the reverse map (session to scope), and every
//! operation is a single critical section, so a `lookup` always observes some
//! complete prefix of the mutation history and never a half-applied one.
//!
//! Registered sessions are `Active` or `Draining`. Deregistering moves an
//! `Active` session to `Draining`; only its delivery worker marks it `Closed`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;

use crate::core::connection::{CloseReason, ConnectionHandle, ConnectionId, ConnectionState};
use crate::core::scope::Scope;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The id is already registered. Ids are allocated once, so this is a
    /// caller bug.
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// The lifecycle task has stopped and no longer accepts commands.
    #[error("connection lifecycle task is not running")]
    LifecycleClosed,
}

#[derive(Default)]
struct RegistryInner {
    by_scope: HashMap<Scope, HashMap<ConnectionId, Arc<ConnectionHandle>>>,
    scope_of: HashMap<ConnectionId, Scope>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the session under its own scope and marks it `Active`.
    pub fn register(&self, connection: Arc<ConnectionHandle>) -> Result<(), RegistryError> {
        let id = connection.id();
        let mut inner = self.write();
        if inner.scope_of.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        let scope = connection.scope().clone();
        connection.set_state(ConnectionState::Active);
        inner.scope_of.insert(id, scope.clone());
        inner.by_scope.entry(scope.clone()).or_default().insert(id, connection);
        drop(inner);

        log::debug!("Registered {} under {}", id, scope);
        Ok(())
    }

    /// Removes the session so it receives no further events. Unknown ids are a
    /// no-op; returns the removed handle when there was one.
    pub fn deregister(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let mut inner = self.write();
        let scope = inner.scope_of.remove(&id)?;

        let mut removed = None;
        if let Some(members) = inner.by_scope.get_mut(&scope) {
            removed = members.remove(&id);
            if members.is_empty() {
                inner.by_scope.remove(&scope);
            }
        }
        drop(inner);

        if let Some(handle) = &removed {
            handle.transition(ConnectionState::Active, ConnectionState::Draining);
            log::debug!("Deregistered {} from {}", id, scope);
        }
        removed
    }

    /// Owned snapshot of the sessions registered under `scope`.
    pub fn lookup(&self, scope: &Scope) -> Vec<Arc<ConnectionHandle>> {
        self.read()
            .by_scope
            .get(scope)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let inner = self.read();
        let scope = inner.scope_of.get(&id)?;
        inner.by_scope.get(scope).and_then(|members| members.get(&id).cloned())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.read().scope_of.contains_key(&id)
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.read().scope_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of scopes with at least one session.
    pub fn scope_count(&self) -> usize {
        self.read().by_scope.len()
    }

    /// Snapshot of every registered session.
    pub fn all(&self) -> Vec<Arc<ConnectionHandle>> {
        self.read()
            .by_scope
            .values()
            .flat_map(|members| members.values().cloned())
            .collect()
    }

    /// Requests close on every session. Sessions stay registered until their
    /// workers finish; returns how many were asked.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let sessions = self.all();
        for session in &sessions {
            session.request_close(reason);
        }
        sessions.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().expect("Registry lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().expect("Registry lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn scope(t: &str, w: &str) -> Scope {
        Scope::new(t, w).unwrap()
    }

    #[test]
    fn register_then_lookup_by_scope() {
        let registry = Registry::new();
        let a = ConnectionHandle::new(scope("t1", "w1"), 8);
        let b = ConnectionHandle::new(scope("t1", "w1"), 8);
        let c = ConnectionHandle::new(scope("t1", "w2"), 8);
        for handle in [&a, &b, &c] {
            registry.register(Arc::clone(handle)).unwrap();
        }

        let ids: HashSet<_> = registry.lookup(&scope("t1", "w1")).iter().map(|h| h.id()).collect();
        assert_eq!(ids, HashSet::from([a.id(), b.id()]));
        assert_eq!(registry.lookup(&scope("t1", "w2")).len(), 1);
        assert!(registry.lookup(&scope("t2", "w1")).is_empty());
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.scope_count(), 2);
        assert_eq!(a.state(), ConnectionState::Active);
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = Registry::new();
        let a = ConnectionHandle::new(scope("t", "w"), 8);
        registry.register(Arc::clone(&a)).unwrap();
        assert_eq!(
            registry.register(Arc::clone(&a)),
            Err(RegistryError::DuplicateConnection(a.id()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deregister_is_idempotent() {
        let registry = Registry::new();
        let a = ConnectionHandle::new(scope("t", "w"), 8);
        registry.register(Arc::clone(&a)).unwrap();

        assert!(registry.deregister(a.id()).is_some());
        assert!(registry.deregister(a.id()).is_none());
        assert!(registry.deregister(ConnectionId::from(u64::MAX)).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.scope_count(), 0);
        assert_eq!(a.state(), ConnectionState::Draining);
    }

    #[test]
    fn lookup_is_a_detached_snapshot() {
        let registry = Registry::new();
        let a = ConnectionHandle::new(scope("t", "w"), 8);
        registry.register(Arc::clone(&a)).unwrap();

        let snapshot = registry.lookup(&scope("t", "w"));
        registry.deregister(a.id());
        assert_eq!(snapshot.len(), 1);
        assert!(registry.lookup(&scope("t", "w")).is_empty());
    }

    #[test]
    fn close_all_requests_close_without_removing() {
        let registry = Registry::new();
        let a = ConnectionHandle::new(scope("t", "w1"), 8);
        let b = ConnectionHandle::new(scope("t", "w2"), 8);
        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&b)).unwrap();

        assert_eq!(registry.close_all(CloseReason::Shutdown), 2);
        assert_eq!(a.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(b.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn concurrent_churn_never_returns_a_removed_session() {
        let registry = Arc::new(Registry::new());
        let target = scope("t", "w");
        let removed: Arc<RwLock<HashSet<ConnectionId>>> = Arc::default();
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let removed = Arc::clone(&removed);
                let target = target.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let handle = ConnectionHandle::new(target.clone(), 1);
                        registry.register(Arc::clone(&handle)).unwrap();
                        registry.deregister(handle.id());
                        removed.write().unwrap().insert(handle.id());
                    }
                })
            })
            .collect();

        let reader = {
            let registry = Arc::clone(&registry);
            let removed = Arc::clone(&removed);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    // Everything recorded here was deregistered before the
                    // lookup started.
                    let before: HashSet<_> = removed.read().unwrap().clone();
                    for handle in registry.lookup(&target) {
                        assert!(!before.contains(&handle.id()), "lookup returned a removed session");
                    }
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        reader.join().unwrap();
        assert!(registry.is_empty());
    }
}
