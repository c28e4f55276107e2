//! Session registry: stream-id → router and connection → session maps.
//!
//! An explicitly owned object handed to request handlers (no process-wide
//! singleton), so tests construct isolated instances.

use crate::error::{RouterError, RouterResult};
use crate::router::MediaRouter;
use crate::types::{StreamId, SubscriberId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle of one live control-plane connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a connection currently owns, used for cleanup-on-disconnect: a
/// publisher connection has only `stream_id` set, a viewer connection both.
#[derive(Debug, Clone, Default)]
pub struct ConnState {
    pub stream_id: Option<StreamId>,
    pub subscriber_id: Option<SubscriberId>,
}

/// Concurrent-safe registry of live routers and connection sessions.
#[derive(Default)]
pub struct SessionRegistry {
    routers: DashMap<StreamId, Arc<MediaRouter>>,
    connections: DashMap<ConnId, ConnState>,
    next_conn: AtomicU64,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a router under its stream id. Fails when a router already
    /// holds that id; the id frees up only when the previous router is
    /// removed.
    pub fn add_router(&self, router: Arc<MediaRouter>) -> RouterResult<()> {
        match self.routers.entry(router.stream_id().clone()) {
            Entry::Occupied(_) => Err(RouterError::RouterExists(router.stream_id().clone())),
            Entry::Vacant(entry) => {
                entry.insert(router);
                Ok(())
            }
        }
    }

    /// Look up a live router. The result may be concurrently stopped;
    /// router operations tolerate that.
    #[must_use]
    pub fn router(&self, stream_id: &StreamId) -> Option<Arc<MediaRouter>> {
        self.routers.get(stream_id).map(|entry| Arc::clone(&entry))
    }

    pub fn remove_router(&self, stream_id: &StreamId) -> Option<Arc<MediaRouter>> {
        self.routers.remove(stream_id).map(|(_, router)| router)
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    #[must_use]
    pub fn stream_ids(&self) -> Vec<StreamId> {
        self.routers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Create the session record for a new connection.
    pub fn register_connection(&self) -> ConnId {
        let id = ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(id, ConnState::default());
        id
    }

    #[must_use]
    pub fn connection(&self, id: ConnId) -> Option<ConnState> {
        self.connections.get(&id).map(|entry| entry.clone())
    }

    /// Mutate one connection's session record in place.
    pub fn update_connection(&self, id: ConnId, update: impl FnOnce(&mut ConnState)) {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            update(&mut entry);
        }
    }

    pub fn remove_connection(&self, id: ConnId) -> Option<ConnState> {
        self.connections.remove(&id).map(|(_, state)| state)
    }
}
