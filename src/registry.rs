//! Live connections of a server or client, by id.
//!
//! A connection inserted into a [`ConnectionRegistry`] removes itself when it stops, so the registry
//! only ever holds connections that are still running or shutting down. Connections hold the
//! registry weakly.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::{connection::Connection, id::ConnectionId};

struct Inner<M> {
    sessions: DashMap<ConnectionId, Connection<M>>,
    emptied: Notify,
}

/// A concurrent map of live connections.
pub struct ConnectionRegistry<M> {
    inner: Arc<Inner<M>>,
}

impl<M> ConnectionRegistry<M>
where
    M: Send + 'static,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        ConnectionRegistry {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                emptied: Notify::new(),
            }),
        }
    }

    /// Adds a connection. It is removed again automatically when it stops.
    pub fn insert(&self, conn: Connection<M>) {
        conn.attach_registry(WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        });
        trace!(connection_id = %conn.id(), "connection registered");
        self.inner.sessions.insert(conn.id(), conn);
    }

    /// Removes a connection, returning it if it was present.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection<M>> {
        remove(&self.inner, id)
    }

    /// Looks up a connection by id.
    pub fn get_session(&self, id: ConnectionId) -> Option<Connection<M>> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| entry.value().clone())
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Returns `true` if there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// A point-in-time copy of the live connections.
    pub fn snapshot(&self) -> Vec<Connection<M>> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Calls `f` once for every registered connection.
    ///
    /// `f` runs over a snapshot, so it may send, stop or look up connections without holding a map
    /// lock. Connections still stopping are included; check [`Connection::state`] to skip them.
    pub fn broadcast_with<F>(&self, mut f: F)
    where
        F: FnMut(&Connection<M>),
    {
        for conn in self.snapshot() {
            f(&conn);
        }
    }

    /// Sends `msg` to every live connection and returns how many accepted it.
    ///
    /// Connections that are already stopping are skipped.
    pub fn broadcast(&self, msg: M) -> usize
    where
        M: Clone,
    {
        let mut accepted = 0;
        self.broadcast_with(|conn| {
            if conn.send(msg.clone()).is_ok() {
                accepted += 1;
            }
        });
        accepted
    }

    /// Begins stopping every live connection.
    pub fn stop_all(&self) {
        for conn in self.snapshot() {
            conn.stop();
        }
    }

    /// Waits until the registry is empty.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.inner.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<M> Clone for ConnectionRegistry<M> {
    fn clone(&self) -> Self {
        ConnectionRegistry {
            inner: self.inner.clone(),
        }
    }
}

impl<M> Default for ConnectionRegistry<M>
where
    M: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ConnectionRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

/// The link a connection keeps back to its registry.
pub(crate) struct WeakRegistry<M> {
    inner: Weak<Inner<M>>,
}

impl<M> WeakRegistry<M> {
    pub(crate) fn remove(&self, id: ConnectionId) {
        if let Some(inner) = self.inner.upgrade() {
            remove(&inner, id);
        }
    }
}

fn remove<M>(inner: &Inner<M>, id: ConnectionId) -> Option<Connection<M>> {
    let (_, conn) = inner.sessions.remove(&id)?;
    trace!(connection_id = %id, "connection deregistered");
    if inner.sessions.is_empty() {
        inner.emptied.notify_waiters();
    }
    Some(conn)
}
