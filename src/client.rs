//! A TCP client keeping a fixed number of sessions to one address.
//!
//! [`Client::connect`] spawns one dial task per configured session. A failed dial is retried with
//! a capped exponential backoff until it succeeds or the client is stopped. A session that later
//! ends is not redialed.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    connection::Connection,
    engine::Engine,
    id::ConnectionId,
    registry::ConnectionRegistry,
};

struct Inner<M> {
    engine: Engine<M>,
    addr: String,
    registry: ConnectionRegistry<M>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Dials `addr` and serves the resulting connections with one [`Engine`].
pub struct Client<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Client<M>
where
    M: Send + 'static,
{
    /// Creates a client for `addr`. Nothing is dialed until [`connect`](Self::connect).
    pub fn new(engine: Engine<M>, addr: impl Into<String>) -> Self {
        Client {
            inner: Arc::new(Inner {
                engine,
                addr: addr.into(),
                registry: ConnectionRegistry::new(),
                sessions: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The remote address.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// The engine serving this client's connections.
    pub fn engine(&self) -> &Engine<M> {
        &self.inner.engine
    }

    /// The live connections.
    pub fn registry(&self) -> &ConnectionRegistry<M> {
        &self.inner.registry
    }

    /// Looks up a live connection by id.
    pub fn get_session(&self, id: ConnectionId) -> Option<Connection<M>> {
        self.inner.registry.get_session(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.registry.len()
    }

    /// Returns `true` if no session is connected.
    pub fn is_empty(&self) -> bool {
        self.inner.registry.is_empty()
    }

    /// Calls `f` once for every registered connection.
    ///
    /// See [`ConnectionRegistry::broadcast_with`].
    pub fn broadcast_with<F>(&self, f: F)
    where
        F: FnMut(&Connection<M>),
    {
        self.inner.registry.broadcast_with(f)
    }

    /// Sends `msg` on every live connection and returns how many accepted it.
    pub fn broadcast(&self, msg: M) -> usize
    where
        M: Clone,
    {
        self.inner.registry.broadcast(msg)
    }

    /// Starts the engine and spawns the configured number of session tasks.
    ///
    /// Returns immediately; sessions connect in the background. Calling it again adds more sessions.
    pub fn connect(&self) {
        self.inner.engine.start();
        let count = self.inner.engine.config().client.sessions;
        info!(addr = %self.inner.addr, sessions = count, "dialing");

        let mut sessions = self.inner.sessions.lock();
        for index in 0..count {
            let client = self.clone();
            sessions.push(tokio::spawn(async move { client.run_session(index).await }));
        }
    }

    /// Waits for every session to end, then shuts down the engine.
    pub async fn run(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock());
        for session in sessions {
            if let Err(err) = session.await {
                error!(%err, "session task aborted");
            }
        }
        self.inner.engine.shutdown().await;
        info!(addr = %self.inner.addr, "client stopped");
    }

    /// Runs until every session ends or Ctrl-C or `SIGTERM` arrives, then stops gracefully.
    pub async fn run_until_signal(&self) {
        let run = self.run();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => {}
            _ = crate::signal::shutdown_signal() => {
                info!("shutdown signal received");
                self.shutdown();
                run.await;
            }
        }
    }

    /// Cancels pending dials and begins stopping every live connection. Returns immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.registry.stop_all();
    }

    /// Shuts down and waits until every session has ended and the engine is stopped.
    pub async fn stop(&self) {
        self.shutdown();
        self.run().await;
    }

    async fn run_session(&self, index: usize) {
        let Some(stream) = self.dial(index).await else {
            return;
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set TCP_NODELAY");
        }
        let peer_addr = stream.peer_addr().ok();
        let local_addr = stream.local_addr().ok();

        let conn = Connection::with_addrs(&self.inner.engine, stream, peer_addr, local_addr);
        self.inner.registry.insert(conn.clone());
        if self.inner.shutdown.is_cancelled() {
            // Raced with shutdown, which may have missed this connection
            conn.stop();
        }
        debug!(connection_id = %conn.id(), session = index, "session connected");

        conn.start().await;
        conn.wait_for_stop().await;
        debug!(connection_id = %conn.id(), session = index, "session ended");
    }

    async fn dial(&self, index: usize) -> Option<TcpStream> {
        let retry = &self.inner.engine.config().client;
        let base = Duration::from_millis(retry.retry_base_ms);
        // The delay doubles before each wait
        let mut backoff = Backoff::new(base.saturating_mul(2), Duration::from_millis(retry.retry_max_ms));

        loop {
            let connect = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return None,
                res = TcpStream::connect(self.inner.addr.as_str()) => res,
            };

            match connect {
                Ok(stream) => return Some(stream),
                Err(err) => {
                    let delay = backoff.next();
                    warn!(addr = %self.inner.addr, session = index, %err, ?delay, "dial failed, retrying");
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

impl<M> Clone for Client<M> {
    fn clone(&self) -> Self {
        Client {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Client<M>
where
    M: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.addr)
            .field("sessions", &self.inner.registry.len())
            .finish()
    }
}
