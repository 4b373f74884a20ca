//! A TCP server.
//!
//! [`Server::bind`] opens the listener and [`Server::serve`] runs the accept loop. Every accepted
//! stream becomes a [`Connection`] in the server's [`ConnectionRegistry`]. Calling
//! [`Server::shutdown`] ends the accept loop; `serve` then stops every live connection, waits for
//! them to finish, and shuts the engine down before returning.
//!
//! # Example
//!
//! ```no_run
//! use rivet::{config::EngineConfig, engine::Engine, handler::Callbacks, server::Server};
//!
//! # #[tokio::main] async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::<String>::builder(EngineConfig::default())
//!     .handler(Callbacks::new().on_message(|event| async move {
//!         let _ = event.conn.send(event.msg);
//!     }))
//!     .build()?;
//!
//! let server = Server::bind(engine, "127.0.0.1:7000").await?;
//! server.run_until_signal().await?;
//! # Ok(())
//! # }
//! ```

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    connection::Connection,
    engine::Engine,
    error::ServeError,
    id::ConnectionId,
    registry::ConnectionRegistry,
};

struct Inner<M> {
    engine: Engine<M>,
    registry: ConnectionRegistry<M>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

/// A TCP server serving every accepted connection with one [`Engine`].
pub struct Server<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Server<M>
where
    M: Send + 'static,
{
    /// Binds a listener to `addr` and starts the engine.
    pub async fn bind(engine: Engine<M>, addr: impl ToSocketAddrs) -> Result<Self, ServeError> {
        let listener = TcpListener::bind(addr).await.map_err(ServeError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServeError::Bind)?;
        engine.start();
        info!(%local_addr, "listening");

        Ok(Server {
            inner: Arc::new(Inner {
                engine,
                registry: ConnectionRegistry::new(),
                listener: Mutex::new(Some(listener)),
                local_addr,
                shutdown: CancellationToken::new(),
                finished: CancellationToken::new(),
            }),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The engine serving this server's connections.
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
    pub fn sessions(&self) -> usize {
        self.inner.registry.len()
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

    /// Sends `msg` to every live connection and returns how many accepted it.
    pub fn broadcast(&self, msg: M) -> usize
    where
        M: Clone,
    {
        self.inner.registry.broadcast(msg)
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown) is called or accepting fails fatally.
    ///
    /// Transient accept errors, including file descriptor and buffer exhaustion, are retried with
    /// a capped exponential backoff. Before returning, every live connection is stopped and awaited
    /// and the engine is shut down. Only the first call serves; later calls wait for it to finish.
    pub async fn serve(&self) -> Result<(), ServeError> {
        let listener = self.inner.listener.lock().take();
        let Some(listener) = listener else {
            self.inner.finished.cancelled().await;
            return Ok(());
        };

        let accept = &self.inner.engine.config().accept;
        let mut backoff = Backoff::new(
            Duration::from_millis(accept.backoff_base_ms),
            Duration::from_millis(accept.backoff_max_ms),
        );

        let res = loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    backoff.reset();
                    self.accept(stream, peer_addr);
                }
                Err(err) if is_transient(&err) => {
                    let delay = backoff.next();
                    warn!(%err, ?delay, "transient accept error");
                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    break Err(ServeError::Accept(err));
                }
            }
        };

        drop(listener);
        info!(local_addr = %self.inner.local_addr, "listener closed");
        self.teardown().await;
        res
    }

    /// Serves until Ctrl-C or `SIGTERM`, then shuts down gracefully.
    pub async fn run_until_signal(&self) -> Result<(), ServeError> {
        let serve = self.serve();
        tokio::pin!(serve);
        tokio::select! {
            res = &mut serve => res,
            _ = crate::signal::shutdown_signal() => {
                info!("shutdown signal received");
                self.shutdown();
                serve.await
            }
        }
    }

    /// Signals the accept loop to exit. Returns immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Signals shutdown and waits until every connection is stopped and the engine is shut down.
    pub async fn stop(&self) {
        self.shutdown();
        let listener = self.inner.listener.lock().take();
        if listener.is_some() {
            // Never served, nothing else will tear down
            drop(listener);
            self.teardown().await;
        } else {
            self.inner.finished.cancelled().await;
        }
    }

    fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer_addr, %err, "failed to set TCP_NODELAY");
        }
        let local_addr = stream.local_addr().ok();
        let conn = Connection::with_addrs(&self.inner.engine, stream, Some(peer_addr), local_addr);
        debug!(connection_id = %conn.id(), %peer_addr, "accepted connection");

        self.inner.registry.insert(conn.clone());
        tokio::spawn(async move {
            conn.start().await;
        });
    }

    async fn teardown(&self) {
        let registry = &self.inner.registry;
        debug!(sessions = registry.len(), "stopping connections");
        registry.stop_all();
        registry.wait_empty().await;
        self.inner.engine.shutdown().await;
        self.inner.finished.cancel();
        info!(local_addr = %self.inner.local_addr, "server stopped");
    }
}

impl<M> Clone for Server<M> {
    fn clone(&self) -> Self {
        Server {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Server<M>
where
    M: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("sessions", &self.inner.registry.len())
            .finish()
    }
}

/// Accept errors that clear up on their own, such as a peer resetting before the handshake
/// completed or the process running out of file descriptors for a moment.
fn is_transient(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        const ENOMEM: i32 = 12;
        const ENFILE: i32 = 23;
        const EMFILE: i32 = 24;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        const ENOBUFS: i32 = 105;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        const ENOBUFS: i32 = 55;

        if let Some(code) = err.raw_os_error() {
            return matches!(code, ENOMEM | ENFILE | EMFILE | ENOBUFS);
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{
        codec::{BytesCoder, LengthValue},
        config::EngineConfig,
        handler::{Callbacks, Event},
    };

    use super::*;

    fn echo_engine() -> Result<Engine<Bytes>, Box<dyn std::error::Error>> {
        let config = EngineConfig {
            linger_ms: 200,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(config)
            .handler(Callbacks::new().on_message(|event: Event<Bytes>| async move {
                let _ = event.conn.send(event.msg);
            }))
            .framer(LengthValue::default())
            .coder(BytesCoder)
            .build_with_builtins()?;
        Ok(engine)
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test]
    async fn echoes_and_stops_gracefully() -> Result<(), Box<dyn std::error::Error>> {
        let server = Server::bind(echo_engine()?, "127.0.0.1:0").await?;
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve().await }
        });

        let mut stream = TcpStream::connect(server.local_addr()).await?;
        stream.write_all(&[0, 0, 0, 4, b'p', b'i', b'n', b'g']).await?;
        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await?;
        assert_eq!(&reply[4..], b"ping");
        assert_eq!(server.sessions(), 1);

        server.shutdown();
        // The server half-closes; acknowledging it lets the connection finish
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await?;
        assert!(rest.is_empty());
        drop(stream);

        serving.await??;
        assert_eq!(server.sessions(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn stop_without_serving_returns() -> Result<(), Box<dyn std::error::Error>> {
        let server = Server::bind(echo_engine()?, "127.0.0.1:0").await?;
        tokio::time::timeout(Duration::from_secs(1), server.stop()).await?;
        assert!(server.serve().await.is_ok());

        Ok(())
    }
}
