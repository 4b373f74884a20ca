//! A single connection and its lifecycle.
//!
//! A [`Connection`] moves through `Ready → Running → Stopping → Stopped`, each step taken by
//! compare-and-swap, so concurrent callers agree on who performs it. Once running, two tasks serve
//! it: a read loop that decodes frames and dispatches them to the handler, and a write loop that
//! drains the [outbound queue](crate::outbound) in batches.
//!
//! # Shutdown
//!
//! [`stop`](Connection::stop) returns immediately. A shutdown task then runs the `on_close` hook,
//! fires the close signal, and enqueues the end marker behind any messages already sent. The write
//! loop flushes those messages, shuts down the write half of the transport, and arms a read deadline
//! of [`linger`](crate::config::EngineConfig::linger). Writes are themselves bounded by `linger`
//! from the close signal, so a peer that stops reading cannot hold the write loop. The read loop
//! keeps delivering what the peer still sends until the peer closes its side or the deadline
//! passes. Only after both loops have
//! exited is the connection removed from its registry and marked stopped.
//!
//! This half-close means a peer receives every message sent before `stop`, and it bounds how long a
//! silent peer can hold a connection open.

use std::{
    any::Any,
    borrow::Cow,
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, error, trace};

use crate::{
    config::HookMode,
    dispatch::Task,
    engine::Engine,
    error::{CodecError, PanicError, SendError},
    handler::Event,
    id::{ConnectionId, TimerId},
    outbound::{self, Outbound, OutboundReceiver, OutboundSender},
    registry::WeakRegistry,
};

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// The lifecycle state of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Created but not started.
    Ready = 0,
    /// Reading and writing.
    Running = 1,
    /// Shutting down.
    Stopping = 2,
    /// Both loops have exited and the transport is closed.
    Stopped = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Ready,
            1 => ConnectionState::Running,
            2 => ConnectionState::Stopping,
            _ => ConnectionState::Stopped,
        }
    }
}

/// Transport halves and the outbound consumer, held until the loops are spawned.
struct Io<M> {
    reader: Reader,
    writer: Writer,
    outbound: OutboundReceiver<M>,
}

struct Inner<M> {
    id: ConnectionId,
    state: AtomicU8,
    engine: Engine<M>,
    outbound: OutboundSender<M>,
    io: Mutex<Option<Io<M>>>,
    loops: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    loops_spawned: CancellationToken,
    close: CancellationToken,
    close_deadline: OnceLock<Instant>,
    terminated: CancellationToken,
    read_deadline: watch::Sender<Option<Instant>>,
    registry: Mutex<Option<WeakRegistry<M>>>,
    repeating_timers: Mutex<Vec<TimerId>>,
    ctx: DashMap<Cow<'static, str>, Arc<dyn Any + Send + Sync>>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

/// A handle to one connection. Cloning it yields another handle to the same connection.
pub struct Connection<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Connection<M>
where
    M: Send + 'static,
{
    /// Wraps a transport in a connection served by `engine`.
    ///
    /// The connection does nothing until [`start`](Self::start) is called.
    pub fn new<T>(engine: &Engine<M>, transport: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_addrs(engine, transport, None, None)
    }

    /// Like [`new`](Self::new), recording the peer and local socket addresses.
    pub fn with_addrs<T>(
        engine: &Engine<M>,
        transport: T,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(transport);
        let (tx, rx) = outbound::channel(engine.config().outbound_capacity);
        let (read_deadline, _) = watch::channel(None);

        Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::generate(),
                state: AtomicU8::new(ConnectionState::Ready as u8),
                engine: engine.clone(),
                outbound: tx,
                io: Mutex::new(Some(Io {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    outbound: rx,
                })),
                loops: Mutex::new(None),
                loops_spawned: CancellationToken::new(),
                close: CancellationToken::new(),
                close_deadline: OnceLock::new(),
                terminated: CancellationToken::new(),
                read_deadline,
                registry: Mutex::new(None),
                repeating_timers: Mutex::new(Vec::new()),
                ctx: DashMap::new(),
                peer_addr,
                local_addr,
            }),
        }
    }

    /// The process-unique id of this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns `true` while the connection is running.
    pub fn is_running(&self) -> bool {
        self.state() == ConnectionState::Running
    }

    /// The remote address, if the transport has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// The local address, if the transport has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    /// The engine serving this connection.
    pub fn engine(&self) -> &Engine<M> {
        &self.inner.engine
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ConnectionState> {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ConnectionState::from_u8)
    }

    /// Starts the connection.
    ///
    /// Runs the `on_connected` hook, inline or through the dispatcher depending on the engine's
    /// [`HookMode`], and then spawns the read and write loops. A dispatched hook is queued before
    /// the loops exist, so it precedes every message callback under the single-loop and sharded
    /// policies. Returns `false` if the connection was not in the `Ready` state.
    pub async fn start(&self) -> bool {
        if self
            .transition(ConnectionState::Ready, ConnectionState::Running)
            .is_err()
        {
            return false;
        }
        let Some(io) = self.inner.io.lock().take() else {
            return false;
        };

        let engine = &self.inner.engine;
        engine.start();
        debug!(connection_id = %self.id(), peer = ?self.peer_addr(), "connection started");

        let handler = engine.handler().clone();
        let conn = self.clone();
        let hook = async move { handler.on_connected(conn).await };
        match engine.config().hook_mode {
            HookMode::Inline => run_hook(self.id(), "on_connected", hook).await,
            HookMode::Dispatched => {
                engine
                    .dispatcher()
                    .put(self.key(), Box::pin(hook))
                    .await
            }
        }

        let deadline = self.inner.read_deadline.subscribe();
        let read = tokio::spawn(read_loop(self.clone(), io.reader, deadline));
        let write = tokio::spawn(write_loop(self.clone(), io.writer, io.outbound));
        *self.inner.loops.lock() = Some((read, write));
        self.inner.loops_spawned.cancel();

        true
    }

    /// Begins an orderly shutdown and returns without waiting for it.
    ///
    /// Only the first call on a running connection has an effect and returns `true`. A connection
    /// that was never started moves straight to `Stopped`. Use [`wait_for_stop`](Self::wait_for_stop)
    /// to wait for the shutdown to complete.
    pub fn stop(&self) -> bool {
        match self.transition(ConnectionState::Running, ConnectionState::Stopping) {
            Ok(()) => {
                debug!(connection_id = %self.id(), "connection stopping");
                tokio::spawn(self.clone().shutdown());
                true
            }
            Err(ConnectionState::Ready) => {
                if self
                    .transition(ConnectionState::Ready, ConnectionState::Stopped)
                    .is_err()
                {
                    return false;
                }
                self.inner.io.lock().take();
                self.inner.close.cancel();
                self.deregister();
                self.inner.terminated.cancel();
                debug!(connection_id = %self.id(), "unstarted connection discarded");
                true
            }
            Err(_) => false,
        }
    }

    /// Waits until the connection has fully stopped.
    pub async fn wait_for_stop(&self) {
        self.inner.terminated.cancelled().await;
    }

    /// Queues a message for the write loop without waiting.
    ///
    /// Messages sent before [`stop`](Self::stop) is called reach the peer before it observes end of
    /// stream. Fails with [`SendError::Closed`] once the connection is stopping. A send racing with
    /// `stop` may be accepted and still be dropped, since it can land behind the end marker.
    pub fn send(&self, msg: M) -> Result<(), SendError<M>> {
        match self.state() {
            ConnectionState::Ready | ConnectionState::Running => {
                self.inner.outbound.put(msg);
                Ok(())
            }
            ConnectionState::Stopping | ConnectionState::Stopped => Err(SendError::Closed(msg)),
        }
    }

    /// Number of messages waiting for the write loop.
    pub fn pending(&self) -> usize {
        self.inner.outbound.len()
    }

    /// Runs `f` at `deadline` through the dispatcher, keyed by this connection.
    ///
    /// Returns `None` when the engine has no timer wheel. The callback is skipped if every handle to
    /// the connection has been dropped by then.
    pub fn run_at<F, Fut>(&self, deadline: Instant, f: F) -> Option<TimerId>
    where
        F: Fn(Connection<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_timer(deadline, Duration::ZERO, f)
    }

    /// Runs `f` once after `delay`.
    pub fn run_after<F, Fut>(&self, delay: Duration, f: F) -> Option<TimerId>
    where
        F: Fn(Connection<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_timer(Instant::now() + delay, Duration::ZERO, f)
    }

    /// Runs `f` every `interval`, starting one interval from now, until cancelled or the connection
    /// stops.
    pub fn run_every<F, Fut>(&self, interval: Duration, f: F) -> Option<TimerId>
    where
        F: Fn(Connection<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.add_timer(Instant::now() + interval, interval, f)?;
        self.inner.repeating_timers.lock().push(id);
        Some(id)
    }

    /// Cancels a timer created through this connection. Returns `false` if it already fired or was
    /// cancelled.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.repeating_timers.lock().retain(|timer| *timer != id);
        self.inner
            .engine
            .timers()
            .is_some_and(|timers| timers.cancel_timer(id))
    }

    fn add_timer<F, Fut>(&self, deadline: Instant, interval: Duration, f: F) -> Option<TimerId>
    where
        F: Fn(Connection<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timers = self.inner.engine.timers()?;
        let weak = Arc::downgrade(&self.inner);
        let callback = move |_now: Instant| -> Task {
            match Weak::upgrade(&weak) {
                Some(inner) => Box::pin(f(Connection { inner })),
                None => Box::pin(async {}),
            }
        };

        Some(timers.add_timer(deadline, interval, self.key(), callback))
    }

    /// Stores a value in the connection's context.
    pub fn insert_ctx<T>(&self, key: impl Into<Cow<'static, str>>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.inner.ctx.insert(key.into(), Arc::new(value));
    }

    /// Looks up a context value of type `T`.
    pub fn get_ctx<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let value = self.inner.ctx.get(key)?.value().clone();
        value.downcast::<T>().ok()
    }

    /// Removes a context value. Returns `true` if it existed.
    pub fn remove_ctx(&self, key: &str) -> bool {
        self.inner.ctx.remove(key).is_some()
    }

    #[inline]
    fn key(&self) -> u64 {
        self.inner.id.as_u64()
    }

    pub(crate) fn attach_registry(&self, registry: WeakRegistry<M>) {
        *self.inner.registry.lock() = Some(registry);
    }

    fn deregister(&self) {
        let registry = self.inner.registry.lock().take();
        if let Some(registry) = registry {
            registry.remove(self.id());
        }
    }

    async fn shutdown(self) {
        let id = self.id();
        let engine = self.inner.engine.clone();

        let handler = engine.handler().clone();
        let conn = self.clone();
        let hook = async move { handler.on_close(conn).await };
        match engine.config().hook_mode {
            HookMode::Inline => run_hook(id, "on_close", hook).await,
            HookMode::Dispatched => engine.dispatcher().put(self.key(), Box::pin(hook)).await,
        }

        // Writes still pending when this passes are abandoned
        let linger = engine.config().linger();
        let _ = self.inner.close_deadline.set(Instant::now() + linger);
        self.inner.close.cancel();
        self.inner.outbound.close();

        // `start` may still be running the on_connected hook
        self.inner.loops_spawned.cancelled().await;
        let loops = self.inner.loops.lock().take();
        if let Some((read, write)) = loops {
            for (name, handle) in [("read", read), ("write", write)] {
                if let Err(err) = handle.await {
                    error!(connection_id = %id, loop_name = name, %err, "connection loop aborted");
                }
            }
        }

        let timers: Vec<_> = self.inner.repeating_timers.lock().drain(..).collect();
        if let Some(wheel) = engine.timers() {
            for timer in timers {
                wheel.cancel_timer(timer);
            }
        }

        self.deregister();
        self.inner
            .state
            .store(ConnectionState::Stopped as u8, Ordering::Release);
        self.inner.terminated.cancel();
        debug!(connection_id = %id, "connection stopped");
    }
}

impl<M> Clone for Connection<M> {
    fn clone(&self) -> Self {
        Connection {
            inner: self.inner.clone(),
        }
    }
}

impl<M> PartialEq for Connection<M> {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl<M> Eq for Connection<M> {}

impl<M> fmt::Debug for Connection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field(
                "state",
                &ConnectionState::from_u8(self.inner.state.load(Ordering::Relaxed)),
            )
            .field("peer_addr", &self.inner.peer_addr)
            .finish()
    }
}

async fn run_hook(id: ConnectionId, hook: &'static str, fut: impl Future<Output = ()>) {
    if let Err(err) = AssertUnwindSafe(fut).catch_unwind().await {
        let err = PanicError::new_boxed(err);
        error!(connection_id = %id, hook, %err, "connection hook panicked");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Resolves once the read deadline has passed, following any change made to it meanwhile.
async fn deadline_elapsed(deadline: &mut watch::Receiver<Option<Instant>>) {
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            res = deadline.changed() => {
                if res.is_err() {
                    sleep_until(current).await;
                    return;
                }
            }
            () = sleep_until(current) => return,
        }
    }
}

fn deadline_exit<M>(conn: &Connection<M>) -> ReadExit {
    if conn.inner.close.is_cancelled() {
        return ReadExit::Drained;
    }
    error!(connection_id = %conn.inner.id, "read deadline elapsed");
    ReadExit::Stop
}

/// Resolves once the close signal has fired and the close deadline has passed.
async fn close_expired<M>(conn: &Connection<M>) {
    conn.inner.close.cancelled().await;
    match conn.inner.close_deadline.get() {
        Some(deadline) => time::sleep_until(*deadline).await,
        None => std::future::pending().await,
    }
}

/// Runs a write, giving up once the close deadline has passed.
async fn write_bounded<M>(
    conn: &Connection<M>,
    write: impl Future<Output = Result<(), CodecError>>,
) -> Result<(), CodecError> {
    tokio::select! {
        res = write => res,
        () = close_expired(conn) => Err(CodecError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer stopped reading before the close deadline",
        ))),
    }
}

enum ReadExit {
    /// The peer closed its side, or reading failed. The connection must stop.
    Stop,
    /// The read deadline passed after our own close. Nothing left to do.
    Drained,
}

async fn read_loop<M>(
    conn: Connection<M>,
    reader: Reader,
    mut deadline: watch::Receiver<Option<Instant>>,
) where
    M: Send + 'static,
{
    let id = conn.id();
    trace!(connection_id = %id, "read loop started");
    let mut framed = FramedRead::new(reader, conn.inner.engine.codec());

    let res = AssertUnwindSafe(async {
        loop {
            let item = tokio::select! {
                item = framed.next() => item,
                () = deadline_elapsed(&mut deadline) => return deadline_exit(&conn),
            };

            match item {
                Some(Ok(msg)) => {
                    let engine = &conn.inner.engine;
                    let handler = engine.handler().clone();
                    let event = Event {
                        conn: conn.clone(),
                        msg,
                    };
                    let put = engine.dispatcher().put(
                        conn.key(),
                        Box::pin(async move { handler.on_message(event).await }),
                    );
                    tokio::select! {
                        () = put => {}
                        () = deadline_elapsed(&mut deadline) => {
                            debug!(connection_id = %id, "read deadline elapsed while dispatching");
                            return deadline_exit(&conn);
                        }
                    }
                }
                Some(Err(err)) => {
                    error!(connection_id = %id, %err, "read failed");
                    return ReadExit::Stop;
                }
                None => {
                    debug!(connection_id = %id, "peer closed the connection");
                    return ReadExit::Stop;
                }
            }
        }
    })
    .catch_unwind()
    .await;

    match res {
        Ok(ReadExit::Stop) => {
            conn.stop();
        }
        Ok(ReadExit::Drained) => {
            trace!(connection_id = %id, "read side drained after close");
        }
        Err(err) => {
            let err = PanicError::new_boxed(err);
            error!(connection_id = %id, %err, "read loop panicked");
            conn.stop();
        }
    }
    trace!(connection_id = %id, "read loop exited");
}

async fn write_loop<M>(conn: Connection<M>, writer: Writer, mut outbound: OutboundReceiver<M>)
where
    M: Send + 'static,
{
    let id = conn.id();
    trace!(connection_id = %id, "write loop started");
    let mut framed = FramedWrite::new(writer, conn.inner.engine.codec());

    let res = AssertUnwindSafe(write_batches(&conn, &mut framed, &mut outbound))
        .catch_unwind()
        .await;
    match res {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(connection_id = %id, %err, "write failed");
            conn.stop();
        }
        Err(err) => {
            let err = PanicError::new_boxed(err);
            error!(connection_id = %id, %err, "write loop panicked");
            conn.stop();
        }
    }

    // Half-close: flush and shut down our side, then give the peer a bounded time to finish
    if let Err(err) = write_bounded(&conn, framed.close()).await {
        debug!(connection_id = %id, %err, "write shutdown failed");
    }
    let now = Instant::now();
    let read_deadline = match conn.inner.close_deadline.get() {
        // The peer already used up its time while we were writing
        Some(deadline) if *deadline <= now => now,
        _ => now + conn.inner.engine.config().linger(),
    };
    conn.inner.read_deadline.send_replace(Some(read_deadline));
    trace!(connection_id = %id, "write loop exited");
}

async fn write_batches<M>(
    conn: &Connection<M>,
    framed: &mut FramedWrite<Writer, crate::codec::FrameCodec<M>>,
    outbound: &mut OutboundReceiver<M>,
) -> Result<(), CodecError>
where
    M: Send + 'static,
{
    let close = &conn.inner.close;
    let mut batch = Vec::with_capacity(conn.inner.engine.config().outbound_capacity);

    loop {
        let closing = close.is_cancelled();
        // After the close signal only the end marker can finish the loop
        let picked = if closing {
            outbound.pick(&mut batch).await
        } else {
            outbound.pick_with_cancel(close, &mut batch).await
        };
        if picked == 0 {
            if closing {
                return Ok(());
            }
            continue;
        }

        let mut finished = false;
        for entry in batch.drain(..) {
            match entry {
                Outbound::Message(msg) => write_bounded(conn, framed.feed(msg)).await?,
                Outbound::End => {
                    finished = true;
                    break;
                }
            }
        }
        write_bounded(conn, framed.flush()).await?;

        if finished {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{
        codec::{BytesCoder, LengthValue},
        config::EngineConfig,
        handler::Callbacks,
    };

    use super::*;

    fn engine(handler: Callbacks<Bytes>, linger: Duration) -> Engine<Bytes> {
        let config = EngineConfig {
            linger_ms: linger.as_millis() as u64,
            ..EngineConfig::default()
        };
        Engine::builder(config)
            .handler(handler)
            .framer(LengthValue::default())
            .coder(BytesCoder)
            .build_with_builtins()
            .expect("engine")
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn concurrent_stop_shuts_down_once() -> Result<(), Box<dyn std::error::Error>> {
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        let engine = engine(
            Callbacks::new().on_close(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
            Duration::from_millis(200),
        );
        let (local, _peer) = tokio::io::duplex(1024);
        let conn = Connection::new(&engine, local);
        assert!(conn.start().await);

        let stops: Vec<_> = (0..16)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.stop() })
            })
            .collect();
        let mut won = 0;
        for stop in stops {
            if stop.await? {
                won += 1;
            }
        }
        assert_eq!(won, 1);

        conn.wait_for_stop().await;
        assert_eq!(conn.state(), ConnectionState::Stopped);
        engine.shutdown().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!conn.stop());

        Ok(())
    }

    #[tokio::test]
    async fn messages_sent_before_stop_arrive_before_eof() -> Result<(), Box<dyn std::error::Error>>
    {
        let engine = engine(Callbacks::new(), Duration::from_secs(5));
        let (local, mut peer) = tokio::io::duplex(1024);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        for body in [&b"one"[..], b"two", b"three"] {
            conn.send(Bytes::copy_from_slice(body))?;
        }
        conn.stop();
        assert!(conn.send(Bytes::from_static(b"late")).is_err());

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await?;
        let expected: Vec<u8> = [&b"one"[..], b"two", b"three"]
            .iter()
            .flat_map(|body| frame(body))
            .collect();
        assert_eq!(received, expected);

        // Acknowledge the half-close so the connection stops without lingering
        peer.shutdown().await?;
        tokio::time::timeout(Duration::from_secs(1), conn.wait_for_stop()).await?;
        engine.shutdown().await;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_bounded_by_linger() -> Result<(), Box<dyn std::error::Error>> {
        let linger = Duration::from_secs(5);
        let engine = engine(Callbacks::new(), linger);
        // The peer half is kept alive and never closes
        let (local, _peer) = tokio::io::duplex(1024);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        let started = Instant::now();
        conn.stop();
        conn.wait_for_stop().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= linger, "stopped after {elapsed:?}");
        assert!(elapsed < linger + Duration::from_secs(1), "stopped after {elapsed:?}");
        engine.shutdown().await;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_stops_reading_is_bounded_by_linger(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let linger = Duration::from_millis(200);
        let engine = engine(Callbacks::new(), linger);
        // The peer stays connected but never reads, so the pipe fills up
        let (local, _peer) = tokio::io::duplex(64);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        conn.send(Bytes::from(vec![7u8; 4096]))?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        conn.stop();
        tokio::time::timeout(Duration::from_secs(3), conn.wait_for_stop()).await?;
        let elapsed = started.elapsed();
        assert!(elapsed >= linger, "stopped after {elapsed:?}");
        assert!(elapsed < linger * 2, "stopped after {elapsed:?}");
        assert_eq!(conn.state(), ConnectionState::Stopped);
        engine.shutdown().await;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_dispatcher_does_not_outlast_linger(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let linger = Duration::from_millis(200);
        let release = CancellationToken::new();
        let handler_release = release.clone();
        let config = EngineConfig {
            dispatcher: "single_loop".to_string(),
            single_loop: crate::config::SingleLoopConfig { queue_size: 1 },
            hook_mode: HookMode::Inline,
            linger_ms: linger.as_millis() as u64,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(config)
            .handler(Callbacks::new().on_message(move |_: Event<Bytes>| {
                let release = handler_release.clone();
                async move { release.cancelled().await }
            }))
            .framer(LengthValue::default())
            .coder(BytesCoder)
            .build_with_builtins()?;
        let (local, mut peer) = tokio::io::duplex(1024);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        // One message blocks the worker, one fills the queue, the rest hold up the read loop
        for i in 0..4u8 {
            peer.write_all(&frame(&[i])).await?;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        conn.stop();
        tokio::time::timeout(Duration::from_secs(3), conn.wait_for_stop()).await?;
        let elapsed = started.elapsed();
        assert!(elapsed >= linger, "stopped after {elapsed:?}");
        assert!(elapsed < linger * 2, "stopped after {elapsed:?}");

        release.cancel();
        engine.shutdown().await;
        drop(peer);

        Ok(())
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_handler_in_order()-> Result<(), Box<dyn std::error::Error>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let engine = engine(
            Callbacks::new().on_message(move |event: Event<Bytes>| {
                let record = record.clone();
                async move { record.lock().push(event.msg) }
            }),
            Duration::from_millis(100),
        );
        let (local, mut peer) = tokio::io::duplex(64);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        for i in 0..50u32 {
            peer.write_all(&frame(&i.to_be_bytes())).await?;
        }
        peer.shutdown().await?;

        tokio::time::timeout(Duration::from_secs(5), conn.wait_for_stop()).await?;
        engine.shutdown().await;

        let seen: Vec<u32> = seen
            .lock()
            .iter()
            .map(|msg| u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]))
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());

        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_stops_the_connection() -> Result<(), Box<dyn std::error::Error>> {
        let config = EngineConfig {
            linger_ms: 100,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(config)
            .handler(Callbacks::<Bytes>::new())
            .framer(LengthValue::new(16))
            .coder(BytesCoder)
            .build_with_builtins()?;
        let (local, mut peer) = tokio::io::duplex(64);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        peer.write_all(&1024u32.to_be_bytes()).await?;
        tokio::time::timeout(Duration::from_secs(2), conn.wait_for_stop()).await?;
        assert_eq!(conn.state(), ConnectionState::Stopped);
        engine.shutdown().await;

        Ok(())
    }

    #[tokio::test]
    async fn on_connected_precedes_messages() -> Result<(), Box<dyn std::error::Error>> {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (connected, message) = (order.clone(), order.clone());
        let engine = engine(
            Callbacks::new()
                .on_connected(move |_| {
                    let connected = connected.clone();
                    async move {
                        tokio::task::yield_now().await;
                        connected.lock().push("connected");
                    }
                })
                .on_message(move |_| {
                    let message = message.clone();
                    async move { message.lock().push("message") }
                }),
            Duration::from_millis(100),
        );
        let (local, mut peer) = tokio::io::duplex(64);
        peer.write_all(&frame(b"hi")).await?;
        peer.shutdown().await?;

        let conn = Connection::new(&engine, local);
        conn.start().await;
        tokio::time::timeout(Duration::from_secs(2), conn.wait_for_stop()).await?;
        engine.shutdown().await;

        assert_eq!(*order.lock(), ["connected", "message"]);

        Ok(())
    }

    #[tokio::test]
    async fn context_store_is_typed() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine(Callbacks::new(), Duration::from_millis(10));
        let (local, _peer) = tokio::io::duplex(64);
        let conn = Connection::new(&engine, local);

        conn.insert_ctx("user", String::from("ferris"));
        assert_eq!(conn.get_ctx::<String>("user").as_deref().map(String::as_str), Some("ferris"));
        assert!(conn.get_ctx::<u32>("user").is_none());
        assert!(conn.remove_ctx("user"));
        assert!(!conn.remove_ctx("user"));

        assert!(conn.stop());
        assert_eq!(conn.state(), ConnectionState::Stopped);

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_stops_with_the_connection() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine(Callbacks::new(), Duration::from_millis(10));
        let (local, mut peer) = tokio::io::duplex(64);
        let conn = Connection::new(&engine, local);
        conn.start().await;

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        conn.run_every(Duration::from_secs(1), move |conn| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = conn.send(Bytes::from_static(b"tick"));
            }
        })
        .ok_or("timers disabled")?;

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        conn.stop();
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await?;
        assert_eq!(buf.len(), 3 * frame(b"tick").len());
        drop(peer);
        conn.wait_for_stop().await;

        assert_eq!(engine.timers().map(|timers| timers.len()), Some(0));
        engine.shutdown().await;

        Ok(())
    }
}
