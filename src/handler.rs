//! User hooks invoked over a connection's lifetime.
//!
//! Implement [`Handler`] for a type, or assemble one from closures with [`Callbacks`]. Every hook
//! runs as a dispatcher task keyed by the connection id, except `on_connected` and `on_close` when
//! the engine's [`HookMode`](crate::config::HookMode) is `Inline`.
//!
//! # Example
//!
//! ```
//! use futures::future::BoxFuture;
//! use rivet::handler::{Event, Handler};
//!
//! struct Echo;
//!
//! impl Handler<String> for Echo {
//!     fn on_message(&self, event: Event<String>) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             let _ = event.conn.send(event.msg);
//!         })
//!     }
//! }
//! ```

use std::{fmt, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use crate::connection::Connection;

/// A message received on a connection.
pub struct Event<M> {
    /// The connection the message arrived on.
    pub conn: Connection<M>,
    /// The decoded message.
    pub msg: M,
}

impl<M> fmt::Debug for Event<M>
where
    M: fmt::Debug + Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("conn", &self.conn.id())
            .field("msg", &self.msg)
            .finish()
    }
}

/// Application logic attached to an engine.
///
/// All methods take `&self`: a handler is shared by every connection of an engine. Keep per-connection
/// state in the connection's context store, or in your own map keyed by connection id.
pub trait Handler<M>: Send + Sync + 'static {
    /// Called once when a connection starts, before any of its messages are handled.
    fn on_connected(&self, conn: Connection<M>) -> BoxFuture<'_, ()> {
        let _ = conn;
        Box::pin(async {})
    }

    /// Called for every decoded message.
    fn on_message(&self, event: Event<M>) -> BoxFuture<'_, ()>;

    /// Called once when a connection begins shutting down.
    fn on_close(&self, conn: Connection<M>) -> BoxFuture<'_, ()> {
        let _ = conn;
        Box::pin(async {})
    }
}

type ConnHook<M> = Box<dyn Fn(Connection<M>) -> BoxFuture<'static, ()> + Send + Sync>;
type MessageHook<M> = Box<dyn Fn(Event<M>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A [`Handler`] built from closures.
///
/// ```
/// use rivet::handler::Callbacks;
///
/// let handler = Callbacks::<String>::new()
///     .on_connected(|conn| async move { println!("{} connected", conn.id()) })
///     .on_message(|event| async move {
///         let _ = event.conn.send(event.msg.to_uppercase());
///     });
/// ```
pub struct Callbacks<M> {
    connected: Option<ConnHook<M>>,
    message: Option<MessageHook<M>>,
    close: Option<ConnHook<M>>,
}

impl<M> Callbacks<M>
where
    M: Send + 'static,
{
    /// Creates a handler whose hooks all do nothing.
    pub fn new() -> Self {
        Callbacks {
            connected: None,
            message: None,
            close: None,
        }
    }

    /// Sets the `on_connected` hook.
    pub fn on_connected<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Connection<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connected = Some(Box::new(move |conn| f(conn).boxed()));
        self
    }

    /// Sets the `on_message` hook.
    pub fn on_message<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Event<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.message = Some(Box::new(move |event| f(event).boxed()));
        self
    }

    /// Sets the `on_close` hook.
    pub fn on_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Connection<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.close = Some(Box::new(move |conn| f(conn).boxed()));
        self
    }
}

impl<M> Default for Callbacks<M>
where
    M: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Handler<M> for Callbacks<M>
where
    M: Send + 'static,
{
    fn on_connected(&self, conn: Connection<M>) -> BoxFuture<'_, ()> {
        match &self.connected {
            Some(hook) => hook(conn),
            None => Box::pin(async {}),
        }
    }

    fn on_message(&self, event: Event<M>) -> BoxFuture<'_, ()> {
        match &self.message {
            Some(hook) => hook(event),
            None => Box::pin(async {}),
        }
    }

    fn on_close(&self, conn: Connection<M>) -> BoxFuture<'_, ()> {
        match &self.close {
            Some(hook) => hook(conn),
            None => Box::pin(async {}),
        }
    }
}

impl<M> fmt::Debug for Callbacks<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connected", &self.connected.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_close", &self.close.is_some())
            .finish()
    }
}

impl<M, H> Handler<M> for Arc<H>
where
    H: Handler<M> + ?Sized,
{
    fn on_connected(&self, conn: Connection<M>) -> BoxFuture<'_, ()> {
        (**self).on_connected(conn)
    }

    fn on_message(&self, event: Event<M>) -> BoxFuture<'_, ()> {
        (**self).on_message(event)
    }

    fn on_close(&self, conn: Connection<M>) -> BoxFuture<'_, ()> {
        (**self).on_close(conn)
    }
}
