//! Defines error handling constructs for rivet.
//!
//! Transport and protocol errors never leave a connection: they are logged and the connection is
//! stopped. The types here cover what callers can observe directly, such as saturation of a
//! dispatcher, sending on a closed connection, codec failures and configuration mistakes caught at
//! startup.

use std::{
    any::Any,
    borrow::Cow,
    error, fmt, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::dispatch::Task;

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Error returned by [`Dispatcher::try_put`](crate::dispatch::Dispatcher::try_put).
///
/// Both variants hand the task back so the caller can retry or run it some other way.
#[derive(thiserror::Error)]
pub enum TryPutError {
    /// The target queue is full, or the elastic pool reached its worker limit.
    #[error("dispatcher queue full")]
    Full(Task),
    /// The dispatcher has been stopped.
    #[error("dispatcher stopped")]
    Stopped(Task),
}

impl TryPutError {
    /// Returns the task that could not be dispatched.
    pub fn into_task(self) -> Task {
        match self {
            TryPutError::Full(task) | TryPutError::Stopped(task) => task,
        }
    }

    /// Returns `true` if the error was caused by a full queue.
    pub fn is_full(&self) -> bool {
        matches!(self, TryPutError::Full(_))
    }
}

impl fmt::Debug for TryPutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPutError::Full(_) => write!(f, "Full"),
            TryPutError::Stopped(_) => write!(f, "Stopped"),
        }
    }
}

/// Error returned when sending a message on a connection.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError<M> {
    /// The connection is stopping or stopped. The message is returned.
    #[error("connection closed")]
    Closed(M),
}

impl<M> SendError<M> {
    /// Returns the message that could not be sent.
    pub fn into_inner(self) -> M {
        match self {
            SendError::Closed(msg) => msg,
        }
    }
}

impl<M> fmt::Debug for SendError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Closed(_) => write!(f, "Closed"),
        }
    }
}

/// An error raised while framing, encoding or decoding a message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An I/O error on the underlying transport.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A frame announced a length above the configured limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Maximum accepted frame length.
        max: usize,
    },
    /// A frame header was malformed.
    #[error("malformed frame: {0}")]
    Malformed(Cow<'static, str>),
    /// No decoder is registered for the message id.
    #[error("unknown message id {0}")]
    UnknownMessage(u32),
    /// Serialization of an outgoing message failed.
    #[error("failed to encode message: {0}")]
    Encode(BoxError),
    /// Deserialization of an incoming message failed.
    #[error("failed to decode message: {0}")]
    Decode(BoxError),
}

/// An error raised when registering or looking up plugins and message ids.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A plugin or message id was registered twice.
    #[error("duplicate {kind} registration '{name}'")]
    Duplicate {
        /// What kind of entry was registered.
        kind: &'static str,
        /// The offending name or id.
        name: String,
    },
    /// A plugin was looked up by a name that was never registered.
    #[error("no {kind} registered under '{name}'")]
    Missing {
        /// What kind of entry was looked up.
        kind: &'static str,
        /// The name that was looked up.
        name: String,
    },
}

/// An error raised while loading configuration or building an engine.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    /// The configuration could not be parsed.
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is out of range.
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// The field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
    /// A plugin lookup or registration failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// An error returned from [`Server::serve`](crate::server::Server::serve) and related setup calls.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Binding the listener failed.
    #[error("failed to bind listener: {0}")]
    Bind(io::Error),
    /// Accepting failed with an error that is not retried.
    #[error("fatal accept error: {0}")]
    Accept(io::Error),
    /// Building the engine failed.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A shared error that occurs when a dispatched task, a connection loop or a hook panics.
#[derive(Clone)]
#[allow(missing_debug_implementations)]
pub struct PanicError(Arc<Mutex<Box<dyn Any + Send>>>);

impl PanicError {
    /// Creates a new PanicError from the boxed payload returned by `catch_unwind`.
    pub fn new_boxed(err: Box<dyn Any + Send>) -> Self {
        PanicError(Arc::new(Mutex::new(err)))
    }

    /// Calls the passed closure `f` with the panic message, or `None` if the payload is not a string.
    pub fn with_str<F, R>(
        &self,
        f: F,
    ) -> Result<Option<R>, PoisonError<MutexGuard<'_, Box<dyn Any + Send>>>>
    where
        F: FnOnce(&str) -> R,
    {
        self.with(|any| payload_str(any).map(f))
    }

    /// Returns a reference to the payload as a `Box<dyn Any + Send>`.
    pub fn with<F, R>(&self, f: F) -> Result<R, PoisonError<MutexGuard<'_, Box<dyn Any + Send>>>>
    where
        F: FnOnce(&Box<dyn Any + Send>) -> R,
    {
        let lock = self.0.lock()?;
        Ok(f(&lock))
    }
}

fn payload_str(any: &Box<dyn Any + Send>) -> Option<&str> {
    // Payloads are strings if raised with the `std::panic!` macro
    any.downcast_ref::<&'static str>()
        .copied()
        .or_else(|| any.downcast_ref::<String>().map(String::as_str))
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with(|any| {
            if let Some(s) = payload_str(any) {
                return write!(f, "panicked: {s}");
            }

            if let Some(err) = any.downcast_ref::<BoxError>() {
                return write!(f, "panicked: {err}");
            }

            write!(f, "panicked")
        })
        .ok()
        .unwrap_or_else(|| write!(f, "panicked"))
    }
}
