//! Concurrency policies for running connection and timer callbacks.
//!
//! A [`Dispatcher`] accepts boxed futures together with a `u64` affinity key and decides on which
//! task they run. Connections use their id as the key, and timers use the id of the connection that
//! owns them, so a policy that respects keys also orders a connection's timer callbacks with its
//! messages.
//!
//! Three policies are provided:
//!
//! - [`SingleLoop`] runs everything on one worker, in submission order, regardless of key.
//! - [`Sharded`] runs a fixed set of single-loop workers and routes each task by `key % workers`.
//!   Tasks with the same key run strictly one after another, different keys run in parallel.
//! - [`Elastic`] grows a pool of reusable workers on demand up to a limit and retires idle ones.
//!   It gives no ordering guarantee.
//!
//! A panicking task is caught and logged. It never takes its worker down.
//!
//! # Example
//!
//! ```
//! use rivet::dispatch::{Dispatcher, Sharded};
//!
//! # tokio_test::block_on(async {
//! let dispatcher = Sharded::new(4, 64);
//! dispatcher.start();
//! dispatcher.put(7, Box::pin(async { println!("hello from shard 3") })).await;
//! dispatcher.stop().await;
//! # })
//! ```

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{future::BoxFuture, FutureExt};
use tracing::error;

use crate::error::{PanicError, TryPutError};

mod elastic;
mod event_loop;
mod sharded;
mod single_loop;

pub use elastic::Elastic;
pub use sharded::Sharded;
pub use single_loop::SingleLoop;

/// A unit of work handed to a dispatcher.
pub type Task = BoxFuture<'static, ()>;

/// Executes tasks under a concurrency policy.
///
/// Implementations must be safe to share between connections, timers and user code. Tasks are
/// tracked only until they run; the dispatcher never reports completion of an individual task.
pub trait Dispatcher: Send + Sync + 'static {
    /// The policy name, as registered in the plugin registry.
    fn name(&self) -> &'static str;

    /// Spawns the worker tasks. Calling it more than once has no effect.
    ///
    /// Must be called from within a Tokio runtime.
    fn start(&self);

    /// Submits a task, waiting for queue space when the policy's queue is full.
    ///
    /// The task is always eventually executed. Once the dispatcher is stopping, the task runs
    /// inline in the caller instead.
    fn put(&self, key: u64, task: Task) -> BoxFuture<'_, ()>;

    /// Submits a task without waiting.
    ///
    /// On failure the task is handed back inside the error so the caller can retry or run it some
    /// other way.
    fn try_put(&self, key: u64, task: Task) -> Result<(), TryPutError>;

    /// Begins stopping and returns a handle that resolves once every task accepted before this call
    /// has finished.
    fn stop_async(&self) -> StopHandle;

    /// Stops the dispatcher, waiting until it is drained.
    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_async())
    }
}

impl fmt::Debug for dyn Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.name())
            .finish()
    }
}

/// Resolves once a dispatcher has drained every task accepted before the stop began.
#[must_use = "a stop handle does nothing unless awaited"]
pub struct StopHandle(BoxFuture<'static, ()>);

impl StopHandle {
    pub(crate) fn new(fut: impl Future<Output = ()> + Send + 'static) -> Self {
        StopHandle(Box::pin(fut))
    }
}

impl Future for StopHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.0.as_mut().poll(cx)
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle").finish_non_exhaustive()
    }
}

/// Runs a task, catching and logging a panic.
pub(crate) async fn run_task(task: Task) {
    if let Err(err) = AssertUnwindSafe(task).catch_unwind().await {
        let err = PanicError::new_boxed(err);
        error!(%err, "dispatched task panicked");
    }
}
