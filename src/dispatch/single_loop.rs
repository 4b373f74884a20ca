use futures::future::BoxFuture;

use crate::error::TryPutError;

use super::{event_loop::EventLoop, Dispatcher, StopHandle, Task};

/// Runs every task on a single worker, in submission order.
///
/// Keys are ignored. This gives a strict total order over everything submitted, including the
/// messages and timers of unrelated connections, at the cost of any parallelism.
pub struct SingleLoop {
    event_loop: EventLoop,
}

impl SingleLoop {
    /// Creates a single-loop dispatcher whose queue holds up to `queue_size` tasks.
    pub fn new(queue_size: usize) -> Self {
        SingleLoop {
            event_loop: EventLoop::new("single_loop", 0, queue_size),
        }
    }
}

impl Dispatcher for SingleLoop {
    fn name(&self) -> &'static str {
        "single_loop"
    }

    fn start(&self) {
        self.event_loop.start();
    }

    fn put(&self, _key: u64, task: Task) -> BoxFuture<'_, ()> {
        Box::pin(self.event_loop.put(task))
    }

    fn try_put(&self, _key: u64, task: Task) -> Result<(), TryPutError> {
        self.event_loop.try_put(task)
    }

    fn stop_async(&self) -> StopHandle {
        StopHandle::new(self.event_loop.stop().cancelled_owned())
    }
}

impl std::fmt::Debug for SingleLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleLoop").finish_non_exhaustive()
    }
}
