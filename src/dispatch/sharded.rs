use std::fmt;

use futures::future::{join_all, BoxFuture};

use crate::error::TryPutError;

use super::{event_loop::EventLoop, Dispatcher, StopHandle, Task};

/// Routes tasks to a fixed set of workers by `key % workers`.
///
/// All tasks with the same key run one after another on the same worker, so per-connection state
/// touched only from that connection's callbacks needs no further synchronization. Tasks with
/// different keys may run in parallel.
pub struct Sharded {
    shards: Vec<EventLoop>,
}

impl Sharded {
    /// Creates a dispatcher with `workers` shards, each with a queue of `queue_size` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is 0.
    pub fn new(workers: usize, queue_size: usize) -> Self {
        assert_ne!(workers, 0, "a sharded dispatcher needs at least one worker");

        Sharded {
            shards: (0..workers)
                .map(|index| EventLoop::new("sharded", index, queue_size))
                .collect(),
        }
    }

    /// Number of shards.
    pub fn workers(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: u64) -> &EventLoop {
        &self.shards[(key % self.shards.len() as u64) as usize]
    }
}

impl Dispatcher for Sharded {
    fn name(&self) -> &'static str {
        "sharded"
    }

    fn start(&self) {
        for shard in &self.shards {
            shard.start();
        }
    }

    fn put(&self, key: u64, task: Task) -> BoxFuture<'_, ()> {
        Box::pin(self.shard(key).put(task))
    }

    fn try_put(&self, key: u64, task: Task) -> Result<(), TryPutError> {
        self.shard(key).try_put(task)
    }

    fn stop_async(&self) -> StopHandle {
        let done: Vec<_> = self
            .shards
            .iter()
            .map(|shard| shard.stop().cancelled_owned())
            .collect();
        StopHandle::new(async move {
            join_all(done).await;
        })
    }
}

impl fmt::Debug for Sharded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sharded")
            .field("workers", &self.shards.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_runs_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = Sharded::new(4, 8);
        dispatcher.start();
        let seen: Arc<Mutex<Vec<Vec<u32>>>> = Arc::new(Mutex::new(vec![Vec::new(); 3]));

        for i in 0..300u32 {
            let key = (i % 3) as u64;
            let seen = seen.clone();
            dispatcher
                .put(key, Box::pin(async move { seen.lock()[key as usize].push(i) }))
                .await;
        }
        dispatcher.stop().await;

        for (key, values) in seen.lock().iter().enumerate() {
            let expected: Vec<u32> = (0..300).filter(|i| (i % 3) as usize == key).collect();
            assert_eq!(values, &expected);
        }

        Ok(())
    }
}
