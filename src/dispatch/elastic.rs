use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TryPutError;

use super::{run_task, Dispatcher, StopHandle, Task};

struct Assignment {
    task: Task,
    /// Handed back so the worker can re-enlist itself without holding its own sender while idle.
    handle: mpsc::Sender<Assignment>,
}

struct IdleWorker {
    tx: mpsc::Sender<Assignment>,
    since: Instant,
}

#[derive(Default)]
struct Pool {
    /// Idle workers, most recently parked last.
    idle: Vec<IdleWorker>,
    live: usize,
    stopping: bool,
}

struct Shared {
    max_workers: usize,
    idle_timeout: Duration,
    pool: Mutex<Pool>,
    sweep_started: AtomicBool,
    sweeper: CancellationToken,
    done: CancellationToken,
}

/// A self-scaling pool of reusable worker tasks.
///
/// Each task goes to the most recently parked idle worker, or to a freshly spawned one while the
/// number of live workers is below `max_workers`. At the limit, [`put`](Dispatcher::put) runs the
/// task inline in the caller and [`try_put`](Dispatcher::try_put) reports the pool as full. A
/// background sweep retires workers that sat idle for longer than the idle timeout.
///
/// There is no ordering guarantee, not even for tasks sharing a key.
pub struct Elastic {
    shared: Arc<Shared>,
}

impl Elastic {
    /// Creates an elastic dispatcher.
    pub fn new(max_workers: usize, idle_timeout: Duration) -> Self {
        Elastic {
            shared: Arc::new(Shared {
                max_workers: max_workers.max(1),
                idle_timeout,
                pool: Mutex::new(Pool::default()),
                sweep_started: AtomicBool::new(false),
                sweeper: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    /// Number of live workers, busy or idle.
    pub fn live_workers(&self) -> usize {
        self.shared.pool.lock().live
    }

    /// Number of parked workers.
    pub fn idle_workers(&self) -> usize {
        self.shared.pool.lock().idle.len()
    }

    /// Hands the task to a worker, or returns it when the pool is stopping or at its limit.
    fn dispatch(&self, mut task: Task) -> Result<(), TryPutError> {
        loop {
            let mut pool = self.shared.pool.lock();
            if pool.stopping {
                return Err(TryPutError::Stopped(task));
            }

            if let Some(worker) = pool.idle.pop() {
                drop(pool);
                let handle = worker.tx.clone();
                match worker.tx.try_send(Assignment { task, handle }) {
                    Ok(()) => return Ok(()),
                    // The worker is on its way out, try the next one
                    Err(TrySendError::Full(assignment) | TrySendError::Closed(assignment)) => {
                        task = assignment.task;
                        continue;
                    }
                }
            }

            if pool.live >= self.shared.max_workers {
                return Err(TryPutError::Full(task));
            }
            pool.live += 1;
            drop(pool);

            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(worker(self.shared.clone(), task, tx, rx));
            return Ok(());
        }
    }
}

async fn worker(
    shared: Arc<Shared>,
    task: Task,
    handle: mpsc::Sender<Assignment>,
    mut rx: mpsc::Receiver<Assignment>,
) {
    trace!("elastic worker started");
    let mut next = Some((task, handle));
    while let Some((task, handle)) = next.take() {
        run_task(task).await;

        {
            let mut pool = shared.pool.lock();
            if pool.stopping {
                break;
            }
            pool.idle.push(IdleWorker {
                tx: handle,
                since: Instant::now(),
            });
        }

        // `None` once the sweep or a stop dropped our idle entry
        next = rx
            .recv()
            .await
            .map(|assignment| (assignment.task, assignment.handle));
    }

    let mut pool = shared.pool.lock();
    pool.live -= 1;
    if pool.stopping && pool.live == 0 {
        shared.done.cancel();
    }
    trace!("elastic worker retired");
}

async fn sweep(shared: Arc<Shared>) {
    let mut interval = time::interval(shared.idle_timeout);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shared.sweeper.cancelled() => break,
            _ = interval.tick() => {
                let now = Instant::now();
                let mut pool = shared.pool.lock();
                let before = pool.idle.len();
                pool.idle
                    .retain(|worker| now.duration_since(worker.since) < shared.idle_timeout);
                let retired = before - pool.idle.len();
                if retired > 0 {
                    debug!(retired, live = pool.live, "retired idle elastic workers");
                }
            }
        }
    }
}

impl Dispatcher for Elastic {
    fn name(&self) -> &'static str {
        "elastic"
    }

    fn start(&self) {
        if self.shared.idle_timeout.is_zero() {
            return;
        }
        if !self.shared.sweep_started.swap(true, Ordering::AcqRel) {
            tokio::spawn(sweep(self.shared.clone()));
        }
    }

    fn put(&self, _key: u64, task: Task) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Err(err) = self.dispatch(task) {
                run_task(err.into_task()).await;
            }
        })
    }

    fn try_put(&self, _key: u64, task: Task) -> Result<(), TryPutError> {
        self.dispatch(task)
    }

    fn stop_async(&self) -> StopHandle {
        {
            let mut pool = self.shared.pool.lock();
            if !pool.stopping {
                pool.stopping = true;
                self.shared.sweeper.cancel();
                // Dropping the senders retires every parked worker
                pool.idle.clear();
                if pool.live == 0 {
                    self.shared.done.cancel();
                }
            }
        }

        StopHandle::new(self.shared.done.clone().cancelled_owned())
    }
}

impl fmt::Debug for Elastic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.shared.pool.lock();
        f.debug_struct("Elastic")
            .field("max_workers", &self.shared.max_workers)
            .field("live", &pool.live)
            .field("idle", &pool.idle.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Barrier;

    use super::*;

    #[tokio::test]
    async fn idle_workers_are_reused() -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = Elastic::new(16, Duration::from_secs(10));
        dispatcher.start();

        for _ in 0..5 {
            dispatcher.put(0, Box::pin(async {})).await;
            // Let the worker park itself before the next put
            while dispatcher.idle_workers() == 0 {
                tokio::task::yield_now().await;
            }
        }
        assert_eq!(dispatcher.live_workers(), 1);

        dispatcher.stop().await;
        assert_eq!(dispatcher.live_workers(), 0);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_pool_runs_inline() -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = Elastic::new(2, Duration::from_secs(10));
        dispatcher.start();
        let gate = Arc::new(Barrier::new(3));

        for _ in 0..2 {
            let gate = gate.clone();
            dispatcher
                .put(0, Box::pin(async move {
                    gate.wait().await;
                }))
                .await;
        }
        assert_eq!(dispatcher.live_workers(), 2);

        let err = dispatcher.try_put(0, Box::pin(async {})).unwrap_err();
        assert!(err.is_full());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        dispatcher
            .put(0, Box::pin(async move {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        assert_eq!(ran.load(Ordering::SeqCst), 1, "task should have run inline");

        gate.wait().await;
        dispatcher.stop().await;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_retires_idle_workers() -> Result<(), Box<dyn std::error::Error>> {
        let dispatcher = Elastic::new(16, Duration::from_secs(1));
        dispatcher.start();

        dispatcher.put(0, Box::pin(async {})).await;
        while dispatcher.idle_workers() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.live_workers(), 1);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        while dispatcher.live_workers() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.idle_workers(), 0);

        dispatcher.stop().await;

        Ok(())
    }
}
