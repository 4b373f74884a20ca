use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::TryPutError;

use super::{run_task, Task};

enum Job {
    Run(Task),
    Stop,
}

/// One bounded queue drained by one worker task, strictly in order.
///
/// The building block of both the single-loop and the sharded policies.
pub(super) struct EventLoop {
    name: &'static str,
    index: usize,
    tx: mpsc::Sender<Job>,
    rx: Mutex<Option<mpsc::Receiver<Job>>>,
    stopping: AtomicBool,
    done: CancellationToken,
}

impl EventLoop {
    pub(super) fn new(name: &'static str, index: usize, queue_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        EventLoop {
            name,
            index,
            tx,
            rx: Mutex::new(Some(rx)),
            stopping: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    pub(super) fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let (name, index, done) = (self.name, self.index, self.done.clone());
        tokio::spawn(async move {
            trace!(dispatcher = name, index, "event loop started");
            run_loop(rx).await;
            trace!(dispatcher = name, index, "event loop stopped");
            done.cancel();
        });
    }

    pub(super) async fn put(&self, task: Task) {
        if self.stopping.load(Ordering::Acquire) {
            return run_task(task).await;
        }

        let job = match self.tx.try_send(Job::Run(task)) {
            Ok(()) => return,
            Err(TrySendError::Full(job)) => match self.tx.send(job).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            Err(TrySendError::Closed(job)) => job,
        };

        // The loop closed its queue while we waited
        if let Job::Run(task) = job {
            run_task(task).await;
        }
    }

    pub(super) fn try_put(&self, task: Task) -> Result<(), TryPutError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(TryPutError::Stopped(task));
        }

        self.tx.try_send(Job::Run(task)).map_err(|err| match err {
            TrySendError::Full(Job::Run(task)) => TryPutError::Full(task),
            TrySendError::Closed(Job::Run(task)) => TryPutError::Stopped(task),
            TrySendError::Full(Job::Stop) | TrySendError::Closed(Job::Stop) => {
                unreachable!("only run jobs are submitted through try_put")
            }
        })
    }

    /// Queues the stop marker behind every accepted task and returns a token cancelled once the loop
    /// has exited.
    pub(super) fn stop(&self) -> CancellationToken {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            // A loop that never started still has to drain what was queued
            self.start();
            if let Err(TrySendError::Full(job)) = self.tx.try_send(Job::Stop) {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(job).await;
                });
            }
        }

        self.done.clone()
    }
}

async fn run_loop(mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Run(task) => run_task(task).await,
            Job::Stop => break,
        }
    }

    // Late puts that raced with the stop marker are still accepted work
    rx.close();
    while let Some(job) = rx.recv().await {
        if let Job::Run(task) = job {
            run_task(task).await;
        }
    }
}
