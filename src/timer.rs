//! Application-level timers dispatched through the engine's [`Dispatcher`].
//!
//! A [`TimerWheel`] keeps every pending timer in a binary min-heap ordered by deadline, with an
//! index from [`TimerId`] to heap position so that cancellation is logarithmic. A single Tokio task
//! sleeps until the earliest deadline, and re-arms whenever a timer is added or cancelled.
//!
//! Expired callbacks are not run on the timer task. Each one is turned into a [`Task`] and handed
//! to the dispatcher under the timer's key, which is the id of the connection that owns it. Under
//! the single-loop and sharded policies a timer callback is therefore never concurrent with the
//! connection's message callbacks, nor with a previous firing of the same timer.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//!
//! use rivet::dispatch::{Dispatcher, SingleLoop};
//! use rivet::timer::TimerWheel;
//!
//! # tokio_test::block_on(async {
//! let dispatcher: Arc<dyn Dispatcher> = Arc::new(SingleLoop::new(64));
//! dispatcher.start();
//! let timers = TimerWheel::new(dispatcher.clone());
//! timers.start();
//!
//! let id = timers.add_timer(
//!     tokio::time::Instant::now() + Duration::from_secs(60),
//!     Duration::ZERO,
//!     0,
//!     |_now| Box::pin(async { println!("one minute later") }),
//! );
//! assert!(timers.cancel_timer(id));
//!
//! timers.stop().await;
//! dispatcher.stop().await;
//! # })
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::Notify,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    dispatch::{Dispatcher, Task},
    id::TimerId,
};

/// Produces the task run when a timer fires. Receives the time of expiry.
pub type TimerCallback = Arc<dyn Fn(Instant) -> Task + Send + Sync>;

struct Entry {
    id: TimerId,
    deadline: Instant,
    interval: Duration,
    key: u64,
    callback: TimerCallback,
}

impl Entry {
    #[inline]
    fn precedes(&self, other: &Entry) -> bool {
        (self.deadline, self.id) < (other.deadline, other.id)
    }
}

/// A binary min-heap that tracks the position of every entry.
#[derive(Default)]
struct Heap {
    entries: Vec<Entry>,
    positions: HashMap<TimerId, usize>,
}

impl Heap {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn peek_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|entry| entry.deadline)
    }

    fn push(&mut self, entry: Entry) {
        let pos = self.entries.len();
        self.positions.insert(entry.id, pos);
        self.entries.push(entry);
        self.sift_up(pos);
    }

    /// Removes the root if its deadline is not after `now`.
    fn pop_due(&mut self, now: Instant) -> Option<Entry> {
        match self.peek_deadline() {
            Some(deadline) if deadline <= now => self.remove_at(0),
            _ => None,
        }
    }

    fn remove(&mut self, id: TimerId) -> Option<Entry> {
        let pos = *self.positions.get(&id)?;
        self.remove_at(pos)
    }

    fn remove_at(&mut self, pos: usize) -> Option<Entry> {
        let last = self.entries.len().checked_sub(1)?;
        if pos > last {
            return None;
        }

        self.swap(pos, last);
        let entry = self.entries.pop()?;
        self.positions.remove(&entry.id);
        if pos < self.entries.len() && self.sift_down(pos) == pos {
            self.sift_up(pos);
        }

        Some(entry)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].id, a);
        self.positions.insert(self.entries[b].id, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.entries[pos].precedes(&self.entries[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    /// Returns the final position of the moved entry.
    fn sift_down(&mut self, mut pos: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.entries[left].precedes(&self.entries[smallest]) {
                smallest = left;
            }
            if right < len && self.entries[right].precedes(&self.entries[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                return pos;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}

struct Shared {
    dispatcher: Arc<dyn Dispatcher>,
    heap: Mutex<Heap>,
    changed: Notify,
    started: AtomicBool,
    close: CancellationToken,
    done: CancellationToken,
}

/// A min-heap timer scheduler whose callbacks run on a [`Dispatcher`].
///
/// Cloning a `TimerWheel` yields another handle to the same schedule.
#[derive(Clone)]
pub struct TimerWheel {
    shared: Arc<Shared>,
}

impl TimerWheel {
    /// Creates a timer wheel that dispatches expired callbacks to `dispatcher`.
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        TimerWheel {
            shared: Arc::new(Shared {
                dispatcher,
                heap: Mutex::new(Heap::default()),
                changed: Notify::new(),
                started: AtomicBool::new(false),
                close: CancellationToken::new(),
                done: CancellationToken::new(),
            }),
        }
    }

    /// Spawns the timer task. Calling it more than once has no effect.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(run(self.shared.clone()));
    }

    /// Stops the timer task and waits for it to exit. Pending timers are discarded.
    ///
    /// Callbacks already handed to the dispatcher are not awaited; stop the dispatcher for that.
    pub async fn stop(&self) {
        self.shared.close.cancel();
        if self.shared.started.load(Ordering::Acquire) {
            self.shared.done.cancelled().await;
        }
        let mut heap = self.shared.heap.lock();
        heap.entries.clear();
        heap.positions.clear();
    }

    /// Schedules `callback` to fire at `deadline` under affinity `key`.
    ///
    /// A non-zero `interval` makes the timer repeat: after each expiry it is rescheduled at the time
    /// of expiry plus `interval`, until cancelled.
    pub fn add_timer<F>(&self, deadline: Instant, interval: Duration, key: u64, callback: F) -> TimerId
    where
        F: Fn(Instant) -> Task + Send + Sync + 'static,
    {
        let id = TimerId::generate();
        self.shared.heap.lock().push(Entry {
            id,
            deadline,
            interval,
            key,
            callback: Arc::new(callback),
        });
        self.shared.changed.notify_one();
        trace!(%id, key, "timer added");

        id
    }

    /// Cancels a pending timer.
    ///
    /// Returns `false` if the timer is unknown or has already fired as a one-shot. Cancelling never
    /// fails otherwise.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = self.shared.heap.lock().remove(id).is_some();
        if removed {
            self.shared.changed.notify_one();
            trace!(%id, "timer cancelled");
        }

        removed
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.shared.heap.lock().len()
    }

    /// Returns `true` if no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("pending", &self.len())
            .field("dispatcher", &self.shared.dispatcher.name())
            .finish()
    }
}

async fn run(shared: Arc<Shared>) {
    trace!("timer wheel started");
    let sleep = time::sleep_until(Instant::now());
    tokio::pin!(sleep);

    loop {
        let next = shared.heap.lock().peek_deadline();
        if let Some(deadline) = next {
            sleep.as_mut().reset(deadline);
        }

        tokio::select! {
            biased;
            _ = shared.close.cancelled() => break,
            _ = shared.changed.notified() => {}
            _ = &mut sleep, if next.is_some() => expire(&shared, Instant::now()),
        }
    }

    trace!("timer wheel stopped");
    shared.done.cancel();
}

fn expire(shared: &Shared, now: Instant) {
    let mut due = Vec::new();
    {
        let mut heap = shared.heap.lock();
        while let Some(entry) = heap.pop_due(now) {
            due.push((entry.key, entry.callback.clone()));
            // Repeating timers go back in under the same lock, so a concurrent cancel always finds them
            if !entry.interval.is_zero() {
                heap.push(Entry {
                    deadline: now + entry.interval,
                    ..entry
                });
            }
        }
    }

    for (key, callback) in due {
        let task = callback(now);
        if let Err(err) = shared.dispatcher.try_put(key, task) {
            // Never block the timer task on a saturated dispatcher
            let dispatcher = shared.dispatcher.clone();
            let task = err.into_task();
            tokio::spawn(async move { dispatcher.put(key, task).await });
        }
    }
}
