//! A multi-producer single-consumer double-buffer queue for outgoing messages.
//!
//! Producers append to a shared buffer under a short lock and never wait on the consumer. The
//! consumer swaps the shared buffer with its own empty buffer in one critical section and drains
//! the batch without holding the lock, so a write loop can flush a whole batch per wakeup.
//!
//! Wakeups go through a channel with a single slot. A producer that finds the slot occupied knows
//! a wakeup is already pending and skips it, so bursts of sends coalesce into one wakeup.
//!
//! # Example
//!
//! ```
//! # tokio_test::block_on(async {
//! let (tx, mut rx) = rivet::outbound::channel::<u32>(16);
//! tx.put(1);
//! tx.put(2);
//! tx.close();
//!
//! let mut batch = Vec::new();
//! rx.pick(&mut batch).await;
//! assert_eq!(batch.len(), 3);
//! # })
//! ```

use std::{fmt, mem, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// An entry in an outbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound<M> {
    /// A message to be written to the transport.
    Message(M),
    /// No more messages follow. Never written to the transport.
    End,
}

/// Creates an outbound queue whose buffers start with room for `capacity` messages.
pub fn channel<M>(capacity: usize) -> (OutboundSender<M>, OutboundReceiver<M>) {
    let (wake_tx, wake_rx) = mpsc::channel(1);
    let buffer = Arc::new(Mutex::new(Vec::with_capacity(capacity)));
    (
        OutboundSender {
            buffer: buffer.clone(),
            wake: wake_tx,
        },
        OutboundReceiver {
            buffer,
            wake: wake_rx,
        },
    )
}

/// The producer side of an outbound queue. Cheap to clone.
pub struct OutboundSender<M> {
    buffer: Arc<Mutex<Vec<Outbound<M>>>>,
    wake: mpsc::Sender<()>,
}

impl<M> OutboundSender<M> {
    /// Appends a message and wakes the consumer if no wakeup is pending.
    pub fn put(&self, msg: M) {
        self.push(Outbound::Message(msg));
    }

    /// Appends the end marker.
    pub fn close(&self) {
        self.push(Outbound::End);
    }

    /// Number of entries waiting for the consumer.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Returns `true` if no entries are waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, entry: Outbound<M>) {
        self.buffer.lock().push(entry);
        // A full slot means a wakeup is already pending
        let _ = self.wake.try_send(());
    }
}

impl<M> Clone for OutboundSender<M> {
    fn clone(&self) -> Self {
        OutboundSender {
            buffer: self.buffer.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<M> fmt::Debug for OutboundSender<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSender")
            .field("len", &self.len())
            .finish()
    }
}

/// The consumer side of an outbound queue.
pub struct OutboundReceiver<M> {
    buffer: Arc<Mutex<Vec<Outbound<M>>>>,
    wake: mpsc::Receiver<()>,
}

impl<M> OutboundReceiver<M> {
    /// Waits until entries are available and moves all of them into `out`.
    ///
    /// `out` is cleared first and becomes the new empty producer buffer on the next call, so reusing
    /// the same vector keeps two allocations alive in rotation. Returns the number of entries moved,
    /// which is zero only once every sender has been dropped.
    pub async fn pick(&mut self, out: &mut Vec<Outbound<M>>) -> usize {
        self.pick_inner(None, out).await
    }

    /// Like [`pick`](Self::pick), but returns early with whatever is available once `cancel` fires.
    ///
    /// Entries already queued are always returned before a cancellation is observed.
    pub async fn pick_with_cancel(
        &mut self,
        cancel: &CancellationToken,
        out: &mut Vec<Outbound<M>>,
    ) -> usize {
        self.pick_inner(Some(cancel), out).await
    }

    /// Moves whatever is queued into `out` without waiting.
    pub fn try_pick(&mut self, out: &mut Vec<Outbound<M>>) -> usize {
        out.clear();
        self.swap(out);
        out.len()
    }

    async fn pick_inner(
        &mut self,
        cancel: Option<&CancellationToken>,
        out: &mut Vec<Outbound<M>>,
    ) -> usize {
        out.clear();
        loop {
            self.swap(out);
            if !out.is_empty() {
                return out.len();
            }

            let woke = match cancel {
                Some(cancel) => {
                    tokio::select! {
                        biased;
                        woke = self.wake.recv() => woke,
                        _ = cancel.cancelled() => return 0,
                    }
                }
                None => self.wake.recv().await,
            };
            if woke.is_none() {
                self.swap(out);
                return out.len();
            }
        }
    }

    fn swap(&self, out: &mut Vec<Outbound<M>>) {
        mem::swap(&mut *self.buffer.lock(), out);
    }
}

impl<M> fmt::Debug for OutboundReceiver<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundReceiver")
            .field("len", &self.buffer.lock().len())
            .finish()
    }
}
