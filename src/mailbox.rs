//! Generic timed mailbox primitive
//!
//! Single lock over a FIFO value buffer plus a FIFO list of pending takers.
//! `put` never blocks; `take` suspends with a timeout. A value racing with a
//! timeout or a cancelled `take` is resolved exactly once: it is either
//! returned to the consumer or stays takeable, never lost and never
//! duplicated.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::TakeTimeout;

/// A registered taker waiting for the next value
struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<T>,
}

struct Inner<T> {
    buffer: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
    next_waiter_id: u64,
}

/// FIFO mailbox with timed, cancellable receipt
///
/// Used as the only communication channel between a session's read loop,
/// its processing loop, room broadcasts and the server shutdown sequence.
///
/// Invariant: a buffered value and a registered waiter never coexist.
pub struct Mailbox<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::new(),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    /// Deliver a value, waking the oldest waiter if one is registered
    ///
    /// Never blocks and never fails. A waiter whose receiver is already gone
    /// is skipped; with no live waiter left the value is buffered.
    pub fn put(&self, value: T) {
        let mut inner = self.inner.lock();
        let mut value = value;
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.tx.send(value) {
                Ok(()) => return,
                // Taker left between registering and receiving, try the next.
                Err(returned) => value = returned,
            }
        }
        inner.buffer.push_back(value);
    }

    /// Take the oldest value, waiting up to `timeout` for one to arrive
    pub async fn take(&self, timeout: Duration) -> Result<T, TakeTimeout> {
        let (id, rx) = {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.buffer.pop_front() {
                return Ok(value);
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            inner.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let mut pending = PendingTake {
            mailbox: self,
            id,
            rx,
            settled: false,
        };

        let received = tokio::time::timeout(timeout, &mut pending.rx).await;
        match received {
            Ok(Ok(value)) => {
                pending.settled = true;
                Ok(value)
            }
            // Timed out, or the sender side vanished with the mailbox.
            Ok(Err(_)) | Err(_) => match pending.settle() {
                Some(value) => Ok(value),
                None => Err(TakeTimeout),
            },
        }
    }
}

/// Cleanup handle for a registered waiter
///
/// Removal and delivery are serialized on the mailbox lock, so a value sent
/// concurrently with a timeout or a cancellation is observed here and
/// returned (timeout) or re-buffered at the front (cancellation).
struct PendingTake<'a, T> {
    mailbox: &'a Mailbox<T>,
    id: u64,
    rx: oneshot::Receiver<T>,
    settled: bool,
}

impl<T> PendingTake<'_, T> {
    /// Deregister after a timeout, recovering a value that raced in
    fn settle(&mut self) -> Option<T> {
        self.settled = true;
        let mut inner = self.mailbox.inner.lock();
        let id = self.id;
        inner.waiters.retain(|w| w.id != id);
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for PendingTake<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // The take future was cancelled. Deregister, and put back a value
        // that was already handed to this waiter so it is not lost.
        let mut inner = self.mailbox.inner.lock();
        let id = self.id;
        inner.waiters.retain(|w| w.id != id);
        if let Ok(value) = self.rx.try_recv() {
            inner.buffer.push_front(value);
        }
    }
}
