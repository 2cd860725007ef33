//! FIFO queue of blocked acquirers.
//!
//! Every waiter owns the receiving half of a single-use channel. A releaser
//! holding the pool lock pops the head waiter and sends the session through
//! the channel; a waiter whose deadline passed removes itself under the same
//! lock. Whichever happens first wins, so a session is either delivered or
//! the waiter times out, never both.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// A queued acquire call.
struct Waiter<S> {
    /// Monotonic arrival order, also used as the waiter's identity.
    arrival: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<S>,
}

/// Result of a successful hand-off.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandOff {
    /// Arrival order of the waiter that received the session.
    pub(crate) arrival: u64,
    /// How long that waiter was queued.
    pub(crate) waited: Duration,
}

/// FIFO of waiters. Lives inside the pool state and is only touched with the
/// pool lock held.
pub(crate) struct WaitQueue<S> {
    waiters: VecDeque<Waiter<S>>,
    next_arrival: u64,
}

impl<S> WaitQueue<S> {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            next_arrival: 0,
        }
    }

    /// Enqueue a waiter at the tail.
    pub(crate) fn push(&mut self, now: Instant) -> (u64, oneshot::Receiver<S>) {
        let (tx, rx) = oneshot::channel();
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.waiters.push_back(Waiter {
            arrival,
            enqueued_at: now,
            tx,
        });
        (arrival, rx)
    }

    /// Remove a waiter. Returns `false` if it was already served.
    pub(crate) fn remove(&mut self, arrival: u64) -> bool {
        match self.waiters.iter().position(|w| w.arrival == arrival) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Give `session` to the oldest waiter still listening.
    ///
    /// Waiters whose receiver is gone are discarded. Returns the session if
    /// nobody took it.
    pub(crate) fn hand_off(&mut self, mut session: S, now: Instant) -> Result<HandOff, S> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(session) {
                Ok(()) => {
                    return Ok(HandOff {
                        arrival: waiter.arrival,
                        waited: now.saturating_duration_since(waiter.enqueued_at),
                    });
                }
                Err(returned) => session = returned,
            }
        }
        Err(session)
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn close_all(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
