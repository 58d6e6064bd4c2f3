//! Request mailbox: many producers, one consumer, no blocking.
//!
//! Requests are fixed-size enum values carried by a bounded channel whose
//! ring is preallocated at init, so the hot path never allocates. A
//! producer that cannot publish gets its request back and must dispose of
//! any packets it carries; the consumer owns every request it dequeues.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use tracing::error;

/// Producer handle. Clone freely across threads.
pub struct MailboxSender<T> {
    name: &'static str,
    tx: Sender<T>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> MailboxSender<T> {
    /// Publish a request without blocking.
    ///
    /// On a full mailbox the request comes back to the caller, which must
    /// drop whatever it carries; the kernel or the peer will retry.
    pub fn try_send(&self, req: T) -> Result<(), T> {
        match self.tx.try_send(req) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(req)) => {
                error!(mailbox = self.name, "mailbox full, dropping request");
                Err(req)
            }
            Err(TrySendError::Disconnected(req)) => {
                error!(mailbox = self.name, "mailbox consumer is gone");
                Err(req)
            }
        }
    }
}

/// Consumer handle, owned by exactly one worker.
pub struct Mailbox<T> {
    rx: Receiver<T>,
}

impl<T> Mailbox<T> {
    /// Dequeue up to `max` requests in FIFO order.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.rx.try_recv() {
                Ok(req) => {
                    out.push(req);
                    n += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        n
    }
}

/// Create a mailbox with a fixed capacity.
pub fn mailbox<T>(name: &'static str, capacity: usize) -> (MailboxSender<T>, Mailbox<T>) {
    let (tx, rx) = bounded(capacity);
    (MailboxSender { name, tx }, Mailbox { rx })
}
