//! Cross-context message channel between the reactor and the dispatcher
//!
//! Producers on the reactor push without blocking; the dispatcher drains everything
//! queued at the moment of the call, in the order chosen when the channel was built.

use tokio::sync::mpsc;

pub use tokio::sync::mpsc::error::SendError;

/// Order in which [`ChannelReceiver::drain_all`] yields queued messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOrder {
    /// Arrival order; used for control events where causality matters
    Fifo,
    /// Newest first; used for state updates where freshness matters
    Lifo,
}

/// Producer half, cheap to clone into every reactor task
#[derive(Debug)]
pub struct ChannelSender<T> {
    inner: mpsc::UnboundedSender<T>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Queues a message; fails only once the receiver is gone
    pub fn push(&self, message: T) -> Result<(), SendError<T>> {
        self.inner.send(message)
    }
}

/// Consumer half, owned by the dispatcher
#[derive(Debug)]
pub struct ChannelReceiver<T> {
    inner: mpsc::UnboundedReceiver<T>,
    order: DrainOrder,
}

impl<T> ChannelReceiver<T> {
    /// Removes and returns every message queued right now, never waiting for more
    pub fn drain_all(&mut self) -> Vec<T> {
        // Pushes racing with this call wait for the next drain.
        let queued = self.inner.len();
        let mut drained = Vec::with_capacity(queued);
        for _ in 0..queued {
            match self.inner.try_recv() {
                Ok(message) => drained.push(message),
                Err(_) => break,
            }
        }

        if self.order == DrainOrder::Lifo {
            drained.reverse();
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn order(&self) -> DrainOrder {
        self.order
    }
}

/// Creates a channel with the given drain discipline
pub fn channel<T>(order: DrainOrder) -> (ChannelSender<T>, ChannelReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSender { inner: tx },
        ChannelReceiver { inner: rx, order },
    )
}
