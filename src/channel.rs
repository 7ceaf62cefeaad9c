//! Bounded single-producer/single-consumer queue with backpressure
//!
//! `put` suspends while the queue is full and gives up with
//! [`ChannelError::QueueTimeout`] instead of dropping the item. `get` returns
//! `None` once the queue has been closed and drained.

use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("queue stayed full for {0:?}")]
    QueueTimeout(Duration),

    #[error("queue closed")]
    Closed,
}

pub struct BoundedChannel<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: watch::Sender<bool>,
    put_timeout: Duration,
}

impl<T: Send> BoundedChannel<T> {
    pub fn new(capacity: usize, put_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed,
            put_timeout,
        }
    }

    /// Enqueue an item, waiting up to the put timeout for a free slot.
    pub async fn put(&self, item: T) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        tokio::select! {
            sent = tokio::time::timeout(self.put_timeout, self.tx.send(item)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(ChannelError::Closed),
                Err(_) => Err(ChannelError::QueueTimeout(self.put_timeout)),
            },
            _ = closed_signal(self.closed.subscribe()) => Err(ChannelError::Closed),
        }
    }

    /// Wait for the next item. `None` means the channel is closed and empty.
    pub async fn get(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        let mut closed_rx = self.closed.subscribe();

        loop {
            if let Ok(item) = rx.try_recv() {
                return Some(item);
            }
            let closed = *closed_rx.borrow_and_update();
            if closed {
                return None;
            }

            tokio::select! {
                item = rx.recv() => return item,
                changed = closed_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Close the channel. Buffered items stay readable; later puts fail.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Items currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves once the closed flag is raised.
async fn closed_signal(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}
