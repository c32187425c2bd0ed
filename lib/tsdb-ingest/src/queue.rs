use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Creates a bounded distribution queue.
///
/// Sending blocks once `capacity` items are waiting, which pushes backpressure from slow workers all the way back to the
/// reader. Any number of workers can receive from the same queue.
pub fn distribution_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueueSender { inner: tx },
        QueueReceiver {
            inner: Arc::new(Mutex::new(rx)),
        },
    )
}

/// The error returned when every receiver of a queue has been dropped.
#[derive(Debug)]
pub struct QueueClosed<T>(pub T);

/// Sending half of a distribution queue.
pub struct QueueSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> QueueSender<T> {
    /// Sends an item, waiting for capacity if the queue is full.
    ///
    /// # Errors
    ///
    /// If every receiver has been dropped, the item is handed back in the error.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed<T>> {
        self.inner.send(item).await.map_err(|e| QueueClosed(e.0))
    }
}

/// Receiving half of a distribution queue.
///
/// Cloning a receiver gives another consumer of the same queue: each item is delivered to exactly one of them.
pub struct QueueReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for QueueReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> QueueReceiver<T> {
    /// Receives the next item.
    ///
    /// Returns `None` once the sender has been dropped and every pending item has been received.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drains_then_closes() {
        let (tx, rx) = distribution_queue(2);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn items_split_between_receivers() {
        let (tx, rx) = distribution_queue(4);
        let rx2 = rx.clone();
        for i in 0..4 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
            if let Some(j) = rx2.recv().await {
                seen.push(j);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn send_fails_without_receivers() {
        let (tx, rx) = distribution_queue::<u32>(1);
        drop(rx);
        assert_eq!(tx.send(7).await.unwrap_err().0, 7);
    }
}
