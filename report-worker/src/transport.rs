use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::mpsc::{channel, error::SendError, Receiver, Sender};

/// Sending half of a bounded transport queue. `send` waits while the queue is full.
#[derive(Clone, Debug)]
pub struct MeasuringSender<T> {
    sender: Sender<T>,
    depth: QueueDepth,
}

#[derive(Debug)]
pub struct MeasuringReceiver<T> {
    receiver: Receiver<T>,
    depth: QueueDepth,
}

/// Number of items sitting in a transport queue.
///
/// Holding one does not keep the queue open, so reporters can observe a queue
/// without delaying its shutdown.
#[derive(Clone, Debug, Default)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

pub fn measuring_channel<T>(capacity: usize) -> (MeasuringSender<T>, MeasuringReceiver<T>) {
    let (tx, rx) = channel(capacity);
    let depth = QueueDepth::default();
    (
        MeasuringSender {
            sender: tx,
            depth: depth.clone(),
        },
        MeasuringReceiver {
            receiver: rx,
            depth,
        },
    )
}

impl<T> MeasuringSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError<T>> {
        // Counted before the item becomes visible so a fast receiver can't underflow the depth
        self.depth.0.fetch_add(1, Ordering::Relaxed);
        let res = self.sender.send(item).await;
        if res.is_err() {
            self.depth.0.fetch_sub(1, Ordering::Relaxed);
        }
        res
    }

    pub fn depth(&self) -> QueueDepth {
        self.depth.clone()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

impl<T> MeasuringReceiver<T> {
    /// Returns `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        let res = self.receiver.recv().await;
        if res.is_some() {
            self.depth.0.fetch_sub(1, Ordering::Relaxed);
        }
        res
    }

    pub async fn recv_many(&mut self, buffer: &mut Vec<T>, limit: usize) -> usize {
        let res = self.receiver.recv_many(buffer, limit).await;
        if res > 0 {
            self.depth.0.fetch_sub(res, Ordering::Relaxed);
        }
        res
    }

    pub fn depth(&self) -> QueueDepth {
        self.depth.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn depth_follows_sends_and_receives() {
        let (tx, mut rx) = measuring_channel(4);
        let depth = rx.depth();

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();
        assert_eq!(depth.get(), 3);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(depth.get(), 2);

        let mut buffer = Vec::new();
        assert_eq!(rx.recv_many(&mut buffer, 10).await, 2);
        assert_eq!(buffer, vec![2, 3]);
        assert_eq!(depth.get(), 0);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (tx, mut rx) = measuring_channel(1);
        assert_eq!(tx.capacity(), 1);
        tx.send("first").await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send("second")).await;
        assert!(blocked.is_err(), "send should wait while the queue is full");

        assert_eq!(rx.recv().await, Some("first"));
        tx.send("second").await.unwrap();
        assert_eq!(rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn depth_handle_does_not_keep_queue_open() {
        let (tx, mut rx) = measuring_channel::<u8>(1);
        let depth = tx.depth();
        drop(tx);

        assert_eq!(rx.recv().await, None);
        assert_eq!(depth.get(), 0);
    }
}
