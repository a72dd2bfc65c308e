//! Long-poll parking queue.
//!
//! A fetch request with nothing to carry is parked until a result is ready,
//! and a ready result with no parked fetch waits for the next one. Both waits
//! are bounded.

use crate::error::ServerError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;

struct ReadyFrame {
    seq: u64,
    payload: Bytes,
    taken: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    parked: VecDeque<oneshot::Sender<Bytes>>,
    ready: VecDeque<ReadyFrame>,
    next_seq: u64,
    closed: bool,
}

/// Rendezvous between parked fetch requests and ready payloads.
#[derive(Default)]
pub struct PollQueue {
    inner: Mutex<Inner>,
}

impl PollQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a fetch request for at most `wait`.
    ///
    /// Returns the first ready payload, or `None` when the wait elapses.
    pub async fn park(&self, wait: Duration) -> Result<Option<Bytes>, ServerError> {
        let mut rx = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(ServerError::ConnectionClosed);
            }
            if let Some(frame) = inner.ready.pop_front() {
                let _ = frame.taken.send(());
                return Ok(Some(frame.payload));
            }
            let (tx, rx) = oneshot::channel();
            inner.parked.push_back(tx);
            rx
        };

        tokio::select! {
            result = &mut rx => match result {
                Ok(payload) => Ok(Some(payload)),
                Err(_) => Err(ServerError::ConnectionClosed),
            },
            _ = tokio::time::sleep(wait) => {
                // A payload handed over while the timer fired is still ours.
                rx.close();
                Ok(rx.try_recv().ok())
            }
        }
    }

    /// Hands `payload` to a parked fetch, waiting at most `wait` for one.
    pub async fn deliver(&self, payload: Bytes, wait: Duration) -> Result<(), ServerError> {
        let (seq, taken) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(ServerError::ConnectionClosed);
            }

            let mut payload = payload;
            while let Some(parked) = inner.parked.pop_front() {
                match parked.send(payload) {
                    Ok(()) => return Ok(()),
                    // That fetch already gave up.
                    Err(returned) => payload = returned,
                }
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            inner.ready.push_back(ReadyFrame {
                seq,
                payload,
                taken: tx,
            });
            (seq, rx)
        };

        match tokio::time::timeout(wait, taken).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ServerError::ConnectionClosed),
            Err(_) => {
                let mut inner = self.inner.lock();
                let before = inner.ready.len();
                inner.ready.retain(|frame| frame.seq != seq);
                if inner.ready.len() == before {
                    // Picked up between the timeout and the lock.
                    Ok(())
                } else {
                    tracing::warn!("No fetch arrived within {:?}, dropping payload", wait);
                    Err(ServerError::Timeout)
                }
            }
        }
    }

    /// Drops every parked fetch and pending payload; the queue stays open.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.parked.clear();
        inner.ready.clear();
    }

    /// Releases every parked fetch and pending payload. Later calls fail.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.parked.clear();
        inner.ready.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of fetches currently parked and still waiting.
    pub fn parked(&self) -> usize {
        self.inner
            .lock()
            .parked
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Number of payloads waiting for a fetch.
    pub fn ready(&self) -> usize {
        self.inner.lock().ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_parked_fetch_receives_payload() {
        let queue = Arc::new(PollQueue::new());
        let fetch = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.park(WAIT).await })
        };

        while queue.parked() == 0 {
            tokio::task::yield_now().await;
        }
        queue.deliver(Bytes::from_static(b"one"), WAIT).await.unwrap();
        assert_eq!(
            fetch.await.unwrap().unwrap(),
            Some(Bytes::from_static(b"one"))
        );
    }

    #[tokio::test]
    async fn test_park_pending_until_delivery() {
        let queue = PollQueue::new();
        let mut fetch = tokio_test::task::spawn(queue.park(WAIT));
        tokio_test::assert_pending!(fetch.poll());
        assert_eq!(queue.parked(), 1);

        queue.deliver(Bytes::from_static(b"x"), WAIT).await.unwrap();
        assert!(fetch.is_woken());
        let payload = tokio_test::assert_ready!(fetch.poll()).unwrap();
        assert_eq!(payload, Some(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_payload_waits_for_next_fetch() {
        let queue = Arc::new(PollQueue::new());
        let delivery = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.deliver(Bytes::from_static(b"two"), WAIT).await })
        };

        while queue.ready() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            queue.park(WAIT).await.unwrap(),
            Some(Bytes::from_static(b"two"))
        );
        delivery.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_park_times_out() {
        let queue = PollQueue::new();
        assert_eq!(queue.park(Duration::from_secs(60)).await.unwrap(), None);
        assert_eq!(queue.parked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_times_out() {
        let queue = PollQueue::new();
        assert!(matches!(
            queue
                .deliver(Bytes::from_static(b"x"), Duration::from_secs(60))
                .await,
            Err(ServerError::Timeout)
        ));
        assert_eq!(queue.ready(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_fetch_skipped() {
        let queue = Arc::new(PollQueue::new());
        assert_eq!(queue.park(Duration::from_secs(1)).await.unwrap(), None);

        let delivery = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .deliver(Bytes::from_static(b"late"), Duration::from_secs(60))
                    .await
            })
        };
        while queue.ready() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            queue.park(WAIT).await.unwrap(),
            Some(Bytes::from_static(b"late"))
        );
        delivery.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reset_keeps_queue_open() {
        let queue = Arc::new(PollQueue::new());
        let delivery = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.deliver(Bytes::from_static(b"stale"), WAIT).await })
        };
        while queue.ready() == 0 {
            tokio::task::yield_now().await;
        }

        queue.reset();
        assert!(matches!(
            delivery.await.unwrap(),
            Err(ServerError::ConnectionClosed)
        ));
        assert_eq!(queue.ready(), 0);
        assert!(!queue.is_closed());

        let fetch = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.park(WAIT).await })
        };
        while queue.parked() == 0 {
            tokio::task::yield_now().await;
        }
        queue.deliver(Bytes::from_static(b"fresh"), WAIT).await.unwrap();
        assert_eq!(
            fetch.await.unwrap().unwrap(),
            Some(Bytes::from_static(b"fresh"))
        );
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue = Arc::new(PollQueue::new());
        let fetch = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.park(WAIT).await })
        };
        while queue.parked() == 0 {
            tokio::task::yield_now().await;
        }

        queue.close();
        assert!(matches!(
            fetch.await.unwrap(),
            Err(ServerError::ConnectionClosed)
        ));
        assert!(matches!(
            queue.deliver(Bytes::from_static(b"x"), WAIT).await,
            Err(ServerError::ConnectionClosed)
        ));
        assert!(queue.is_closed());
    }
}
