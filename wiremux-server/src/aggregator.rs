//! Per-batch response aggregation.

use crate::session::TransportMode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremux_protocol::{Response, ResponseMessage};

/// Collects the responses of one inbound batch.
///
/// Streaming mode hands back a single-entry envelope for every response.
/// Batching mode holds responses until the expected count reaches zero and
/// then hands back one envelope with all of them. In both modes the response
/// that brings the count to zero is marked `last`.
pub struct BatchAggregator {
    identity: String,
    mode: TransportMode,
    expected: usize,
    remaining: AtomicUsize,
    collected: Mutex<Vec<Response>>,
}

impl BatchAggregator {
    pub fn new(identity: impl Into<String>, mode: TransportMode, expected: usize) -> Self {
        let collected = match mode {
            TransportMode::Streaming => Vec::new(),
            TransportMode::Batching => Vec::with_capacity(expected),
        };
        Self {
            identity: identity.into(),
            mode,
            expected,
            remaining: AtomicUsize::new(expected),
            collected: Mutex::new(collected),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Responses still outstanding.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Envelope owed for a batch with no requests.
    ///
    /// Batching transports still answer the exchange, with an empty envelope.
    pub fn empty_reply(&self) -> Option<ResponseMessage> {
        match (self.mode, self.expected) {
            (TransportMode::Batching, 0) => Some(ResponseMessage::new(&self.identity, Vec::new())),
            _ => None,
        }
    }

    /// Records one completed response. Returns the envelope to flush, if any.
    pub fn complete(&self, mut response: Response) -> Option<ResponseMessage> {
        match self.mode {
            TransportMode::Streaming => {
                let remaining = self.decrement()?;
                response.last = remaining == 0;
                Some(ResponseMessage::single(&self.identity, response))
            }
            TransportMode::Batching => {
                let mut collected = self.collected.lock();
                let remaining = self.decrement()?;
                response.last = remaining == 0;
                collected.push(response);
                if remaining == 0 {
                    Some(ResponseMessage::new(
                        &self.identity,
                        std::mem::take(&mut *collected),
                    ))
                } else {
                    None
                }
            }
        }
    }

    /// Decrements the counter, refusing to go below zero.
    fn decrement(&self) -> Option<usize> {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => Some(previous - 1),
            Err(_) => {
                tracing::warn!(
                    "Dropping surplus response for completed batch (identity={})",
                    self.identity
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_streaming_flushes_each_response() {
        let agg = BatchAggregator::new("id", TransportMode::Streaming, 3);

        for (i, uuid) in ["b", "c", "a"].iter().enumerate() {
            let envelope = agg.complete(Response::ok(*uuid, i)).unwrap();
            assert_eq!(envelope.identity, "id");
            assert_eq!(envelope.responses.len(), 1);
            assert_eq!(envelope.responses[0].uuid, *uuid);
            assert_eq!(envelope.responses[0].last, i == 2);
        }
        assert_eq!(agg.remaining(), 0);
    }

    #[test]
    fn test_batching_flushes_once() {
        let agg = BatchAggregator::new("id", TransportMode::Batching, 3);

        assert!(agg.complete(Response::ok("2", 2)).is_none());
        assert!(agg.complete(Response::ok("3", 3)).is_none());
        assert_eq!(agg.remaining(), 1);

        let envelope = agg.complete(Response::ok("1", 1)).unwrap();
        let ids: Vec<_> = envelope.responses.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
        let lasts: Vec<_> = envelope.responses.iter().map(|r| r.last).collect();
        assert_eq!(lasts, vec![false, false, true]);
    }

    #[test]
    fn test_surplus_completion_ignored() {
        let agg = BatchAggregator::new("id", TransportMode::Batching, 1);
        assert!(agg.complete(Response::ok("1", 1)).is_some());
        assert!(agg.complete(Response::ok("1", 1)).is_none());
        assert_eq!(agg.remaining(), 0);
    }

    #[test]
    fn test_empty_batch() {
        let batching = BatchAggregator::new("id", TransportMode::Batching, 0);
        let envelope = batching.empty_reply().unwrap();
        assert!(envelope.responses.is_empty());

        let streaming = BatchAggregator::new("id", TransportMode::Streaming, 0);
        assert!(streaming.empty_reply().is_none());

        let nonempty = BatchAggregator::new("id", TransportMode::Batching, 2);
        assert!(nonempty.empty_reply().is_none());
    }

    #[test]
    fn test_concurrent_batching_completions() {
        let k = 64;
        let agg = Arc::new(BatchAggregator::new("id", TransportMode::Batching, k));

        let handles: Vec<_> = (0..k)
            .map(|i| {
                let agg = agg.clone();
                std::thread::spawn(move || agg.complete(Response::ok(i.to_string(), i)))
            })
            .collect();

        let flushed: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(flushed.len(), 1);

        let envelope = &flushed[0];
        assert_eq!(envelope.responses.len(), k);
        assert_eq!(envelope.responses.iter().filter(|r| r.last).count(), 1);
        assert!(envelope.responses[k - 1].last);
    }
}
