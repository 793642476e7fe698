//! Per-direction traffic queues
//!
//! Inbound packets are copied into a [`TrafficEvent`] and appended to the
//! queue for their direction. No crypto happens at enqueue time; the owner
//! flushes periodically, swapping each queue for an empty one and handing
//! the batch to the crypto workers.

use std::mem;

use onionhop_crypto::TunnelNonce;
use parking_lot::Mutex;
use tracing::trace;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::Direction;

/// One queued packet awaiting its onion transform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficEvent {
    pub payload: Vec<u8>,
    pub nonce: TunnelNonce,
}

/// Ordered batch of traffic events
pub type TrafficQueue = Vec<TrafficEvent>;

/// The two direction queues owned by one hop handler
pub struct HopQueues {
    upstream: Mutex<TrafficQueue>,
    downstream: Mutex<TrafficQueue>,
    max_len: usize,
    max_payload: usize,
}

impl HopQueues {
    pub fn new(max_len: usize, max_payload: usize) -> Self {
        Self {
            upstream: Mutex::new(Vec::new()),
            downstream: Mutex::new(Vec::new()),
            max_len,
            max_payload,
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.max_queue_len, config.max_payload_size)
    }

    fn queue(&self, direction: Direction) -> &Mutex<TrafficQueue> {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    /// Copy `payload` into a new event at the tail of the `direction` queue
    pub fn push(&self, direction: Direction, payload: &[u8], nonce: TunnelNonce) -> CoreResult<()> {
        if payload.is_empty() {
            return Err(CoreError::MalformedInput("empty payload".into()));
        }
        if payload.len() > self.max_payload {
            return Err(CoreError::MalformedInput(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                self.max_payload
            )));
        }

        let mut queue = self.queue(direction).lock();
        if queue.len() >= self.max_len {
            return Err(CoreError::QueueFull {
                direction,
                limit: self.max_len,
            });
        }
        queue.push(TrafficEvent {
            payload: payload.to_vec(),
            nonce,
        });
        trace!("Queued {} bytes {:?} ({} pending)", payload.len(), direction, queue.len());
        Ok(())
    }

    /// Swap the `direction` queue for an empty one and return its contents
    pub fn take(&self, direction: Direction) -> TrafficQueue {
        mem::take(&mut *self.queue(direction).lock())
    }

    pub fn len(&self, direction: Direction) -> usize {
        self.queue(direction).lock().len()
    }

    /// Events pending in both directions
    pub fn pending(&self) -> usize {
        self.len(Direction::Upstream) + self.len(Direction::Downstream)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_push_and_take() {
        let queues = HopQueues::new(8, 64);
        let nonce = TunnelNonce::generate();
        queues.push(Direction::Downstream, b"P1", nonce).unwrap();
        queues.push(Direction::Downstream, b"P2", nonce).unwrap();

        assert_eq!(queues.len(Direction::Downstream), 2);
        assert_eq!(queues.len(Direction::Upstream), 0);

        let batch = queues.take(Direction::Downstream);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"P1");
        assert_eq!(batch[0].nonce, nonce);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_rejects_malformed_payloads() {
        let queues = HopQueues::new(8, 4);
        let nonce = TunnelNonce::generate();
        assert!(matches!(
            queues.push(Direction::Upstream, b"", nonce),
            Err(CoreError::MalformedInput(_))
        ));
        assert!(matches!(
            queues.push(Direction::Upstream, b"too long", nonce),
            Err(CoreError::MalformedInput(_))
        ));
        assert!(queues.is_empty());
    }

    #[test]
    fn test_queue_full() {
        let queues = HopQueues::new(2, 64);
        let nonce = TunnelNonce::generate();
        queues.push(Direction::Upstream, b"a", nonce).unwrap();
        queues.push(Direction::Upstream, b"b", nonce).unwrap();

        let err = queues.push(Direction::Upstream, b"c", nonce).unwrap_err();
        assert!(matches!(
            err,
            CoreError::QueueFull { direction: Direction::Upstream, limit: 2 }
        ));
        // the other direction has its own budget
        queues.push(Direction::Downstream, b"c", nonce).unwrap();
    }

    proptest! {
        #[test]
        fn take_preserves_enqueue_order(payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 1..32), 0..64)
        ) {
            let queues = HopQueues::new(64, 32);
            let nonces: Vec<TunnelNonce> = payloads.iter().map(|_| TunnelNonce::generate()).collect();
            for (payload, nonce) in payloads.iter().zip(&nonces) {
                queues.push(Direction::Downstream, payload, *nonce).unwrap();
            }

            let batch = queues.take(Direction::Downstream);
            prop_assert_eq!(batch.len(), payloads.len());
            for ((event, payload), nonce) in batch.iter().zip(&payloads).zip(&nonces) {
                prop_assert_eq!(&event.payload, payload);
                prop_assert_eq!(&event.nonce, nonce);
            }
            prop_assert_eq!(queues.len(Direction::Downstream), 0);
        }
    }
}
