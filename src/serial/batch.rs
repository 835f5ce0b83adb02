//! Fixed-capacity frame batches and the collector↔egress handoff.
//!
//! A [`Batch`] is a small array of 256-byte slots used to move groups of
//! frames between execution contexts without per-frame allocation. The
//! handoff between the collector task and the egress engine is a two-party
//! rendezvous: a capacity-1 channel carries the full batch across, and a
//! recycle channel returns drained batches, so exactly two batch objects
//! circulate for the lifetime of the link. If the egress side cannot keep
//! up, the collector blocks on the exchange, which is the backpressure
//! that ultimately bounds application submission.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{ModlinkError, Result};

/// Number of slots per batch. Must stay at or below half the egress
/// window, so an accepted batch always fits the available window space.
pub(crate) const BATCH_CAPACITY: usize = 8;

/// Size of each slot in bytes.
pub(crate) const SLOT_CAPACITY: usize = 256;

struct Slot {
    bytes: [u8; SLOT_CAPACITY],
    length: usize,
}

/// A fixed group of frame-sized byte slots.
pub(crate) struct Batch {
    slots: Box<[Slot]>,
    cursor: usize,
}

impl Batch {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..BATCH_CAPACITY)
                .map(|_| Slot {
                    bytes: [0u8; SLOT_CAPACITY],
                    length: 0,
                })
                .collect(),
            cursor: 0,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.cursor
    }

    pub(crate) fn is_full(&self) -> bool {
        self.cursor == self.slots.len()
    }

    pub(crate) fn insert(&mut self, data: &[u8]) -> Result<()> {
        if self.cursor == self.slots.len() {
            return Err(ModlinkError::Protocol("batch overflow".to_string()));
        }
        if data.len() > SLOT_CAPACITY {
            return Err(ModlinkError::FrameOverflow {
                limit: SLOT_CAPACITY,
            });
        }
        let slot = &mut self.slots[self.cursor];
        slot.bytes[..data.len()].copy_from_slice(data);
        slot.length = data.len();
        self.cursor += 1;
        Ok(())
    }

    pub(crate) fn slot(&self, index: usize) -> &[u8] {
        assert!(index < self.cursor, "slot index out of range");
        let slot = &self.slots[index];
        &slot.bytes[..slot.length]
    }

    pub(crate) fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.length = 0;
        }
        self.cursor = 0;
    }
}

/// Outcome of the egress side waiting on the handoff.
pub(crate) enum Accepted {
    /// A populated batch arrived.
    Batch(Batch),
    /// No batch arrived within the wait.
    TimedOut,
    /// The collector side has shut down.
    Closed,
}

/// Collector side of the rendezvous.
pub(crate) struct CollectorHandoff {
    handoff_tx: mpsc::Sender<Batch>,
    recycle_rx: mpsc::Receiver<Batch>,
}

impl CollectorHandoff {
    /// Hand the populated batch to the egress side and receive an empty
    /// one in exchange. Blocks until the egress side takes delivery.
    pub(crate) async fn exchange(&mut self, batch: Batch) -> Option<Batch> {
        if batch.count() == 0 {
            return Some(batch);
        }
        self.handoff_tx.send(batch).await.ok()?;
        self.recycle_rx.recv().await
    }
}

/// Egress side of the rendezvous.
pub(crate) struct EgressHandoff {
    handoff_rx: mpsc::Receiver<Batch>,
    recycle_tx: mpsc::Sender<Batch>,
}

impl EgressHandoff {
    /// Wait up to `duration` for the collector to hand over a batch.
    pub(crate) async fn accept(&mut self, duration: Duration) -> Accepted {
        match tokio::time::timeout(duration, self.handoff_rx.recv()).await {
            Ok(Some(batch)) => Accepted::Batch(batch),
            Ok(None) => Accepted::Closed,
            Err(_) => Accepted::TimedOut,
        }
    }

    /// Return a drained batch to the collector side.
    pub(crate) fn recycle(&mut self, mut batch: Batch) {
        batch.reset();
        let _ = self.recycle_tx.try_send(batch);
    }
}

/// Create the two sides of the handoff plus the collector's initial batch.
pub(crate) fn handoff_pair() -> (CollectorHandoff, EgressHandoff, Batch) {
    let (handoff_tx, handoff_rx) = mpsc::channel(1);
    let (recycle_tx, recycle_rx) = mpsc::channel(2);
    recycle_tx
        .try_send(Batch::new())
        .unwrap_or_else(|_| unreachable!("fresh recycle channel has capacity"));
    (
        CollectorHandoff {
            handoff_tx,
            recycle_rx,
        },
        EgressHandoff {
            handoff_rx,
            recycle_tx,
        },
        Batch::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_read_back() {
        let mut batch = Batch::new();
        batch.insert(b"first").unwrap();
        batch.insert(b"second").unwrap();
        assert_eq!(batch.count(), 2);
        assert_eq!(batch.slot(0), b"first");
        assert_eq!(batch.slot(1), b"second");
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut batch = Batch::new();
        for _ in 0..BATCH_CAPACITY {
            batch.insert(&[0xAB]).unwrap();
        }
        assert!(batch.is_full());
        assert!(batch.insert(&[0xCD]).is_err());
    }

    #[test]
    fn test_reset() {
        let mut batch = Batch::new();
        batch.insert(&[1, 2, 3]).unwrap();
        batch.reset();
        assert_eq!(batch.count(), 0);
        assert!(!batch.is_full());
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let (mut collector, mut egress, mut batch) = handoff_pair();
        batch.insert(b"frame").unwrap();

        let exchange = tokio::spawn(async move { collector.exchange(batch).await });

        let accepted = egress.accept(Duration::from_secs(1)).await;
        let Accepted::Batch(received) = accepted else {
            panic!("expected batch");
        };
        assert_eq!(received.count(), 1);
        assert_eq!(received.slot(0), b"frame");
        egress.recycle(received);

        let fresh = exchange.await.unwrap().unwrap();
        assert_eq!(fresh.count(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_exchanged() {
        let (mut collector, mut egress, batch) = handoff_pair();
        let returned = collector.exchange(batch).await.unwrap();
        assert_eq!(returned.count(), 0);
        assert!(matches!(
            egress.accept(Duration::from_millis(10)).await,
            Accepted::TimedOut
        ));
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let (_collector, mut egress, _batch) = handoff_pair();
        assert!(matches!(
            egress.accept(Duration::from_millis(10)).await,
            Accepted::TimedOut
        ));
    }

    #[tokio::test]
    async fn test_accept_reports_closed() {
        let (collector, mut egress, _batch) = handoff_pair();
        drop(collector);
        assert!(matches!(
            egress.accept(Duration::from_millis(10)).await,
            Accepted::Closed
        ));
    }
}
