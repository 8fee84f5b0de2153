//! Decoupled activation intake.
//!
//! Sensors push events through a cloneable [`ActivationFeed`] without ever
//! touching the topology; the owning writer drains the queue on its own
//! cadence. A full queue drops the event instead of blocking the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::hebbian::ActivationEvent;
use crate::register::NodeId;

const DROP_WARN_EVERY: u64 = 1024;

/// Producer handle.
#[derive(Debug, Clone)]
pub struct ActivationFeed {
    tx: Sender<ActivationEvent>,
    epoch: Instant,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, held by the writer.
#[derive(Debug)]
pub struct FeedDrain {
    rx: Receiver<ActivationEvent>,
    dropped: Arc<AtomicU64>,
}

/// Bounded feed whose timestamps are seconds since `epoch`.
pub fn activation_feed(capacity: usize, epoch: Instant) -> (ActivationFeed, FeedDrain) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ActivationFeed {
            tx,
            epoch,
            dropped: Arc::clone(&dropped),
        },
        FeedDrain { rx, dropped },
    )
}

impl ActivationFeed {
    /// Queue an activation stamped now. Returns `false` if it was dropped.
    pub fn record(&self, node: NodeId, strength: f32) -> bool {
        let timestamp = self.epoch.elapsed().as_secs_f64();
        self.record_at(node, strength, timestamp)
    }

    pub fn record_at(&self, node: NodeId, strength: f32, timestamp: f64) -> bool {
        let event = ActivationEvent {
            node,
            timestamp,
            strength,
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n % DROP_WARN_EVERY == 1 {
                    warn!(dropped = n, "activation feed full; dropping events");
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FeedDrain {
    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<ActivationEvent> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_order() {
        let (feed, drain) = activation_feed(8, Instant::now());
        assert!(feed.record_at(3, 1.0, 0.5));
        assert!(feed.clone().record_at(4, 0.5, 0.6));
        assert_eq!(drain.pending(), 2);

        let events = drain.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].node, 3);
        assert_eq!(events[1].timestamp, 0.6);
        assert!(drain.drain().is_empty());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (feed, drain) = activation_feed(2, Instant::now());
        assert!(feed.record(0, 1.0));
        assert!(feed.record(1, 1.0));
        assert!(!feed.record(2, 1.0));
        assert_eq!(feed.dropped(), 1);
        assert_eq!(drain.dropped(), 1);
        assert_eq!(drain.drain().len(), 2);
    }

    #[test]
    fn producers_on_other_threads() {
        let (feed, drain) = activation_feed(64, Instant::now());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let feed = feed.clone();
                std::thread::spawn(move || {
                    for i in 0..8 {
                        feed.record(t * 8 + i, 1.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(drain.drain().len(), 32);
    }
}
