use std::collections::VecDeque;

use tracing::trace;

use crate::hebbian::{HebbianReport, PlasticityEngine};
use crate::prng::Prng;
use crate::register::NodeId;
use crate::topology::Topology;

/// Strength at which replayed members are re-recorded.
pub const REPLAY_STRENGTH: f32 = 0.5;

/// Bounded FIFO of past activation patterns, replayed offline to
/// consolidate coactivations without live input.
#[derive(Debug, Clone)]
pub struct ExperienceReplay {
    capacity: usize,
    buffer: VecDeque<Vec<NodeId>>,
    rng: Prng,
}

impl ExperienceReplay {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            rng: Prng::fork(seed, 0x52),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn patterns(&self) -> impl Iterator<Item = &[NodeId]> {
        self.buffer.iter().map(Vec::as_slice)
    }

    /// Append a pattern, evicting the oldest when full. Empty patterns and
    /// zero-capacity buffers store nothing.
    pub fn store(&mut self, pattern: &[NodeId]) {
        if self.capacity == 0 || pattern.is_empty() {
            return;
        }
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(pattern.to_vec());
    }

    pub fn replay(
        &mut self,
        topology: &mut Topology,
        engine: &mut PlasticityEngine,
        num_replays: usize,
    ) -> HebbianReport {
        let now = engine.now();
        self.replay_at(topology, engine, num_replays, now)
    }

    /// Sample `num_replays` stored patterns with replacement; re-record each
    /// member at half strength and run one Hebbian update per pattern.
    pub fn replay_at(
        &mut self,
        topology: &mut Topology,
        engine: &mut PlasticityEngine,
        num_replays: usize,
        now: f64,
    ) -> HebbianReport {
        let mut total = HebbianReport::default();
        if self.buffer.is_empty() {
            return total;
        }

        for _ in 0..num_replays {
            let pick = self.rng.gen_range_usize(0, self.buffer.len());
            let Some(pattern) = self.buffer.get(pick) else {
                continue;
            };
            for &node in pattern {
                engine.record_activation_at(node, REPLAY_STRENGTH, now);
            }
            let r = engine.apply_hebbian_update_at(topology, now);
            total.coactivations += r.coactivations;
            total.strengthened += r.strengthened;
            total.sprouted += r.sprouted;
        }

        trace!(replays = num_replays, ?total, "experience replay");
        total
    }
}
