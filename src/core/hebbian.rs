//! Time-windowed Hebbian learning over the topology's edge index.
//!
//! Activations are recorded as timestamped events. Pairs of distinct nodes
//! firing within the correlation window are coactivated; coactivation
//! strengthens existing edges, sprouts new ones past a threshold, and shields
//! edges from the next decay pass.

use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, trace};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::prng::Prng;
use crate::register::NodeId;
use crate::topology::Topology;

/// Base learning parameters. Developmental scaling never mutates these.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HebbianConfig {
    pub strengthening_rate: f32,
    /// Fraction of strength lost per decay pass by an edge with no recent
    /// coactivation.
    pub weakening_rate: f32,
    /// Decayed edges below this are removed.
    pub pruning_threshold: f32,
    /// Correlation an unconnected pair must strictly exceed to sprout an edge.
    pub sprouting_threshold: f32,
    /// Coincidence window in seconds.
    pub correlation_window: f64,

    pub sprout_strength: f32,
    pub exploratory_strength: f32,
    /// Per-active-node chance of an exploratory edge, scaled by curiosity.
    pub exploration_probability: f32,
}

impl Default for HebbianConfig {
    fn default() -> Self {
        Self {
            strengthening_rate: 0.1,
            weakening_rate: 0.05,
            pruning_threshold: 0.001,
            sprouting_threshold: 0.8,
            correlation_window: 0.05,
            sprout_strength: 0.01,
            exploratory_strength: 0.001,
            exploration_probability: 0.1,
        }
    }
}

impl HebbianConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.correlation_window > 0.0) {
            return Err("correlation_window must be > 0");
        }
        if !(0.0..=1.0).contains(&self.weakening_rate) {
            return Err("weakening_rate must be in [0, 1]");
        }
        if !(self.pruning_threshold >= 0.0) {
            return Err("pruning_threshold must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.exploration_probability) {
            return Err("exploration_probability must be in [0, 1]");
        }
        Ok(())
    }
}

/// Rates actually used by updates and decay.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PlasticityRates {
    pub strengthening_rate: f32,
    pub weakening_rate: f32,
    pub pruning_threshold: f32,
}

impl From<&HebbianConfig> for PlasticityRates {
    fn from(cfg: &HebbianConfig) -> Self {
        Self {
            strengthening_rate: cfg.strengthening_rate,
            weakening_rate: cfg.weakening_rate,
            pruning_threshold: cfg.pruning_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ActivationEvent {
    pub node: NodeId,
    /// Seconds since the engine's epoch.
    pub timestamp: f64,
    pub strength: f32,
}

/// Two distinct nodes that fired within the window, earlier event first.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coactivation {
    pub a: NodeId,
    pub b: NodeId,
    pub correlation: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HebbianReport {
    pub coactivations: usize,
    pub strengthened: usize,
    pub sprouted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DecayReport {
    pub decayed: usize,
    pub pruned: usize,
}

#[inline]
fn pair_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct PlasticityEngine {
    base: HebbianConfig,
    rates: PlasticityRates,

    epoch: Instant,
    history: Vec<ActivationEvent>,
    // Coactivations per unordered pair since the last decay pass.
    counts: HashMap<(NodeId, NodeId), u32>,

    rng: Prng,
}

impl core::fmt::Debug for PlasticityEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PlasticityEngine")
            .field("rates", &self.rates)
            .field("events", &self.history.len())
            .field("tracked_pairs", &self.counts.len())
            .finish()
    }
}

impl PlasticityEngine {
    pub fn new(cfg: HebbianConfig, seed: u64) -> Self {
        Self::with_epoch(cfg, seed, Instant::now())
    }

    /// Share a clock origin with other producers (see [`crate::feed`]).
    pub fn with_epoch(cfg: HebbianConfig, seed: u64, epoch: Instant) -> Self {
        Self {
            rates: PlasticityRates::from(&cfg),
            base: cfg,
            epoch,
            history: Vec::new(),
            counts: HashMap::new(),
            rng: Prng::fork(seed, 0x4E),
        }
    }

    pub fn base(&self) -> &HebbianConfig {
        &self.base
    }

    pub fn rates(&self) -> PlasticityRates {
        self.rates
    }

    pub(crate) fn set_rates(&mut self, rates: PlasticityRates) {
        self.rates = rates;
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Seconds since the engine's epoch.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    pub fn recent_events(&self) -> &[ActivationEvent] {
        &self.history
    }

    pub fn coactivation_count(&self, a: NodeId, b: NodeId) -> u32 {
        self.counts.get(&pair_key(a, b)).copied().unwrap_or(0)
    }

    pub fn record_activation(&mut self, node: NodeId, strength: f32) {
        let now = self.now();
        self.record_activation_at(node, strength, now);
    }

    /// Append an event stamped `timestamp` and drop events older than two
    /// windows.
    pub fn record_activation_at(&mut self, node: NodeId, strength: f32, timestamp: f64) {
        self.history.push(ActivationEvent {
            node,
            timestamp,
            strength,
        });
        let horizon = 2.0 * self.base.correlation_window;
        self.history.retain(|e| timestamp - e.timestamp < horizon);
    }

    pub fn detect_coactivations(&mut self) -> Vec<Coactivation> {
        let now = self.now();
        self.detect_coactivations_at(now)
    }

    /// Pairs of distinct nodes among the events of the last window, with
    /// `correlation = (1 - dt / window) * strength_a * strength_b`.
    /// Each detected pair bumps its coactivation counter.
    pub fn detect_coactivations_at(&mut self, now: f64) -> Vec<Coactivation> {
        let window = self.base.correlation_window;
        let recent: Vec<ActivationEvent> = self
            .history
            .iter()
            .filter(|e| now - e.timestamp < window)
            .copied()
            .collect();

        let mut out = Vec::new();
        for (i, first) in recent.iter().enumerate() {
            for second in &recent[i + 1..] {
                if first.node == second.node {
                    continue;
                }
                let dt = (second.timestamp - first.timestamp).abs();
                if dt >= window {
                    continue;
                }
                let correlation = (1.0 - dt / window) as f32 * first.strength * second.strength;
                *self
                    .counts
                    .entry(pair_key(first.node, second.node))
                    .or_insert(0) += 1;
                out.push(Coactivation {
                    a: first.node,
                    b: second.node,
                    correlation,
                });
            }
        }
        out
    }

    pub fn apply_hebbian_update(&mut self, topology: &mut Topology) -> HebbianReport {
        let now = self.now();
        self.apply_hebbian_update_at(topology, now)
    }

    /// Strengthen edges between coactivated pairs; sprout a weak bidirectional
    /// edge between unconnected pairs whose correlation exceeds the threshold.
    /// Pairs touching a retired or unknown node are left alone.
    pub fn apply_hebbian_update_at(&mut self, topology: &mut Topology, now: f64) -> HebbianReport {
        let pairs = self.detect_coactivations_at(now);
        let mut report = HebbianReport {
            coactivations: pairs.len(),
            ..Default::default()
        };

        for Coactivation { a, b, correlation } in pairs {
            if !(topology.is_live(a) && topology.is_live(b)) {
                debug!(a, b, "hebbian update skipped: node not live");
                continue;
            }
            let (result, tally) = if topology.edges().get_strength(a, b) > 0.0 {
                let delta = self.rates.strengthening_rate * correlation;
                (topology.connect(a, b, delta, false), &mut report.strengthened)
            } else if correlation > self.base.sprouting_threshold {
                let s = self.base.sprout_strength;
                (topology.connect(a, b, s, true), &mut report.sprouted)
            } else {
                continue;
            };

            match result {
                Ok(()) => *tally += 1,
                Err(e) => debug!(a, b, "hebbian update skipped: {e}"),
            }
        }

        trace!(?report, "hebbian update");
        report
    }

    /// Weaken every edge whose endpoints did not coactivate since the last
    /// pass, remove the ones that fall below the pruning threshold, then
    /// clear all coactivation counters.
    pub fn apply_synaptic_decay(&mut self, topology: &mut Topology) -> DecayReport {
        let keep = 1.0 - self.rates.weakening_rate;
        let floor = self.rates.pruning_threshold;
        let counts = &self.counts;

        let triples: Vec<(NodeId, NodeId, f32)> = topology.edges().iter().collect();
        let decay = |&(s, d, w): &(NodeId, NodeId, f32)| -> Option<(NodeId, NodeId, f32)> {
            if counts.get(&pair_key(s, d)).copied().unwrap_or(0) > 0 {
                None
            } else {
                Some((s, d, w * keep))
            }
        };

        #[cfg(feature = "parallel")]
        let decayed: Vec<(NodeId, NodeId, f32)> = triples.par_iter().filter_map(decay).collect();
        #[cfg(not(feature = "parallel"))]
        let decayed: Vec<(NodeId, NodeId, f32)> = triples.iter().filter_map(decay).collect();

        let mut report = DecayReport::default();
        let edges = topology.edges_mut();
        for (s, d, w) in decayed {
            if w < floor {
                edges.remove_edge(s, d);
                report.pruned += 1;
            } else {
                edges.set_strength(s, d, w);
                report.decayed += 1;
            }
        }

        self.counts.clear();
        if report.pruned > 0 {
            debug!(pruned = report.pruned, "synaptic decay pruned edges");
        }
        report
    }

    /// Give each live active node a curiosity-scaled chance of one weak edge
    /// to a random live node. Returns how many edges were added.
    pub fn induce_sprouting(&mut self, topology: &mut Topology, active: &[NodeId]) -> usize {
        let n = topology.node_count();
        if n == 0 {
            return 0;
        }
        let p = self.base.exploration_probability * topology.context().curiosity;

        let mut sprouted = 0;
        for &src in active {
            if !topology.is_live(src) || !self.rng.chance(p) {
                continue;
            }
            let dst = self.rng.gen_range_usize(0, n);
            if dst == src || !topology.is_live(dst) {
                continue;
            }
            match topology.connect(src, dst, self.base.exploratory_strength, false) {
                Ok(()) => sprouted += 1,
                Err(e) => debug!(src, dst, "exploratory sprout skipped: {e}"),
            }
        }
        sprouted
    }
}
