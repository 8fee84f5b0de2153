//! Usage tracking, node spawning and prune candidates.

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::error::{LoomError, Result};
use crate::prng::Prng;
use crate::register::{NodeId, SEMANTIC};
use crate::topology::Topology;

/// Nodes a topology must hold before spawned nodes get wired in.
pub const SPAWN_WIRING_MIN_NODES: usize = 10;
const SPAWN_EMBEDDING_SCALE: f32 = 0.1;
const SPAWN_EDGE_STRENGTH: f32 = 0.001;
const SPAWN_MAX_LINKS: usize = 3;

#[derive(Debug, Clone)]
pub struct StructuralPlasticityEngine {
    usage_decay: f32,
    usage: HashMap<NodeId, f32>,
    rng: Prng,
}

impl StructuralPlasticityEngine {
    pub fn new(usage_decay: f32, seed: u64) -> Self {
        Self {
            usage_decay,
            usage: HashMap::new(),
            rng: Prng::fork(seed, 0x53),
        }
    }

    pub fn usage(&self, id: NodeId) -> Option<f32> {
        self.usage.get(&id).copied()
    }

    pub fn tracked(&self) -> usize {
        self.usage.len()
    }

    /// Decay every score, then credit each active node with 1.0.
    pub fn track_usage(&mut self, active: &[NodeId]) {
        let decay = self.usage_decay;
        for score in self.usage.values_mut() {
            *score *= decay;
        }
        for &id in active {
            *self.usage.entry(id).or_insert(0.0) += 1.0;
        }
    }

    /// Weave `n` nodes with small random embeddings. Once the topology has
    /// more than ten nodes, each is linked both ways to 1..=3 random earlier
    /// live nodes.
    ///
    /// Running out of capacity ends the batch early; the nodes woven so far
    /// are still returned.
    pub fn spawn(&mut self, topology: &mut Topology, n: usize) -> Result<Vec<NodeId>> {
        let mut spawned = Vec::with_capacity(n);
        for _ in 0..n {
            let mut embedding = [0.0f32; SEMANTIC.width];
            self.rng.fill_gaussian(&mut embedding, SPAWN_EMBEDDING_SCALE);
            let id = match topology.weave(Some(&embedding)) {
                Ok(id) => id,
                Err(e @ LoomError::CapacityExceeded { .. }) => {
                    warn!(spawned = spawned.len(), requested = n, "spawn stopped: {e}");
                    break;
                }
                Err(e) => return Err(e),
            };

            if topology.node_count() > SPAWN_WIRING_MIN_NODES {
                let links = self.rng.gen_range_usize(1, SPAWN_MAX_LINKS + 1);
                for target in self.rng.sample_distinct(id, links) {
                    if !topology.is_live(target) {
                        continue;
                    }
                    if let Err(e) = topology.connect(id, target, SPAWN_EDGE_STRENGTH, true) {
                        debug!(id, target, "spawn link skipped: {e}");
                    }
                }
            }
            spawned.push(id);
        }
        if !spawned.is_empty() {
            debug!(count = spawned.len(), "spawned nodes");
        }
        Ok(spawned)
    }

    /// Nodes whose usage score fell below `threshold`, ascending. They are
    /// dropped from tracking but left in the topology.
    pub fn prune_candidates(&mut self, threshold: f32) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .usage
            .iter()
            .filter(|(_, &score)| score < threshold)
            .map(|(&id, _)| id)
            .collect();
        out.sort_unstable();
        for id in &out {
            self.usage.remove(id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyConfig;

    #[test]
    fn usage_decays_and_accumulates() {
        let mut s = StructuralPlasticityEngine::new(0.5, 1);
        s.track_usage(&[1, 2]);
        s.track_usage(&[1]);
        assert_eq!(s.usage(1), Some(1.5));
        assert_eq!(s.usage(2), Some(0.5));
        assert_eq!(s.usage(3), None);
    }

    #[test]
    fn prune_candidates_drop_tracking_only() {
        let mut topo = Topology::new(TopologyConfig::with_capacity(8));
        for _ in 0..3 {
            topo.weave(None).unwrap();
        }
        let mut s = StructuralPlasticityEngine::new(0.1, 1);
        s.track_usage(&[0, 1, 2]);
        s.track_usage(&[1]);
        s.track_usage(&[1]);

        // 0 and 2 are at 0.01, 1 is well above
        assert_eq!(s.prune_candidates(0.05), vec![0, 2]);
        assert_eq!(s.tracked(), 1);
        assert!(topo.is_live(0) && topo.is_live(2));
        assert!(s.prune_candidates(0.05).is_empty());
    }

    #[test]
    fn small_topologies_spawn_unwired() {
        let mut topo = Topology::new(TopologyConfig::with_capacity(16));
        let mut s = StructuralPlasticityEngine::new(0.99, 2);
        let ids = s.spawn(&mut topo, 5).unwrap();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(topo.edges().is_empty());
    }

    #[test]
    fn spawned_nodes_link_to_earlier_nodes() {
        let mut topo = Topology::new(TopologyConfig::with_capacity(32));
        for _ in 0..12 {
            topo.weave(None).unwrap();
        }
        let mut s = StructuralPlasticityEngine::new(0.99, 2);
        let id = s.spawn(&mut topo, 1).unwrap()[0];

        let out: Vec<_> = topo.edges().iter().filter(|e| e.0 == id).collect();
        assert!((1..=3).contains(&out.len()));
        for (_, dst, w) in out {
            assert!(dst < id);
            assert!((w - 0.001).abs() < 1e-7);
            assert!((topo.edges().get_strength(dst, id) - 0.001).abs() < 1e-7);
        }
        let emb = topo.node(id).unwrap().semantic_embedding();
        assert!(emb.iter().any(|&x| x != 0.0));
    }

    #[test]
    fn spawn_stops_at_capacity_and_keeps_woven_ids() {
        let mut topo = Topology::new(TopologyConfig::with_capacity(2));
        let mut s = StructuralPlasticityEngine::new(0.99, 2);
        assert_eq!(s.spawn(&mut topo, 3).unwrap(), vec![0, 1]);
        assert_eq!(topo.node_count(), 2);
        assert!(s.spawn(&mut topo, 1).unwrap().is_empty());
    }
}
