use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::development::DevelopmentalPhase;
use crate::hebbian::PlasticityRates;
use crate::register::{NodeId, REGISTER_WIDTH};
use crate::substrate::Substrate;
use crate::topology::{Hormone, Topology, TopologyStats};

/// A read-only snapshot of what the substrate is doing.
///
/// Design intent:
/// - Observers cannot mutate or steer the substrate.
/// - Snapshotting is *on-demand* and can allocate; the tick loop stays unchanged.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubstrateSnapshot {
    pub cycle: u64,
    pub topology: TopologyStats,
    pub phase: DevelopmentalPhase,
    pub experience_count: u64,
    pub rates: PlasticityRates,
    pub replay_patterns: usize,
    pub pending_events: usize,
    pub dropped_events: u64,
}

pub struct SubstrateAdapter<'a> {
    substrate: &'a Substrate,
}

impl<'a> SubstrateAdapter<'a> {
    pub fn new(substrate: &'a Substrate) -> Self {
        Self { substrate }
    }

    pub fn snapshot(&self) -> SubstrateSnapshot {
        let s = self.substrate;
        SubstrateSnapshot {
            cycle: s.cycle(),
            topology: s.topology().snapshot(),
            phase: s.development().phase(),
            experience_count: s.development().experience_count(),
            rates: s.engine().rates(),
            replay_patterns: s.replay().len(),
            pending_events: s.pending_events(),
            dropped_events: s.dropped_events(),
        }
    }
}

/// Full exported state: registers as a `[node_count][256]` matrix, edges as
/// `(source, target, strength)` triples, hyperedges by name and the four
/// context levels.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TopologyExport {
    pub registers: Vec<Vec<f32>>,
    pub edges: Vec<(NodeId, NodeId, f32)>,
    pub hyperedges: BTreeMap<String, Vec<NodeId>>,
    pub processors: BTreeMap<String, Vec<f32>>,
    pub context: BTreeMap<String, f32>,
}

impl TopologyExport {
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub struct TopologyAdapter<'a> {
    topology: &'a Topology,
}

impl<'a> TopologyAdapter<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    pub fn snapshot(&self) -> TopologyStats {
        self.topology.snapshot()
    }

    pub fn export(&self) -> TopologyExport {
        let t = self.topology;
        let registers = t
            .store()
            .rows(t.node_count())
            .chunks_exact(REGISTER_WIDTH)
            .map(<[f32]>::to_vec)
            .collect();

        let mut hyperedges = BTreeMap::new();
        let mut processors = BTreeMap::new();
        for (name, h) in t.hyperedges() {
            hyperedges.insert(name.to_string(), h.members.clone());
            processors.insert(name.to_string(), h.vector.clone());
        }

        let ctx = t.context();
        let context = Hormone::ALL
            .into_iter()
            .map(|h| (h.as_str().to_string(), ctx.get(h)))
            .collect();

        TopologyExport {
            registers,
            edges: t.edges().triples(),
            hyperedges,
            processors,
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::SubstrateConfig;
    use crate::topology::TopologyConfig;

    #[test]
    fn export_matches_topology() {
        let mut t = Topology::new(TopologyConfig::with_capacity(8));
        let a = t.weave(Some(&[1.0; 4])).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.25, false).unwrap();
        t.create_hyperedge(&[a, b], "ab").unwrap();

        let export = TopologyAdapter::new(&t).export();
        assert_eq!(export.registers.len(), 3);
        assert!(export.registers.iter().all(|r| r.len() == REGISTER_WIDTH));
        assert_eq!(export.edges.len(), 5);
        assert_eq!(export.edges[0], (a, b, 0.25));
        assert_eq!(export.hyperedges["ab"], vec![a, b]);
        assert_eq!(export.processors["ab"].len(), 128);
        assert_eq!(export.context.len(), 4);
        assert_eq!(export.context["curiosity"], 0.5);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn export_serializes_to_json() {
        let mut t = Topology::new(TopologyConfig::with_capacity(2));
        t.weave(None).unwrap();
        let json = TopologyAdapter::new(&t).export().to_json().unwrap();
        let back: TopologyExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.registers.len(), 1);
        assert!(json.contains("\"legacy_drive\""));
    }

    #[test]
    fn substrate_snapshot_reads_every_component() {
        let mut s = Substrate::new(SubstrateConfig::with_capacity(4)).unwrap();
        s.topology_mut().weave(None).unwrap();
        s.record_activation(0, 1.0);

        let snap = SubstrateAdapter::new(&s).snapshot();
        assert_eq!(snap.cycle, 0);
        assert_eq!(snap.pending_events, 1);
        assert_eq!(snap.topology.node_count, 1);
        assert_eq!(snap.phase, DevelopmentalPhase::Infant);
    }
}
