use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::str::FromStr;

use tracing::{debug, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::edges::{EdgeIndex, SelfLoopPolicy};
use crate::error::{LoomError, Result};
use crate::node::{cosine_similarity, poincare_distance, Node, NodeMut};
use crate::prng::Prng;
use crate::register::{
    ArrayBackend, NodeId, RegisterStore, CONNECTIONS, META_LIVE, META_PROCESSOR, POSITION,
    REGISTER_WIDTH, SEMANTIC,
};
use crate::storage;

/// Width of a hyperedge processor vector. Member embeddings are sampled up
/// to this many dimensions.
pub const PROCESSOR_WIDTH: usize = 128;

/// Largest register bank a config may request (4 GiB of rows).
pub const MAX_CAPACITY: usize = 1 << 22;

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TopologyConfig {
    /// Rows preallocated in the register store. Fixed for the store's lifetime.
    pub capacity: usize,
    pub backend: ArrayBackend,

    /// Cached connection strength a target must exceed to be activated.
    pub activation_threshold: f32,
    /// Context stress above which propagation stops after the current step.
    pub stress_halt: f32,

    /// Std-dev of the gaussian position jitter given to woven nodes.
    pub position_jitter: f32,
    /// Strength of each member <-> processor edge of a hyperedge.
    pub hyperedge_strength: f32,

    pub self_loops: SelfLoopPolicy,

    pub seed: Option<u64>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            backend: ArrayBackend::Host,
            activation_threshold: 0.01,
            stress_halt: 0.7,
            position_jitter: 0.1,
            hyperedge_strength: 0.5,
            self_loops: SelfLoopPolicy::Allow,
            seed: None,
        }
    }
}

impl TopologyConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_backend(mut self, backend: ArrayBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_self_loops(mut self, policy: SelfLoopPolicy) -> Self {
        self.self_loops = policy;
        self
    }

    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        if self.capacity > MAX_CAPACITY {
            return Err("capacity exceeds MAX_CAPACITY");
        }
        if !(self.activation_threshold >= 0.0) {
            return Err("activation_threshold must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.stress_halt) {
            return Err("stress_halt must be in [0, 1]");
        }
        if !(self.position_jitter >= 0.0) {
            return Err("position_jitter must be >= 0");
        }
        Ok(())
    }
}

/// Global modulatory signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Hormone {
    Stress,
    Curiosity,
    LegacyDrive,
    ConsolidationPressure,
}

impl Hormone {
    pub const ALL: [Hormone; 4] = [
        Hormone::Stress,
        Hormone::Curiosity,
        Hormone::LegacyDrive,
        Hormone::ConsolidationPressure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Hormone::Stress => "stress",
            Hormone::Curiosity => "curiosity",
            Hormone::LegacyDrive => "legacy_drive",
            Hormone::ConsolidationPressure => "consolidation_pressure",
        }
    }
}

impl FromStr for Hormone {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self> {
        Hormone::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| LoomError::UnknownHormone(s.to_string()))
    }
}

/// Context field read by propagation and plasticity. Every level is in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Context {
    pub stress: f32,
    pub curiosity: f32,
    pub legacy_drive: f32,
    pub consolidation_pressure: f32,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            stress: 0.0,
            curiosity: 0.5,
            legacy_drive: 0.0,
            consolidation_pressure: 0.0,
        }
    }
}

impl Context {
    pub fn get(&self, hormone: Hormone) -> f32 {
        match hormone {
            Hormone::Stress => self.stress,
            Hormone::Curiosity => self.curiosity,
            Hormone::LegacyDrive => self.legacy_drive,
            Hormone::ConsolidationPressure => self.consolidation_pressure,
        }
    }

    fn slot(&mut self, hormone: Hormone) -> &mut f32 {
        match hormone {
            Hormone::Stress => &mut self.stress,
            Hormone::Curiosity => &mut self.curiosity,
            Hormone::LegacyDrive => &mut self.legacy_drive,
            Hormone::ConsolidationPressure => &mut self.consolidation_pressure,
        }
    }
}

/// A higher-order relation reduced to pairwise edges through a processor node.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hyperedge {
    pub members: Vec<NodeId>,
    pub processor: NodeId,
    /// Mean of the members' embeddings, `PROCESSOR_WIDTH` wide.
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TopologyStats {
    pub node_count: usize,
    pub live_count: usize,
    pub edge_count: usize,
    pub hyperedge_count: usize,
    pub context: Context,
    /// `node_count / capacity`.
    pub utilization: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PropagationReport {
    pub steps_run: usize,
    /// Stopped before the requested step count because stress was high.
    pub halted_by_stress: bool,
    /// Active set after the last step that ran, ascending.
    pub activated: Vec<NodeId>,
}

pub struct Topology {
    cfg: TopologyConfig,
    store: RegisterStore,
    edges: EdgeIndex,
    hyperedges: BTreeMap<String, Hyperedge>,
    context: Context,
    next_id: NodeId,
    rng: Prng,
}

impl core::fmt::Debug for Topology {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Topology")
            .field("nodes", &self.next_id)
            .field("edges", &self.edges.len())
            .field("hyperedges", &self.hyperedges.len())
            .field("store", &self.store)
            .finish()
    }
}

impl Topology {
    pub fn new(cfg: TopologyConfig) -> Self {
        Self::with_store(cfg, RegisterStore::allocate_on(cfg.capacity, cfg.backend))
    }

    /// Validate `cfg` and allocate fallibly.
    pub fn try_new(cfg: TopologyConfig) -> Result<Self> {
        cfg.validate().map_err(LoomError::InvalidConfig)?;
        let store = RegisterStore::try_allocate_on(cfg.capacity, cfg.backend)?;
        Ok(Self::with_store(cfg, store))
    }

    fn with_store(cfg: TopologyConfig, store: RegisterStore) -> Self {
        Self {
            store,
            edges: EdgeIndex::new(cfg.self_loops),
            hyperedges: BTreeMap::new(),
            context: Context::default(),
            next_id: 0,
            rng: Prng::fork(cfg.seed.unwrap_or(1), 0x70),
            cfg,
        }
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.cfg
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Nodes ever woven; ids are exactly `0..node_count()`.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.next_id
    }

    pub fn store(&self) -> &RegisterStore {
        &self.store
    }

    pub fn edges(&self) -> &EdgeIndex {
        &self.edges
    }

    pub(crate) fn edges_mut(&mut self) -> &mut EdgeIndex {
        &mut self.edges
    }

    pub fn context(&self) -> Context {
        self.context
    }

    #[inline]
    pub fn contains(&self, id: NodeId) -> bool {
        id < self.next_id
    }

    fn require(&self, id: NodeId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(LoomError::InvalidNodeReference(id))
        }
    }

    pub fn node(&self, id: NodeId) -> Result<Node<'_>> {
        self.require(id)?;
        self.store.node(id)
    }

    /// Woven and not tombstoned.
    pub fn is_live(&self, id: NodeId) -> bool {
        self.contains(id)
            && self
                .store
                .node(id)
                .map(|n| n.is_live())
                .unwrap_or(false)
    }

    pub fn live_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.next_id).filter(move |&id| self.is_live(id))
    }

    /// Allocate the next id and initialize its register row.
    pub fn weave(&mut self, embedding: Option<&[f32]>) -> Result<NodeId> {
        let id = self.next_id;
        if id >= self.store.capacity() {
            warn!(capacity = self.store.capacity(), "weave refused: store full");
            return Err(LoomError::CapacityExceeded {
                capacity: self.store.capacity(),
            });
        }

        let mut jitter = [0.0f32; POSITION.width];
        self.rng.fill_gaussian(&mut jitter, self.cfg.position_jitter);

        let mut row = [0.0f32; REGISTER_WIDTH];
        let mut node = NodeMut::new(id, &mut row);
        node.stamp_identity();
        node.set_position(&jitter);
        if let Some(embedding) = embedding {
            node.set_semantic_embedding(embedding);
        }
        self.store.write_row(id, &row)?;

        self.next_id += 1;
        Ok(id)
    }

    /// Add `strength` to `src -> dst` (and `dst -> src` when bidirectional),
    /// mirroring it into the sources' cached connection slots.
    pub fn connect(
        &mut self,
        src: NodeId,
        dst: NodeId,
        strength: f32,
        bidirectional: bool,
    ) -> Result<()> {
        self.require(src)?;
        self.require(dst)?;

        if self.edges.add_edge(src, dst, strength).is_some() {
            self.store.node_mut(src)?.strengthen_connection(dst, strength);
        }
        if bidirectional && self.edges.add_edge(dst, src, strength).is_some() {
            self.store.node_mut(dst)?.strengthen_connection(src, strength);
        }
        Ok(())
    }

    /// Materialize a named relation over `members` as a processor node whose
    /// embedding is the members' mean, linked both ways to every member.
    ///
    /// All ids are validated before anything is mutated. Reusing a name
    /// replaces the bookkeeping entry; the old processor node stays woven.
    pub fn create_hyperedge(&mut self, members: &[NodeId], name: &str) -> Result<NodeId> {
        for &m in members {
            self.require(m)?;
        }

        let mut vector = vec![0.0f32; PROCESSOR_WIDTH];
        if !members.is_empty() {
            let scale = 1.0 / members.len() as f32;
            for &m in members {
                let embedding = self.store.node(m)?.semantic_embedding();
                for (v, e) in vector.iter_mut().zip(embedding.iter().take(PROCESSOR_WIDTH)) {
                    *v += e * scale;
                }
            }
        }

        let processor = self.weave(Some(&vector[..SEMANTIC.width.min(PROCESSOR_WIDTH)]))?;
        self.store.node_mut(processor)?.set_flag(META_PROCESSOR, true);

        let s = self.cfg.hyperedge_strength;
        for &m in members {
            self.connect(m, processor, s, false)?;
            self.connect(processor, m, s, false)?;
        }

        debug!(name, processor, members = members.len(), "hyperedge woven");
        self.hyperedges.insert(
            name.to_string(),
            Hyperedge {
                members: members.to_vec(),
                processor,
                vector,
            },
        );
        Ok(processor)
    }

    pub fn hyperedge(&self, name: &str) -> Option<&Hyperedge> {
        self.hyperedges.get(name)
    }

    pub fn hyperedges(&self) -> impl Iterator<Item = (&str, &Hyperedge)> {
        self.hyperedges.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Fold an external activation into a node's history ring.
    pub fn stimulate(&mut self, id: NodeId, strength: f32) -> Result<()> {
        self.require(id)?;
        self.store.node_mut(id)?.push_activation(strength);
        Ok(())
    }

    /// Run up to `steps` synchronous wavefront steps from `sources`.
    ///
    /// Each step, every active node offers its summed activation history,
    /// scaled by the cached slot strength, to each candidate target in
    /// `0..min(node_count, 64)` whose slot exceeds the activation threshold.
    /// Targets fold the step's total incoming drive into their history once
    /// and form the next active set. A stressed context stops the wave after
    /// the current step; an empty active set ends it.
    pub fn propagate(&mut self, sources: &[NodeId], steps: usize) -> PropagationReport {
        let mut active: BTreeSet<NodeId> =
            sources.iter().copied().filter(|&id| self.is_live(id)).collect();
        let candidates = self.next_id.min(CONNECTIONS.width);
        let threshold = self.cfg.activation_threshold;

        let mut report = PropagationReport::default();
        for step in 0..steps {
            let mut incoming: BTreeMap<NodeId, f32> = BTreeMap::new();
            for &id in &active {
                let Ok(node) = self.store.node(id) else {
                    continue;
                };
                let drive = node.activation_sum();
                for target in 0..candidates {
                    let strength = node.connection_slot(target);
                    if strength > threshold && self.is_live(target) {
                        *incoming.entry(target).or_insert(0.0) += drive * strength;
                    }
                }
            }

            for (&target, &sum) in &incoming {
                if let Ok(mut node) = self.store.node_mut(target) {
                    node.push_activation(sum);
                }
            }

            report.steps_run += 1;
            active = incoming.into_keys().collect();

            if self.context.stress > self.cfg.stress_halt {
                report.halted_by_stress = step + 1 < steps;
                break;
            }
            if active.is_empty() {
                break;
            }
        }

        report.activated = active.into_iter().collect();
        report
    }

    /// Store a clamped level. Only the stored value changes.
    pub fn modulate(&mut self, hormone: Hormone, level: f32) {
        let level = if level.is_nan() {
            0.0
        } else {
            level.clamp(0.0, 1.0)
        };
        *self.context.slot(hormone) = level;
    }

    pub fn modulate_named(&mut self, hormone: &str, level: f32) -> Result<()> {
        self.modulate(hormone.parse()?, level);
        Ok(())
    }

    /// Tombstone a node: it keeps its id and row but stops taking part in
    /// propagation and exploratory growth. Returns whether it was live.
    pub fn retire(&mut self, id: NodeId) -> Result<bool> {
        self.require(id)?;
        let mut node = self.store.node_mut(id)?;
        let was_live = node.as_node().is_live();
        node.set_flag(META_LIVE, false);
        Ok(was_live)
    }

    pub fn snapshot(&self) -> TopologyStats {
        let capacity = self.store.capacity();
        TopologyStats {
            node_count: self.next_id,
            live_count: self.live_ids().count(),
            edge_count: self.edges.len(),
            hyperedge_count: self.hyperedges.len(),
            context: self.context,
            utilization: if capacity == 0 {
                1.0
            } else {
                self.next_id as f32 / capacity as f32
            },
        }
    }

    pub fn semantic_similarity(&self, a: NodeId, b: NodeId) -> Result<f32> {
        Ok(cosine_similarity(
            self.node(a)?.semantic_embedding(),
            self.node(b)?.semantic_embedding(),
        ))
    }

    pub fn hyperbolic_distance(&self, a: NodeId, b: NodeId) -> Result<f32> {
        Ok(poincare_distance(
            self.node(a)?.position(),
            self.node(b)?.position(),
        ))
    }

    /// The `k` live, non-processor nodes whose embeddings are closest to
    /// `query` by cosine similarity, best first.
    pub fn most_similar(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        let mut padded = [0.0f32; SEMANTIC.width];
        let n = query.len().min(SEMANTIC.width);
        padded[..n].copy_from_slice(&query[..n]);
        let query = &padded;

        let score = |id: NodeId| -> Option<(NodeId, f32)> {
            let node = self.store.node(id).ok()?;
            if !node.is_live() || node.is_processor() {
                return None;
            }
            Some((id, cosine_similarity(query, node.semantic_embedding())))
        };

        #[cfg(feature = "parallel")]
        let mut scored: Vec<(NodeId, f32)> =
            (0..self.next_id).into_par_iter().filter_map(score).collect();
        #[cfg(not(feature = "parallel"))]
        let mut scored: Vec<(NodeId, f32)> = (0..self.next_id).filter_map(score).collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        scored
    }

    /// Flush register rows written since the last tick to the array backend.
    pub fn sync(&mut self) -> usize {
        self.store.sync()
    }

    // =========================================================================
    // Topology image
    // =========================================================================

    /// Serialize a versioned, chunked topology image.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        self.save_image_with(w, &[])
    }

    /// Write the image followed by caller-owned chunks.
    pub(crate) fn save_image_with<W: Write>(
        &self,
        w: &mut W,
        extra: &[([u8; 4], &[u8])],
    ) -> io::Result<()> {
        w.write_all(storage::MAGIC)?;
        storage::write_u32_le(w, storage::VERSION_CURRENT)?;

        storage::write_chunk(w, *b"CFG0", &self.cfg_payload()?)?;
        storage::write_chunk(w, *b"PRNG", &self.rng.state().to_le_bytes())?;
        storage::write_chunk(w, *b"CTXT", &self.context_payload()?)?;
        storage::write_chunk_lz4(w, *b"REGS", &self.registers_payload()?)?;
        storage::write_chunk(w, *b"EDGE", &self.edges_payload()?)?;
        storage::write_chunk(w, *b"HYPR", &self.hyperedges_payload()?)?;
        for (tag, payload) in extra {
            storage::write_chunk(w, *tag, payload)?;
        }
        Ok(())
    }

    /// Load a topology image. Unknown chunks are skipped.
    pub fn load_image_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Self::load_image_with(r, &[]).map(|(topo, _)| topo)
    }

    /// Load an image, also returning the raw payloads of the `keep` chunks.
    pub(crate) fn load_image_with<R: Read>(
        r: &mut R,
        keep: &[[u8; 4]],
    ) -> io::Result<(Self, Vec<([u8; 4], Vec<u8>)>)> {
        let magic = storage::read_exact::<8, _>(r)?;
        if &magic != storage::MAGIC {
            return Err(storage::invalid("bad topology image magic"));
        }
        let version = storage::read_u32_le(r)?;
        if version != storage::VERSION_CURRENT {
            return Err(storage::invalid("unsupported topology image version"));
        }

        let mut cfg: Option<TopologyConfig> = None;
        let mut rng_state: Option<u64> = None;
        let mut context: Option<Context> = None;
        let mut registers: Option<(usize, Vec<f32>)> = None;
        let mut edges: Option<Vec<(NodeId, NodeId, f32)>> = None;
        let mut hyperedges: Option<BTreeMap<String, Hyperedge>> = None;
        let mut extra = Vec::new();

        loop {
            let (tag, len) = match storage::read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };

            let mut take = r.by_ref().take(u64::from(len));
            match &tag {
                b"CFG0" => cfg = Some(Self::read_cfg_payload(&mut take)?),
                b"PRNG" => rng_state = Some(storage::read_u64_le(&mut take)?),
                b"CTXT" => context = Some(Self::read_context_payload(&mut take)?),
                b"REGS" => {
                    let payload = storage::read_lz4_payload(&mut take, len)?;
                    registers = Some(Self::read_registers_payload(&payload)?);
                }
                b"EDGE" => edges = Some(Self::read_edges_payload(&mut take)?),
                b"HYPR" => hyperedges = Some(Self::read_hyperedges_payload(&mut take)?),
                other if keep.contains(other) => {
                    let mut payload = Vec::new();
                    take.read_to_end(&mut payload)?;
                    extra.push((*other, payload));
                }
                _ => {}
            }
            io::copy(&mut take, &mut io::sink())?;
        }

        let cfg = cfg.ok_or_else(|| storage::invalid("missing CFG0"))?;
        let (node_count, rows) = registers.ok_or_else(|| storage::invalid("missing REGS"))?;
        if node_count > cfg.capacity {
            return Err(storage::invalid("REGS exceeds capacity"));
        }

        let mut topo =
            Topology::try_new(cfg).map_err(|e| storage::invalid_owned(e.to_string()))?;
        for id in 0..node_count {
            let start = id * REGISTER_WIDTH;
            topo.store
                .write_row(id, &rows[start..start + REGISTER_WIDTH])
                .map_err(|e| storage::invalid_owned(e.to_string()))?;
        }
        topo.next_id = node_count;

        for (s, d, w) in edges.ok_or_else(|| storage::invalid("missing EDGE"))? {
            if s >= node_count || d >= node_count {
                return Err(storage::invalid("EDGE references unknown node"));
            }
            topo.edges.add_edge(s, d, w);
        }
        topo.hyperedges = hyperedges.unwrap_or_default();
        topo.context = context.unwrap_or_default();
        if let Some(state) = rng_state {
            topo.rng = Prng::from_state(state);
        }
        Ok((topo, extra))
    }

    /// Exact serialized size in bytes of the current image.
    pub fn image_size_bytes(&self) -> io::Result<usize> {
        let mut cw = storage::CountingWriter::new();
        self.save_image_to(&mut cw)?;
        Ok(cw.written())
    }

    fn cfg_payload(&self) -> io::Result<Vec<u8>> {
        let mut p = Vec::with_capacity(48);
        storage::write_u32_le(&mut p, self.cfg.capacity as u32)?;
        storage::write_u32_le(&mut p, self.cfg.backend as u32)?;
        storage::write_f32_le(&mut p, self.cfg.activation_threshold)?;
        storage::write_f32_le(&mut p, self.cfg.stress_halt)?;
        storage::write_f32_le(&mut p, self.cfg.position_jitter)?;
        storage::write_f32_le(&mut p, self.cfg.hyperedge_strength)?;
        storage::write_u32_le(&mut p, self.cfg.self_loops as u32)?;
        storage::write_u32_le(&mut p, u32::from(self.cfg.seed.is_some()))?;
        storage::write_u64_le(&mut p, self.cfg.seed.unwrap_or(0))?;
        Ok(p)
    }

    fn read_cfg_payload<R: Read>(r: &mut R) -> io::Result<TopologyConfig> {
        let capacity = storage::read_u32_le(r)? as usize;
        let backend = match storage::read_u32_le(r)? {
            0 => ArrayBackend::Host,
            _ => ArrayBackend::Accelerated,
        };
        let activation_threshold = storage::read_f32_le(r)?;
        let stress_halt = storage::read_f32_le(r)?;
        let position_jitter = storage::read_f32_le(r)?;
        let hyperedge_strength = storage::read_f32_le(r)?;
        let self_loops = match storage::read_u32_le(r)? {
            0 => SelfLoopPolicy::Allow,
            _ => SelfLoopPolicy::Reject,
        };
        let seed_present = storage::read_u32_le(r)?;
        let seed = storage::read_u64_le(r)?;

        Ok(TopologyConfig {
            capacity,
            backend,
            activation_threshold,
            stress_halt,
            position_jitter,
            hyperedge_strength,
            self_loops,
            seed: (seed_present != 0).then_some(seed),
        })
    }

    fn context_payload(&self) -> io::Result<Vec<u8>> {
        let mut p = Vec::with_capacity(16);
        for h in Hormone::ALL {
            storage::write_f32_le(&mut p, self.context.get(h))?;
        }
        Ok(p)
    }

    fn read_context_payload<R: Read>(r: &mut R) -> io::Result<Context> {
        let mut ctx = Context::default();
        for h in Hormone::ALL {
            *ctx.slot(h) = storage::read_f32_le(r)?.clamp(0.0, 1.0);
        }
        Ok(ctx)
    }

    fn registers_payload(&self) -> io::Result<Vec<u8>> {
        let rows = self.store.rows(self.next_id);
        let mut p = Vec::with_capacity(4 + rows.len() * 4);
        storage::write_u32_le(&mut p, self.next_id as u32)?;
        for &x in rows {
            storage::write_f32_le(&mut p, x)?;
        }
        Ok(p)
    }

    fn read_registers_payload(payload: &[u8]) -> io::Result<(usize, Vec<f32>)> {
        let mut r = payload;
        let node_count = storage::read_u32_le(&mut r)? as usize;
        let n = node_count
            .checked_mul(REGISTER_WIDTH)
            .ok_or_else(|| storage::invalid("REGS too large"))?;
        if r.len() != n * 4 {
            return Err(storage::invalid("REGS length mismatch"));
        }
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            rows.push(storage::read_f32_le(&mut r)?);
        }
        Ok((node_count, rows))
    }

    fn edges_payload(&self) -> io::Result<Vec<u8>> {
        let triples = self.edges.triples();
        let mut p = Vec::with_capacity(4 + triples.len() * 12);
        storage::write_u32_le(&mut p, triples.len() as u32)?;
        for (s, d, w) in triples {
            storage::write_u32_le(&mut p, s as u32)?;
            storage::write_u32_le(&mut p, d as u32)?;
            storage::write_f32_le(&mut p, w)?;
        }
        Ok(p)
    }

    fn read_edges_payload<R: Read>(r: &mut R) -> io::Result<Vec<(NodeId, NodeId, f32)>> {
        let n = storage::read_u32_le(r)? as usize;
        let mut out = Vec::with_capacity(n.min(1 << 20));
        for _ in 0..n {
            let s = storage::read_u32_le(r)? as usize;
            let d = storage::read_u32_le(r)? as usize;
            let w = storage::read_f32_le(r)?;
            out.push((s, d, w));
        }
        Ok(out)
    }

    fn hyperedges_payload(&self) -> io::Result<Vec<u8>> {
        let mut p = Vec::new();
        storage::write_u32_le(&mut p, self.hyperedges.len() as u32)?;
        for (name, h) in &self.hyperedges {
            storage::write_string(&mut p, name)?;
            storage::write_u32_le(&mut p, h.processor as u32)?;
            storage::write_u32_le(&mut p, h.members.len() as u32)?;
            for &m in &h.members {
                storage::write_u32_le(&mut p, m as u32)?;
            }
            storage::write_u32_le(&mut p, h.vector.len() as u32)?;
            for &x in &h.vector {
                storage::write_f32_le(&mut p, x)?;
            }
        }
        Ok(p)
    }

    fn read_hyperedges_payload<R: Read>(r: &mut R) -> io::Result<BTreeMap<String, Hyperedge>> {
        let n = storage::read_u32_le(r)? as usize;
        let mut out = BTreeMap::new();
        for _ in 0..n {
            let name = storage::read_string(r)?;
            let processor = storage::read_u32_le(r)? as usize;
            let m = storage::read_u32_le(r)? as usize;
            let mut members = Vec::with_capacity(m.min(1 << 16));
            for _ in 0..m {
                members.push(storage::read_u32_le(r)? as usize);
            }
            let v = storage::read_u32_le(r)? as usize;
            let mut vector = Vec::with_capacity(v.min(PROCESSOR_WIDTH));
            for _ in 0..v {
                vector.push(storage::read_f32_le(r)?);
            }
            out.insert(
                name,
                Hyperedge {
                    members,
                    processor,
                    vector,
                },
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(capacity: usize) -> Topology {
        Topology::new(TopologyConfig::with_capacity(capacity).with_seed(9))
    }

    #[test]
    fn weave_assigns_dense_ids_until_full() {
        let mut t = topo(3);
        assert_eq!(t.weave(None).unwrap(), 0);
        assert_eq!(t.weave(None).unwrap(), 1);
        assert_eq!(t.weave(None).unwrap(), 2);
        assert!(matches!(
            t.weave(None),
            Err(LoomError::CapacityExceeded { capacity: 3 })
        ));
        assert_eq!(t.node_count(), 3);
        assert_eq!(t.snapshot().utilization, 1.0);
    }

    #[test]
    fn weave_writes_identity_and_embedding() {
        let mut t = topo(4);
        t.weave(None).unwrap();
        let id = t.weave(Some(&[0.5; 80])).unwrap();
        let node = t.node(id).unwrap();
        assert_eq!(node.identifier(), 1.0);
        assert!(node.semantic_embedding().iter().all(|&x| x == 0.5));
        assert!(node.is_live());
        let norm: f32 = node.position().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!(norm > 0.0 && norm < 1.0);
    }

    #[test]
    fn connect_accumulates_in_index_and_register() {
        let mut t = topo(8);
        let a = t.weave(None).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.2, false).unwrap();
        t.connect(a, b, 0.3, false).unwrap();

        assert!((t.edges().get_strength(a, b) - 0.5).abs() < 1e-6);
        assert_eq!(t.edges().get_strength(b, a), 0.0);
        assert!((t.node(a).unwrap().connection_slot(b) - 0.5).abs() < 1e-6);
        assert_eq!(t.node(b).unwrap().connection_slot(a), 0.0);

        t.connect(a, b, 0.1, true).unwrap();
        assert!((t.edges().get_strength(b, a) - 0.1).abs() < 1e-6);
        assert!((t.node(b).unwrap().connection_slot(a) - 0.1).abs() < 1e-6);
        assert!(t.edges().is_consistent());
    }

    #[test]
    fn connect_rejects_unwoven_ids() {
        let mut t = topo(8);
        t.weave(None).unwrap();
        assert!(matches!(
            t.connect(0, 5, 0.1, false),
            Err(LoomError::InvalidNodeReference(5))
        ));
        assert!(t.edges().is_empty());
    }

    #[test]
    fn rejected_self_loop_leaves_register_untouched() {
        let mut t = Topology::new(
            TopologyConfig::with_capacity(2).with_self_loops(SelfLoopPolicy::Reject),
        );
        let a = t.weave(None).unwrap();
        t.connect(a, a, 0.4, false).unwrap();
        assert!(t.edges().is_empty());
        assert_eq!(t.node(a).unwrap().connection_slot(a), 0.0);
    }

    #[test]
    fn hyperedge_processor_is_member_mean() {
        let mut t = topo(8);
        let a = t.weave(Some(&[1.0; 64])).unwrap();
        let b = t.weave(Some(&[3.0; 64])).unwrap();
        let p = t.create_hyperedge(&[a, b], "pair").unwrap();

        assert_eq!(p, 2);
        let node = t.node(p).unwrap();
        assert!(node.is_processor());
        assert!(node
            .semantic_embedding()
            .iter()
            .all(|&x| (x - 2.0).abs() < 1e-6));

        let h = t.hyperedge("pair").unwrap();
        assert_eq!(h.members, vec![a, b]);
        assert_eq!(h.vector.len(), PROCESSOR_WIDTH);
        assert!((h.vector[0] - 2.0).abs() < 1e-6);
        assert_eq!(h.vector[64], 0.0);

        for m in [a, b] {
            assert!((t.edges().get_strength(m, p) - 0.5).abs() < 1e-6);
            assert!((t.edges().get_strength(p, m) - 0.5).abs() < 1e-6);
        }
        assert_eq!(t.snapshot().hyperedge_count, 1);
    }

    #[test]
    fn hyperedge_with_unknown_member_mutates_nothing() {
        let mut t = topo(8);
        t.weave(None).unwrap();
        assert!(t.create_hyperedge(&[0, 4], "bad").is_err());
        assert_eq!(t.node_count(), 1);
        assert!(t.hyperedge("bad").is_none());
        assert!(t.edges().is_empty());
    }

    #[test]
    fn modulate_clamps() {
        let mut t = topo(1);
        t.modulate_named("stress", 1.7).unwrap();
        assert_eq!(t.context().stress, 1.0);
        t.modulate(Hormone::Stress, -0.3);
        assert_eq!(t.context().stress, 0.0);
        t.modulate(Hormone::ConsolidationPressure, 0.4);
        assert_eq!(t.context().get(Hormone::ConsolidationPressure), 0.4);
        assert!(matches!(
            t.modulate_named("dopamine", 0.5),
            Err(LoomError::UnknownHormone(_))
        ));
    }

    #[test]
    fn propagation_follows_cached_slots() {
        let mut t = topo(8);
        let a = t.weave(None).unwrap();
        let b = t.weave(None).unwrap();
        let c = t.weave(None).unwrap();
        t.connect(a, b, 0.5, false).unwrap();
        t.connect(b, c, 0.5, false).unwrap();
        t.stimulate(a, 1.0).unwrap();

        let report = t.propagate(&[a], 1);
        assert_eq!(report.steps_run, 1);
        assert_eq!(report.activated, vec![b]);
        assert!((t.node(b).unwrap().latest_activation() - 0.5).abs() < 1e-6);

        let report = t.propagate(&[a], 2);
        assert_eq!(report.activated, vec![c]);
        // b's history now holds 0.5 + 0.5, c receives 1.0 * 0.5
        assert!((t.node(c).unwrap().latest_activation() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn weak_slots_do_not_activate() {
        let mut t = topo(4);
        let a = t.weave(None).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.01, false).unwrap();
        let report = t.propagate(&[a], 3);
        assert!(report.activated.is_empty());
        assert_eq!(report.steps_run, 1);
        assert!(!report.halted_by_stress);
    }

    #[test]
    fn dead_wave_ends_without_running_every_step() {
        let mut t = topo(4);
        let a = t.weave(None).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.5, false).unwrap();
        let report = t.propagate(&[a], usize::MAX);
        assert_eq!(report.steps_run, 2);
        assert!(report.activated.is_empty());
    }

    #[test]
    fn high_stress_halts_after_first_step() {
        let mut t = topo(4);
        let a = t.weave(None).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.5, true).unwrap();
        t.modulate(Hormone::Stress, 0.9);

        let report = t.propagate(&[a], 5);
        assert_eq!(report.steps_run, 1);
        assert!(report.halted_by_stress);
        assert_eq!(report.activated, vec![b]);
    }

    #[test]
    fn retired_nodes_drop_out_of_propagation() {
        let mut t = topo(4);
        let a = t.weave(None).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.5, false).unwrap();
        assert!(t.retire(b).unwrap());
        assert!(!t.retire(b).unwrap());

        assert!(t.propagate(&[a], 1).activated.is_empty());
        let stats = t.snapshot();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.live_count, 1);
        // id is never reused
        assert_eq!(t.weave(None).unwrap(), 2);
    }

    #[test]
    fn most_similar_ranks_live_nodes() {
        let mut t = topo(8);
        let mut e = [0.0f32; 64];
        e[0] = 1.0;
        let x = t.weave(Some(&e)).unwrap();
        e[1] = 1.0;
        let xy = t.weave(Some(&e)).unwrap();
        let mut f = [0.0f32; 64];
        f[5] = 1.0;
        t.weave(Some(&f)).unwrap();

        let hits = t.most_similar(&[1.0], 2);
        assert_eq!(hits[0].0, x);
        assert_eq!(hits[1].0, xy);
        assert!((t.semantic_similarity(x, xy).unwrap() - 0.5f32.sqrt()).abs() < 1e-5);
        assert!(t.hyperbolic_distance(x, xy).unwrap() >= 0.0);
    }

    #[test]
    fn image_roundtrip_preserves_state() {
        let mut t = topo(16);
        let a = t.weave(Some(&[0.25; 64])).unwrap();
        let b = t.weave(None).unwrap();
        t.connect(a, b, 0.3, true).unwrap();
        t.create_hyperedge(&[a, b], "ab").unwrap();
        t.modulate(Hormone::Curiosity, 0.9);

        let mut bytes = Vec::new();
        t.save_image_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), t.image_size_bytes().unwrap());

        let loaded = Topology::load_image_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(loaded.node_count(), t.node_count());
        assert_eq!(loaded.capacity(), 16);
        assert_eq!(loaded.edges().triples(), t.edges().triples());
        assert_eq!(loaded.hyperedge("ab"), t.hyperedge("ab"));
        assert_eq!(loaded.context(), t.context());
        assert_eq!(
            loaded.store().rows(loaded.node_count()),
            t.store().rows(t.node_count())
        );
        assert!(loaded.edges().is_consistent());
    }

    #[test]
    fn image_with_oversized_capacity_is_rejected() {
        let mut t = topo(4);
        t.weave(None).unwrap();
        let mut bytes = Vec::new();
        t.save_image_to(&mut bytes).unwrap();

        // magic, version, then the CFG0 header; capacity leads the payload.
        assert_eq!(&bytes[12..16], b"CFG0");
        bytes[20..24].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = Topology::load_image_from(&mut std::io::Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn try_new_rejects_invalid_config() {
        let cfg = TopologyConfig::with_capacity(MAX_CAPACITY + 1);
        assert!(matches!(
            Topology::try_new(cfg),
            Err(LoomError::InvalidConfig(_))
        ));
    }

    #[test]
    fn image_with_bad_magic_is_rejected() {
        let bytes = b"NOTLOOM!\x01\x00\x00\x00".to_vec();
        assert!(Topology::load_image_from(&mut std::io::Cursor::new(bytes)).is_err());
    }
}
