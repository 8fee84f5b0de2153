//! The single writer that owns a topology and all its learning machinery.
//!
//! Every mutation of the topology goes through `&mut Substrate`, so edge
//! updates from different components are serialized by construction. Sensors
//! talk to it only through the [`ActivationFeed`], which never blocks.

use std::io::{Read, Write};

use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::development::{DevelopmentalController, DevelopmentalPhase};
use crate::error::{LoomError, Result};
use crate::feed::{activation_feed, ActivationFeed, FeedDrain};
use crate::hebbian::{DecayReport, HebbianConfig, HebbianReport, PlasticityEngine};
use crate::register::NodeId;
use crate::replay::ExperienceReplay;
use crate::storage;
use crate::structural::StructuralPlasticityEngine;
use crate::topology::{Topology, TopologyConfig};

/// Image chunk holding the experience counter and cycle.
const DEVELOPMENT_CHUNK: [u8; 4] = *b"DEVL";

/// When the periodic phases of a tick run. Counters are in ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScheduleConfig {
    /// 0 disables decay.
    pub decay_every: u64,
    /// 0 disables periodic replay; pressure-triggered replay still runs.
    pub replay_every: u64,
    pub replays_per_cycle: usize,
    /// Consolidation pressure at or above which every tick replays.
    pub consolidation_pressure_trigger: f32,
    /// 0 disables growth (spawn and prune).
    pub growth_every: u64,
    pub spawn_per_growth: usize,
    pub prune_usage_threshold: f32,
    /// Tombstone prune candidates instead of only forgetting their usage.
    pub retire_pruned: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            decay_every: 1,
            replay_every: 100,
            replays_per_cycle: 10,
            consolidation_pressure_trigger: 0.5,
            growth_every: 0,
            spawn_per_growth: 1,
            prune_usage_threshold: 0.01,
            retire_pruned: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SubstrateConfig {
    pub topology: TopologyConfig,
    pub hebbian: HebbianConfig,
    pub replay_capacity: usize,
    pub usage_decay: f32,
    pub feed_capacity: usize,
    pub schedule: ScheduleConfig,
}

impl SubstrateConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topology: TopologyConfig::with_capacity(capacity),
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.topology.seed = Some(seed);
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleConfig) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn validate(&self) -> core::result::Result<(), &'static str> {
        self.topology.validate()?;
        self.hebbian.validate()?;
        if !(0.0..=1.0).contains(&self.usage_decay) {
            return Err("usage_decay must be in [0, 1]");
        }
        if self.feed_capacity == 0 {
            return Err("feed_capacity must be > 0");
        }
        Ok(())
    }
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            topology: TopologyConfig::default(),
            hebbian: HebbianConfig::default(),
            replay_capacity: 10_000,
            usage_decay: 0.99,
            feed_capacity: 4096,
            schedule: ScheduleConfig::default(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TickReport {
    pub cycle: u64,
    pub events: usize,
    /// Live nodes that fired this tick, ascending.
    pub active: Vec<NodeId>,
    pub hebbian: HebbianReport,
    pub sprouted: usize,
    pub decay: Option<DecayReport>,
    pub replay: Option<HebbianReport>,
    pub spawned: usize,
    pub pruned: Vec<NodeId>,
    pub phase: DevelopmentalPhase,
    pub synced_rows: usize,
}

pub struct Substrate {
    cfg: SubstrateConfig,
    topology: Topology,
    engine: PlasticityEngine,
    development: DevelopmentalController,
    replay: ExperienceReplay,
    structural: StructuralPlasticityEngine,
    feed: ActivationFeed,
    drain: FeedDrain,
    cycle: u64,
}

impl core::fmt::Debug for Substrate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Substrate")
            .field("cycle", &self.cycle)
            .field("topology", &self.topology)
            .field("phase", &self.development.phase())
            .finish()
    }
}

impl Substrate {
    pub fn new(cfg: SubstrateConfig) -> Result<Self> {
        cfg.validate().map_err(LoomError::InvalidConfig)?;
        let topology = Topology::new(cfg.topology);
        Ok(Self::assemble(cfg, topology))
    }

    /// Wrap an existing topology, e.g. one loaded from an image. The
    /// topology keeps its own config; `cfg.topology` is ignored.
    pub fn with_topology(cfg: SubstrateConfig, topology: Topology) -> Result<Self> {
        let cfg = SubstrateConfig {
            topology: *topology.config(),
            ..cfg
        };
        cfg.validate().map_err(LoomError::InvalidConfig)?;
        Ok(Self::assemble(cfg, topology))
    }

    fn assemble(cfg: SubstrateConfig, topology: Topology) -> Self {
        let seed = cfg.topology.seed.unwrap_or(1);
        let mut engine = PlasticityEngine::new(cfg.hebbian, seed);
        let (feed, drain) = activation_feed(cfg.feed_capacity, engine.epoch());
        let development = DevelopmentalController::new();
        development.modulate(&mut engine);

        Self {
            replay: ExperienceReplay::new(cfg.replay_capacity, seed),
            structural: StructuralPlasticityEngine::new(cfg.usage_decay, seed),
            topology,
            engine,
            development,
            feed,
            drain,
            cycle: 0,
            cfg,
        }
    }

    pub fn config(&self) -> &SubstrateConfig {
        &self.cfg
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn engine(&self) -> &PlasticityEngine {
        &self.engine
    }

    pub fn development(&self) -> &DevelopmentalController {
        &self.development
    }

    pub fn replay(&self) -> &ExperienceReplay {
        &self.replay
    }

    pub fn structural(&self) -> &StructuralPlasticityEngine {
        &self.structural
    }

    /// A producer handle for sensors on other threads.
    pub fn feed(&self) -> ActivationFeed {
        self.feed.clone()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Events queued for the next tick.
    pub fn pending_events(&self) -> usize {
        self.drain.pending()
    }

    pub fn dropped_events(&self) -> u64 {
        self.drain.dropped()
    }

    pub fn tick(&mut self) -> TickReport {
        let now = self.engine.now();
        self.tick_at(now)
    }

    /// Run one scheduler cycle at time `now`:
    /// drain the feed, Hebbian update and exploratory sprouting, decay,
    /// usage tracking, experience and phase, replay, growth, backend sync.
    pub fn tick_at(&mut self, now: f64) -> TickReport {
        self.cycle += 1;
        let cycle = self.cycle;
        let schedule = self.cfg.schedule;

        self.development.modulate(&mut self.engine);

        let events = self.drain.drain();
        let mut active: Vec<NodeId> = Vec::with_capacity(events.len());
        for e in &events {
            self.engine
                .record_activation_at(e.node, e.strength, e.timestamp);
            match self.topology.stimulate(e.node, e.strength) {
                Ok(()) if self.topology.is_live(e.node) => active.push(e.node),
                Ok(()) => {}
                Err(err) => debug!(node = e.node, "activation ignored: {err}"),
            }
        }
        active.sort_unstable();
        active.dedup();

        let hebbian = self.engine.apply_hebbian_update_at(&mut self.topology, now);
        let sprouted = self.engine.induce_sprouting(&mut self.topology, &active);

        let decay = (schedule.decay_every > 0 && cycle % schedule.decay_every == 0)
            .then(|| self.engine.apply_synaptic_decay(&mut self.topology));

        self.structural.track_usage(&active);

        if !active.is_empty() {
            self.replay.store(&active);
            if self.development.record_experience().is_some() {
                self.development.modulate(&mut self.engine);
            }
        }

        let pressure = self.topology.context().consolidation_pressure;
        let consolidate = (schedule.replay_every > 0 && cycle % schedule.replay_every == 0)
            || pressure >= schedule.consolidation_pressure_trigger;
        let replay = consolidate.then(|| {
            self.replay.replay_at(
                &mut self.topology,
                &mut self.engine,
                schedule.replays_per_cycle,
                now,
            )
        });

        let (spawned, pruned) = if schedule.growth_every > 0 && cycle % schedule.growth_every == 0
        {
            self.grow(&schedule)
        } else {
            (0, Vec::new())
        };

        let synced_rows = self.topology.sync();

        let report = TickReport {
            cycle,
            events: events.len(),
            active,
            hebbian,
            sprouted,
            decay,
            replay,
            spawned,
            pruned,
            phase: self.development.phase(),
            synced_rows,
        };
        debug!(
            cycle,
            events = report.events,
            active = report.active.len(),
            edges = self.topology.edges().len(),
            "tick"
        );
        report
    }

    fn grow(&mut self, schedule: &ScheduleConfig) -> (usize, Vec<NodeId>) {
        let spawned = match self
            .structural
            .spawn(&mut self.topology, schedule.spawn_per_growth)
        {
            Ok(ids) => ids.len(),
            Err(e) => {
                warn!("growth spawn stopped: {e}");
                0
            }
        };

        let pruned = self
            .structural
            .prune_candidates(schedule.prune_usage_threshold);
        if schedule.retire_pruned {
            for &id in &pruned {
                if let Err(e) = self.topology.retire(id) {
                    debug!(id, "retire skipped: {e}");
                }
            }
        }
        (spawned, pruned)
    }

    /// Queue an activation on the substrate's own feed; it is consumed by
    /// the next tick.
    pub fn record_activation(&mut self, node: NodeId, strength: f32) {
        self.feed.record(node, strength);
    }

    /// Save the topology image plus the developmental state, so a reloaded
    /// substrate resumes in the same phase.
    pub fn save_image_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let mut devl = Vec::with_capacity(16);
        storage::write_u64_le(&mut devl, self.development.experience_count())?;
        storage::write_u64_le(&mut devl, self.cycle)?;
        self.topology
            .save_image_with(w, &[(DEVELOPMENT_CHUNK, devl.as_slice())])?;
        Ok(())
    }

    /// Images without developmental state start from experience zero.
    pub fn load_image_from<R: Read>(cfg: SubstrateConfig, r: &mut R) -> Result<Self> {
        let (topology, extra) = Topology::load_image_with(r, &[DEVELOPMENT_CHUNK])?;
        let mut substrate = Self::with_topology(cfg, topology)?;

        if let Some((_, payload)) = extra.iter().find(|(tag, _)| *tag == DEVELOPMENT_CHUNK) {
            let mut p = payload.as_slice();
            let experience = storage::read_u64_le(&mut p)?;
            substrate.cycle = storage::read_u64_le(&mut p)?;
            substrate.development = DevelopmentalController::with_experience(experience);
            substrate.development.modulate(&mut substrate.engine);
        }
        Ok(substrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Hormone;

    fn quiet_schedule() -> ScheduleConfig {
        ScheduleConfig {
            decay_every: 0,
            replay_every: 0,
            consolidation_pressure_trigger: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_validate() {
        let cfg = SubstrateConfig::default();
        assert_eq!(cfg.replay_capacity, 10_000);
        assert_eq!(cfg.feed_capacity, 4096);
        assert!(cfg.validate().is_ok());

        let bad = SubstrateConfig {
            usage_decay: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            Substrate::new(bad),
            Err(LoomError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tick_learns_from_fed_coactivation() {
        let cfg = SubstrateConfig::with_capacity(16)
            .with_seed(4)
            .with_schedule(quiet_schedule());
        let mut s = Substrate::new(cfg).unwrap();
        for _ in 0..3 {
            s.topology_mut().weave(None).unwrap();
        }
        s.topology_mut().modulate(Hormone::Curiosity, 0.0);

        let feed = s.feed();
        feed.record_at(0, 1.0, 1.0);
        feed.record_at(1, 0.9, 1.0);
        let report = s.tick_at(1.0);

        assert_eq!(report.cycle, 1);
        assert_eq!(report.events, 2);
        assert_eq!(report.active, vec![0, 1]);
        assert_eq!(report.hebbian.sprouted, 1);
        assert!((s.topology().edges().get_strength(0, 1) - 0.01).abs() < 1e-6);
        assert_eq!(s.replay().len(), 1);
        assert_eq!(s.development().experience_count(), 1);
        assert!(s.topology().node(0).unwrap().latest_activation() > 0.0);
    }

    #[test]
    fn quiet_tick_changes_nothing() {
        let cfg = SubstrateConfig::with_capacity(4).with_schedule(quiet_schedule());
        let mut s = Substrate::new(cfg).unwrap();
        let report = s.tick_at(0.0);
        assert!(report.active.is_empty());
        assert_eq!(report.decay, None);
        assert_eq!(report.replay, None);
        assert_eq!(s.development().experience_count(), 0);
    }

    #[test]
    fn consolidation_pressure_triggers_replay() {
        let cfg = SubstrateConfig::with_capacity(4).with_schedule(ScheduleConfig {
            decay_every: 0,
            replay_every: 0,
            ..Default::default()
        });
        let mut s = Substrate::new(cfg).unwrap();
        assert_eq!(s.tick_at(0.0).replay, None);

        s.topology_mut()
            .modulate(Hormone::ConsolidationPressure, 0.9);
        assert!(s.tick_at(0.0).replay.is_some());
    }

    #[test]
    fn unwoven_ids_in_the_feed_are_ignored() {
        let cfg = SubstrateConfig::with_capacity(4).with_schedule(quiet_schedule());
        let mut s = Substrate::new(cfg).unwrap();
        s.topology_mut().weave(None).unwrap();
        s.record_activation(0, 1.0);
        s.record_activation(9, 1.0);
        let report = s.tick();
        assert_eq!(report.events, 2);
        assert_eq!(report.active, vec![0]);
        assert!(s.topology().edges().is_empty());
    }

    #[test]
    fn growth_spawns_and_retires_idle_nodes() {
        let cfg = SubstrateConfig::with_capacity(32)
            .with_seed(8)
            .with_schedule(ScheduleConfig {
                decay_every: 0,
                replay_every: 0,
                consolidation_pressure_trigger: 2.0,
                growth_every: 1,
                spawn_per_growth: 2,
                prune_usage_threshold: 0.5,
                retire_pruned: true,
                ..Default::default()
            });
        let mut s = Substrate::new(cfg).unwrap();
        s.topology_mut().weave(None).unwrap();
        s.topology_mut().modulate(Hormone::Curiosity, 0.0);

        let feed = s.feed();
        feed.record_at(0, 1.0, 0.0);
        let first = s.tick_at(0.0);
        assert_eq!(first.spawned, 2);
        assert!(first.pruned.is_empty());

        // node 0's usage decays 0.99 per tick and never falls under 0.5 here
        let second = s.tick_at(0.1);
        assert_eq!(second.spawned, 2);
        assert!(second.pruned.is_empty());
        assert!(s.topology().is_live(0));
        assert_eq!(s.topology().node_count(), 5);
    }

    #[test]
    fn image_roundtrip_through_substrate() {
        let cfg = SubstrateConfig::with_capacity(8).with_seed(2);
        let mut s = Substrate::new(cfg).unwrap();
        let a = s.topology_mut().weave(None).unwrap();
        let b = s.topology_mut().weave(None).unwrap();
        s.topology_mut().connect(a, b, 0.4, false).unwrap();

        let mut bytes = Vec::new();
        s.save_image_to(&mut bytes).unwrap();
        let loaded =
            Substrate::load_image_from(cfg, &mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(loaded.topology().node_count(), 2);
        assert!((loaded.topology().edges().get_strength(a, b) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn image_roundtrip_keeps_developmental_phase() {
        let cfg = SubstrateConfig::with_capacity(8).with_seed(2);
        let mut s = Substrate::new(cfg).unwrap();
        s.topology_mut().weave(None).unwrap();
        s.development = DevelopmentalController::with_experience(1_200);
        s.development.modulate(&mut s.engine);
        s.cycle = 1_250;
        let rates = s.engine().rates();

        let mut bytes = Vec::new();
        s.save_image_to(&mut bytes).unwrap();
        let loaded =
            Substrate::load_image_from(cfg, &mut std::io::Cursor::new(bytes)).unwrap();

        assert_eq!(loaded.development().experience_count(), 1_200);
        assert_eq!(loaded.development().phase(), DevelopmentalPhase::Juvenile);
        assert_eq!(loaded.cycle(), 1_250);
        assert_eq!(loaded.engine().rates(), rates);
        assert!((loaded.engine().rates().strengthening_rate - 0.15).abs() < 1e-6);
    }

    #[test]
    fn topology_images_load_as_fresh_substrates() {
        let cfg = SubstrateConfig::with_capacity(4);
        let mut topo = Topology::new(cfg.topology);
        topo.weave(None).unwrap();
        let mut bytes = Vec::new();
        topo.save_image_to(&mut bytes).unwrap();

        let loaded =
            Substrate::load_image_from(cfg, &mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(loaded.development().experience_count(), 0);
        assert_eq!(loaded.cycle(), 0);
        assert_eq!(loaded.topology().node_count(), 1);
    }

    #[test]
    fn growth_at_capacity_reports_partial_spawn() {
        let cfg = SubstrateConfig::with_capacity(3).with_schedule(ScheduleConfig {
            growth_every: 1,
            spawn_per_growth: 3,
            prune_usage_threshold: 0.0,
            ..quiet_schedule()
        });
        let mut s = Substrate::new(cfg).unwrap();
        s.topology_mut().weave(None).unwrap();

        let report = s.tick_at(0.0);
        assert_eq!(report.spawned, 2);
        assert_eq!(s.topology().node_count(), 3);
        assert_eq!(s.tick_at(1.0).spawned, 0);
    }
}
