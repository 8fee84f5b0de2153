//! # loom
//!
//! A self-modifying graph substrate where memory and computation share one
//! structure.
//!
//! Every node is a fixed-width register row in a preallocated bank; edges live
//! in a sparse weighted index. Activity propagates along cached connection
//! slots, and time-windowed Hebbian learning reshapes the graph: coactivated
//! pairs strengthen, idle edges decay and are pruned, curiosity sprouts
//! exploratory links, and structural plasticity spawns new nodes.
//!
//! ## Quick Start
//!
//! ```
//! use loom::prelude::*;
//!
//! let cfg = SubstrateConfig::with_capacity(1_000).with_seed(42);
//! let mut substrate = Substrate::new(cfg).unwrap();
//!
//! let topo = substrate.topology_mut();
//! let a = topo.weave(Some(&[0.1; 64])).unwrap();
//! let b = topo.weave(Some(&[0.2; 64])).unwrap();
//! topo.connect(a, b, 0.5, true).unwrap();
//!
//! // Sensors push through the feed; the tick drains it and learns.
//! let feed = substrate.feed();
//! feed.record(a, 1.0);
//! feed.record(b, 1.0);
//! let report = substrate.tick();
//! assert_eq!(report.active, vec![a, b]);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Serialization of configs, reports and exports
//! - `parallel`: Parallel decay sweeps and similarity scans via rayon
//! - `simd`: SIMD cosine similarity via the `wide` crate
//! - `gpu`: Mirror the register bank into a wgpu storage buffer
//!
//! ## Modules
//!
//! - [`topology`]: Node weaving, edges, hyperedges, propagation, context
//! - [`hebbian`]: Coactivation detection, strengthening, decay, sprouting
//! - [`development`]: Critical-period rate scaling
//! - [`replay`]: Offline experience replay
//! - [`structural`]: Usage tracking, spawning, prune candidates
//! - [`substrate`]: The single writer and its tick scheduler
//! - [`observer`]: Read-only observation adapters and exports

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/register.rs"]
pub mod register;

#[path = "core/node.rs"]
pub mod node;

#[path = "core/edges.rs"]
pub mod edges;

#[path = "core/topology.rs"]
pub mod topology;

#[path = "core/hebbian.rs"]
pub mod hebbian;

#[path = "core/development.rs"]
pub mod development;

#[path = "core/replay.rs"]
pub mod replay;

#[path = "core/structural.rs"]
pub mod structural;

#[path = "core/feed.rs"]
pub mod feed;

#[path = "core/substrate.rs"]
pub mod substrate;

#[path = "core/storage.rs"]
pub mod storage;

#[cfg(feature = "gpu")]
#[path = "core/gpu.rs"]
pub mod gpu;

pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use loom::prelude::*;
/// ```
pub mod prelude {
    pub use crate::development::{DevelopmentalController, DevelopmentalPhase};
    pub use crate::edges::{EdgeIndex, SelfLoopPolicy};
    pub use crate::error::{LoomError, Result};
    pub use crate::feed::ActivationFeed;
    pub use crate::hebbian::{
        ActivationEvent, Coactivation, HebbianConfig, PlasticityEngine, PlasticityRates,
    };
    pub use crate::observer::{SubstrateAdapter, TopologyAdapter, TopologyExport};
    pub use crate::register::{ArrayBackend, NodeId, RegisterStore};
    pub use crate::replay::ExperienceReplay;
    pub use crate::structural::StructuralPlasticityEngine;
    pub use crate::substrate::{ScheduleConfig, Substrate, SubstrateConfig, TickReport};
    pub use crate::topology::{
        Context, Hormone, PropagationReport, Topology, TopologyConfig, TopologyStats,
    };
}
