use std::io;

use thiserror::Error;

use crate::register::NodeId;

/// Failures surfaced by the substrate.
///
/// Oversized field writes are not represented here: they are truncated to the
/// field width and logged, never reported.
#[derive(Debug, Error)]
pub enum LoomError {
    /// Weave attempted on a full register store.
    #[error("register store is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    /// Row access past the preallocated capacity.
    #[error("row {id} is outside the register store (capacity {capacity})")]
    OutOfBounds { id: NodeId, capacity: usize },

    /// Operation names a node id that was never woven.
    #[error("node {0} has not been woven")]
    InvalidNodeReference(NodeId),

    /// The accelerated array backend could not be brought up.
    #[error("array backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("unknown hormone `{0}`")]
    UnknownHormone(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("topology image: {0}")]
    Image(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LoomError>;
