//! Preallocated register bank holding every node's state.
//!
//! Each node is one fixed-width row of `REGISTER_WIDTH` f32 slots. The row is
//! split into disjoint fields at constant offsets (see [`Field`]); nothing is
//! ever reallocated once the store exists.

use hashbrown::HashSet;
use tracing::{debug, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};
use crate::node::{Node, NodeMut};

pub type NodeId = usize;

/// Scalar slots per register row.
pub const REGISTER_WIDTH: usize = 256;

/// A contiguous slot range inside a register row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub start: usize,
    pub width: usize,
}

impl Field {
    pub const fn new(start: usize, width: usize) -> Self {
        Self { start, width }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.start + self.width
    }

    #[inline]
    pub fn range(&self) -> core::ops::Range<usize> {
        self.start..self.end()
    }
}

pub const IDENTIFIER: Field = Field::new(0, 4);
/// Coordinates inside the Poincaré ball.
pub const POSITION: Field = Field::new(IDENTIFIER.end(), 16);
pub const SEMANTIC: Field = Field::new(POSITION.end(), 64);
/// Ring buffer of recent activation magnitudes, newest last.
pub const ACTIVATION: Field = Field::new(SEMANTIC.end(), 64);
/// Outgoing strength cache, slot = `target % CONNECTIONS.width`.
pub const CONNECTIONS: Field = Field::new(ACTIVATION.end(), 64);
pub const AFFECT: Field = Field::new(CONNECTIONS.end(), 32);
pub const METADATA: Field = Field::new(AFFECT.end(), 12);

/// Metadata slot: 1.0 while the node is live, 0.0 once tombstoned.
pub const META_LIVE: usize = 0;
/// Metadata slot: 1.0 for hyperedge processor nodes.
pub const META_PROCESSOR: usize = 1;

const _: () = assert!(METADATA.end() == REGISTER_WIDTH);
const _: () = assert!(META_PROCESSOR < METADATA.width);

/// Where the register bank lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArrayBackend {
    /// Plain in-process array.
    #[default]
    Host,
    /// Host array mirrored into an accelerator buffer (requires `gpu`).
    Accelerated,
}

pub struct RegisterStore {
    capacity: usize,
    data: Vec<f32>,
    backend: ArrayBackend,

    // Rows written since the last `sync`.
    dirty: HashSet<NodeId>,

    #[cfg(feature = "gpu")]
    mirror: Option<crate::gpu::RegisterMirror>,
}

impl core::fmt::Debug for RegisterStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisterStore")
            .field("capacity", &self.capacity)
            .field("backend", &self.backend)
            .field("dirty_rows", &self.dirty.len())
            .finish()
    }
}

impl RegisterStore {
    /// Preallocate `capacity` zeroed rows in host memory.
    pub fn allocate(capacity: usize) -> Self {
        Self::from_data(capacity, vec![0.0; capacity * REGISTER_WIDTH])
    }

    /// Like [`Self::allocate`], but a bank the allocator cannot provide is
    /// reported instead of aborting the process.
    pub fn try_allocate(capacity: usize) -> Result<Self> {
        let len = capacity
            .checked_mul(REGISTER_WIDTH)
            .ok_or(LoomError::InvalidConfig("register bank size overflows"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| LoomError::InvalidConfig("register bank too large to allocate"))?;
        data.resize(len, 0.0);
        Ok(Self::from_data(capacity, data))
    }

    fn from_data(capacity: usize, data: Vec<f32>) -> Self {
        Self {
            capacity,
            data,
            backend: ArrayBackend::Host,
            dirty: HashSet::new(),
            #[cfg(feature = "gpu")]
            mirror: None,
        }
    }

    /// Preallocate on the requested backend.
    ///
    /// An unavailable accelerator is not an error: the store falls back to
    /// host memory and reports `ArrayBackend::Host` from [`Self::backend`].
    pub fn allocate_on(capacity: usize, backend: ArrayBackend) -> Self {
        Self::allocate(capacity).on_backend(backend)
    }

    /// Fallible [`Self::allocate_on`].
    pub fn try_allocate_on(capacity: usize, backend: ArrayBackend) -> Result<Self> {
        Ok(Self::try_allocate(capacity)?.on_backend(backend))
    }

    fn on_backend(self, backend: ArrayBackend) -> Self {
        #[cfg_attr(not(feature = "gpu"), allow(unused_mut))]
        let mut store = self;
        if backend == ArrayBackend::Accelerated {
            #[cfg(feature = "gpu")]
            {
                match crate::gpu::RegisterMirror::new(store.capacity) {
                    Ok(mirror) => {
                        store.mirror = Some(mirror);
                        store.backend = ArrayBackend::Accelerated;
                    }
                    Err(e) => warn!("{e}; using host register bank"),
                }
            }

            #[cfg(not(feature = "gpu"))]
            {
                let e = LoomError::BackendUnavailable(
                    "built without the `gpu` feature".to_string(),
                );
                warn!("{e}; using host register bank");
            }
        }
        store
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn backend(&self) -> ArrayBackend {
        self.backend
    }

    #[inline]
    fn check(&self, id: NodeId) -> Result<core::ops::Range<usize>> {
        if id >= self.capacity {
            return Err(LoomError::OutOfBounds {
                id,
                capacity: self.capacity,
            });
        }
        let start = id * REGISTER_WIDTH;
        Ok(start..start + REGISTER_WIDTH)
    }

    pub fn read_row(&self, id: NodeId) -> Result<&[f32]> {
        let range = self.check(id)?;
        Ok(&self.data[range])
    }

    /// Overwrite a whole row. Short inputs zero the remainder; long inputs
    /// are truncated to `REGISTER_WIDTH`.
    pub fn write_row(&mut self, id: NodeId, values: &[f32]) -> Result<()> {
        let range = self.check(id)?;
        if values.len() > REGISTER_WIDTH {
            debug!(
                id,
                len = values.len(),
                "register row truncated to {REGISTER_WIDTH} slots"
            );
        }
        let row = &mut self.data[range];
        let n = values.len().min(REGISTER_WIDTH);
        row[..n].copy_from_slice(&values[..n]);
        row[n..].fill(0.0);
        self.dirty.insert(id);
        Ok(())
    }

    pub fn row_mut(&mut self, id: NodeId) -> Result<&mut [f32]> {
        let range = self.check(id)?;
        self.dirty.insert(id);
        Ok(&mut self.data[range])
    }

    pub fn node(&self, id: NodeId) -> Result<Node<'_>> {
        Ok(Node::new(id, self.read_row(id)?))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<NodeMut<'_>> {
        Ok(NodeMut::new(id, self.row_mut(id)?))
    }

    /// The first `rows` rows as one row-major slice.
    pub fn rows(&self, rows: usize) -> &[f32] {
        &self.data[..rows.min(self.capacity) * REGISTER_WIDTH]
    }

    pub fn dirty_rows(&self) -> usize {
        self.dirty.len()
    }

    /// Push rows written since the last call to the accelerator mirror.
    /// Returns how many rows were flushed; host-only stores just reset.
    pub fn sync(&mut self) -> usize {
        let n = self.dirty.len();

        #[cfg(feature = "gpu")]
        {
            if let Some(mirror) = &self.mirror {
                for &id in &self.dirty {
                    let start = id * REGISTER_WIDTH;
                    mirror.upload_row(id, &self.data[start..start + REGISTER_WIDTH]);
                }
                mirror.submit();
            }
        }

        self.dirty.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_tile_the_register() {
        let fields = [
            IDENTIFIER,
            POSITION,
            SEMANTIC,
            ACTIVATION,
            CONNECTIONS,
            AFFECT,
            METADATA,
        ];
        let mut cursor = 0;
        for f in fields {
            assert_eq!(f.start, cursor);
            cursor = f.end();
        }
        assert_eq!(cursor, REGISTER_WIDTH);
        assert_eq!(SEMANTIC.start, 20);
        assert_eq!(CONNECTIONS.start, 148);
        assert_eq!(METADATA.start, 244);
    }

    #[test]
    fn rows_start_zeroed() {
        let store = RegisterStore::allocate(3);
        assert_eq!(store.capacity(), 3);
        assert!(store.read_row(2).unwrap().iter().all(|&x| x == 0.0));
        assert_eq!(store.rows(3).len(), 3 * REGISTER_WIDTH);
    }

    #[test]
    fn out_of_bounds_rows_are_rejected() {
        let mut store = RegisterStore::allocate(2);
        assert!(matches!(
            store.read_row(2),
            Err(LoomError::OutOfBounds { id: 2, capacity: 2 })
        ));
        assert!(matches!(
            store.write_row(5, &[1.0]),
            Err(LoomError::OutOfBounds { id: 5, .. })
        ));
    }

    #[test]
    fn write_row_truncates_and_zero_fills() {
        let mut store = RegisterStore::allocate(2);
        store.write_row(0, &[1.0; REGISTER_WIDTH + 10]).unwrap();
        store.write_row(1, &[1.0; REGISTER_WIDTH]).unwrap();
        assert!(store.read_row(0).unwrap().iter().all(|&x| x == 1.0));

        store.write_row(1, &[2.0, 3.0]).unwrap();
        let row = store.read_row(1).unwrap();
        assert_eq!(&row[..2], &[2.0, 3.0]);
        assert!(row[2..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn oversized_bank_is_reported_not_aborted() {
        assert!(matches!(
            RegisterStore::try_allocate(usize::MAX / 2),
            Err(LoomError::InvalidConfig(_))
        ));
        let store = RegisterStore::try_allocate_on(2, ArrayBackend::Host).unwrap();
        assert_eq!(store.capacity(), 2);
    }

    #[test]
    fn accelerated_request_falls_back_without_device() {
        let mut store = RegisterStore::allocate_on(4, ArrayBackend::Accelerated);
        store.write_row(1, &[0.5; 8]).unwrap();
        assert_eq!(store.read_row(1).unwrap()[7], 0.5);
        if !cfg!(feature = "gpu") {
            assert_eq!(store.backend(), ArrayBackend::Host);
        }
        assert_eq!(store.sync(), 1);
        assert_eq!(store.dirty_rows(), 0);
    }
}
