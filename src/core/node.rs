//! Typed views over a single register row.
//!
//! A node has no storage of its own: [`Node`] and [`NodeMut`] borrow one row
//! of the [`RegisterStore`](crate::register::RegisterStore) and read or write
//! its fields in place. Every write is bounded by the field width; oversized
//! inputs are truncated.

use tracing::debug;

use crate::register::{
    Field, NodeId, ACTIVATION, AFFECT, CONNECTIONS, IDENTIFIER, METADATA, META_LIVE,
    META_PROCESSOR, POSITION, SEMANTIC,
};

/// Positions are kept strictly inside the unit ball.
const POINCARE_MAX_NORM: f32 = 1.0 - 1e-5;

#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    id: NodeId,
    row: &'a [f32],
}

#[derive(Debug)]
pub struct NodeMut<'a> {
    id: NodeId,
    row: &'a mut [f32],
}

impl<'a> Node<'a> {
    pub(crate) fn new(id: NodeId, row: &'a [f32]) -> Self {
        Self { id, row }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The id as stored in the register itself.
    #[inline]
    pub fn identifier(&self) -> f32 {
        self.row[IDENTIFIER.start]
    }

    #[inline]
    pub fn field(&self, field: Field) -> &'a [f32] {
        &self.row[field.range()]
    }

    pub fn position(&self) -> &'a [f32] {
        self.field(POSITION)
    }

    pub fn semantic_embedding(&self) -> &'a [f32] {
        self.field(SEMANTIC)
    }

    pub fn activation_history(&self) -> &'a [f32] {
        self.field(ACTIVATION)
    }

    pub fn connection_weights(&self) -> &'a [f32] {
        self.field(CONNECTIONS)
    }

    /// Cached outgoing strength toward `target` (lossy: targets sharing
    /// `target % 64` share a slot).
    #[inline]
    pub fn connection_slot(&self, target: NodeId) -> f32 {
        self.row[CONNECTIONS.start + target % CONNECTIONS.width]
    }

    pub fn affect(&self) -> &'a [f32] {
        self.field(AFFECT)
    }

    pub fn metadata(&self) -> &'a [f32] {
        self.field(METADATA)
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.row[METADATA.start + META_LIVE] > 0.5
    }

    #[inline]
    pub fn is_processor(&self) -> bool {
        self.row[METADATA.start + META_PROCESSOR] > 0.5
    }

    /// Sum over the activation ring buffer.
    pub fn activation_sum(&self) -> f32 {
        self.activation_history().iter().sum()
    }

    /// Most recent activation magnitude.
    #[inline]
    pub fn latest_activation(&self) -> f32 {
        self.row[ACTIVATION.end() - 1]
    }
}

impl<'a> NodeMut<'a> {
    pub(crate) fn new(id: NodeId, row: &'a mut [f32]) -> Self {
        Self { id, row }
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn as_node(&self) -> Node<'_> {
        Node::new(self.id, &self.row[..])
    }

    /// Write `values` into `field`, zeroing any slots it does not cover.
    /// Returns `true` when the input had to be truncated.
    pub fn set_field(&mut self, field: Field, values: &[f32]) -> bool {
        let dst = &mut self.row[field.range()];
        let n = values.len().min(field.width);
        dst[..n].copy_from_slice(&values[..n]);
        dst[n..].fill(0.0);

        let truncated = values.len() > field.width;
        if truncated {
            debug!(
                node = self.id,
                len = values.len(),
                width = field.width,
                "field write truncated"
            );
        }
        truncated
    }

    /// Stamp the id into the identifier field and mark the node live.
    pub fn stamp_identity(&mut self) {
        let id = self.id as f32;
        self.row[IDENTIFIER.range()].fill(id);
        self.set_flag(META_LIVE, true);
    }

    /// Set a position, projected into the open Poincaré ball.
    pub fn set_position(&mut self, coords: &[f32]) -> bool {
        let truncated = self.set_field(POSITION, coords);
        project_to_poincare(&mut self.row[POSITION.range()]);
        truncated
    }

    pub fn set_semantic_embedding(&mut self, embedding: &[f32]) -> bool {
        self.set_field(SEMANTIC, embedding)
    }

    pub fn set_affect(&mut self, affect: &[f32]) -> bool {
        self.set_field(AFFECT, affect)
    }

    /// Accumulate into the cached slot for `target`; returns the new slot value.
    pub fn strengthen_connection(&mut self, target: NodeId, strength: f32) -> f32 {
        let slot = &mut self.row[CONNECTIONS.start + target % CONNECTIONS.width];
        *slot += strength;
        *slot
    }

    /// Shift the ring buffer left by one and append `value`.
    pub fn push_activation(&mut self, value: f32) {
        let history = &mut self.row[ACTIVATION.range()];
        history.copy_within(1.., 0);
        history[ACTIVATION.width - 1] = value;
    }

    pub fn set_flag(&mut self, slot: usize, on: bool) {
        debug_assert!(slot < METADATA.width);
        self.row[METADATA.start + slot] = if on { 1.0 } else { 0.0 };
    }
}

/// Scale `coords` back inside the unit ball if needed.
pub fn project_to_poincare(coords: &mut [f32]) {
    let norm = coords.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm >= POINCARE_MAX_NORM {
        let scale = POINCARE_MAX_NORM / norm;
        for x in coords.iter_mut() {
            *x *= scale;
        }
    }
}

/// Geodesic distance between two points of the Poincaré ball.
pub fn poincare_distance(a: &[f32], b: &[f32]) -> f32 {
    let sq = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>();
    let diff: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    let denom = ((1.0 - sq(a)) * (1.0 - sq(b))).max(f32::EPSILON);
    let arg = 1.0 + 2.0 * diff / denom;
    // acosh(x) = ln(x + sqrt(x^2 - 1))
    (arg + (arg * arg - 1.0).max(0.0).sqrt()).ln()
}

/// Cosine similarity; 0.0 when either side is all zeros.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (dot, na, nb) = dot_and_norms(a, b);
    if na <= 0.0 || nb <= 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

#[cfg(not(feature = "simd"))]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let mut dot = 0.0;
    let mut na = 0.0;
    let mut nb = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    (dot, na, nb)
}

#[cfg(feature = "simd")]
fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    use wide::f32x4;

    let n = a.len().min(b.len());
    let lanes = n / 4 * 4;

    let mut dot = f32x4::ZERO;
    let mut na = f32x4::ZERO;
    let mut nb = f32x4::ZERO;
    for i in (0..lanes).step_by(4) {
        let va = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let vb = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        dot += va * vb;
        na += va * va;
        nb += vb * vb;
    }

    let (mut d, mut x, mut y) = (dot.reduce_add(), na.reduce_add(), nb.reduce_add());
    for i in lanes..n {
        d += a[i] * b[i];
        x += a[i] * a[i];
        y += b[i] * b[i];
    }
    (d, x, y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register::{RegisterStore, REGISTER_WIDTH};

    #[test]
    fn oversized_embedding_stays_inside_its_field() {
        let mut store = RegisterStore::allocate(1);
        let mut node = store.node_mut(0).unwrap();
        assert!(node.set_semantic_embedding(&[1.0; 100]));

        let row = store.read_row(0).unwrap();
        assert!(row[SEMANTIC.range()].iter().all(|&x| x == 1.0));
        assert!(row[ACTIVATION.range()].iter().all(|&x| x == 0.0));
        assert!(row[..SEMANTIC.start].iter().all(|&x| x == 0.0));
        assert_eq!(row.len(), REGISTER_WIDTH);
    }

    #[test]
    fn short_embedding_zero_fills() {
        let mut store = RegisterStore::allocate(1);
        let mut node = store.node_mut(0).unwrap();
        node.set_semantic_embedding(&[9.0; 64]);
        assert!(!node.set_semantic_embedding(&[1.0, 2.0]));
        let view = node.as_node();
        assert_eq!(&view.semantic_embedding()[..3], &[1.0, 2.0, 0.0]);
    }

    #[test]
    fn connection_slots_alias_modulo_64() {
        let mut store = RegisterStore::allocate(1);
        let mut node = store.node_mut(0).unwrap();
        node.strengthen_connection(3, 0.25);
        let v = node.strengthen_connection(67, 0.5);
        assert!((v - 0.75).abs() < 1e-6);
        assert!((node.as_node().connection_slot(131) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn activation_ring_shifts_left() {
        let mut store = RegisterStore::allocate(1);
        let mut node = store.node_mut(0).unwrap();
        node.push_activation(1.0);
        node.push_activation(2.0);
        let view = node.as_node();
        let h = view.activation_history();
        assert_eq!(h[62], 1.0);
        assert_eq!(h[63], 2.0);
        assert_eq!(view.latest_activation(), 2.0);
        assert_eq!(view.activation_sum(), 3.0);
    }

    #[test]
    fn identity_stamp_marks_live() {
        let mut store = RegisterStore::allocate(8);
        let mut node = store.node_mut(5).unwrap();
        node.stamp_identity();
        let view = node.as_node();
        assert_eq!(view.identifier(), 5.0);
        assert!(view.field(IDENTIFIER).iter().all(|&x| x == 5.0));
        assert!(view.is_live());
        assert!(!view.is_processor());
    }

    #[test]
    fn positions_are_projected_into_the_ball() {
        let mut store = RegisterStore::allocate(1);
        let mut node = store.node_mut(0).unwrap();
        node.set_position(&[3.0, 4.0]);
        let norm: f32 = node
            .as_node()
            .position()
            .iter()
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt();
        assert!(norm < 1.0);
    }

    #[test]
    fn poincare_distance_basics() {
        let origin = [0.0f32; 4];
        let p = [0.5f32, 0.0, 0.0, 0.0];
        assert!(poincare_distance(&origin, &origin).abs() < 1e-4);
        // d(0, r) = 2 atanh(r) = ln(3) for r = 0.5
        assert!((poincare_distance(&origin, &p) - 3.0f32.ln()).abs() < 1e-3);
    }

    #[test]
    fn cosine_similarity_handles_zero_vectors() {
        let a = [1.0f32, 0.0, 0.0, 0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0; 5]), 0.0);
        let b = [-1.0f32, 0.0, 0.0, 0.0, -1.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }
}
