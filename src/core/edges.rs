//! Sparse weighted adjacency with a reverse index.
//!
//! This is the authoritative edge set. Both maps are only ever touched
//! together, inside a single `&mut self` call, so a reader can never see a
//! forward entry without its reverse entry or vice versa.

use hashbrown::{HashMap, HashSet};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::register::NodeId;

/// Whether `add_edge(a, a, _)` is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SelfLoopPolicy {
    #[default]
    Allow,
    Reject,
}

#[derive(Debug, Clone, Default)]
pub struct EdgeIndex {
    forward: HashMap<(NodeId, NodeId), f32>,
    reverse: HashMap<NodeId, HashSet<NodeId>>,
    self_loops: SelfLoopPolicy,
}

impl EdgeIndex {
    pub fn new(self_loops: SelfLoopPolicy) -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            self_loops,
        }
    }

    pub fn self_loop_policy(&self) -> SelfLoopPolicy {
        self.self_loops
    }

    /// Insert or accumulate. Returns the resulting strength, or `None` when a
    /// self-loop is rejected by policy.
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, strength: f32) -> Option<f32> {
        if src == dst && self.self_loops == SelfLoopPolicy::Reject {
            return None;
        }
        let s = self.forward.entry((src, dst)).or_insert(0.0);
        *s += strength;
        let total = *s;
        self.reverse.entry(dst).or_default().insert(src);
        Some(total)
    }

    /// Strength of `src -> dst`, 0.0 when absent.
    #[inline]
    pub fn get_strength(&self, src: NodeId, dst: NodeId) -> f32 {
        self.forward.get(&(src, dst)).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn contains(&self, src: NodeId, dst: NodeId) -> bool {
        self.forward.contains_key(&(src, dst))
    }

    /// All `(source, strength)` pairs pointing at `dst`, unordered.
    pub fn incoming(&self, dst: NodeId) -> Vec<(NodeId, f32)> {
        match self.reverse.get(&dst) {
            Some(sources) => sources
                .iter()
                .map(|&src| (src, self.get_strength(src, dst)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Overwrite an existing edge's strength. Absent edges are left absent.
    pub fn set_strength(&mut self, src: NodeId, dst: NodeId, strength: f32) -> bool {
        match self.forward.get_mut(&(src, dst)) {
            Some(s) => {
                *s = strength;
                true
            }
            None => false,
        }
    }

    /// Remove from both maps. Returns the removed strength, `None` if absent.
    pub fn remove_edge(&mut self, src: NodeId, dst: NodeId) -> Option<f32> {
        let strength = self.forward.remove(&(src, dst))?;
        if let Some(sources) = self.reverse.get_mut(&dst) {
            sources.remove(&src);
            if sources.is_empty() {
                self.reverse.remove(&dst);
            }
        }
        Some(strength)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, NodeId, f32)> + '_ {
        self.forward.iter().map(|(&(s, d), &w)| (s, d, w))
    }

    /// Edges as `(source, target, strength)` triples in id order.
    pub fn triples(&self) -> Vec<(NodeId, NodeId, f32)> {
        let mut out: Vec<_> = self.iter().collect();
        out.sort_unstable_by_key(|&(s, d, _)| (s, d));
        out
    }

    /// Forward and reverse maps describe exactly the same edge set.
    pub fn is_consistent(&self) -> bool {
        let reverse_count: usize = self.reverse.values().map(|s| s.len()).sum();
        reverse_count == self.forward.len()
            && self.forward.keys().all(|(s, d)| {
                self.reverse
                    .get(d)
                    .map(|sources| sources.contains(s))
                    .unwrap_or(false)
            })
    }
}
