//! # Layered Index
//!
//! A node's view of the key space, rebuilt from scratch on every setup pass.
//!
//! Each [`Layer`] holds the identifier the node claims in that layer, a finger
//! table of `(id, address)` hints gathered by random walks, and a key-ordered
//! successor table sampled from other nodes' db samples. Layer 0 identifiers are
//! drawn from the local db sample; layer `i > 0` identifiers are drawn from the
//! fingers of layer `i - 1`, which spreads higher layers over more of the key
//! space.
//!
//! A [`LayeredIndex`] is immutable once built. Nodes publish it behind an `Arc`
//! and replace the whole thing, so readers never see a mix of two passes.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::messages::{Finger, Key, Record, ServerGroup};
use crate::store::DbSample;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layer {
    pub id: Key,
    pub fingers: Vec<Finger>,
    /// Ordered by key.
    pub successors: Vec<Record>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayeredIndex {
    layers: Vec<Layer>,
    /// Setup pass that produced this index; 0 means never built.
    generation: u64,
}

impl LayeredIndex {
    pub fn new(layers: Vec<Layer>, generation: u64) -> Self {
        Self { layers, generation }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, layer: usize) -> Option<&Layer> {
        self.layers.get(layer)
    }

    pub fn id(&self, layer: usize) -> Option<&Key> {
        self.layers.get(layer).map(|l| &l.id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Server group for `key` if any layer's successor table holds it.
    pub fn successor_hit(&self, key: &Key) -> Option<&ServerGroup> {
        self.layers
            .iter()
            .flat_map(|l| l.successors.iter())
            .find(|r| r.key == *key)
            .map(|r| &r.value)
    }

    /// Up to `n` distinct finger addresses from the top layer, ordered by how
    /// closely their id precedes `key` on the circular key space.
    pub fn closest_preceding_fingers(&self, key: &Key, n: usize) -> Vec<&Finger> {
        let Some(top) = self.layers.last() else {
            return Vec::new();
        };

        let mut fingers: Vec<&Finger> = top.fingers.iter().collect();
        // Ids at or below the key first (largest first), then the wrapped ones.
        fingers.sort_by(|a, b| {
            let a_wraps = a.id > *key;
            let b_wraps = b.id > *key;
            a_wraps.cmp(&b_wraps).then_with(|| b.id.cmp(&a.id))
        });

        let mut picked: Vec<&Finger> = Vec::with_capacity(n);
        for finger in fingers {
            if picked.len() == n {
                break;
            }
            if !picked.iter().any(|f| f.address == finger.address) {
                picked.push(finger);
            }
        }
        picked
    }
}

/// Pick the identifier this node claims at `layer`.
///
/// `built` holds the layers already completed in the current pass. Returns
/// `None` when there is nothing to choose from (empty db sample or an empty
/// finger table below).
pub fn choose_id<R: Rng + ?Sized>(
    layer: usize,
    db: &DbSample,
    built: &[Layer],
    rng: &mut R,
) -> Option<Key> {
    if layer == 0 {
        return db.choose_key(rng);
    }
    let below = built.get(layer - 1)?;
    below.fingers.choose(rng).map(|f| f.id.clone())
}
