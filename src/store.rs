//! Local record storage: the routing store and the per-pass db sample.
//!
//! The routing store maps keys to the server groups that own them. It is only
//! used for routing decisions; the consistency layer stays the source of truth.
//! The db sample is a multiset of records drawn uniformly from the routing store
//! at the start of every setup pass and kept sorted by key, so successor queries
//! are a binary search followed by a circular scan.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::messages::{Key, Record, ServerGroup, Status};

#[derive(Debug, Default)]
pub struct RoutingStore {
    records: HashMap<Key, ServerGroup>,
    /// Dense key list for O(1) uniform sampling.
    keys: Vec<Key>,
}

impl RoutingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the server group for `key`.
    pub fn insert(&mut self, key: Key, value: ServerGroup) {
        if self.records.insert(key.clone(), value).is_none() {
            self.keys.push(key);
        }
    }

    pub fn get(&self, key: &Key) -> Option<&ServerGroup> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// One uniformly random record, or `None` when the store is empty.
    pub fn sample_one<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Record> {
        let key = self.keys.choose(rng)?;
        let value = self.records.get(key)?.clone();
        Some(Record {
            key: key.clone(),
            value,
        })
    }

    /// `n` independent samples. Duplicates are expected; an empty store yields none.
    pub fn sample_many<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Record> {
        if self.is_empty() {
            return Vec::new();
        }
        (0..n).filter_map(|_| self.sample_one(rng)).collect()
    }
}

/// Key-sorted sample of records seeding layer-0 identifiers and successor answers.
#[derive(Clone, Debug, Default)]
pub struct DbSample {
    records: Vec<Record>,
}

impl DbSample {
    pub fn new(mut records: Vec<Record>) -> Self {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn choose_key<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<Key> {
        self.records.choose(rng).map(|r| r.key.clone())
    }

    /// `t` records starting at the first key `>= key`, wrapping past the end.
    ///
    /// Fails with [`Status::ErrNoKey`] when `t` exceeds the sample size.
    pub fn successors(&self, key: &Key, t: usize) -> Result<Vec<Record>, Status> {
        if t > self.records.len() {
            return Err(Status::ErrNoKey);
        }
        let start = self.records.partition_point(|r| r.key < *key);
        let (head, tail) = self.records.split_at(start);
        Ok(tail.iter().chain(head).take(t).cloned().collect())
    }
}
