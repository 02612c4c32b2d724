//! # Random Walks
//!
//! Walks are the only way a node learns about nodes beyond its neighbors.
//! An honest walk of `n` steps hops to a uniformly random neighbor and asks it
//! to continue with `n - 1` steps, so the landing point is `n` edges away.
//! Once `n` exceeds the honest region's mixing time the landing point is
//! close to uniform over honest nodes, no matter what Sybil nodes do.
//!
//! Sybil nodes are modelled by [`WalkStrategy::Sybil`]: they answer every walk
//! with one of their own neighbors in a single hop, trying to keep walks
//! trapped among attacker identities.
//!
//! Honest nodes may keep a [`WalkAheadCache`] of endpoints from walks done
//! ahead of time, trading a little staleness for skipping a full multi-hop
//! traversal on every request.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::config::MAX_WALK_STEPS;
use crate::messages::{Address, RandomWalkReply, Status};
use crate::protocols::WhanauRpc;

/// How a node answers random-walk requests. Fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkStrategy {
    Honest,
    Sybil,
}

pub struct RandomWalker<N: WhanauRpc> {
    strategy: WalkStrategy,
    self_addr: Address,
    neighbors: Arc<[Address]>,
    network: Arc<N>,
    hop_timeout: Duration,
}

impl<N: WhanauRpc> Clone for RandomWalker<N> {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy,
            self_addr: self.self_addr.clone(),
            neighbors: self.neighbors.clone(),
            network: self.network.clone(),
            hop_timeout: self.hop_timeout,
        }
    }
}

impl<N: WhanauRpc> RandomWalker<N> {
    pub fn new(
        strategy: WalkStrategy,
        self_addr: Address,
        neighbors: Arc<[Address]>,
        network: Arc<N>,
        hop_timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            self_addr,
            neighbors,
            network,
            hop_timeout,
        }
    }

    pub fn strategy(&self) -> WalkStrategy {
        self.strategy
    }

    pub fn random_neighbor(&self) -> Option<Address> {
        self.neighbors.choose(&mut rand::thread_rng()).cloned()
    }

    /// A walk that never consults the walk-ahead cache.
    pub async fn walk(&self, steps: usize) -> RandomWalkReply {
        match self.strategy {
            WalkStrategy::Honest => self.honest_walk(steps).await,
            WalkStrategy::Sybil => self.sybil_walk(),
        }
    }

    async fn honest_walk(&self, steps: usize) -> RandomWalkReply {
        if steps == 0 {
            return RandomWalkReply::ok(self.self_addr.clone());
        }
        if steps > MAX_WALK_STEPS {
            debug!(node = %self.self_addr, steps, max = MAX_WALK_STEPS, "refusing overlong walk");
            return RandomWalkReply::err(Status::ErrRandWalk);
        }
        let Some(neighbor) = self.random_neighbor() else {
            debug!(node = %self.self_addr, "cannot walk: no neighbors");
            return RandomWalkReply::err(Status::ErrRandWalk);
        };
        if steps == 1 {
            return RandomWalkReply::ok(neighbor);
        }

        // The next hop waits on every hop after it.
        let remaining = u32::try_from(steps - 1).unwrap_or(u32::MAX);
        let deadline = self.hop_timeout.saturating_mul(remaining);
        let forwarded =
            tokio::time::timeout(deadline, self.network.random_walk(&neighbor, steps - 1)).await;

        match forwarded {
            Ok(Ok(reply)) => match reply.landed() {
                Some(server) => RandomWalkReply::ok(server),
                None => {
                    trace!(node = %self.self_addr, via = %neighbor, "walk failed downstream");
                    RandomWalkReply::err(Status::ErrNoKey)
                }
            },
            Ok(Err(e)) => {
                debug!(node = %self.self_addr, via = %neighbor, error = %e, "walk hop unreachable");
                RandomWalkReply::err(Status::ErrNoKey)
            }
            Err(_) => {
                debug!(node = %self.self_addr, via = %neighbor, steps, "walk hop timed out");
                RandomWalkReply::err(Status::ErrNoKey)
            }
        }
    }

    fn sybil_walk(&self) -> RandomWalkReply {
        match self.random_neighbor() {
            Some(neighbor) => RandomWalkReply::ok(neighbor),
            None => RandomWalkReply::err(Status::ErrNoKey),
        }
    }
}

/// Bounded queue of endpoints of walks performed ahead of time.
///
/// Only walks of exactly `steps` hops are served from the cache.
#[derive(Debug)]
pub struct WalkAheadCache {
    capacity: usize,
    steps: usize,
    queue: VecDeque<Address>,
}

impl WalkAheadCache {
    pub fn new(capacity: usize, steps: usize) -> Self {
        Self {
            capacity,
            steps,
            queue: VecDeque::with_capacity(capacity),
        }
    }

    pub fn pop(&mut self, steps: usize) -> Option<Address> {
        if steps != self.steps {
            return None;
        }
        self.queue.pop_front()
    }

    /// Returns false when the cache is already full.
    pub fn push(&mut self, server: Address) -> bool {
        if self.queue.len() >= self.capacity {
            return false;
        }
        self.queue.push_back(server);
        true
    }

    pub fn deficit(&self) -> usize {
        self.capacity.saturating_sub(self.queue.len())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
