//! # Lookup Routing
//!
//! A lookup walks through a fixed sequence of stages and stops at the first
//! one that produces an OK answer:
//!
//! | Stage | Source |
//! |-------|--------|
//! | Local hit | This node's routing store |
//! | Successor hit | Successor tables of the published index |
//! | Finger probe | Remote lookup via the top-layer fingers closest before the key |
//! | Neighbor probe | Remote lookup via direct neighbors, in random order |
//!
//! Every forwarded lookup carries `routed_from`, the addresses already on the
//! path. A node appends itself before forwarding and never forwards to an
//! address already in the list, so no path visits a node twice.
//!
//! A path holds at most `max_lookup_hops` nodes. The deadline for a forwarded
//! lookup is `rpc_timeout` times the hops still allowed, so a node further
//! along always gives up on a stalled peer, and moves to its next candidate,
//! before its caller gives up on it.

use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, trace};

use crate::messages::{Address, Key, LookupReply, ServerGroup};
use crate::overlay::WhanauNode;
use crate::protocols::WhanauRpc;

impl<N: WhanauRpc> WhanauNode<N> {
    /// Start a lookup at this node.
    pub async fn lookup(&self, key: impl Into<Key>) -> LookupReply {
        self.handle_lookup(key.into(), Vec::new()).await
    }

    pub async fn handle_lookup(&self, key: Key, routed_from: Vec<Address>) -> LookupReply {
        if let Some(servers) = self.get_record(&key).await {
            trace!(node = %self.address(), key = %key, "lookup hit routing store");
            return self.resolve(&key, servers).await;
        }

        let index = self.index().await;
        if let Some(servers) = index.successor_hit(&key) {
            trace!(node = %self.address(), key = %key, "lookup hit successor table");
            return self.resolve(&key, servers.clone()).await;
        }

        let mut path = routed_from;
        if !path.contains(self.address()) {
            path.push(self.address().clone());
        }
        let Some(deadline) = self.config.lookup_deadline(path.len()) else {
            debug!(node = %self.address(), key = %key, hops = path.len(), "lookup hop limit reached");
            return LookupReply::not_found();
        };

        let fingers: Vec<Address> = index
            .closest_preceding_fingers(&key, self.config.finger_probe_fanout)
            .into_iter()
            .map(|f| f.address.clone())
            .filter(|addr| !path.contains(addr))
            .collect();
        for finger in fingers {
            if let Some(reply) = self.probe(&finger, &key, &path, deadline).await {
                return reply;
            }
        }

        for neighbor in self.shuffled_neighbors() {
            if path.contains(&neighbor) {
                continue;
            }
            if let Some(reply) = self.probe(&neighbor, &key, &path, deadline).await {
                return reply;
            }
        }

        debug!(node = %self.address(), key = %key, hops = path.len(), "lookup exhausted");
        LookupReply::not_found()
    }

    async fn probe(
        &self,
        to: &Address,
        key: &Key,
        path: &[Address],
        deadline: Duration,
    ) -> Option<LookupReply> {
        let forwarded =
            tokio::time::timeout(deadline, self.network.lookup(to, key.clone(), path.to_vec())).await;
        let Ok(outcome) = forwarded else {
            debug!(peer = %to, key = %key, deadline_ms = deadline.as_millis() as u64, "lookup probe timed out");
            return None;
        };
        match outcome {
            Ok(reply) if reply.status.is_ok() => Some(reply),
            Ok(reply) => {
                trace!(peer = %to, key = %key, status = %reply.status, "probe missed");
                None
            }
            Err(e) => {
                debug!(peer = %to, key = %key, error = %e, "lookup probe failed");
                None
            }
        }
    }

    /// Ask the consistency layer for the authoritative value. The routing
    /// answer stands even when it cannot resolve one.
    async fn resolve(&self, key: &Key, servers: ServerGroup) -> LookupReply {
        match self.consistency.consistent_lookup(key, &servers).await {
            Ok(value) => LookupReply::found(servers, Some(value)),
            Err(e) => {
                debug!(node = %self.address(), key = %key, error = %e, "consistency lookup unresolved");
                LookupReply::found(servers, None)
            }
        }
    }

    fn shuffled_neighbors(&self) -> Vec<Address> {
        let mut neighbors = self.neighbors().to_vec();
        neighbors.shuffle(&mut rand::thread_rng());
        neighbors
    }
}
