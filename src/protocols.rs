//! Protocol trait definitions for Whanau's networking layer.
//!
//! These traits abstract over the underlying transport so the index
//! construction and routing logic can run against TCP in production and an
//! in-memory registry in tests.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`WhanauRpc`] | The five cross-node operations |
//! | [`ConsistencyLayer`] | Authoritative store behind a server group |
//!
//! An `Err` from a [`WhanauRpc`] method means the call itself failed (the
//! peer was unreachable or answered garbage). A reachable peer that could not
//! satisfy the request answers `Ok` with a non-OK [`Status`](crate::messages::Status).

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{
    Address, GetIdReply, Key, LookupReply, PutReply, RandomWalkReply, SampleSuccessorsReply,
    ServerGroup, TrueValue,
};

/// Remote operations a node can invoke on a peer.
#[async_trait]
pub trait WhanauRpc: Send + Sync + 'static {
    /// Continue a random walk of `steps` hops starting at `to`.
    async fn random_walk(&self, to: &Address, steps: usize) -> Result<RandomWalkReply>;

    /// Ask `to` for the identifier it claims at `layer`.
    async fn get_id(&self, to: &Address, layer: usize) -> Result<GetIdReply>;

    /// Ask `to` for `t` records following `key` in its db sample.
    async fn sample_successors(&self, to: &Address, key: Key, t: usize)
        -> Result<SampleSuccessorsReply>;

    /// Route a lookup through `to`.
    async fn lookup(&self, to: &Address, key: Key, routed_from: Vec<Address>)
        -> Result<LookupReply>;

    async fn put(&self, to: &Address, key: Key, value: TrueValue) -> Result<PutReply>;
}

/// Strongly-consistent store that resolves a server group to an authoritative value.
#[async_trait]
pub trait ConsistencyLayer: Send + Sync + 'static {
    async fn consistent_lookup(&self, key: &Key, group: &ServerGroup) -> Result<TrueValue>;

    async fn consistent_put(&self, key: Key, value: TrueValue) -> Result<()>;
}
