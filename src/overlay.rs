//! # Whanau Node Core
//!
//! [`WhanauNode`] is a cheap-to-clone handle around a single actor task that
//! owns all mutable per-node state: the routing store, the current db sample,
//! the published [`LayeredIndex`], identifiers staged by an in-flight setup
//! pass, and the walk-ahead cache. Handles talk to the actor over an mpsc
//! channel and receive answers on oneshot channels, so no lock is ever held
//! across a network call.
//!
//! Index construction lives in [`crate::setup`] and lookup routing in
//! [`crate::router`]; both are further `impl` blocks on [`WhanauNode`].
//!
//! ## Visibility during setup
//!
//! Peers read this node's layer identifiers (via `GetId`) while building their
//! own fingers, and this node may be building at the same moment. Identifiers
//! chosen during a pass are therefore staged and served by `GetId` right away,
//! together with the db sample they were drawn from, which `SampleSuccessors`
//! reads. Fingers and successor tables become visible only when the finished
//! index is published as a whole. An aborted pass drops the staged sample and
//! identifiers, leaving the published db sample and index paired as before.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

use crate::config::{ConfigError, WhanauConfig};
use crate::index::{Layer, LayeredIndex};
use crate::messages::{
    Address, GetIdReply, Key, PutReply, RandomWalkReply, Record, SampleSuccessorsReply,
    ServerGroup, Status, TrueValue,
};
use crate::protocols::{ConsistencyLayer, WhanauRpc};
use crate::store::{DbSample, RoutingStore};
use crate::walker::{RandomWalker, WalkAheadCache, WalkStrategy};

const COMMAND_CHANNEL_CAPACITY: usize = 100;

/// Point-in-time view of a node's state for logging and tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeTelemetry {
    pub stored_keys: usize,
    pub db_sample_size: usize,
    pub layers: usize,
    pub fingers: usize,
    pub successors: usize,
    pub generation: u64,
    pub walk_cache_len: usize,
}

pub struct WhanauNode<N: WhanauRpc> {
    cmd_tx: mpsc::Sender<Command>,
    address: Address,
    neighbors: Arc<[Address]>,
    pub(crate) walker: RandomWalker<N>,
    pub(crate) network: Arc<N>,
    pub(crate) consistency: Arc<dyn ConsistencyLayer>,
    pub(crate) config: Arc<WhanauConfig>,
    /// Serializes setup passes on this node.
    pub(crate) setup_lock: Arc<Mutex<()>>,
}

impl<N: WhanauRpc> Clone for WhanauNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            address: self.address.clone(),
            neighbors: self.neighbors.clone(),
            walker: self.walker.clone(),
            network: self.network.clone(),
            consistency: self.consistency.clone(),
            config: self.config.clone(),
            setup_lock: self.setup_lock.clone(),
        }
    }
}

struct NodeActor {
    store: RoutingStore,
    db: DbSample,
    index: Arc<LayeredIndex>,
    /// Db sample drawn by the running setup pass.
    staged_db: Option<DbSample>,
    /// Identifiers chosen so far in the running setup pass, by layer.
    staged_ids: Vec<Key>,
    walk_cache: WalkAheadCache,
    cmd_rx: mpsc::Receiver<Command>,
}

enum Command {
    // Records
    InsertRecord(Key, ServerGroup),
    GetRecord(Key, oneshot::Sender<Option<ServerGroup>>),

    // Setup pass
    BeginPass(usize, oneshot::Sender<DbSample>),
    StageId(usize, Key),
    AbortPass,
    Publish(Vec<Layer>, oneshot::Sender<Arc<LayeredIndex>>),

    // RPC handlers
    GetId(usize, oneshot::Sender<Option<Key>>),
    SampleSuccessors(Key, usize, oneshot::Sender<Result<Vec<Record>, Status>>),

    // Queries
    Snapshot(oneshot::Sender<Arc<LayeredIndex>>),
    GetTelemetry(oneshot::Sender<NodeTelemetry>),

    // Walk-ahead cache
    PopWalkAhead(usize, oneshot::Sender<Option<Address>>),
    PushWalkAhead(Address),
    WalkAheadDeficit(oneshot::Sender<usize>),

    Quit,
}

impl<N: WhanauRpc> WhanauNode<N> {
    /// Spawn the node's actor. Must be called within a tokio runtime.
    pub fn new(
        address: Address,
        neighbors: Vec<Address>,
        strategy: WalkStrategy,
        network: N,
        consistency: Arc<dyn ConsistencyLayer>,
        config: WhanauConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let network = Arc::new(network);
        let neighbors: Arc<[Address]> = neighbors.into();

        let actor = NodeActor {
            store: RoutingStore::new(),
            db: DbSample::default(),
            index: Arc::new(LayeredIndex::default()),
            staged_db: None,
            staged_ids: Vec::new(),
            walk_cache: WalkAheadCache::new(config.walk_cache_capacity, config.mixing_steps),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        let walker = RandomWalker::new(
            strategy,
            address.clone(),
            neighbors.clone(),
            network.clone(),
            config.rpc_timeout,
        );

        let node = Self {
            cmd_tx,
            address,
            neighbors,
            walker,
            network,
            consistency,
            config: Arc::new(config),
            setup_lock: Arc::new(Mutex::new(())),
        };

        if strategy == WalkStrategy::Honest && node.config.walk_cache_capacity > 0 {
            node.spawn_walk_ahead_refill();
        }
        Ok(node)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn neighbors(&self) -> &[Address] {
        &self.neighbors
    }

    pub fn strategy(&self) -> WalkStrategy {
        self.walker.strategy()
    }

    pub fn config(&self) -> &WhanauConfig {
        &self.config
    }

    /// Get a reference to the network layer for making RPC calls.
    pub fn network(&self) -> &N {
        &self.network
    }

    /// Seed the routing store with the server group responsible for `key`.
    pub async fn insert_record(&self, key: impl Into<Key>, servers: ServerGroup) {
        let _ = self
            .cmd_tx
            .send(Command::InsertRecord(key.into(), servers))
            .await;
    }

    pub async fn get_record(&self, key: &Key) -> Option<ServerGroup> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetRecord(key.clone(), tx)).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// The currently published index.
    pub async fn index(&self) -> Arc<LayeredIndex> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return Arc::new(LayeredIndex::default());
        }
        rx.await.unwrap_or_default()
    }

    pub async fn telemetry(&self) -> NodeTelemetry {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetTelemetry(tx)).await.is_err() {
            return NodeTelemetry::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Answer a walk request. Honest nodes serve from the walk-ahead cache
    /// when it holds an endpoint of the requested length.
    pub async fn handle_random_walk(&self, steps: usize) -> RandomWalkReply {
        if self.strategy() == WalkStrategy::Honest
            && let Some(server) = self.pop_walk_ahead(steps).await
        {
            trace!(node = %self.address, steps, "walk served from cache");
            return RandomWalkReply::ok(server);
        }
        self.walker.walk(steps).await
    }

    pub async fn handle_get_id(&self, layer: usize) -> GetIdReply {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::GetId(layer, tx)).await.is_err() {
            return GetIdReply::err(Status::ErrNoKey);
        }
        match rx.await.ok().flatten() {
            Some(key) => GetIdReply::ok(key),
            None => GetIdReply::err(Status::ErrNoKey),
        }
    }

    pub async fn handle_sample_successors(&self, key: Key, t: usize) -> SampleSuccessorsReply {
        let (tx, rx) = oneshot::channel();
        let outcome = if self
            .cmd_tx
            .send(Command::SampleSuccessors(key, t, tx))
            .await
            .is_err()
        {
            Err(Status::ErrNoKey)
        } else {
            rx.await.unwrap_or(Err(Status::ErrNoKey))
        };
        match outcome {
            Ok(successors) => SampleSuccessorsReply {
                successors,
                status: Status::Ok,
            },
            Err(status) => SampleSuccessorsReply {
                successors: Vec::new(),
                status,
            },
        }
    }

    /// Hand the write to the consistency layer. The overlay itself holds no
    /// authoritative values, so the reply is OK even when the write fails.
    pub async fn handle_put(&self, key: Key, value: TrueValue) -> PutReply {
        if let Err(e) = self.consistency.consistent_put(key.clone(), value).await {
            debug!(node = %self.address, key = %key, error = %e, "consistency put failed");
        }
        PutReply { status: Status::Ok }
    }

    pub async fn put(&self, key: impl Into<Key>, value: impl Into<TrueValue>) -> PutReply {
        self.handle_put(key.into(), value.into()).await
    }

    pub(crate) async fn begin_pass(&self, sample_size: usize) -> Option<DbSample> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::BeginPass(sample_size, tx))
            .await
            .ok()?;
        rx.await.ok()
    }

    pub(crate) async fn stage_id(&self, layer: usize, id: Key) {
        let _ = self.cmd_tx.send(Command::StageId(layer, id)).await;
    }

    pub(crate) async fn abort_pass(&self) {
        let _ = self.cmd_tx.send(Command::AbortPass).await;
    }

    pub(crate) async fn publish(&self, layers: Vec<Layer>) -> Option<Arc<LayeredIndex>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Publish(layers, tx)).await.ok()?;
        rx.await.ok()
    }

    async fn pop_walk_ahead(&self, steps: usize) -> Option<Address> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::PopWalkAhead(steps, tx))
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    fn spawn_walk_ahead_refill(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.walk_cache_refill_interval);
            loop {
                interval.tick().await;

                let (tx, rx) = oneshot::channel();
                if node.cmd_tx.send(Command::WalkAheadDeficit(tx)).await.is_err() {
                    break;
                }
                let deficit = match rx.await {
                    Ok(deficit) => deficit,
                    Err(_) => break,
                };
                if deficit == 0 {
                    continue;
                }

                let mut filled = 0usize;
                for _ in 0..deficit {
                    if let Some(server) = node.walker.walk(node.config.mixing_steps).await.landed() {
                        if node.cmd_tx.send(Command::PushWalkAhead(server)).await.is_err() {
                            return;
                        }
                        filled += 1;
                    }
                }
                trace!(node = %node.address, deficit, filled, "walk-ahead cache refilled");
            }
        });
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

impl NodeActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::InsertRecord(key, servers) => {
                    self.store.insert(key, servers);
                }
                Command::GetRecord(key, reply) => {
                    let _ = reply.send(self.store.get(&key).cloned());
                }
                Command::BeginPass(sample_size, reply) => {
                    let _ = reply.send(self.handle_begin_pass(sample_size));
                }
                Command::StageId(layer, id) => {
                    self.staged_ids.truncate(layer);
                    if self.staged_ids.len() == layer {
                        self.staged_ids.push(id);
                    }
                }
                Command::AbortPass => {
                    self.staged_db = None;
                    self.staged_ids.clear();
                }
                Command::Publish(layers, reply) => {
                    let generation = self.index.generation() + 1;
                    self.index = Arc::new(LayeredIndex::new(layers, generation));
                    if let Some(db) = self.staged_db.take() {
                        self.db = db;
                    }
                    self.staged_ids.clear();
                    let _ = reply.send(self.index.clone());
                }
                Command::GetId(layer, reply) => {
                    let id = self
                        .staged_ids
                        .get(layer)
                        .or_else(|| self.index.id(layer))
                        .cloned();
                    let _ = reply.send(id);
                }
                Command::SampleSuccessors(key, t, reply) => {
                    let db = self.staged_db.as_ref().unwrap_or(&self.db);
                    let _ = reply.send(db.successors(&key, t));
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.index.clone());
                }
                Command::GetTelemetry(reply) => {
                    let _ = reply.send(self.telemetry());
                }
                Command::PopWalkAhead(steps, reply) => {
                    let _ = reply.send(self.walk_cache.pop(steps));
                }
                Command::PushWalkAhead(server) => {
                    self.walk_cache.push(server);
                }
                Command::WalkAheadDeficit(reply) => {
                    let _ = reply.send(self.walk_cache.deficit());
                }
                Command::Quit => {
                    break;
                }
            }
        }
    }

    fn handle_begin_pass(&mut self, sample_size: usize) -> DbSample {
        let records = self.store.sample_many(sample_size, &mut rand::thread_rng());
        let db = DbSample::new(records);
        self.staged_db = Some(db.clone());
        self.staged_ids.clear();
        db
    }

    fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry {
            stored_keys: self.store.len(),
            db_sample_size: self.db.len(),
            layers: self.index.len(),
            fingers: self.index.layers().iter().map(|l| l.fingers.len()).sum(),
            successors: self.index.layers().iter().map(|l| l.successors.len()).sum(),
            generation: self.index.generation(),
            walk_cache_len: self.walk_cache.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::{quick_config, Call, TestCluster};
    use std::time::Duration;

    fn walk_calls(calls: &[Call]) -> Vec<(Address, usize)> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::RandomWalk { to, steps } => Some((to.clone(), *steps)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn honest_walk_takes_exactly_the_requested_hops() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["b"]).await;
        cluster.honest("b", &["c"]).await;
        cluster.honest("c", &["d"]).await;
        cluster.honest("d", &["e"]).await;
        cluster.honest("e", &["a"]).await;

        let reply = a.handle_random_walk(3).await;
        assert_eq!(reply.landed(), Some("d".to_string()));
        assert_eq!(
            walk_calls(&cluster.registry.calls().await),
            vec![("b".to_string(), 2), ("c".to_string(), 1)]
        );

        cluster.registry.clear_calls().await;
        assert_eq!(a.handle_random_walk(5).await.landed(), Some("a".to_string()));
        assert_eq!(walk_calls(&cluster.registry.calls().await).len(), 4);
    }

    #[tokio::test]
    async fn zero_step_walk_lands_on_self() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["b"]).await;
        assert_eq!(a.handle_random_walk(0).await.landed(), Some("a".to_string()));
        assert!(cluster.registry.calls().await.is_empty());
    }

    #[tokio::test]
    async fn walk_without_neighbors_fails() {
        let cluster = TestCluster::new(quick_config());
        let lonely = cluster.honest("lonely", &[]).await;
        let reply = lonely.handle_random_walk(2).await;
        assert_eq!(reply.status, Status::ErrRandWalk);
        assert_eq!(reply.server, None);

        let sybil = cluster.spawn("s", &[], WalkStrategy::Sybil).await;
        assert_eq!(sybil.handle_random_walk(2).await.status, Status::ErrNoKey);
    }

    #[tokio::test]
    async fn sybil_walk_is_a_single_hop() {
        let cluster = TestCluster::new(quick_config());
        let sybil = cluster.spawn("s1", &["s2"], WalkStrategy::Sybil).await;
        cluster.spawn("s2", &["s1"], WalkStrategy::Sybil).await;

        for steps in [1, 2, 7, 50] {
            assert_eq!(sybil.handle_random_walk(steps).await.landed(), Some("s2".to_string()));
        }
        assert!(walk_calls(&cluster.registry.calls().await).is_empty());
    }

    #[tokio::test]
    async fn honest_walk_entering_sybil_region_stops_there() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["s1"]).await;
        cluster.spawn("s1", &["s2"], WalkStrategy::Sybil).await;
        cluster.spawn("s2", &["s1"], WalkStrategy::Sybil).await;

        assert_eq!(a.handle_random_walk(10).await.landed(), Some("s2".to_string()));
        assert_eq!(
            walk_calls(&cluster.registry.calls().await),
            vec![("s1".to_string(), 9)]
        );
    }

    #[tokio::test]
    async fn unreachable_hop_fails_the_walk() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["b"]).await;
        cluster.honest("b", &["c"]).await;
        cluster.registry.set_down("b", true).await;

        let reply = a.handle_random_walk(3).await;
        assert_eq!(reply.status, Status::ErrNoKey);
        assert_eq!(reply.landed(), None);
    }

    #[tokio::test]
    async fn overlong_walk_is_refused() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["b"]).await;
        cluster.honest("b", &["a"]).await;

        let reply = a.handle_random_walk(crate::config::MAX_WALK_STEPS + 1).await;
        assert_eq!(reply.status, Status::ErrRandWalk);
        assert!(cluster.registry.calls().await.is_empty());

        let reply = a.handle_random_walk(usize::MAX).await;
        assert_eq!(reply.status, Status::ErrRandWalk);
    }

    #[tokio::test]
    async fn get_id_unknown_layer_is_no_key() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["b"]).await;
        assert_eq!(a.handle_get_id(0).await, GetIdReply::err(Status::ErrNoKey));
        assert_eq!(a.handle_get_id(99).await.status, Status::ErrNoKey);
    }

    #[tokio::test]
    async fn staged_identifiers_are_visible_before_publish() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &["b"]).await;
        a.insert_record("k1", ServerGroup::new(["s1"])).await;

        let db = a.begin_pass(4).await.unwrap();
        assert_eq!(db.len(), 4);
        a.stage_id(0, Key::from("k1")).await;

        assert_eq!(a.handle_get_id(0).await, GetIdReply::ok(Key::from("k1")));
        assert_eq!(a.handle_get_id(1).await.status, Status::ErrNoKey);
        assert!(a.index().await.is_empty());

        a.abort_pass().await;
        assert_eq!(a.handle_get_id(0).await.status, Status::ErrNoKey);
    }

    #[tokio::test]
    async fn sample_successors_reads_current_db_sample() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &[]).await;
        for k in ["k1", "k2", "k3"] {
            a.insert_record(k, ServerGroup::new([format!("srv-{k}")])).await;
        }

        // No pass yet: the db sample is empty.
        let reply = a.handle_sample_successors(Key::from("k1"), 1).await;
        assert_eq!(reply.status, Status::ErrNoKey);
        assert!(reply.successors.is_empty());

        a.begin_pass(3).await.unwrap();
        let reply = a.handle_sample_successors(Key::from("a"), 3).await;
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.successors.len(), 3);
        assert!(reply.successors.windows(2).all(|w| w[0].key <= w[1].key));

        let too_many = a.handle_sample_successors(Key::from("a"), 4).await;
        assert_eq!(too_many.status, Status::ErrNoKey);
    }

    #[tokio::test]
    async fn aborted_pass_restores_published_db_sample() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &[]).await;
        for k in ["k1", "k2", "k3"] {
            a.insert_record(k, ServerGroup::new([format!("srv-{k}")])).await;
        }

        a.begin_pass(3).await.unwrap();
        assert_eq!(a.handle_sample_successors(Key::from("a"), 3).await.status, Status::Ok);
        a.abort_pass().await;
        assert_eq!(
            a.handle_sample_successors(Key::from("a"), 1).await.status,
            Status::ErrNoKey
        );
        assert_eq!(a.telemetry().await.db_sample_size, 0);

        a.begin_pass(3).await.unwrap();
        a.publish(Vec::new()).await.unwrap();
        assert_eq!(a.telemetry().await.db_sample_size, 3);

        // A second failed pass leaves the published sample in place.
        a.begin_pass(3).await.unwrap();
        a.abort_pass().await;
        assert_eq!(a.telemetry().await.db_sample_size, 3);
        assert_eq!(a.handle_sample_successors(Key::from("a"), 3).await.status, Status::Ok);
    }

    #[tokio::test]
    async fn put_reaches_consistency_layer() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &[]).await;
        assert_eq!(a.put("k1", "v1").await.status, Status::Ok);
        assert_eq!(cluster.consistency.len().await, 1);
    }

    #[tokio::test]
    async fn walk_ahead_cache_serves_precomputed_walks() {
        let config = WhanauConfig {
            walk_cache_capacity: 2,
            walk_cache_refill_interval: Duration::from_secs(3600),
            ..quick_config()
        };
        let cluster = TestCluster::new(config);
        cluster.honest("c", &["a"]).await;
        cluster.honest("b", &["c"]).await;
        let a = cluster.honest("a", &["b"]).await;

        let mut filled = false;
        for _ in 0..100 {
            if a.telemetry().await.walk_cache_len == 2 {
                filled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(filled, "walk-ahead cache never filled");

        cluster.registry.clear_calls().await;
        assert_eq!(a.handle_random_walk(2).await.landed(), Some("c".to_string()));
        assert!(walk_calls(&cluster.registry.calls().await).is_empty());
        assert_eq!(a.telemetry().await.walk_cache_len, 1);

        // Other walk lengths never use the cache.
        assert_eq!(a.handle_random_walk(3).await.landed(), Some("a".to_string()));
        assert!(!walk_calls(&cluster.registry.calls().await).is_empty());
        assert_eq!(a.telemetry().await.walk_cache_len, 1);
    }

    #[tokio::test]
    async fn quit_stops_the_actor() {
        let cluster = TestCluster::new(quick_config());
        let a = cluster.honest("a", &[]).await;
        a.insert_record("k1", ServerGroup::new(["s1"])).await;
        assert_eq!(a.telemetry().await.stored_keys, 1);

        a.quit().await;
        tokio::task::yield_now().await;
        assert_eq!(a.get_record(&Key::from("k1")).await, None);
        assert_eq!(a.telemetry().await, NodeTelemetry::default());
    }
}
