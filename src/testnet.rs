//! In-memory network for exercising several nodes in one process.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::config::WhanauConfig;
use crate::consistency::MemoryConsistency;
use crate::messages::{
    Address, GetIdReply, Key, LookupReply, PutReply, RandomWalkReply, SampleSuccessorsReply,
    TrueValue,
};
use crate::overlay::WhanauNode;
use crate::protocols::{ConsistencyLayer, WhanauRpc};
use crate::walker::WalkStrategy;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    RandomWalk { to: Address, steps: usize },
    GetId { to: Address, layer: usize },
    SampleSuccessors { to: Address, t: usize },
    Lookup { to: Address, routed_from: Vec<Address> },
    Put { to: Address },
}

#[derive(Default)]
pub(crate) struct NetworkRegistry {
    peers: RwLock<HashMap<Address, WhanauNode<TestNetwork>>>,
    /// Addresses that fail every call.
    down: Mutex<HashSet<Address>>,
    /// Remaining injected failures per address.
    flaky: Mutex<HashMap<Address, usize>>,
    /// Addresses that accept calls and never answer.
    hung: Mutex<HashSet<Address>>,
    calls: Mutex<Vec<Call>>,
}

impl NetworkRegistry {
    pub(crate) async fn register(&self, node: &WhanauNode<TestNetwork>) {
        self.peers
            .write()
            .await
            .insert(node.address().clone(), node.clone());
    }

    async fn get(&self, addr: &Address) -> Option<WhanauNode<TestNetwork>> {
        self.peers.read().await.get(addr).cloned()
    }

    pub(crate) async fn set_down(&self, addr: &str, down: bool) {
        let mut set = self.down.lock().await;
        if down {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    pub(crate) async fn set_hung(&self, addr: &str, hung: bool) {
        let mut set = self.hung.lock().await;
        if hung {
            set.insert(addr.to_string());
        } else {
            set.remove(addr);
        }
    }

    /// Fail the next `count` calls addressed to `addr`.
    pub(crate) async fn fail_next(&self, addr: &str, count: usize) {
        self.flaky.lock().await.insert(addr.to_string(), count);
    }

    pub(crate) async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub(crate) async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    async fn dispatch(&self, to: &Address, call: Call) -> anyhow::Result<WhanauNode<TestNetwork>> {
        self.calls.lock().await.push(call);
        if self.down.lock().await.contains(to) {
            return Err(anyhow!("injected network failure"));
        }
        let hung = self.hung.lock().await.contains(to);
        if hung {
            std::future::pending::<()>().await;
        }
        {
            let mut flaky = self.flaky.lock().await;
            if let Some(remaining) = flaky.get_mut(to)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(anyhow!("injected transient failure"));
            }
        }
        self.get(to)
            .await
            .ok_or_else(|| anyhow!("peer not reachable"))
    }
}

#[derive(Clone)]
pub(crate) struct TestNetwork {
    registry: Arc<NetworkRegistry>,
}

#[async_trait]
impl WhanauRpc for TestNetwork {
    async fn random_walk(&self, to: &Address, steps: usize) -> anyhow::Result<RandomWalkReply> {
        let call = Call::RandomWalk {
            to: to.clone(),
            steps,
        };
        let peer = self.registry.dispatch(to, call).await?;
        Ok(peer.handle_random_walk(steps).await)
    }

    async fn get_id(&self, to: &Address, layer: usize) -> anyhow::Result<GetIdReply> {
        let call = Call::GetId {
            to: to.clone(),
            layer,
        };
        let peer = self.registry.dispatch(to, call).await?;
        Ok(peer.handle_get_id(layer).await)
    }

    async fn sample_successors(
        &self,
        to: &Address,
        key: Key,
        t: usize,
    ) -> anyhow::Result<SampleSuccessorsReply> {
        let call = Call::SampleSuccessors { to: to.clone(), t };
        let peer = self.registry.dispatch(to, call).await?;
        Ok(peer.handle_sample_successors(key, t).await)
    }

    async fn lookup(
        &self,
        to: &Address,
        key: Key,
        routed_from: Vec<Address>,
    ) -> anyhow::Result<LookupReply> {
        let call = Call::Lookup {
            to: to.clone(),
            routed_from: routed_from.clone(),
        };
        let peer = self.registry.dispatch(to, call).await?;
        Ok(peer.handle_lookup(key, routed_from).await)
    }

    async fn put(&self, to: &Address, key: Key, value: TrueValue) -> anyhow::Result<PutReply> {
        let peer = self.registry.dispatch(to, Call::Put { to: to.clone() }).await?;
        Ok(peer.handle_put(key, value).await)
    }
}

pub(crate) struct TestCluster {
    pub(crate) registry: Arc<NetworkRegistry>,
    pub(crate) consistency: Arc<MemoryConsistency>,
    pub(crate) config: WhanauConfig,
}

impl TestCluster {
    pub(crate) fn new(config: WhanauConfig) -> Self {
        Self {
            registry: Arc::new(NetworkRegistry::default()),
            consistency: Arc::new(MemoryConsistency::new()),
            config,
        }
    }

    pub(crate) async fn spawn(
        &self,
        addr: &str,
        neighbors: &[&str],
        strategy: WalkStrategy,
    ) -> WhanauNode<TestNetwork> {
        let network = TestNetwork {
            registry: self.registry.clone(),
        };
        let consistency: Arc<dyn ConsistencyLayer> = self.consistency.clone();
        let node = WhanauNode::new(
            addr.to_string(),
            neighbors.iter().map(|n| n.to_string()).collect(),
            strategy,
            network,
            consistency,
            self.config.clone(),
        )
        .expect("valid test config");
        self.registry.register(&node).await;
        node
    }

    pub(crate) async fn honest(&self, addr: &str, neighbors: &[&str]) -> WhanauNode<TestNetwork> {
        self.spawn(addr, neighbors, WalkStrategy::Honest).await
    }
}

/// Small widths and quick retries so in-process setup passes converge fast.
pub(crate) fn quick_config() -> WhanauConfig {
    WhanauConfig {
        layer_count: 2,
        finger_width: 3,
        successor_width: 3,
        mixing_steps: 2,
        successor_walk_steps: 2,
        successors_per_walk: 2,
        db_sample_size: 4,
        retry_budget: 20,
        retry_backoff: std::time::Duration::from_millis(5),
        ..WhanauConfig::default()
    }
}
