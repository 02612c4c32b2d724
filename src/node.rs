//! # High-Level Node API
//!
//! A [`Node`] binds a TCP listener, wires a [`WhanauNode`] to the [`TcpRpc`]
//! transport and serves inbound RPCs in the background.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("127.0.0.1:7000", neighbors, WalkStrategy::Honest, WhanauConfig::default()).await?;
//! node.insert_record("k1", ServerGroup::new(["127.0.0.1:9000"])).await;
//! node.setup().await?;
//! let reply = node.lookup("k1").await;
//! ```
//!
//! Neighbors are addresses of other nodes and are fixed for the node's
//! lifetime. When ports are assigned by the OS, bind the listeners first and
//! hand them to [`Node::with_listener`] once every address is known.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::WhanauConfig;
use crate::consistency::MemoryConsistency;
use crate::index::LayeredIndex;
use crate::messages::{Address, Key, LookupReply, PutReply, ServerGroup, TrueValue};
use crate::overlay::{NodeTelemetry, WhanauNode};
use crate::protocols::ConsistencyLayer;
use crate::rpc::{self, TcpRpc};
use crate::setup::SetupError;
use crate::walker::WalkStrategy;

pub struct Node {
    local_addr: SocketAddr,
    overlay: WhanauNode<TcpRpc>,
    listener: JoinHandle<Result<()>>,
}

impl Node {
    /// Bind `addr` and start serving with a private in-memory consistency layer.
    pub async fn bind(
        addr: &str,
        neighbors: Vec<Address>,
        strategy: WalkStrategy,
        config: WhanauConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Self::with_listener(listener, neighbors, strategy, config, Arc::new(MemoryConsistency::new()))
    }

    /// Start serving on an already-bound listener.
    pub fn with_listener(
        listener: TcpListener,
        neighbors: Vec<Address>,
        strategy: WalkStrategy,
        config: WhanauConfig,
        consistency: Arc<dyn ConsistencyLayer>,
    ) -> Result<Self> {
        let local_addr = listener.local_addr().context("listener has no local address")?;
        // Forwarded lookups and walks carry their own, longer deadlines.
        let transport = TcpRpc::with_timeouts(config.rpc_timeout, config.call_ceiling());

        let overlay = WhanauNode::new(
            local_addr.to_string(),
            neighbors,
            strategy,
            transport,
            consistency,
            config,
        )
        .context("invalid node configuration")?;

        let listener = {
            let overlay = overlay.clone();
            tokio::spawn(async move {
                let result = rpc::serve(listener, overlay).await;
                if let Err(e) = &result {
                    warn!(error = ?e, "listener stopped");
                }
                result
            })
        };

        info!(
            addr = %local_addr,
            neighbors = overlay.neighbors().len(),
            strategy = ?overlay.strategy(),
            "whanau node listening"
        );

        Ok(Self {
            local_addr,
            overlay,
            listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address peers use to reach this node.
    pub fn address(&self) -> &Address {
        self.overlay.address()
    }

    pub fn overlay(&self) -> &WhanauNode<TcpRpc> {
        &self.overlay
    }

    pub async fn insert_record(&self, key: impl Into<Key>, servers: ServerGroup) {
        self.overlay.insert_record(key, servers).await;
    }

    pub async fn setup(&self) -> Result<Arc<LayeredIndex>, SetupError> {
        self.overlay.setup().await
    }

    pub fn spawn_periodic_setup(&self, interval: Duration) -> JoinHandle<()> {
        self.overlay.spawn_periodic_setup(interval)
    }

    pub async fn lookup(&self, key: impl Into<Key>) -> LookupReply {
        self.overlay.lookup(key).await
    }

    pub async fn put(&self, key: impl Into<Key>, value: impl Into<TrueValue>) -> PutReply {
        self.overlay.put(key, value).await
    }

    pub async fn index(&self) -> Arc<LayeredIndex> {
        self.overlay.index().await
    }

    pub async fn telemetry(&self) -> NodeTelemetry {
        self.overlay.telemetry().await
    }

    pub async fn shutdown(&self) {
        // Stop accepting before the actor goes away.
        self.listener.abort();
        self.overlay.quit().await;
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.listener.abort();
    }
}
