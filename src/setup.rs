//! # Index Construction
//!
//! A setup pass rebuilds the whole [`LayeredIndex`] from scratch:
//!
//! 1. Draw a fresh db sample from the routing store.
//! 2. For each layer, in order:
//!    - choose this node's identifier (layer 0 from the db sample, higher
//!      layers from the fingers of the layer below) and stage it so peers can
//!      read it through `GetId`,
//!    - build the finger table: walk `mixing_steps` hops and record the landed
//!      peer's identifier for this layer,
//!    - build the successor table: walk `successor_walk_steps` hops, ask the
//!      landed peer for its identifier and then for the records following that
//!      identifier in its db sample.
//! 3. Publish the finished index in one step.
//!
//! Every table entry gets a bounded number of attempts with exponential
//! backoff between them. If any entry runs out, the pass fails and the
//! previously published index stays in place.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::index::{choose_id, Layer, LayeredIndex};
use crate::messages::{Address, Finger, Key, Record};
use crate::overlay::WhanauNode;
use crate::protocols::WhanauRpc;
use crate::store::DbSample;

/// Extra GetId attempts spent on a reached peer that has no identifier yet,
/// before the entry walks to a different one.
const MAX_FINGER_REASKS: usize = 1;

/// Which table an exhausted retry budget belonged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableKind {
    Finger,
    Successor,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Finger => f.write_str("finger"),
            TableKind::Successor => f.write_str("successor"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupError {
    #[error("routing store is empty; nothing to sample")]
    EmptyStore,

    #[error("no identifier available for layer {layer}")]
    NoIdentifier { layer: usize },

    #[error("{table} table for layer {layer} incomplete after {attempts} attempts")]
    RetriesExhausted {
        layer: usize,
        table: TableKind,
        attempts: usize,
    },

    #[error("setup task failed: {0}")]
    TaskFailed(String),

    #[error("node actor has shut down")]
    ActorClosed,
}

impl<N: WhanauRpc> WhanauNode<N> {
    /// Run one full setup pass and publish the result.
    ///
    /// Concurrent calls on the same node queue behind each other.
    pub async fn setup(&self) -> Result<Arc<LayeredIndex>, SetupError> {
        let _pass = self.setup_lock.lock().await;
        let started = Instant::now();

        let db = self
            .begin_pass(self.config.db_sample_size)
            .await
            .ok_or(SetupError::ActorClosed)?;
        if db.is_empty() {
            self.abort_pass().await;
            return Err(SetupError::EmptyStore);
        }

        match self.build_layers(&db).await {
            Ok(layers) => {
                let index = self.publish(layers).await.ok_or(SetupError::ActorClosed)?;
                info!(
                    node = %self.address(),
                    generation = index.generation(),
                    layers = index.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "published layered index"
                );
                Ok(index)
            }
            Err(e) => {
                self.abort_pass().await;
                warn!(node = %self.address(), error = %e, "setup pass failed; keeping previous index");
                Err(e)
            }
        }
    }

    async fn build_layers(&self, db: &DbSample) -> Result<Vec<Layer>, SetupError> {
        let mut built: Vec<Layer> = Vec::with_capacity(self.config.layer_count);
        for layer in 0..self.config.layer_count {
            let id = pick_identifier(layer, db, &built).ok_or(SetupError::NoIdentifier { layer })?;
            self.stage_id(layer, id.clone()).await;
            trace!(node = %self.address(), layer, id = %id, "staged layer identifier");

            let fingers = self.build_fingers(layer).await?;
            let successors = self.build_successors(layer).await?;
            debug!(
                node = %self.address(),
                layer,
                fingers = fingers.len(),
                successors = successors.len(),
                "layer built"
            );
            built.push(Layer {
                id,
                fingers,
                successors,
            });
        }
        Ok(built)
    }

    /// Exactly `finger_width` fingers for `layer`, sampled concurrently.
    pub async fn build_fingers(&self, layer: usize) -> Result<Vec<Finger>, SetupError> {
        let width = self.config.finger_width;
        let permits = Arc::new(Semaphore::new(self.config.setup_concurrency));
        let mut join_set = JoinSet::new();

        for slot in 0..width {
            let node = self.clone();
            let permits = permits.clone();
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (slot, node.sample_finger(layer).await)
            });
        }

        let mut slots: Vec<Option<Finger>> = vec![None; width];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((slot, Ok(finger))) => slots[slot] = Some(finger),
                Ok((_, Err(e))) => {
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    join_set.abort_all();
                    return Err(SetupError::TaskFailed(e.to_string()));
                }
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// One finger: walk until a peer is reached, then ask it for its identifier
    /// at `layer`. A peer that answers without an identifier is asked again up
    /// to [`MAX_FINGER_REASKS`] times, since it may be mid-pass; after that, or
    /// after a transport failure, the next attempt walks again.
    async fn sample_finger(&self, layer: usize) -> Result<Finger, SetupError> {
        let budget = self.config.retry_budget;
        let mut peer: Option<Address> = None;
        let mut reasks = 0;

        for attempt in 0..budget {
            self.back_off(attempt).await;

            let target = match peer.take() {
                Some(target) => target,
                None => match self.handle_random_walk(self.config.mixing_steps).await.landed() {
                    Some(landed) => landed,
                    None => {
                        trace!(node = %self.address(), layer, attempt, "finger walk failed");
                        continue;
                    }
                },
            };

            match self.call(self.network.get_id(&target, layer)).await {
                Ok(reply) => match (reply.status.is_ok(), reply.key) {
                    (true, Some(id)) => {
                        return Ok(Finger {
                            id,
                            address: target,
                        });
                    }
                    _ if reasks < MAX_FINGER_REASKS => {
                        trace!(peer = %target, layer, status = %reply.status, "peer has no identifier yet");
                        reasks += 1;
                        peer = Some(target);
                    }
                    _ => {
                        trace!(peer = %target, layer, "peer still has no identifier; walking elsewhere");
                        reasks = 0;
                    }
                },
                Err(e) => {
                    debug!(peer = %target, layer, error = %e, "get_id failed");
                }
            }
        }

        Err(SetupError::RetriesExhausted {
            layer,
            table: TableKind::Finger,
            attempts: budget,
        })
    }

    /// Exactly `successor_width` records for `layer`, sorted by key.
    pub async fn build_successors(&self, layer: usize) -> Result<Vec<Record>, SetupError> {
        let width = self.config.successor_width;
        let per_walk = self.config.successors_per_walk.min(width);
        let walks = width.div_ceil(per_walk);
        let permits = Arc::new(Semaphore::new(self.config.setup_concurrency));
        let mut join_set = JoinSet::new();

        for _ in 0..walks {
            let node = self.clone();
            let permits = permits.clone();
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                node.sample_successor_batch(layer, per_walk).await
            });
        }

        let mut successors: Vec<Record> = Vec::with_capacity(walks * per_walk);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(batch)) => successors.extend(batch),
                Ok(Err(e)) => {
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    join_set.abort_all();
                    return Err(SetupError::TaskFailed(e.to_string()));
                }
            }
        }

        successors.truncate(width);
        successors.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(successors)
    }

    /// `t` records from the db sample of one walked-to peer, starting at that
    /// peer's identifier for `layer`.
    async fn sample_successor_batch(&self, layer: usize, t: usize) -> Result<Vec<Record>, SetupError> {
        let budget = self.config.retry_budget;

        for attempt in 0..budget {
            self.back_off(attempt).await;

            let Some(peer) = self
                .handle_random_walk(self.config.successor_walk_steps)
                .await
                .landed()
            else {
                trace!(node = %self.address(), layer, attempt, "successor walk failed");
                continue;
            };

            let id = match self.call(self.network.get_id(&peer, layer)).await {
                Ok(reply) if reply.status.is_ok() => match reply.key {
                    Some(id) => id,
                    None => continue,
                },
                Ok(reply) => {
                    trace!(peer = %peer, layer, status = %reply.status, "peer has no identifier yet");
                    continue;
                }
                Err(e) => {
                    debug!(peer = %peer, layer, error = %e, "get_id failed");
                    continue;
                }
            };

            match self.call(self.network.sample_successors(&peer, id.clone(), t)).await {
                Ok(reply) if reply.status.is_ok() && reply.successors.len() == t => {
                    return Ok(reply.successors);
                }
                Ok(reply) => {
                    trace!(peer = %peer, key = %id, status = %reply.status, "successor sample rejected");
                }
                Err(e) => {
                    debug!(peer = %peer, key = %id, error = %e, "sample_successors failed");
                }
            }
        }

        Err(SetupError::RetriesExhausted {
            layer,
            table: TableKind::Successor,
            attempts: budget,
        })
    }

    async fn back_off(&self, attempt: usize) {
        let delay = self.config.backoff_for(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Run `fut` under the configured per-call deadline.
    pub(crate) async fn call<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        tokio::time::timeout(self.config.rpc_timeout, fut)
            .await
            .map_err(|_| anyhow!("rpc timed out after {:?}", self.config.rpc_timeout))?
    }

    /// Re-run setup every `interval` until the node shuts down.
    pub fn spawn_periodic_setup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                match node.setup().await {
                    Ok(_) => {}
                    Err(SetupError::ActorClosed) => break,
                    Err(e) => debug!(node = %node.address(), error = %e, "periodic setup skipped"),
                }
            }
        })
    }
}

fn pick_identifier(layer: usize, db: &DbSample, built: &[Layer]) -> Option<Key> {
    choose_id(layer, db, built, &mut rand::thread_rng())
}
