//! In-process consistency layer.
//!
//! Stands in for a replicated store behind each server group. Every node
//! sharing one [`MemoryConsistency`] sees the same values, which is enough for
//! single-process deployments and tests.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::messages::{Key, ServerGroup, TrueValue};
use crate::protocols::ConsistencyLayer;

#[derive(Debug, Default)]
pub struct MemoryConsistency {
    values: RwLock<HashMap<Key, TrueValue>>,
}

impl MemoryConsistency {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }
}

#[async_trait]
impl ConsistencyLayer for MemoryConsistency {
    async fn consistent_lookup(&self, key: &Key, group: &ServerGroup) -> Result<TrueValue> {
        if group.is_empty() {
            return Err(anyhow!("empty server group for key {key}"));
        }
        self.values
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no value stored for key {key}"))
    }

    async fn consistent_put(&self, key: Key, value: TrueValue) -> Result<()> {
        self.values.write().await.insert(key, value);
        Ok(())
    }
}
