use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{NodeStore, StoreState, TokenStore};
use crate::error::CoreResult;
use crate::model::{Node, NodeFilter, NodeState, ProvisioningToken};

/// In-process store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert(&self, node: Node) -> CoreResult<()> {
        self.state.write().await.insert(node)
    }

    async fn get(&self, id: &str) -> CoreResult<Option<Node>> {
        Ok(self.state.read().await.get(id))
    }

    async fn update(&self, node: Node) -> CoreResult<()> {
        self.state.write().await.update(node)
    }

    async fn delete(&self, id: &str) -> CoreResult<Option<Node>> {
        Ok(self.state.write().await.delete(id))
    }

    async fn list(&self, filter: &NodeFilter) -> CoreResult<Vec<Node>> {
        Ok(self.state.read().await.list(filter))
    }

    async fn transition(&self, id: &str, from: &[NodeState], to: NodeState) -> CoreResult<Node> {
        self.state.write().await.transition(id, from, to)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: ProvisioningToken) -> CoreResult<()> {
        self.state.write().await.insert_token(token)
    }

    async fn consume_token(&self, value: &str, now: DateTime<Utc>) -> CoreResult<ProvisioningToken> {
        self.state.write().await.consume_token(value, now)
    }

    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        Ok(self.state.write().await.purge_expired_tokens(now))
    }
}
