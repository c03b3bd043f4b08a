//! Storage seams for nodes and provisioning tokens.
//!
//! The engine only needs CRUD, filtering, uniqueness on address and public
//! key, and compare-and-set state transitions. `MemoryStore` keeps records
//! in process; `JsonFileStore` mirrors them to a JSON file after every write.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use crate::error::{CoreError, CoreResult};
use crate::model::{Node, NodeFilter, NodeState, ProvisioningToken};

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert a new node. Fails on duplicate id, address or public key.
    async fn insert(&self, node: Node) -> CoreResult<()>;

    async fn get(&self, id: &str) -> CoreResult<Option<Node>>;

    /// Replace an existing node record.
    async fn update(&self, node: Node) -> CoreResult<()>;

    async fn delete(&self, id: &str) -> CoreResult<Option<Node>>;

    /// Nodes matching `filter`, ordered by id.
    async fn list(&self, filter: &NodeFilter) -> CoreResult<Vec<Node>>;

    /// Move a node to `to` if its current state is one of `from` (any state
    /// when `from` is empty). Returns the updated record.
    async fn transition(&self, id: &str, from: &[NodeState], to: NodeState) -> CoreResult<Node>;

    async fn require(&self, id: &str) -> CoreResult<Node> {
        self.get(id)
            .await?
            .ok_or_else(|| CoreError::NodeNotFound(id.to_string()))
    }

    /// Addresses currently held by stored nodes.
    async fn assigned_addresses(&self) -> CoreResult<HashSet<Ipv4Addr>> {
        let nodes = self.list(&NodeFilter::all()).await?;
        Ok(nodes.into_iter().map(|node| node.address).collect())
    }
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: ProvisioningToken) -> CoreResult<()>;

    /// Mark a token used and return it. Fails if it is unknown, already used
    /// or expired at `now`.
    async fn consume_token(&self, value: &str, now: DateTime<Utc>) -> CoreResult<ProvisioningToken>;

    /// Drop tokens that expired before `now`; returns how many were removed.
    async fn purge_expired_tokens(&self, now: DateTime<Utc>) -> CoreResult<usize>;
}

/// Record set shared by both store implementations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    nodes: BTreeMap<String, Node>,
    #[serde(default)]
    tokens: BTreeMap<String, ProvisioningToken>,
}

impl StoreState {
    fn check_unique(&self, node: &Node) -> CoreResult<()> {
        for other in self.nodes.values().filter(|other| other.id != node.id) {
            if other.address == node.address {
                return Err(CoreError::AddressInUse(node.address));
            }
            if other.public_key == node.public_key {
                return Err(CoreError::PublicKeyInUse(node.public_key.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, node: Node) -> CoreResult<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(CoreError::NodeExists(node.id));
        }
        self.check_unique(&node)?;
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub(crate) fn get(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).cloned()
    }

    pub(crate) fn update(&mut self, node: Node) -> CoreResult<()> {
        if !self.nodes.contains_key(&node.id) {
            return Err(CoreError::NodeNotFound(node.id));
        }
        self.check_unique(&node)?;
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub(crate) fn delete(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub(crate) fn list(&self, filter: &NodeFilter) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|node| filter.matches(node))
            .cloned()
            .collect()
    }

    pub(crate) fn transition(
        &mut self,
        id: &str,
        from: &[NodeState],
        to: NodeState,
    ) -> CoreResult<Node> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| CoreError::NodeNotFound(id.to_string()))?;

        if !from.is_empty() && !from.contains(&node.state) {
            let expected = from
                .iter()
                .map(NodeState::as_str)
                .collect::<Vec<_>>()
                .join("|");
            return Err(CoreError::StateConflict {
                node_id: id.to_string(),
                expected,
                actual: node.state,
            });
        }

        node.state = to;
        node.updated_at = Utc::now();
        Ok(node.clone())
    }

    pub(crate) fn insert_token(&mut self, token: ProvisioningToken) -> CoreResult<()> {
        if self.tokens.contains_key(&token.value) {
            return Err(CoreError::Storage("duplicate provisioning token".to_string()));
        }
        self.tokens.insert(token.value.clone(), token);
        Ok(())
    }

    pub(crate) fn consume_token(
        &mut self,
        value: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<ProvisioningToken> {
        let token = self.tokens.get_mut(value).ok_or(CoreError::TokenNotFound)?;
        if token.used {
            return Err(CoreError::TokenAlreadyUsed);
        }
        if token.is_expired(now) {
            return Err(CoreError::TokenExpired);
        }
        token.used = true;
        Ok(token.clone())
    }

    pub(crate) fn purge_expired_tokens(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| !token.is_expired(now));
        before - self.tokens.len()
    }
}
