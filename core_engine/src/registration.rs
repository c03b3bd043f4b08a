//! Registration flow: token redemption, address allocation, key issuance,
//! config rendering, peer publication and persistence. Also the inverse
//! operations (deregistration) and key rotation.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::error::{CoreError, CoreResult};
use crate::identity::IdentityIssuer;
use crate::model::{Node, NodeClass, NodeState, ProvisioningToken};
use crate::peer_config::PeerConfigBuilder;
use crate::pool::AddressPool;
use crate::store::{NodeStore, TokenStore};
use crate::supervisor::ConnectionSupervisor;

#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub node_id: String,
    pub class: NodeClass,
    pub metadata: BTreeMap<String, String>,
}

impl RegistrationRequest {
    pub fn new(node_id: impl Into<String>, class: NodeClass) -> Self {
        Self {
            node_id: node_id.into(),
            class,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub struct Registrar {
    store: Arc<dyn NodeStore>,
    tokens: Arc<dyn TokenStore>,
    pool: Arc<AddressPool>,
    issuer: Arc<dyn IdentityIssuer>,
    builder: Arc<PeerConfigBuilder>,
    supervisor: Arc<ConnectionSupervisor>,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn NodeStore>,
        tokens: Arc<dyn TokenStore>,
        pool: Arc<AddressPool>,
        issuer: Arc<dyn IdentityIssuer>,
        builder: Arc<PeerConfigBuilder>,
        supervisor: Arc<ConnectionSupervisor>,
    ) -> Self {
        Self {
            store,
            tokens,
            pool,
            issuer,
            builder,
            supervisor,
        }
    }

    /// Mint and store a token for a node that will register later.
    pub async fn issue_token(
        &self,
        node_id: &str,
        class: NodeClass,
        ttl: ChronoDuration,
    ) -> CoreResult<ProvisioningToken> {
        let token = ProvisioningToken::mint(node_id, class, ttl);
        self.tokens.insert_token(token.clone()).await?;
        info!(%node_id, %class, expires_at = %token.expires_at, "provisioning token issued");
        Ok(token)
    }

    /// Consume a token and return the node id and class it was bound to.
    pub async fn redeem(&self, token: &str) -> CoreResult<(String, NodeClass)> {
        let token = self.tokens.consume_token(token, Utc::now()).await?;
        info!(node_id = %token.node_id, class = %token.class, "provisioning token redeemed");
        Ok((token.node_id, token.class))
    }

    /// Redeem `token` and register the node it names.
    ///
    /// The token is spent even if registration fails afterwards.
    pub async fn register_with_token(
        &self,
        token: &str,
        metadata: BTreeMap<String, String>,
    ) -> CoreResult<Node> {
        let (node_id, class) = self.redeem(token).await?;
        self.register(RegistrationRequest {
            node_id,
            class,
            metadata,
        })
        .await
    }

    /// Allocate, issue keys, render, publish and persist a new node.
    ///
    /// The node ends in CONNECTING; when publishing the peer fails it is
    /// kept in ERROR and the failure is returned.
    #[instrument(level = "info", skip(self, request), fields(node_id = %request.node_id, class = %request.class))]
    pub async fn register(&self, request: RegistrationRequest) -> CoreResult<Node> {
        if request.node_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("node id must not be empty".to_string()));
        }

        let _guard = self.supervisor.lock_node(&request.node_id).await;
        if self.store.get(&request.node_id).await?.is_some() {
            return Err(CoreError::NodeExists(request.node_id));
        }

        let address = self.pool.allocate(request.class).await?;
        let result = self.provision(request, address).await;
        self.pool.release(address).await;
        result
    }

    async fn provision(&self, request: RegistrationRequest, address: Ipv4Addr) -> CoreResult<Node> {
        let keys = self.issuer.generate_keypair()?;
        let sync = self.supervisor.synchronizer();
        let server_public_key = sync.control().server_public_key().await?;
        let rendered_config = self
            .builder
            .render(
                &keys.private_key,
                address,
                &server_public_key,
                self.builder.default_endpoint(),
            )
            .await;

        let now = Utc::now();
        let node = Node {
            id: request.node_id,
            class: request.class,
            address,
            public_key: keys.public_key,
            private_key: keys.private_key,
            rendered_config,
            state: NodeState::Pending,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
            deactivated_at: None,
            last_address: None,
        };
        self.store.insert(node.clone()).await?;

        let states = self.supervisor.states();
        states.set(&node.id, NodeState::Pending);

        if let Err(err) = sync.add_peer(&node.public_key, address, &node.id).await {
            error!(%address, "peer could not be published: {err}");
            self.store
                .transition(&node.id, &[NodeState::Pending], NodeState::Error)
                .await?;
            states.set(&node.id, NodeState::Error);
            return Err(err.into());
        }

        let node = self
            .store
            .transition(&node.id, &[NodeState::Pending], NodeState::Connecting)
            .await?;
        states.set(&node.id, NodeState::Connecting);
        info!(%address, "node registered");
        Ok(node)
    }

    /// Retract the peer, delete the node and free its address.
    #[instrument(level = "info", skip(self))]
    pub async fn deregister(&self, node_id: &str) -> CoreResult<Node> {
        let guard = self.supervisor.lock_node(node_id).await;
        let node = self.store.require(node_id).await?;

        let removal = self.supervisor.synchronizer().remove_peer(&node.public_key).await;
        if !removal.is_complete() {
            warn!(?removal, "peer removal incomplete, deregistering anyway");
        }

        self.store.delete(node_id).await?;
        self.pool.release(node.address).await;
        drop(guard);
        self.supervisor.forget(node_id);

        info!(address = %node.address, "node deregistered");
        Ok(node)
    }

    /// Issue a fresh keypair for an existing node, keeping its address.
    #[instrument(level = "info", skip(self))]
    pub async fn rotate_keys(&self, node_id: &str) -> CoreResult<Node> {
        let _guard = self.supervisor.lock_node(node_id).await;
        let mut node = self.store.require(node_id).await?;
        let sync = self.supervisor.synchronizer();

        let keys = self.issuer.generate_keypair()?;
        let server_public_key = sync.control().server_public_key().await?;
        let rendered_config = self
            .builder
            .render(
                &keys.private_key,
                node.address,
                &server_public_key,
                self.builder.default_endpoint(),
            )
            .await;

        let old_key = std::mem::replace(&mut node.public_key, keys.public_key);
        node.private_key = keys.private_key;
        node.rendered_config = rendered_config;
        node.updated_at = Utc::now();
        self.store.update(node.clone()).await?;

        let removal = sync.remove_peer(&old_key).await;
        if !removal.is_complete() {
            warn!(?removal, "old peer entry not fully removed");
        }
        if node.state != NodeState::Deactivated {
            sync.add_peer(&node.public_key, node.address, &node.id).await?;
        }

        info!(address = %node.address, "keys rotated");
        Ok(node)
    }

    /// Render the node's config again from its stored fields.
    pub async fn rerender_config(&self, node_id: &str) -> CoreResult<Node> {
        let _guard = self.supervisor.lock_node(node_id).await;
        let mut node = self.store.require(node_id).await?;
        let server_public_key = self
            .supervisor
            .synchronizer()
            .control()
            .server_public_key()
            .await?;

        node.rendered_config = self
            .builder
            .render(
                &node.private_key,
                node.address,
                &server_public_key,
                self.builder.default_endpoint(),
            )
            .await;
        node.updated_at = Utc::now();
        self.store.update(node.clone()).await?;
        Ok(node)
    }
}
