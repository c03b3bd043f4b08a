//! Records owned by the engine: nodes and provisioning tokens.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::CoreError;

/// Default lifetime of a provisioning token.
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

/// Role of a node; each class owns its own address sub-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeClass {
    #[serde(alias = "central")]
    ControlPlane,
    Worker,
}

impl NodeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeClass::ControlPlane => "control-plane",
            NodeClass::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "control-plane" | "control_plane" | "central" => Ok(NodeClass::ControlPlane),
            "worker" => Ok(NodeClass::Worker),
            other => Err(CoreError::UnknownClass(other.to_string())),
        }
    }
}

/// Connection state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Connecting,
    Connected,
    Disconnected,
    Deactivated,
    Error,
    Reconnecting,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "PENDING",
            NodeState::Connecting => "CONNECTING",
            NodeState::Connected => "CONNECTED",
            NodeState::Disconnected => "DISCONNECTED",
            NodeState::Deactivated => "DEACTIVATED",
            NodeState::Error => "ERROR",
            NodeState::Reconnecting => "RECONNECTING",
        }
    }

    /// States the stale-state reaper is allowed to fail.
    pub fn is_transitional(&self) -> bool {
        matches!(self, NodeState::Connecting | NodeState::Reconnecting)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(NodeState::Pending),
            "CONNECTING" => Ok(NodeState::Connecting),
            "CONNECTED" => Ok(NodeState::Connected),
            "DISCONNECTED" => Ok(NodeState::Disconnected),
            "DEACTIVATED" => Ok(NodeState::Deactivated),
            "ERROR" => Ok(NodeState::Error),
            "RECONNECTING" => Ok(NodeState::Reconnecting),
            other => Err(format!("unknown node state {other}")),
        }
    }
}

/// A registered peer.
#[derive(Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub class: NodeClass,
    pub address: Ipv4Addr,
    pub public_key: String,
    pub private_key: String,
    pub rendered_config: String,
    pub state: NodeState,

    /// Opaque data owned by provisioning flows
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub deactivated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_address: Option<Ipv4Addr>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("address", &self.address)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("state", &self.state)
            .field("metadata", &self.metadata)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .field("deactivated_at", &self.deactivated_at)
            .field("last_address", &self.last_address)
            .finish()
    }
}

/// Selects nodes by class and/or state.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub class: Option<NodeClass>,
    pub states: Vec<NodeState>,
}

impl NodeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: NodeClass) -> Self {
        self.class = Some(class);
        self
    }

    pub fn maybe_class(mut self, class: Option<NodeClass>) -> Self {
        self.class = class;
        self
    }

    pub fn state(mut self, state: NodeState) -> Self {
        self.states.push(state);
        self
    }

    pub fn matches(&self, node: &Node) -> bool {
        if let Some(class) = self.class {
            if node.class != class {
                return false;
            }
        }
        self.states.is_empty() || self.states.contains(&node.state)
    }
}

/// Single-use capability binding a future node id to a class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningToken {
    pub value: String,
    pub node_id: String,
    pub class: NodeClass,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub used: bool,
}

impl ProvisioningToken {
    /// Mint a fresh token: 32 random bytes, URL-safe base64 without padding.
    pub fn mint(node_id: impl Into<String>, class: NodeClass, ttl: ChronoDuration) -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let now = Utc::now();
        ProvisioningToken {
            value: URL_SAFE_NO_PAD.encode(bytes),
            node_id: node_id.into(),
            class,
            created_at: now,
            expires_at: now + ttl,
            used: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_aliases() {
        assert_eq!("central".parse::<NodeClass>().unwrap(), NodeClass::ControlPlane);
        assert_eq!("Worker".parse::<NodeClass>().unwrap(), NodeClass::Worker);
        assert!("gateway".parse::<NodeClass>().is_err());

        let parsed: NodeClass = serde_json::from_str("\"central\"").unwrap();
        assert_eq!(parsed, NodeClass::ControlPlane);
        assert_eq!(
            serde_json::to_string(&NodeClass::ControlPlane).unwrap(),
            "\"control-plane\""
        );
    }

    #[test]
    fn state_names() {
        assert_eq!(
            serde_json::to_string(&NodeState::Reconnecting).unwrap(),
            "\"RECONNECTING\""
        );
        assert_eq!("connected".parse::<NodeState>().unwrap(), NodeState::Connected);
        assert!(NodeState::Connecting.is_transitional());
        assert!(!NodeState::Error.is_transitional());
    }

    #[test]
    fn token_shape() {
        let token = ProvisioningToken::mint("node-1", NodeClass::Worker, ChronoDuration::hours(1));
        assert_eq!(token.value.len(), 43);
        assert!(!token.value.contains('='));
        assert_eq!(URL_SAFE_NO_PAD.decode(&token.value).unwrap().len(), 32);
        assert!(!token.is_expired(Utc::now()));
        assert!(token.is_expired(token.expires_at));

        let other = ProvisioningToken::mint("node-1", NodeClass::Worker, ChronoDuration::hours(1));
        assert_ne!(token.value, other.value);
    }

    #[test]
    fn filter_matching() {
        let now = Utc::now();
        let node = Node {
            id: "n".into(),
            class: NodeClass::Worker,
            address: Ipv4Addr::new(10, 0, 1, 2),
            public_key: "pk".into(),
            private_key: "super-secret".into(),
            rendered_config: String::new(),
            state: NodeState::Connected,
            metadata: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            deactivated_at: None,
            last_address: None,
        };

        assert!(NodeFilter::all().matches(&node));
        assert!(NodeFilter::all().class(NodeClass::Worker).matches(&node));
        assert!(!NodeFilter::all().class(NodeClass::ControlPlane).matches(&node));
        assert!(NodeFilter::all()
            .state(NodeState::Disconnected)
            .state(NodeState::Connected)
            .matches(&node));
        assert!(!NodeFilter::all().state(NodeState::Error).matches(&node));
        assert!(!format!("{node:?}").contains("super-secret"));
    }
}
