//! Error taxonomy of the engine.

use std::io;
use thiserror::Error;

use crate::model::{NodeClass, NodeState};
use crate::tunnel::TunnelError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No free address remains in the class sub-range
    #[error("address pool for class {0} is exhausted")]
    PoolExhausted(NodeClass),

    #[error("key generation failed: {0}")]
    KeyGen(String),

    /// Tunnel synchronization failed; see `TunnelError::is_transient`
    #[error("tunnel synchronization failed: {0}")]
    Sync(#[from] TunnelError),

    #[error("activation of {node_id} failed after {attempts} attempts: {last_error}")]
    ActivationFailed {
        node_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("provisioning token has expired")]
    TokenExpired,

    #[error("provisioning token was already used")]
    TokenAlreadyUsed,

    #[error("provisioning token not found")]
    TokenNotFound,

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("node {0} already exists")]
    NodeExists(String),

    #[error("address {0} is already assigned")]
    AddressInUse(std::net::Ipv4Addr),

    #[error("public key {0} is already registered")]
    PublicKeyInUse(String),

    /// Compare-and-set transition lost against a concurrent writer
    #[error("node {node_id} is {actual}, expected {expected}")]
    StateConflict {
        node_id: String,
        expected: String,
        actual: NodeState,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown node class {0}")]
    UnknownClass(String),

    #[error("invalid address range: {0}")]
    InvalidRange(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
