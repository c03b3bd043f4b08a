//! Peer lifecycle and health core for a WireGuard overlay network.
//!
//! Addresses are allocated per node class, identities are issued natively,
//! peers are kept in step between the live interface and its definition
//! file, and a supervisor drives every node through its connection state
//! machine with bounded retries while a background monitor keeps checking.

pub mod engine;
pub mod error;
pub mod identity;
pub mod model;
pub mod monitor;
pub mod peer_config;
pub mod pool;
pub mod probe;
pub mod registration;
pub mod retry;
pub mod state_cache;
pub mod store;
pub mod supervisor;
pub mod tunnel;

pub use engine::{Engine, EngineParts};
pub use error::{CoreError, CoreResult};
pub use model::{Node, NodeClass, NodeFilter, NodeState, ProvisioningToken};
pub use supervisor::{ConnectionSupervisor, HealthOutcome, HealthReport};
