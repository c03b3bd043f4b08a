//! Reachability checks for peers.

use async_trait::async_trait;
use chrono::Utc;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use shared_utils::config::{ProbeKind, SupervisorConfig, TunnelConfig};

use crate::tunnel::{CommandRunner, TunnelControl};

#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Whether the peer with `public_key` at `address` answers right now.
    async fn is_reachable(&self, address: Ipv4Addr, public_key: &str) -> bool;
}

/// Single ICMP echo, run where the tunnel lives (same exec prefix).
#[derive(Debug, Clone)]
pub struct PingProbe {
    runner: CommandRunner,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(exec_prefix: Vec<String>, timeout: Duration) -> Self {
        Self {
            runner: CommandRunner::new(exec_prefix, timeout + Duration::from_secs(1)),
            timeout,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn is_reachable(&self, address: Ipv4Addr, _public_key: &str) -> bool {
        let wait = self.timeout.as_secs().max(1).to_string();
        let target = address.to_string();
        match self
            .runner
            .output("ping", &["-c", "1", "-W", &wait, &target])
            .await
        {
            Ok(output) => {
                trace!(%address, status = ?output.status.code(), "ping finished");
                output.status.success()
            }
            Err(err) => {
                debug!(%address, "ping could not run: {err}");
                false
            }
        }
    }
}

/// Live when the interface saw a handshake from the peer recently enough.
pub struct HandshakeProbe {
    control: Arc<dyn TunnelControl>,
    max_age: Duration,
}

impl HandshakeProbe {
    pub fn new(control: Arc<dyn TunnelControl>, max_age: Duration) -> Self {
        Self { control, max_age }
    }
}

#[async_trait]
impl ReachabilityProbe for HandshakeProbe {
    async fn is_reachable(&self, address: Ipv4Addr, public_key: &str) -> bool {
        let peers = match self.control.dump_peers().await {
            Ok(peers) => peers,
            Err(err) => {
                debug!(%address, "peer listing failed: {err}");
                return false;
            }
        };

        let age = peers
            .iter()
            .find(|peer| peer.public_key == public_key)
            .and_then(|peer| peer.handshake_age(Utc::now()));

        trace!(%address, age_secs = ?age.map(|a| a.as_secs()), "handshake age");
        age.is_some_and(|age| age < self.max_age)
    }
}

pub fn probe_from_config(
    supervisor: &SupervisorConfig,
    tunnel: &TunnelConfig,
    control: Arc<dyn TunnelControl>,
) -> Arc<dyn ReachabilityProbe> {
    match supervisor.probe {
        ProbeKind::Ping => Arc::new(PingProbe::new(
            tunnel.exec_prefix.clone(),
            supervisor.probe_timeout(),
        )),
        ProbeKind::Handshake => Arc::new(HandshakeProbe::new(
            control,
            supervisor.handshake_max_age(),
        )),
    }
}
