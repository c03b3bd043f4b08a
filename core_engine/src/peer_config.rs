//! Rendering of the client-side tunnel configuration handed to a peer.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use shared_utils::config::PeerConfig;

use crate::tunnel::wgconf::{InterfaceDefinition, Line, Section, SectionKind};

/// Where peers should reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEndpoint {
    /// Detect the host's routable address when rendering
    Auto,
    /// Host name or address, optionally with `:port`
    Fixed(String),
}

impl FromStr for ServerEndpoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            Ok(ServerEndpoint::Auto)
        } else {
            Ok(ServerEndpoint::Fixed(s.to_string()))
        }
    }
}

/// Turns `ServerEndpoint::Auto` into a concrete host.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self) -> Option<String>;
}

/// Picks the local address the host would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for a route.
#[derive(Debug, Clone)]
pub struct OutboundAddressResolver {
    probe_target: SocketAddr,
}

impl Default for OutboundAddressResolver {
    fn default() -> Self {
        Self {
            probe_target: SocketAddr::from(([8, 8, 8, 8], 80)),
        }
    }
}

#[async_trait]
impl EndpointResolver for OutboundAddressResolver {
    async fn resolve(&self) -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect(self.probe_target).await.ok()?;
        let local = socket.local_addr().ok()?;
        if local.ip().is_unspecified() {
            return None;
        }
        Some(local.ip().to_string())
    }
}

pub struct PeerConfigBuilder {
    overlay: Ipv4Net,
    endpoint: ServerEndpoint,
    endpoint_port: u16,
    fallback_host: String,
    dns: Vec<String>,
    mtu: u32,
    persistent_keepalive: u32,
    resolver: Arc<dyn EndpointResolver>,
    last_known_good: Mutex<Option<String>>,
}

impl PeerConfigBuilder {
    pub fn new(config: &PeerConfig, overlay: Ipv4Net) -> Self {
        let endpoint = config
            .server_endpoint
            .parse()
            .unwrap_or(ServerEndpoint::Auto);

        Self {
            overlay,
            endpoint,
            endpoint_port: config.endpoint_port,
            fallback_host: config.fallback_host.clone(),
            dns: config.dns.clone(),
            mtu: config.mtu,
            persistent_keepalive: config.persistent_keepalive,
            resolver: Arc::new(OutboundAddressResolver::default()),
            last_known_good: Mutex::new(None),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Endpoint from configuration.
    pub fn default_endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    pub fn last_known_good(&self) -> Option<String> {
        self.last_known_good
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    fn remember(&self, host: &str) {
        if let Ok(mut guard) = self.last_known_good.lock() {
            *guard = Some(host.to_string());
        }
    }

    /// Concrete `host:port` for `endpoint`.
    ///
    /// A failed `Auto` resolution falls back to the last endpoint that
    /// resolved, then to the configured fallback host.
    pub async fn resolve_endpoint(&self, endpoint: &ServerEndpoint) -> String {
        let host = match endpoint {
            ServerEndpoint::Fixed(host) => host.clone(),
            ServerEndpoint::Auto => match self.resolver.resolve().await {
                Some(host) => {
                    debug!(%host, "server endpoint resolved");
                    self.remember(&host);
                    host
                }
                None => match self.last_known_good() {
                    Some(host) => {
                        warn!(%host, "endpoint resolution failed, using last known good");
                        host
                    }
                    None => {
                        warn!(
                            host = %self.fallback_host,
                            "endpoint resolution failed and nothing resolved before, using fallback"
                        );
                        self.fallback_host.clone()
                    }
                },
            },
        };

        if has_port(&host) {
            host
        } else {
            format!("{host}:{}", self.endpoint_port)
        }
    }

    /// Render with an already resolved `host:port`. Deterministic.
    pub fn render_with_endpoint(
        &self,
        private_key: &str,
        address: Ipv4Addr,
        server_public_key: &str,
        endpoint: &str,
    ) -> String {
        let mut definition = InterfaceDefinition::default();

        let mut interface = Section::new(SectionKind::Interface);
        interface.push_entry("PrivateKey", private_key);
        interface.push_entry("Address", format!("{address}/{}", self.overlay.prefix_len()));
        if !self.dns.is_empty() {
            interface.push_entry("DNS", self.dns.join(", "));
        }
        interface.push_entry("MTU", self.mtu.to_string());
        interface.lines.push(Line::Blank);
        definition.push_section(interface);

        let mut peer = Section::new(SectionKind::Peer);
        peer.push_entry("PublicKey", server_public_key);
        peer.push_entry("Endpoint", endpoint);
        peer.push_entry("AllowedIPs", self.overlay.trunc().to_string());
        if self.persistent_keepalive > 0 {
            peer.push_entry("PersistentKeepalive", self.persistent_keepalive.to_string());
        }
        definition.push_section(peer);

        definition.to_string()
    }

    pub async fn render(
        &self,
        private_key: &str,
        address: Ipv4Addr,
        server_public_key: &str,
        endpoint: &ServerEndpoint,
    ) -> String {
        let endpoint = self.resolve_endpoint(endpoint).await;
        self.render_with_endpoint(private_key, address, server_public_key, &endpoint)
    }
}

fn has_port(host: &str) -> bool {
    if host.parse::<SocketAddr>().is_ok() {
        return true;
    }
    // host names and IPv4 literals with a trailing numeric port
    match host.rsplit_once(':') {
        Some((name, port)) => !name.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}
