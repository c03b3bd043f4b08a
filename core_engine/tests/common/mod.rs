#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use core_engine::engine::{Engine, EngineParts};
use core_engine::identity::{IdentityIssuer, X25519Issuer};
use core_engine::model::NodeState;
use core_engine::peer_config::EndpointResolver;
use core_engine::probe::ReachabilityProbe;
use core_engine::store::{MemoryStore, NodeStore};
use core_engine::tunnel::{
    InterfaceStatus, LivePeer, RouteOutcome, TunnelControl, TunnelError, TunnelResult,
};
use shared_utils::config::{ClassRangeConfig, Config};

pub const DEFINITION: &str = "\
[Interface]
Address = 10.0.0.1/16
ListenPort = 51820
PrivateKey = yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
";

/// In-memory stand-in for the tunnel utilities.
pub struct FakeControl {
    pub server_key: String,
    pub peers: Mutex<BTreeMap<String, String>>,
    pub routes: Mutex<Vec<Ipv4Net>>,
    pub addresses: Mutex<Vec<Ipv4Net>>,
    pub handshakes: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Endpoint and rx/tx byte counters per key
    pub traffic: Mutex<HashMap<String, (String, u64, u64)>>,
    pub set_failures: AtomicU32,
    pub fail_remove: AtomicBool,
    pub restarts: AtomicU32,
}

impl FakeControl {
    pub fn new() -> Self {
        let server = X25519Issuer.generate_keypair().unwrap();
        Self {
            server_key: server.public_key,
            peers: Mutex::new(BTreeMap::new()),
            routes: Mutex::new(Vec::new()),
            addresses: Mutex::new(vec!["10.0.0.1/16".parse().unwrap()]),
            handshakes: Mutex::new(HashMap::new()),
            traffic: Mutex::new(HashMap::new()),
            set_failures: AtomicU32::new(0),
            fail_remove: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
        }
    }

    /// Make the next `n` `set_peer` calls fail.
    pub fn fail_next_sets(&self, n: u32) {
        self.set_failures.store(n, Ordering::SeqCst);
    }

    pub fn allowed_ips(&self, public_key: &str) -> Option<String> {
        self.peers.lock().unwrap().get(public_key).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn set_traffic(&self, public_key: &str, endpoint: &str, rx_bytes: u64, tx_bytes: u64) {
        self.traffic
            .lock()
            .unwrap()
            .insert(public_key.to_string(), (endpoint.to_string(), rx_bytes, tx_bytes));
    }

    pub fn insert_peer(&self, public_key: &str, allowed: &str) {
        self.peers
            .lock()
            .unwrap()
            .insert(public_key.to_string(), allowed.to_string());
    }
}

#[async_trait]
impl TunnelControl for FakeControl {
    async fn set_peer(&self, public_key: &str, allowed_ips: &str) -> TunnelResult<()> {
        let remaining = self.set_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.set_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TunnelError::Command {
                command: "wg set".to_string(),
                stderr: "Unable to access interface: No such device".to_string(),
            });
        }
        self.insert_peer(public_key, allowed_ips);
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> TunnelResult<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(TunnelError::Command {
                command: "wg set remove".to_string(),
                stderr: "interface busy".to_string(),
            });
        }
        self.peers.lock().unwrap().remove(public_key);
        Ok(())
    }

    async fn dump_peers(&self) -> TunnelResult<Vec<LivePeer>> {
        let handshakes = self.handshakes.lock().unwrap().clone();
        let traffic = self.traffic.lock().unwrap().clone();
        Ok(self
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|(key, allowed)| {
                let counters = traffic.get(key);
                LivePeer {
                    public_key: key.clone(),
                    endpoint: counters.map(|(endpoint, _, _)| endpoint.clone()),
                    allowed_ips: allowed.split(',').map(|s| s.trim().to_string()).collect(),
                    latest_handshake: handshakes.get(key).copied(),
                    rx_bytes: counters.map_or(0, |(_, rx, _)| *rx),
                    tx_bytes: counters.map_or(0, |(_, _, tx)| *tx),
                }
            })
            .collect())
    }

    async fn show_interface(&self) -> TunnelResult<InterfaceStatus> {
        Ok(InterfaceStatus {
            public_key: self.server_key.clone(),
            listen_port: Some(51820),
            addresses: self.addresses.lock().unwrap().clone(),
        })
    }

    async fn add_route(&self, destination: Ipv4Net) -> TunnelResult<RouteOutcome> {
        let mut routes = self.routes.lock().unwrap();
        if routes.contains(&destination) {
            Ok(RouteOutcome::AlreadyPresent)
        } else {
            routes.push(destination);
            Ok(RouteOutcome::Added)
        }
    }

    async fn restart(&self) -> TunnelResult<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Probe answering from a script first, then from a default.
pub struct FakeProbe {
    script: Mutex<VecDeque<bool>>,
    default: AtomicBool,
    calls: AtomicU32,
    /// Calls never answer while set
    hang: AtomicBool,
}

impl FakeProbe {
    pub fn new(default: bool) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: AtomicBool::new(default),
            calls: AtomicU32::new(0),
            hang: AtomicBool::new(false),
        }
    }

    pub fn script(&self, answers: &[bool]) {
        self.script.lock().unwrap().extend(answers.iter().copied());
    }

    pub fn set_default(&self, reachable: bool) {
        self.default.store(reachable, Ordering::SeqCst);
    }

    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn is_reachable(&self, _address: Ipv4Addr, _public_key: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.default.load(Ordering::SeqCst))
    }
}

pub struct NoResolver;

#[async_trait]
impl EndpointResolver for NoResolver {
    async fn resolve(&self) -> Option<String> {
        None
    }
}

/// Configuration with tiny delays and a four-address worker range.
pub fn test_config(definition_path: PathBuf) -> Config {
    let mut config = Config::default();
    config.pool.overlay_cidr = "10.0.0.0/16".to_string();
    config.pool.server_address = "10.0.0.1".to_string();
    config.pool.classes = vec![
        ClassRangeConfig {
            class: "control-plane".to_string(),
            range: "10.0.0.2-10.0.0.254".to_string(),
        },
        ClassRangeConfig {
            class: "worker".to_string(),
            range: "10.0.1.2-10.0.1.5".to_string(),
        },
    ];
    config.pool.routed_range = Some("10.0.1.2-10.0.1.5".to_string());
    config.tunnel.definition_path = definition_path.to_string_lossy().into_owned();
    config.peer.server_endpoint = "vpn.test".to_string();
    config.supervisor.max_attempts = 3;
    config.supervisor.base_delay_ms = 1;
    config.supervisor.settle_delay_ms = 0;
    config.supervisor.cleanup_delay_ms = 0;
    config.supervisor.health_check_interval_secs = 0;
    config.store.path = None;
    config
}

pub struct Harness {
    pub engine: Engine,
    pub control: Arc<FakeControl>,
    pub probe: Arc<FakeProbe>,
    pub store: Arc<MemoryStore>,
    pub definition: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let definition = dir.path().join("wg0.conf");
        std::fs::write(&definition, DEFINITION).unwrap();

        let mut config = test_config(definition.clone());
        adjust(&mut config);

        let control = Arc::new(FakeControl::new());
        let probe = Arc::new(FakeProbe::new(true));
        let store = Arc::new(MemoryStore::new());

        let engine = Engine::with_parts(
            config,
            store.clone(),
            EngineParts {
                control: control.clone(),
                probe: probe.clone(),
                issuer: Arc::new(X25519Issuer),
                resolver: Some(Arc::new(NoResolver)),
            },
        )
        .unwrap();

        Self {
            engine,
            control,
            probe,
            store,
            definition,
            _dir: dir,
        }
    }

    pub fn definition_text(&self) -> String {
        std::fs::read_to_string(&self.definition).unwrap()
    }

    pub async fn state_of(&self, node_id: &str) -> NodeState {
        self.store.require(node_id).await.unwrap().state
    }

    /// Poll until `node_id` reaches one of `states`, or give up after `limit`.
    pub async fn wait_for_state(&self, node_id: &str, states: &[NodeState], limit: Duration) -> NodeState {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let state = self.state_of(node_id).await;
            if states.contains(&state) || tokio::time::Instant::now() >= deadline {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

pub fn new_public_key() -> String {
    X25519Issuer.generate_keypair().unwrap().public_key
}
