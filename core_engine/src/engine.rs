//! Wiring of every component from a `Config`.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use shared_utils::config::Config;

use crate::error::{CoreError, CoreResult};
use crate::identity::{IdentityIssuer, X25519Issuer};
use crate::monitor::{HealthMonitor, MonitorSettings};
use crate::peer_config::{EndpointResolver, PeerConfigBuilder};
use crate::pool::AddressPool;
use crate::probe::{probe_from_config, ReachabilityProbe};
use crate::registration::Registrar;
use crate::retry::RetryPolicy;
use crate::state_cache::ConnectionStates;
use crate::store::{JsonFileStore, MemoryStore, NodeStore, TokenStore};
use crate::supervisor::{ConnectionSupervisor, SupervisorSettings};
use crate::tunnel::{AddressingOutcome, TunnelControl, TunnelSynchronizer, WgCommandControl};

/// Collaborators that can be swapped out, mostly for tests.
pub struct EngineParts {
    pub control: Arc<dyn TunnelControl>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub issuer: Arc<dyn IdentityIssuer>,
    pub resolver: Option<Arc<dyn EndpointResolver>>,
}

pub struct Engine {
    config: Config,
    store: Arc<dyn NodeStore>,
    pool: Arc<AddressPool>,
    synchronizer: Arc<TunnelSynchronizer>,
    supervisor: Arc<ConnectionSupervisor>,
    registrar: Registrar,
    monitor: HealthMonitor,
}

impl Engine {
    /// Build the engine against the real tunnel utilities and the configured store.
    pub async fn from_config(config: Config) -> CoreResult<Self> {
        let control: Arc<dyn TunnelControl> = Arc::new(WgCommandControl::new(&config.tunnel));
        let probe = probe_from_config(&config.supervisor, &config.tunnel, Arc::clone(&control));
        let parts = EngineParts {
            control,
            probe,
            issuer: Arc::new(X25519Issuer),
            resolver: None,
        };

        match config.store.path.clone() {
            Some(path) => {
                let store = Arc::new(JsonFileStore::open(PathBuf::from(path)).await?);
                Self::with_parts(config, store, parts)
            }
            None => {
                warn!("no store path configured, node records will not survive a restart");
                Self::with_parts(config, Arc::new(MemoryStore::new()), parts)
            }
        }
    }

    pub fn with_parts<S>(config: Config, store: Arc<S>, parts: EngineParts) -> CoreResult<Self>
    where
        S: NodeStore + TokenStore + 'static,
    {
        let nodes: Arc<dyn NodeStore> = store.clone();
        let tokens: Arc<dyn TokenStore> = store;

        let pool = Arc::new(AddressPool::from_config(&config.pool, Arc::clone(&nodes))?);
        let synchronizer = Arc::new(TunnelSynchronizer::new(
            Arc::clone(&parts.control),
            &config.tunnel.definition_path,
            pool.overlay(),
            pool.server_address(),
            pool.routed_range(),
        ));

        let mut builder = PeerConfigBuilder::new(&config.peer, pool.overlay());
        if let Some(resolver) = parts.resolver {
            builder = builder.with_resolver(resolver);
        }

        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&nodes),
            Arc::clone(&synchronizer),
            parts.probe,
            Arc::new(ConnectionStates::new()),
            SupervisorSettings::from_config(&config.supervisor),
        ));

        let registrar = Registrar::new(
            Arc::clone(&nodes),
            Arc::clone(&tokens),
            Arc::clone(&pool),
            parts.issuer,
            Arc::new(builder),
            Arc::clone(&supervisor),
        );

        let monitor = HealthMonitor::new(
            Arc::clone(&supervisor),
            tokens,
            MonitorSettings::from_config(&config.monitor)?,
        );

        Ok(Self {
            config,
            store: nodes,
            pool,
            synchronizer,
            supervisor,
            registrar,
            monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    pub fn synchronizer(&self) -> &Arc<TunnelSynchronizer> {
        &self.synchronizer
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Repair server addressing (retrying while the interface comes up),
    /// load the state cache and start the background loops.
    pub async fn start(&self) -> CoreResult<()> {
        let policy = RetryPolicy::from_config(&self.config.supervisor);
        let repaired = policy
            .run_while(
                |_| self.synchronizer.ensure_server_addressing(),
                |err| err.is_transient(),
            )
            .await
            .map_err(|exhausted| CoreError::Sync(exhausted.last_error))?;

        match repaired.value {
            AddressingOutcome::AlreadyValid => info!("server addressing valid"),
            AddressingOutcome::Repaired { file, interface } => {
                warn!(file, interface, "server addressing repaired")
            }
        }

        let cached = self.supervisor.warm_cache().await?;
        info!(nodes = cached, "connection state cache loaded");

        self.monitor.start();
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.monitor.stop().await;
    }
}
