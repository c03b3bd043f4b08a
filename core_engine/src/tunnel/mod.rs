//! Keeps peer entries in step between the live interface and its
//! persisted definition file.
//!
//! Every operation is a single attempt and idempotent with respect to the
//! peer's public key. Retrying transient failures is left to the caller.

mod control;
mod error;
pub mod wgconf;

pub use control::{
    parse_addresses, parse_dump, CommandRunner, InterfaceStatus, LivePeer, RouteOutcome,
    TunnelControl, WgCommandControl,
};
pub use error::{TunnelError, TunnelResult};

use ipnet::Ipv4Net;
use std::collections::HashMap;
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::identity::decode_key;
use crate::pool::AddressRange;
use wgconf::InterfaceDefinition;

/// What `add_peer` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub live_changed: bool,
    pub file_changed: bool,
    /// Keys of stale peers that held the same address
    pub removed_conflicts: Vec<String>,
    pub route: Option<RouteOutcome>,
}

impl SyncOutcome {
    pub fn is_noop(&self) -> bool {
        !self.live_changed && !self.file_changed && self.removed_conflicts.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideOutcome {
    Removed,
    Absent,
    Failed(String),
}

/// Result of `remove_peer` on each side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub live: SideOutcome,
    pub file: SideOutcome,
}

impl RemoveOutcome {
    /// Neither side had an entry for the key.
    pub fn is_absent(&self) -> bool {
        self.live == SideOutcome::Absent && self.file == SideOutcome::Absent
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.live, SideOutcome::Failed(_)) && !matches!(self.file, SideOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingOutcome {
    AlreadyValid,
    Repaired { file: bool, interface: bool },
}

/// Interface-level figures for status reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub public_key: String,
    pub listen_port: Option<u16>,
    pub addresses: Vec<Ipv4Net>,
    /// The server address carries the overlay prefix on the interface
    pub addressing_valid: bool,
    pub peer_count: usize,
    /// Peers that completed at least one handshake
    pub handshaken: usize,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub struct TunnelSynchronizer {
    control: Arc<dyn TunnelControl>,
    definition_path: PathBuf,
    overlay: Ipv4Net,
    server_address: Ipv4Addr,
    routed: Option<AddressRange>,
    file_lock: Mutex<()>,
}

impl TunnelSynchronizer {
    pub fn new(
        control: Arc<dyn TunnelControl>,
        definition_path: impl Into<PathBuf>,
        overlay: Ipv4Net,
        server_address: Ipv4Addr,
        routed: Option<AddressRange>,
    ) -> Self {
        Self {
            control,
            definition_path: definition_path.into(),
            overlay,
            server_address,
            routed,
            file_lock: Mutex::new(()),
        }
    }

    pub fn control(&self) -> &Arc<dyn TunnelControl> {
        &self.control
    }

    pub fn definition_path(&self) -> &Path {
        &self.definition_path
    }

    /// Publish `public_key` with `address/32` on the interface and in the file.
    ///
    /// Stale entries holding the same address under another key are removed
    /// first. Calling this twice with the same arguments changes nothing the
    /// second time.
    pub async fn add_peer(
        &self,
        public_key: &str,
        address: Ipv4Addr,
        node_id: &str,
    ) -> TunnelResult<SyncOutcome> {
        decode_key(public_key).map_err(TunnelError::InvalidKey)?;
        let allowed = format!("{address}/32");
        let mut outcome = SyncOutcome::default();

        let live = self.control.dump_peers().await?;
        for stale in live.iter().filter(|peer| {
            peer.public_key != public_key && peer.allowed_ips.iter().any(|ip| *ip == allowed)
        }) {
            warn!(%node_id, %address, stale_key = %stale.public_key, "removing stale live peer holding the address");
            self.control.remove_peer(&stale.public_key).await?;
            outcome.removed_conflicts.push(stale.public_key.clone());
        }

        let current = live.iter().find(|peer| peer.public_key == public_key);
        let up_to_date = current.is_some_and(|peer| peer.allowed_ips == [allowed.as_str()]);
        if !up_to_date {
            self.control.set_peer(public_key, &allowed).await?;
            outcome.live_changed = true;
        }

        match self
            .edit_definition(|def| {
                let removed = def.remove_conflicting_peers(&allowed, public_key);
                let upserted = def.upsert_peer(public_key, &allowed, Some(node_id));
                (!removed.is_empty() || upserted, removed)
            })
            .await
        {
            Ok(Some((changed, removed))) => {
                outcome.file_changed = changed;
                for key in removed {
                    if !outcome.removed_conflicts.contains(&key) {
                        outcome.removed_conflicts.push(key);
                    }
                }
            }
            Ok(None) => {}
            Err(err @ TunnelError::ConfigCorruption { .. }) => {
                error!(%node_id, file = %self.definition_path.display(), "peer not persisted: {err}");
            }
            Err(err) => return Err(err),
        }

        if self.routed.is_some_and(|range| range.contains(address)) {
            let destination = Ipv4Net::from(address);
            outcome.route = Some(self.control.add_route(destination).await?);
        }

        if outcome.is_noop() {
            debug!(%node_id, %address, "peer already in sync");
        } else {
            info!(
                %node_id,
                %address,
                live_changed = outcome.live_changed,
                file_changed = outcome.file_changed,
                conflicts = outcome.removed_conflicts.len(),
                "peer synchronized"
            );
        }

        Ok(outcome)
    }

    /// Retract `public_key` from both the interface and the file.
    ///
    /// Both sides are always attempted; failures are logged and reported in
    /// the outcome instead of aborting. An unknown key is a no-op.
    pub async fn remove_peer(&self, public_key: &str) -> RemoveOutcome {
        let live = self.remove_live(public_key).await;
        if let SideOutcome::Failed(reason) = &live {
            warn!(%public_key, "failed to remove live peer: {reason}");
        }

        let file = match self.edit_definition(|def| def.remove_peer(public_key)).await {
            Ok(Some(true)) => SideOutcome::Removed,
            Ok(Some(false)) | Ok(None) => SideOutcome::Absent,
            Err(err) => {
                warn!(%public_key, file = %self.definition_path.display(), "failed to remove peer from file: {err}");
                SideOutcome::Failed(err.to_string())
            }
        };

        let outcome = RemoveOutcome { live, file };
        if outcome.is_absent() {
            debug!(%public_key, "peer was not present");
        } else {
            info!(%public_key, live = ?outcome.live, file = ?outcome.file, "peer removed");
        }
        outcome
    }

    async fn remove_live(&self, public_key: &str) -> SideOutcome {
        match self.control.dump_peers().await {
            Ok(peers) if !peers.iter().any(|peer| peer.public_key == public_key) => {
                return SideOutcome::Absent;
            }
            Ok(_) => {}
            Err(err) => debug!(%public_key, "peer listing failed, removing blindly: {err}"),
        }

        match self.control.remove_peer(public_key).await {
            Ok(()) => SideOutcome::Removed,
            Err(err) => SideOutcome::Failed(err.to_string()),
        }
    }

    /// Live entry for `public_key`, `None` when the interface has no such peer.
    pub async fn peer_status(&self, public_key: &str) -> TunnelResult<Option<LivePeer>> {
        Ok(self
            .control
            .dump_peers()
            .await?
            .into_iter()
            .find(|peer| peer.public_key == public_key))
    }

    /// Every live peer keyed by public key.
    pub async fn peer_statuses(&self) -> TunnelResult<HashMap<String, LivePeer>> {
        Ok(self
            .control
            .dump_peers()
            .await?
            .into_iter()
            .map(|peer| (peer.public_key.clone(), peer))
            .collect())
    }

    pub async fn server_status(&self) -> TunnelResult<ServerStatus> {
        let interface = self.control.show_interface().await?;
        let peers = self.control.dump_peers().await?;
        let addressing_valid = interface
            .addresses
            .iter()
            .any(|net| net.addr() == self.server_address && covers(net, self.overlay));

        Ok(ServerStatus {
            public_key: interface.public_key,
            listen_port: interface.listen_port,
            addresses: interface.addresses,
            addressing_valid,
            peer_count: peers.len(),
            handshaken: peers.iter().filter(|peer| peer.latest_handshake.is_some()).count(),
            rx_bytes: peers.iter().map(|peer| peer.rx_bytes).sum(),
            tx_bytes: peers.iter().map(|peer| peer.tx_bytes).sum(),
        })
    }

    /// Make sure the server address carries the overlay prefix, both in the
    /// file and on the interface, restarting the interface after a repair.
    pub async fn ensure_server_addressing(&self) -> TunnelResult<AddressingOutcome> {
        let desired = Ipv4Net::new(self.server_address, self.overlay.prefix_len())
            .map_err(|e| TunnelError::UnexpectedOutput {
                command: "overlay prefix".to_string(),
                message: e.to_string(),
            })?;

        let file_repaired = self
            .edit_definition(|def| {
                let current = def.interface_address().map(str::to_string);
                let repaired = repair_address_list(current.as_deref(), self.server_address, desired, self.overlay);
                match repaired {
                    Some(value) => {
                        warn!(
                            found = current.as_deref().unwrap_or("<none>"),
                            repaired = %value,
                            "server address in definition does not cover the overlay"
                        );
                        def.set_interface_address(&value)
                    }
                    None => false,
                }
            })
            .await?
            .unwrap_or(false);

        let status = self.control.show_interface().await?;
        let live_ok = status
            .addresses
            .iter()
            .any(|net| net.addr() == self.server_address && covers(net, self.overlay));
        if !live_ok {
            warn!(
                addresses = ?status.addresses,
                expected = %desired,
                "interface address does not cover the overlay"
            );
        }

        if file_repaired || !live_ok {
            self.control.restart().await?;
            info!(%desired, file = file_repaired, interface = !live_ok, "server addressing repaired");
            return Ok(AddressingOutcome::Repaired {
                file: file_repaired,
                interface: !live_ok,
            });
        }

        debug!(%desired, "server addressing already valid");
        Ok(AddressingOutcome::AlreadyValid)
    }

    /// Parse the definition, apply `edit`, and write it back if the edit
    /// reports a change. Returns `None` when the file does not exist.
    async fn edit_definition<T: Changed>(
        &self,
        edit: impl FnOnce(&mut InterfaceDefinition) -> T + Send,
    ) -> TunnelResult<Option<T>> {
        let _guard = self.file_lock.lock().await;

        let text = match fs::read_to_string(&self.definition_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %self.definition_path.display(), "interface definition not found");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let mut definition = InterfaceDefinition::parse(&text)?;
        let result = edit(&mut definition);
        if result.changed() {
            write_atomically(&self.definition_path, &definition.to_string()).await?;
        }
        Ok(Some(result))
    }
}

/// Edit results that tell whether the definition must be written back.
trait Changed {
    fn changed(&self) -> bool;
}

impl Changed for bool {
    fn changed(&self) -> bool {
        *self
    }
}

impl<T> Changed for (bool, T) {
    fn changed(&self) -> bool {
        self.0
    }
}

fn covers(net: &Ipv4Net, overlay: Ipv4Net) -> bool {
    net.trunc().contains(&overlay)
}

/// New `Address` value when the server entry is missing or too narrow.
fn repair_address_list(
    current: Option<&str>,
    server: Ipv4Addr,
    desired: Ipv4Net,
    overlay: Ipv4Net,
) -> Option<String> {
    let Some(current) = current else {
        return Some(desired.to_string());
    };

    let items: Vec<&str> = current
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect();

    let server_entry = items.iter().position(|item| {
        item.parse::<Ipv4Net>().map(|net| net.addr() == server).unwrap_or(false)
            || item.parse::<Ipv4Addr>().map(|addr| addr == server).unwrap_or(false)
    });

    let mut repaired: Vec<String> = items.iter().map(|item| item.to_string()).collect();
    match server_entry {
        Some(idx) => {
            let ok = items[idx]
                .parse::<Ipv4Net>()
                .map(|net| covers(&net, overlay))
                .unwrap_or(false);
            if ok {
                return None;
            }
            repaired[idx] = desired.to_string();
        }
        None => repaired.insert(0, desired.to_string()),
    }
    Some(repaired.join(", "))
}

async fn write_atomically(path: &Path, contents: &str) -> TunnelResult<()> {
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    fs::rename(&tmp, path).await?;
    Ok(())
}
