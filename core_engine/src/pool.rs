//! Overlay address allocation.
//!
//! Each node class owns a disjoint inclusive sub-range of the overlay
//! network. Allocation scans that range in ascending order and hands out the
//! first address that is neither held by a stored node nor reserved by an
//! in-flight registration.

use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use shared_utils::config::{parse_range, PoolConfig};

use crate::error::{CoreError, CoreResult};
use crate::model::NodeClass;
use crate::store::NodeStore;

/// Inclusive IPv4 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
}

impl AddressRange {
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> CoreResult<Self> {
        if u32::from(first) > u32::from(last) {
            return Err(CoreError::InvalidRange(format!("{first}-{last}")));
        }
        Ok(Self { first, last })
    }

    pub fn parse(range: &str) -> CoreResult<Self> {
        let (first, last) = parse_range(range).map_err(CoreError::InvalidRange)?;
        Self::new(first, last)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let value = u32::from(addr);
        value >= u32::from(self.first) && value <= u32::from(self.last)
    }

    fn overlaps(&self, other: &AddressRange) -> bool {
        u32::from(self.first) <= u32::from(other.last)
            && u32::from(other.first) <= u32::from(self.last)
    }

    fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.first)..=u32::from(self.last)).map(Ipv4Addr::from)
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.last) - u32::from(self.first)) + 1
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.first, self.last)
    }
}

pub struct AddressPool {
    overlay: Ipv4Net,
    server_address: Ipv4Addr,
    ranges: Vec<(NodeClass, AddressRange)>,
    routed: Option<AddressRange>,
    store: Arc<dyn NodeStore>,
    reservations: Mutex<HashSet<Ipv4Addr>>,
}

impl AddressPool {
    pub fn new(
        overlay: Ipv4Net,
        server_address: Ipv4Addr,
        ranges: Vec<(NodeClass, AddressRange)>,
        routed: Option<AddressRange>,
        store: Arc<dyn NodeStore>,
    ) -> CoreResult<Self> {
        for (index, (class, range)) in ranges.iter().enumerate() {
            if !overlay.contains(&range.first) || !overlay.contains(&range.last) {
                return Err(CoreError::InvalidRange(format!(
                    "{class} range {range} is outside {overlay}"
                )));
            }
            if range.contains(server_address) {
                return Err(CoreError::InvalidRange(format!(
                    "{class} range {range} contains the server address {server_address}"
                )));
            }
            for (other_class, other) in &ranges[index + 1..] {
                if other_class == class {
                    return Err(CoreError::InvalidRange(format!(
                        "class {class} has more than one range"
                    )));
                }
                if range.overlaps(other) {
                    return Err(CoreError::InvalidRange(format!(
                        "{class} range {range} overlaps {other_class} range {other}"
                    )));
                }
            }
        }

        Ok(Self {
            overlay,
            server_address,
            ranges,
            routed,
            store,
            reservations: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_config(config: &PoolConfig, store: Arc<dyn NodeStore>) -> CoreResult<Self> {
        let overlay: Ipv4Net = config
            .overlay_cidr
            .parse()
            .map_err(|e| CoreError::InvalidRange(format!("{}: {e}", config.overlay_cidr)))?;
        let server_address: Ipv4Addr = config
            .server_address
            .parse()
            .map_err(|e| CoreError::InvalidRange(format!("{}: {e}", config.server_address)))?;

        let ranges = config
            .classes
            .iter()
            .map(|entry| Ok((entry.class.parse()?, AddressRange::parse(&entry.range)?)))
            .collect::<CoreResult<Vec<_>>>()?;

        let routed = config
            .routed_range
            .as_deref()
            .map(AddressRange::parse)
            .transpose()?;

        Self::new(overlay, server_address, ranges, routed, store)
    }

    pub fn overlay(&self) -> Ipv4Net {
        self.overlay
    }

    pub fn server_address(&self) -> Ipv4Addr {
        self.server_address
    }

    pub fn range_for(&self, class: NodeClass) -> CoreResult<AddressRange> {
        self.ranges
            .iter()
            .find(|(c, _)| *c == class)
            .map(|(_, range)| *range)
            .ok_or_else(|| CoreError::UnknownClass(class.to_string()))
    }

    pub fn classes(&self) -> impl Iterator<Item = NodeClass> + '_ {
        self.ranges.iter().map(|(class, _)| *class)
    }

    /// Range whose peers need an explicit host route.
    pub fn routed_range(&self) -> Option<AddressRange> {
        self.routed
    }

    /// Reserve the lowest free address of the class range.
    ///
    /// The address stays reserved until `release` is called, which callers do
    /// once the owning node is persisted or the registration is abandoned.
    pub async fn allocate(&self, class: NodeClass) -> CoreResult<Ipv4Addr> {
        let range = self.range_for(class)?;

        let mut reservations = self.reservations.lock().await;
        let assigned = self.store.assigned_addresses().await?;

        let free = range.addresses().find(|addr| {
            *addr != self.server_address
                && *addr != self.overlay.network()
                && *addr != self.overlay.broadcast()
                && !assigned.contains(addr)
                && !reservations.contains(addr)
        });

        match free {
            Some(addr) => {
                reservations.insert(addr);
                debug!(%class, address = %addr, "address reserved");
                Ok(addr)
            }
            None => {
                warn!(%class, range = %range, "address pool exhausted");
                Err(CoreError::PoolExhausted(class))
            }
        }
    }

    /// Drop the in-flight reservation for `addr`, if any.
    ///
    /// Ownership of stored addresses is derived from the node store, so an
    /// address becomes allocatable again once its node is deleted.
    pub async fn release(&self, addr: Ipv4Addr) {
        if self.reservations.lock().await.remove(&addr) {
            debug!(address = %addr, "reservation released");
        }
    }

    /// Allocated/total counts for one class.
    pub async fn usage(&self, class: NodeClass) -> CoreResult<(u64, u64)> {
        let range = self.range_for(class)?;
        let reservations = self.reservations.lock().await;
        let assigned = self.store.assigned_addresses().await?;
        let used = assigned
            .iter()
            .chain(reservations.iter())
            .filter(|addr| range.contains(**addr))
            .collect::<HashSet<_>>()
            .len() as u64;
        Ok((used, range.size()))
    }
}
