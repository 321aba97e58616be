use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr as _;

use ip_network::IpNetwork;
use parking_lot::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to parse CIDR: {0}")]
    InvalidCidr(#[from] ip_network::IpNetworkParseError),
    #[error("fake-IP range must be IPv4")]
    NotIpv4,
    #[error("fake-IP range /{0} is too small")]
    TooSmall(u8),
}

/// Wrap-around allocator of synthetic IPv4 addresses for hostnames.
///
/// Invariants: the two maps are inverse on their domains and every live value
/// lies in `[min, max]`. When the cursor reaches a slot that is still bound to
/// an older hostname, that binding is evicted from both maps first.
pub struct FakeIpPool {
    network: u32,
    broadcast: u32,
    min: u32,
    max: u32,
    inner: Mutex<Bindings>,
}

#[derive(Default)]
struct Bindings {
    cursor: u32,
    by_host: HashMap<String, u32>,
    by_ip: HashMap<u32, String>,
}

impl FakeIpPool {
    /// Creates a pool over an IPv4 CIDR such as `198.18.0.0/16`.
    ///
    /// The network address, the `.1` gateway and the broadcast address are
    /// never handed out.
    pub fn new(cidr: &str) -> Result<Self, PoolError> {
        let IpNetwork::V4(network) = IpNetwork::from_str(cidr)? else {
            return Err(PoolError::NotIpv4);
        };

        let prefix = network.netmask();
        if prefix > 29 {
            return Err(PoolError::TooSmall(prefix));
        }

        let network = u32::from(network.network_address());
        let broadcast = network + ((1u64 << (32 - prefix)) - 1) as u32;

        Ok(Self {
            network,
            broadcast,
            min: network + 2,
            max: broadcast - 1,
            inner: Mutex::new(Bindings::default()),
        })
    }

    /// Whether `ip` lies anywhere in the pool's range.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip.to_canonical() {
            IpAddr::V4(ip) => (self.network..=self.broadcast).contains(&u32::from(ip)),
            IpAddr::V6(_) => false,
        }
    }

    /// The fake IP for `host`, allocating a slot if it has none yet.
    pub fn lookup(&self, host: &str) -> Ipv4Addr {
        let mut inner = self.inner.lock();

        if let Some(ip) = inner.by_host.get(host) {
            return Ipv4Addr::from(*ip);
        }

        let capacity = self.max - self.min + 1;
        let ip = self.min + inner.cursor;
        inner.cursor = (inner.cursor + 1) % capacity;

        if let Some(evicted) = inner.by_ip.remove(&ip) {
            tracing::debug!(host = %evicted, ip = %Ipv4Addr::from(ip), "Evicting stale fake-IP binding");
            inner.by_host.remove(&evicted);
        }

        inner.by_host.insert(host.to_owned(), ip);
        inner.by_ip.insert(ip, host.to_owned());

        Ipv4Addr::from(ip)
    }

    /// The hostname bound to a previously handed-out fake IP.
    pub fn reverse_lookup(&self, ip: Ipv4Addr) -> Option<String> {
        self.inner.lock().by_ip.get(&u32::from(ip)).cloned()
    }
}
