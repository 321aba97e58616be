//! Sorted sets of CIDR ranges with a binary-search `contains`, used to classify
//! flow targets as private, domestic or foreign.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod builtin;

use std::net::IpAddr;
use std::str::FromStr as _;
use std::sync::LazyLock;

use anyhow::{Context as _, Result, bail, ensure};
use ip_network::IpNetwork;
use parking_lot::RwLock;

/// Loopback, RFC1918 and friends. Never routed through the relay.
pub static PRIVATE: LazyLock<SharedRangeDb> = LazyLock::new(|| {
    SharedRangeDb::new(RangeDb::from_cidrs(builtin::PRIVATE).expect("builtin private CIDRs parse"))
});

/// Seed set of CN delegations, replaced wholesale by the periodic refresher.
pub static CHINA: LazyLock<SharedRangeDb> = LazyLock::new(|| {
    SharedRangeDb::new(RangeDb::from_cidrs(builtin::CHINA).expect("builtin china CIDRs parse"))
});

/// A single CIDR, stored as its inclusive byte-array bounds.
///
/// Bounds are 4 bytes for IPv4 and 16 bytes for IPv6; comparing mixed lengths
/// lexicographically keeps the two families apart in one sorted sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRange {
    min: Vec<u8>,
    max: Vec<u8>,
}

impl IpRange {
    pub fn new(cidr: &str) -> Result<Self> {
        let network =
            IpNetwork::from_str(cidr).with_context(|| format!("Failed to parse CIDR `{cidr}`"))?;

        let (min, prefix) = match network {
            IpNetwork::V4(n) => (n.network_address().octets().to_vec(), n.netmask()),
            IpNetwork::V6(n) => (n.network_address().octets().to_vec(), n.netmask()),
        };

        let mut max = min.clone();
        for (i, byte) in max.iter_mut().enumerate() {
            *byte |= !mask_byte(prefix, i);
        }

        Ok(Self { min, max })
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        self.min.as_slice() <= key && key <= self.max.as_slice()
    }
}

/// The netmask byte at index `i` for the given prefix length.
fn mask_byte(prefix: u8, i: usize) -> u8 {
    let bits_before = (i as u32) * 8;
    let prefix = u32::from(prefix);

    if prefix >= bits_before + 8 {
        0xff
    } else if prefix <= bits_before {
        0x00
    } else {
        0xffu8 << (bits_before + 8 - prefix)
    }
}

/// An immutable, sorted range set.
#[derive(Debug, Default)]
pub struct RangeDb {
    ranges: Vec<IpRange>,
}

impl RangeDb {
    pub fn from_cidrs<'a>(cidrs: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let ranges = cidrs
            .into_iter()
            .map(IpRange::new)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_ranges(ranges))
    }

    pub fn from_ranges(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort_by(|a, b| a.min.cmp(&b.min));

        Self { ranges }
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, target: IpAddr) -> bool {
        let key = lookup_key(target);

        // First entry whose `min` exceeds the target, then step back one.
        let idx = self
            .ranges
            .partition_point(|range| range.min.as_slice() <= key.as_slice());

        let Some(idx) = idx.checked_sub(1) else {
            return false;
        };

        self.ranges[idx].contains_key(&key)
    }
}

fn lookup_key(target: IpAddr) -> Vec<u8> {
    // IPv4-mapped IPv6 addresses compare against the IPv4 entries.
    match target.to_canonical() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

/// A range set shared between the per-flow classifiers (readers) and the
/// periodic refresher (writer).
///
/// Refreshers build a new [`RangeDb`] off-lock and commit it with
/// [`SharedRangeDb::replace`]; the lock only ever covers the swap.
#[derive(Debug)]
pub struct SharedRangeDb {
    inner: RwLock<RangeDb>,
}

impl SharedRangeDb {
    pub fn new(db: RangeDb) -> Self {
        Self {
            inner: RwLock::new(db),
        }
    }

    pub fn contains(&self, target: IpAddr) -> bool {
        self.inner.read().contains(target)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn replace(&self, db: RangeDb) {
        *self.inner.write() = db;
    }
}

/// Parses an RIR delegation file (`delegated-apnic-latest`) into a fresh DB of
/// the given country's IPv4 + IPv6 allocations.
///
/// Rows look like `apnic|CN|ipv4|1.0.1.0|256|20110414|allocated`. For IPv4 the
/// value field is a host count, for IPv6 it is already a prefix length.
pub fn parse_delegations(body: &str, country: &str) -> Result<RangeDb> {
    let mut ranges = Vec::new();

    for line in body.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields = line.split('|').collect::<Vec<_>>();
        let [_, cc, kind, start, value, ..] = fields.as_slice() else {
            continue;
        };

        if *cc != country || !matches!(*kind, "ipv4" | "ipv6") {
            continue;
        }

        let value = value
            .parse::<u32>()
            .with_context(|| format!("Failed to parse value field of `{line}`"))?;
        ensure!(value > 0, "Zero-sized delegation in `{line}`");

        let prefix = match *kind {
            "ipv4" => 32 - value.ilog2(),
            _ => value,
        };

        ranges.push(IpRange::new(&format!("{start}/{prefix}"))?);
    }

    if ranges.is_empty() {
        bail!("Delegation file contains no `{country}` ranges");
    }

    Ok(RangeDb::from_ranges(ranges))
}
