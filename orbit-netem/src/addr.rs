//! Mesh address derivation and subnet arithmetic.
//!
//! Every node gets a four-octet mesh address `base.(2 + id)` and a sixteen-octet
//! twin `fd00::a:b:c:d` that carries each octet of the four-octet address in
//! its own 16-bit group. Routes, allowed-ips and shaping keys all go through the
//! same embedding so both families stay in step.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use serde::Deserialize;

pub const MAX_NODE_ID: u8 = 253;
pub const HOST_OFFSET: u8 = 2;
pub const DEFAULT_MESH_BASE: Ipv4Addr = Ipv4Addr::new(192, 168, 50, 0);
pub const MESH_V6_PREFIX: u16 = 0xfd00;
/// Prefix length for a node's own v6 address on its mesh interface.
pub const OWN_V6_PREFIX_LEN: u8 = 64;
/// Prefix length for point-to-point v6 peer links.
pub const P2P_V6_PREFIX_LEN: u8 = 126;
/// Four-octet subnets shorter than this cannot be mirrored.
pub const MIN_MIRROR_PREFIX_LEN: u8 = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("node id {0} is larger than allowed {MAX_NODE_ID}")]
    NodeIdOutOfRange(u64),
    #[error("prefix length /{prefix} exceeds /{max}")]
    PrefixTooLong { prefix: u8, max: u8 },
    #[error("subnet {0} is too wide to mirror into the mesh v6 range")]
    SubnetTooWide(Ipv4Subnet),
    #[error("malformed subnet '{0}'")]
    Malformed(String),
}

/// Identifier of one node (host or emulated machine) on a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "u64")]
pub struct NodeId(u8);

impl NodeId {
    pub fn new(id: u64) -> Result<Self, AddrError> {
        if id > MAX_NODE_ID as u64 {
            return Err(AddrError::NodeIdOutOfRange(id));
        }
        Ok(Self(id as u8))
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u64> for NodeId {
    type Error = AddrError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl FromStr for NodeId {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u64 = s
            .trim()
            .parse()
            .map_err(|_| AddrError::Malformed(s.to_string()))?;
        Self::new(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshAddress {
    pub v4: Ipv4Addr,
    pub v6: Ipv6Addr,
}

pub fn mesh_address(base: Ipv4Addr, id: NodeId) -> MeshAddress {
    let [a, b, c, _] = base.octets();
    let v4 = Ipv4Addr::new(a, b, c, HOST_OFFSET + id.get());
    MeshAddress {
        v4,
        v6: embed_v4(v4),
    }
}

/// `a.b.c.d` -> `fd00::a:b:c:d`.
pub fn embed_v4(addr: Ipv4Addr) -> Ipv6Addr {
    let [a, b, c, d] = addr.octets();
    Ipv6Addr::new(MESH_V6_PREFIX, 0, 0, 0, a as u16, b as u16, c as u16, d as u16)
}

/// Inverse of [`embed_v4`] for addresses of that shape.
pub fn extract_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    let [p, z0, z1, z2, a, b, c, d] = addr.segments();
    if p != MESH_V6_PREFIX || z0 != 0 || z1 != 0 || z2 != 0 {
        return None;
    }
    let octet = |g: u16| u8::try_from(g).ok();
    Some(Ipv4Addr::new(octet(a)?, octet(b)?, octet(c)?, octet(d)?))
}

fn prefix_bounds<const N: usize>(bytes: [u8; N], prefix: u8) -> ([u8; N], [u8; N]) {
    let mut first = bytes;
    let mut last = bytes;
    for (i, (f, l)) in first.iter_mut().zip(last.iter_mut()).enumerate() {
        let fixed_bits = (prefix as usize).saturating_sub(i * 8).min(8);
        let mask = if fixed_bits == 0 {
            0
        } else {
            u8::MAX << (8 - fixed_bits)
        };
        *f &= mask;
        *l = *f | !mask;
    }
    (first, last)
}

/// Adds one to a big-endian byte string, carrying through every byte.
/// Returns `false` on wrap-around.
fn increment(bytes: &mut [u8]) -> bool {
    for byte in bytes.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return true;
        }
    }
    false
}

/// Every address from the network address to the last address, inclusive.
#[derive(Debug, Clone)]
pub struct Addresses<const N: usize> {
    next: Option<[u8; N]>,
    last: [u8; N],
}

impl<const N: usize> Iterator for Addresses<N> {
    type Item = [u8; N];

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        if current == self.last {
            self.next = None;
        } else {
            let mut next = current;
            self.next = increment(&mut next).then_some(next);
        }
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, AddrError> {
        if prefix > 32 {
            return Err(AddrError::PrefixTooLong { prefix, max: 32 });
        }
        let (network, _) = prefix_bounds(addr.octets(), prefix);
        Ok(Self {
            network: network.into(),
            prefix,
        })
    }

    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            network: addr,
            prefix: 32,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn last(&self) -> Ipv4Addr {
        prefix_bounds(self.network.octets(), self.prefix).1.into()
    }

    pub fn len(&self) -> u64 {
        1u64 << (32 - self.prefix)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        prefix_bounds(addr.octets(), self.prefix).0 == self.network.octets()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        let (first, last) = prefix_bounds(self.network.octets(), self.prefix);
        Addresses {
            next: Some(first),
            last,
        }
        .map(Ipv4Addr::from)
    }

    /// The sixteen-octet subnets covering exactly the embedded addresses of
    /// this subnet.
    ///
    /// From /24 on the varying bits all sit in the last group, so a single
    /// `/(96 + prefix)` covers them. Between /16 and /24 the third octet varies
    /// too, which lands in a different group, so the subnet is split into one
    /// /120 per /24 block.
    pub fn mesh_v6(&self) -> Result<Vec<Ipv6Subnet>, AddrError> {
        if self.prefix >= 24 {
            return Ok(vec![Ipv6Subnet {
                network: embed_v4(self.network),
                prefix: 96 + self.prefix,
            }]);
        }
        if self.prefix < MIN_MIRROR_PREFIX_LEN {
            return Err(AddrError::SubnetTooWide(*self));
        }
        let base = u32::from(self.network);
        let blocks = 1u32 << (24 - self.prefix);
        Ok((0..blocks)
            .map(|block| Ipv6Subnet {
                network: embed_v4(Ipv4Addr::from(base + (block << 8))),
                prefix: 120,
            })
            .collect())
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Subnet {
    type Err = AddrError;

    /// Accepts `a.b.c.d/p`, or a bare address as a /32.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddrError::Malformed(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse().map_err(|_| malformed())?),
            None => (s.trim(), 32),
        };
        let addr: Ipv4Addr = addr.parse().map_err(|_| malformed())?;
        Self::new(addr, prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv6Subnet {
    network: Ipv6Addr,
    prefix: u8,
}

impl Ipv6Subnet {
    pub fn new(addr: Ipv6Addr, prefix: u8) -> Result<Self, AddrError> {
        if prefix > 128 {
            return Err(AddrError::PrefixTooLong { prefix, max: 128 });
        }
        let (network, _) = prefix_bounds(addr.octets(), prefix);
        Ok(Self {
            network: network.into(),
            prefix,
        })
    }

    pub fn host(addr: Ipv6Addr) -> Self {
        Self {
            network: addr,
            prefix: 128,
        }
    }

    pub fn network(&self) -> Ipv6Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn last(&self) -> Ipv6Addr {
        prefix_bounds(self.network.octets(), self.prefix).1.into()
    }

    /// Saturates at `u128::MAX` for a /0.
    pub fn len(&self) -> u128 {
        1u128.checked_shl(128 - self.prefix as u32).unwrap_or(u128::MAX)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        prefix_bounds(addr.octets(), self.prefix).0 == self.network.octets()
    }

    pub fn addresses(&self) -> impl Iterator<Item = Ipv6Addr> {
        let (first, last) = prefix_bounds(self.network.octets(), self.prefix);
        Addresses {
            next: Some(first),
            last,
        }
        .map(Ipv6Addr::from)
    }
}

impl fmt::Display for Ipv6Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv6Subnet {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddrError::Malformed(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, prefix.parse().map_err(|_| malformed())?),
            None => (s.trim(), 128),
        };
        let addr: Ipv6Addr = addr.parse().map_err(|_| malformed())?;
        Self::new(addr, prefix)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn v4(s: &str) -> Ipv4Subnet {
        s.parse().expect("valid subnet")
    }

    #[test]
    fn node_five_derives_documented_addresses() {
        let addr = mesh_address(DEFAULT_MESH_BASE, NodeId::new(5).unwrap());
        assert_eq!(addr.v4, Ipv4Addr::new(192, 168, 50, 7));
        assert_eq!(addr.v6, "fd00::c0:a8:32:7".parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            Ipv6Subnet::new(addr.v6, P2P_V6_PREFIX_LEN)
                .unwrap()
                .to_string(),
            "fd00::c0:a8:32:4/126"
        );
    }

    #[test]
    fn node_ids_above_253_are_rejected() {
        assert!(NodeId::new(253).is_ok());
        assert_eq!(NodeId::new(254), Err(AddrError::NodeIdOutOfRange(254)));
        assert!("300".parse::<NodeId>().is_err());
        assert!("abc".parse::<NodeId>().is_err());
    }

    #[test]
    fn derivation_is_injective() {
        let mut v4s = HashSet::new();
        let mut v6s = HashSet::new();
        for id in 0..=MAX_NODE_ID as u64 {
            let addr = mesh_address(DEFAULT_MESH_BASE, NodeId::new(id).unwrap());
            assert!(v4s.insert(addr.v4), "duplicate v4 for {id}");
            assert!(v6s.insert(addr.v6), "duplicate v6 for {id}");
        }
    }

    #[test]
    fn embedding_round_trips_every_octet() {
        for octet in 0..=255u8 {
            let addr = Ipv4Addr::new(octet, 255 - octet, octet / 2, octet);
            assert_eq!(extract_v4(embed_v4(addr)), Some(addr));
        }
        assert_eq!(extract_v4("fd00::1:2:3:100".parse().unwrap()), None);
        assert_eq!(extract_v4("fe80::1".parse().unwrap()), None);
    }

    #[test]
    fn subnet_is_normalised_to_network() {
        let subnet = v4("10.0.0.6/30");
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(subnet.last(), Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(subnet.to_string(), "10.0.0.4/30");
        assert!(subnet.contains(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 0, 0, 8)));
    }

    #[test]
    fn malformed_subnets_are_rejected() {
        assert!("10.0.0.0/33".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.0/24".parse::<Ipv4Subnet>().is_err());
        assert!("10.0.0.0/x".parse::<Ipv4Subnet>().is_err());
        assert!("fd00::/129".parse::<Ipv6Subnet>().is_err());
        assert_eq!(v4("10.1.2.3"), Ipv4Subnet::host(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn enumeration_is_inclusive() {
        let addrs: Vec<_> = v4("10.0.0.0/30").addresses().collect();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 0, 0, 0),
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
            ]
        );
        assert_eq!(v4("10.0.0.9/32").addresses().count(), 1);
        assert_eq!(v4("255.255.255.255/32").addresses().count(), 1);
        assert_eq!(v4("255.255.255.252/30").addresses().count(), 4);
    }

    #[test]
    fn enumeration_carries_across_bytes() {
        let addrs: Vec<_> = v4("10.0.0.0/23").addresses().collect();
        assert_eq!(addrs.len(), 512);
        let pos = addrs
            .iter()
            .position(|a| *a == Ipv4Addr::new(10, 0, 0, 255))
            .unwrap();
        assert_eq!(addrs[pos + 1], Ipv4Addr::new(10, 0, 1, 0));

        let subnet: Ipv6Subnet = "fd00::a:0/119".parse().unwrap();
        let addrs: Vec<_> = subnet.addresses().collect();
        assert_eq!(addrs.len() as u128, subnet.len());
        let pos = addrs
            .iter()
            .position(|a| *a == "fd00::a:ff".parse::<Ipv6Addr>().unwrap())
            .unwrap();
        assert_eq!(addrs[pos + 1], "fd00::a:100".parse::<Ipv6Addr>().unwrap());
        assert_eq!(*addrs.last().unwrap(), subnet.last());
    }

    #[test]
    fn mirror_keeps_prefix_semantics() {
        let mirror = v4("10.0.0.0/24").mesh_v6().unwrap();
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror[0].prefix(), 120);
        assert_eq!(mirror[0].network(), embed_v4(Ipv4Addr::new(10, 0, 0, 0)));

        let mirror = v4("10.0.0.4/30").mesh_v6().unwrap();
        assert_eq!(mirror[0].to_string(), "fd00::a:0:0:4/126");

        let mirror = v4("10.0.0.9/32").mesh_v6().unwrap();
        assert_eq!(mirror, vec![Ipv6Subnet::host(embed_v4(Ipv4Addr::new(10, 0, 0, 9)))]);
    }

    #[test]
    fn mirror_has_same_cardinality_and_commutes_with_enumeration() {
        for subnet in ["10.0.0.0/30", "10.0.0.0/24", "172.16.4.0/22", "10.9.0.0/20", "1.2.3.4/32"] {
            let subnet = v4(subnet);
            let mirror = subnet.mesh_v6().unwrap();
            let mirrored_len: u128 = mirror.iter().map(Ipv6Subnet::len).sum();
            assert_eq!(mirrored_len, subnet.len() as u128, "{subnet}");

            let mapped: Vec<Ipv6Addr> = subnet.addresses().map(embed_v4).collect();
            let enumerated: Vec<Ipv6Addr> = mirror.iter().flat_map(Ipv6Subnet::addresses).collect();
            assert_eq!(mapped, enumerated, "{subnet}");
        }
    }

    #[test]
    fn wide_subnets_cannot_be_mirrored() {
        assert!(v4("10.0.0.0/16").mesh_v6().is_ok());
        assert_eq!(
            v4("10.0.0.0/15").mesh_v6(),
            Err(AddrError::SubnetTooWide(v4("10.0.0.0/15")))
        );
    }

    #[test]
    fn node_ids_deserialize_from_json_keys() {
        let ids: std::collections::BTreeMap<NodeId, u8> =
            serde_json::from_str(r#"{"3": 1, "0": 2}"#).unwrap();
        assert_eq!(ids.keys().map(|id| id.get()).collect::<Vec<_>>(), vec![0, 3]);
        assert!(serde_json::from_str::<std::collections::BTreeMap<NodeId, u8>>(r#"{"254": 1}"#).is_err());
    }
}
