use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use bytes::BufMut;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

/// Width of a node identifier in bytes (160 bits).
pub const ID_LENGTH_IN_BYTES: usize = 20;

/// Wire width of a serialized contact: id (20) || port (2, BE) || ip (16).
pub const CONTACT_LENGTH_IN_BYTES: usize = 38;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("Invalid id length: {0}. Must be {ID_LENGTH_IN_BYTES} bytes")]
    InvalidIdLength(usize),
    #[error("Invalid hex id: {0}")]
    InvalidHexId(#[from] hex::FromHexError),
    #[error("Invalid contact length: {0}. Must be {CONTACT_LENGTH_IN_BYTES} bytes")]
    InvalidContactLength(usize),
}

/// A 160-bit Kademlia identifier. Used both for node ids, storage keys and
/// the per-request random ids (nonces) echoed back by responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LENGTH_IN_BYTES]);

impl NodeId {
    /// The all-zero id, reserved for contacts whose real id is not known yet
    /// (the bootstrap gateway). Never valid on the wire.
    pub const ZERO: NodeId = NodeId([0u8; ID_LENGTH_IN_BYTES]);

    /// Generates a fresh id from the OS cryptographic RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH_IN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub const fn from_bytes(bytes: [u8; ID_LENGTH_IN_BYTES]) -> Self {
        NodeId(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, TypesError> {
        let bytes: [u8; ID_LENGTH_IN_BYTES] = slice
            .try_into()
            .map_err(|_| TypesError::InvalidIdLength(slice.len()))?;
        Ok(NodeId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH_IN_BYTES] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// XOR distance to another id.
    pub fn distance_to(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LENGTH_IN_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

/// XOR distance between two ids. Ordered lexicographically, most significant
/// byte first, so the derived `Ord` sorts closest-first in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance(pub(crate) [u8; ID_LENGTH_IN_BYTES]);

impl Distance {
    /// Index of the k-bucket this distance falls into: the position of the
    /// highest differing bit. A zero distance maps to bucket 0.
    pub fn bucket_index(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit = 7 - byte.leading_zeros() as usize;
                return (ID_LENGTH_IN_BYTES - 1 - i) * 8 + bit;
            }
        }
        0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

/// A peer's address record: id plus UDP endpoint. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl Contact {
    pub fn new(id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self { id, ip, port }
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Serializes the contact into its 38-byte wire form. IPv4 addresses are
    /// carried IPv4-mapped so the ip field is always 16 bytes.
    pub fn encode(&self, buf: &mut dyn BufMut) {
        buf.put_slice(self.id.as_bytes());
        buf.put_u16(self.port);
        let octets = match self.ip {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        };
        buf.put_slice(&octets);
    }

    /// Parses a 38-byte wire contact, unmapping IPv4-in-IPv6 addresses.
    pub fn decode(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != CONTACT_LENGTH_IN_BYTES {
            return Err(TypesError::InvalidContactLength(bytes.len()));
        }
        let id = NodeId::from_slice(&bytes[..ID_LENGTH_IN_BYTES])?;
        let port = u16::from_be_bytes([bytes[20], bytes[21]]);
        let octets: [u8; 16] = bytes[22..]
            .try_into()
            .map_err(|_| TypesError::InvalidContactLength(bytes.len()))?;
        let ip = unmap_ipv4in6_address(IpAddr::V6(Ipv6Addr::from(octets)));
        Ok(Self { id, ip, port })
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.ip, self.port)
    }
}

/// Turns IPv4-mapped IPv6 addresses back into plain IPv4.
pub fn unmap_ipv4in6_address(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::net::Ipv4Addr;

    #[test]
    fn distance_is_symmetric_xor() {
        let a = NodeId::from_bytes(hex!("8bc8082329609092bf86dea25cf7784cd708cc5d"));
        let b = NodeId::from_bytes(hex!("28f787e3b60f99fb29b14266c40b536d6037307e"));
        assert_eq!(a.distance_to(&b), b.distance_to(&a));
        assert!(a.distance_to(&a).is_zero());
    }

    #[test]
    fn bucket_index_tracks_highest_differing_bit() {
        let local = NodeId::ZERO;
        let mut far = [0u8; ID_LENGTH_IN_BYTES];
        far[0] = 0x80;
        assert_eq!(local.distance_to(&NodeId::from_bytes(far)).bucket_index(), 159);

        let mut near = [0u8; ID_LENGTH_IN_BYTES];
        near[19] = 0x01;
        assert_eq!(local.distance_to(&NodeId::from_bytes(near)).bucket_index(), 0);

        assert_eq!(local.distance_to(&local).bucket_index(), 0);
    }

    #[test]
    fn distance_orders_closest_first() {
        let key = NodeId::from_bytes(hex!("28f787e3b60f99fb29b14266c40b536d6037307e"));
        let closer = NodeId::from_bytes(hex!("28f787e3b60f99fb29b14266c40b536d6037307f"));
        let farther = NodeId::from_bytes(hex!("a8f787e3b60f99fb29b14266c40b536d6037307e"));
        assert!(key.distance_to(&closer) < key.distance_to(&farther));
    }

    #[test]
    fn contact_roundtrip_v4() {
        let contact = Contact::new(
            NodeId::random(),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            5050,
        );
        let mut buf = Vec::new();
        contact.encode(&mut buf);
        assert_eq!(buf.len(), CONTACT_LENGTH_IN_BYTES);
        let decoded = Contact::decode(&buf).expect("contact decodes");
        assert_eq!(decoded, contact);
    }

    #[test]
    fn contact_rejects_bad_length() {
        assert!(Contact::decode(&[0u8; 37]).is_err());
        assert!(Contact::decode(&[0u8; 39]).is_err());
    }

    #[test]
    fn id_hex_roundtrip() {
        let id = NodeId::random();
        let parsed: NodeId = id.to_string().parse().expect("hex parses");
        assert_eq!(parsed, id);
    }
}
