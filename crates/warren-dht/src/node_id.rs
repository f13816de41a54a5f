//! 160-bit node identifiers, the XOR proximity metric, BEP-42 id
//! derivation and compact endpoint codecs.

use std::net::{IpAddr, SocketAddr};

use warren_crypto::sha::Sha1Digest;

/// Length of a node id / infohash in bytes.
pub const NODE_ID_LEN: usize = 20;

/// A 160-bit DHT node identifier or infohash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// The all-zero id.
    pub fn zero() -> Self {
        NodeId([0u8; NODE_ID_LEN])
    }

    /// Id from raw bytes.
    pub fn from_bytes(b: [u8; NODE_ID_LEN]) -> Self {
        NodeId(b)
    }

    /// Id from a byte slice of exactly 20 bytes.
    pub fn from_slice(b: &[u8]) -> Option<Self> {
        b.try_into().ok().map(NodeId)
    }

    /// Infohash of arbitrary data: its SHA-1.
    pub fn from_digest(d: Sha1Digest) -> Self {
        NodeId(d)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance between `self` and `other`.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LEN] {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, o) in out.iter_mut().enumerate() {
            *o = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Whether `a` is closer to `self` (as a target) than `b` is.
    pub fn closer_to(&self, a: &NodeId, b: &NodeId) -> bool {
        self.distance(a) < self.distance(b)
    }

    /// Bit `i` (0 = most significant).
    pub fn bit(&self, i: usize) -> bool {
        (self.0[i / 8] >> (7 - (i % 8))) & 1 == 1
    }

    /// Length of the common prefix with `other`, in bits.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return i * 8 + x.leading_zeros() as usize;
            }
        }
        NODE_ID_LEN * 8
    }

    /// A uniformly random id.
    pub fn random() -> Self {
        NodeId(rand::random())
    }

    /// Derive a node id from the node's external address per BEP 42.
    ///
    /// The high 21 bits come from CRC32-C over the masked address mixed
    /// with a 3-bit random value whose source byte lands in the last id
    /// byte; the middle is random.
    pub fn generate(addr: IpAddr) -> Self {
        Self::generate_with_rand(addr, rand::random())
    }

    fn generate_with_rand(addr: IpAddr, r: u8) -> Self {
        const V4_MASK: [u8; 4] = [0x03, 0x0f, 0x3f, 0xff];
        const V6_MASK: [u8; 8] = [0x01, 0x03, 0x07, 0x0f, 0x1f, 0x3f, 0x7f, 0xff];

        let mut masked = [0u8; 8];
        let len = match addr {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                for i in 0..4 {
                    masked[i] = o[i] & V4_MASK[i];
                }
                4
            }
            IpAddr::V6(v6) => {
                let o = v6.octets();
                for i in 0..8 {
                    masked[i] = o[i] & V6_MASK[i];
                }
                8
            }
        };
        masked[0] |= (r & 0x7) << 5;

        let crc = crc32c(&masked[..len]);

        let mut id = [0u8; NODE_ID_LEN];
        id[0] = (crc >> 24) as u8;
        id[1] = (crc >> 16) as u8;
        id[2] = (((crc >> 8) as u8) & 0xf8) | (rand::random::<u8>() & 0x7);
        for b in id.iter_mut().take(19).skip(3) {
            *b = rand::random();
        }
        id[19] = r;
        NodeId(id)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A known DHT node: id plus UDP endpoint. Identity is the id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeContact {
    pub id: NodeId,
    pub endpoint: SocketAddr,
}

impl std::fmt::Display for NodeContact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.id, self.endpoint)
    }
}

/// Compact endpoint encoding: 4+2 (IPv4) or 16+2 (IPv6) bytes, port
/// big-endian.
pub fn encode_endpoint(ep: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match ep.ip() {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }
    out.extend_from_slice(&ep.port().to_be_bytes());
    out
}

/// Decode a compact endpoint of either family.
pub fn decode_endpoint(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        6 => {
            let ip: [u8; 4] = data[..4].try_into().ok()?;
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::from((ip, port)))
        }
        18 => {
            let ip: [u8; 16] = data[..16].try_into().ok()?;
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

/// Decode a concatenated `nodes` blob of IPv4 contacts (26 bytes each).
pub fn decode_contacts_v4(data: &[u8]) -> Vec<NodeContact> {
    decode_contacts(data, 6)
}

/// Decode a concatenated `nodes6` blob of IPv6 contacts (38 bytes each).
pub fn decode_contacts_v6(data: &[u8]) -> Vec<NodeContact> {
    decode_contacts(data, 18)
}

fn decode_contacts(data: &[u8], ep_len: usize) -> Vec<NodeContact> {
    let rec = NODE_ID_LEN + ep_len;
    let mut out = Vec::with_capacity(data.len() / rec);
    for chunk in data.chunks_exact(rec) {
        let Some(id) = NodeId::from_slice(&chunk[..NODE_ID_LEN]) else {
            continue;
        };
        let Some(endpoint) = decode_endpoint(&chunk[NODE_ID_LEN..]) else {
            continue;
        };
        out.push(NodeContact { id, endpoint });
    }
    out
}

/// CRC32-C (Castagnoli), as BEP 42 prescribes.
fn crc32c(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = crc32c_table();
    let mut crc = !0u32;
    for &b in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ b as u32) & 0xff) as usize];
    }
    !crc
}

const fn crc32c_table() -> [u32; 256] {
    // Reflected Castagnoli polynomial.
    const POLY: u32 = 0x82f6_3b78;
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
