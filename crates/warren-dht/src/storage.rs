//! Server-side DHT storage: the peer tracker and the BEP-44 record store.
//!
//! Both stores hand out write tokens bound to the requester's IP and the
//! target id, derived from a secret that rotates every five minutes; a
//! token remains valid for one rotation after it was issued.
//!
//! The BEP-44 store enforces the mutable-item rules wire-side errors are
//! built from: sequence monotonicity (302), same-seq/different-value
//! rejection (302), and compare-and-swap against the *current* sequence
//! (301). A successful CAS at an unchanged sequence number is single-use:
//! the consumed sequence cannot authorise a second swap.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use warren_crypto::ed25519::{PublicKey, Signature};
use warren_crypto::sha;

use crate::bencode::Value;
use crate::node_id::NodeId;
use crate::{MAX_SALT_SIZE, MAX_VALUE_SIZE};

/// Secret rotation interval.
const TOKEN_ROTATE: Duration = Duration::from_secs(5 * 60);

/// Peers idle longer than this drop off a swarm.
const PEER_TTL: Duration = Duration::from_secs(30 * 60);

/// Stored records expire after this long without a refresh.
const RECORD_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Maximum peers returned for one `get_peers` reply; 50 compact endpoints
/// fit a UDP datagram comfortably.
pub const MAX_PEERS_PER_REPLY: usize = 50;

/// Rotating-secret write-token mint.
pub struct TokenMint {
    secret: [u8; 20],
    prev_secret: [u8; 20],
    rotated_at: Instant,
}

impl TokenMint {
    pub fn new() -> Self {
        Self {
            secret: rand::random(),
            prev_secret: rand::random(),
            rotated_at: Instant::now(),
        }
    }

    fn rotate_if_due(&mut self) {
        if self.rotated_at.elapsed() >= TOKEN_ROTATE {
            self.prev_secret = self.secret;
            self.secret = rand::random();
            self.rotated_at = Instant::now();
        }
    }

    fn token_with(secret: &[u8; 20], ip: &IpAddr, target: &NodeId) -> Vec<u8> {
        let mut input = Vec::with_capacity(20 + 16 + 20);
        input.extend_from_slice(secret);
        match ip {
            IpAddr::V4(v4) => input.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => input.extend_from_slice(&v6.octets()),
        }
        input.extend_from_slice(target.as_bytes());
        sha::sha1(&input).to_vec()
    }

    /// Issue a token for `ip` writing to `target`.
    pub fn generate(&mut self, ip: &IpAddr, target: &NodeId) -> Vec<u8> {
        self.rotate_if_due();
        Self::token_with(&self.secret, ip, target)
    }

    /// Check a token against the current and previous secrets.
    pub fn verify(&mut self, ip: &IpAddr, target: &NodeId, token: &[u8]) -> bool {
        self.rotate_if_due();
        token == Self::token_with(&self.secret, ip, target).as_slice()
            || token == Self::token_with(&self.prev_secret, ip, target).as_slice()
    }
}

impl Default for TokenMint {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer lists per infohash.
#[derive(Default)]
pub struct TrackerStore {
    swarms: HashMap<NodeId, HashMap<SocketAddr, Instant>>,
}

impl TrackerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `peer` as a member of `infohash`'s swarm.
    pub fn add_peer(&mut self, infohash: NodeId, peer: SocketAddr) {
        self.swarms
            .entry(infohash)
            .or_default()
            .insert(peer, Instant::now());
    }

    /// Up to `max` live peers of the swarm.
    pub fn list_peers(&mut self, infohash: &NodeId, max: usize) -> Vec<SocketAddr> {
        let Some(swarm) = self.swarms.get_mut(infohash) else {
            return Vec::new();
        };
        swarm.retain(|_, seen| seen.elapsed() < PEER_TTL);
        if swarm.is_empty() {
            self.swarms.remove(infohash);
            return Vec::new();
        }
        swarm.keys().take(max).copied().collect()
    }
}

/// A signed BEP-44 mutable item.
#[derive(Clone, Debug)]
pub struct MutableItem {
    pub public_key: PublicKey,
    pub salt: Vec<u8>,
    pub value: Value,
    pub seq: i64,
    pub signature: Signature,
}

impl MutableItem {
    /// The target id this item is stored under:
    /// `SHA1(public_key ‖ salt)`.
    pub fn target(&self) -> NodeId {
        mutable_target(&self.public_key, &self.salt)
    }

    /// The byte string the signature covers, per BEP 44: the bencoded
    /// `salt` entry (when non-empty) followed by the bencoded `seq` and
    /// `v` entries.
    pub fn signing_data(salt: &[u8], seq: i64, value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        if !salt.is_empty() {
            out.extend_from_slice(b"4:salt");
            Value::bytes(salt.to_vec()).encode_into(&mut out);
        }
        out.extend_from_slice(b"3:seq");
        Value::Int(seq).encode_into(&mut out);
        out.extend_from_slice(b"1:v");
        value.encode_into(&mut out);
        out
    }

    /// Sign `value` at `seq` with `key`, producing a storable item.
    pub fn sign(
        key: &warren_crypto::ed25519::SigningKey,
        salt: Vec<u8>,
        value: Value,
        seq: i64,
    ) -> Self {
        let signature = key.sign(Self::signing_data(&salt, seq, &value));
        Self {
            public_key: key.public_key(),
            salt,
            value,
            seq,
            signature,
        }
    }

    /// Whether the signature verifies under the item's own key.
    pub fn verify(&self) -> bool {
        self.public_key.verify(
            Self::signing_data(&self.salt, self.seq, &self.value),
            &self.signature,
        )
    }
}

/// Target id of a mutable item.
pub fn mutable_target(public_key: &PublicKey, salt: &[u8]) -> NodeId {
    let mut input = Vec::with_capacity(32 + salt.len());
    input.extend_from_slice(&public_key.to_bytes());
    input.extend_from_slice(salt);
    NodeId::from_digest(sha::sha1(&input))
}

/// Target id of an immutable value: SHA-1 of its bencoding.
pub fn immutable_target(value: &Value) -> NodeId {
    NodeId::from_digest(sha::sha1(value.encode()))
}

/// Why a BEP-44 put was rejected; maps onto wire error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutError {
    /// 205: value too big.
    ValueTooBig,
    /// 207: salt too big.
    SaltTooBig,
    /// 206: bad signature.
    BadSignature,
    /// 301: compare-and-swap mismatch.
    CasMismatch,
    /// 302: sequence number not updated.
    SeqNotUpdated,
}

impl PutError {
    /// KRPC error code.
    pub fn code(self) -> i64 {
        match self {
            PutError::ValueTooBig => 205,
            PutError::SaltTooBig => 207,
            PutError::BadSignature => 206,
            PutError::CasMismatch => 301,
            PutError::SeqNotUpdated => 302,
        }
    }

    /// KRPC error message.
    pub fn message(self) -> &'static str {
        match self {
            PutError::ValueTooBig => "Argument 'v' too big",
            PutError::SaltTooBig => "Argument 'salt' too big",
            PutError::BadSignature => "Invalid signature",
            PutError::CasMismatch => "Compare-and-swap mismatch",
            PutError::SeqNotUpdated => "Sequence number not updated",
        }
    }
}

struct MutableSlot {
    item: MutableItem,
    /// Sequence at which a same-seq CAS replacement was already granted;
    /// that sequence cannot authorise another swap.
    cas_consumed_at: Option<i64>,
    stored_at: Instant,
}

/// BEP-44 key-value store.
#[derive(Default)]
pub struct Bep44Store {
    immutable: HashMap<NodeId, (Value, Instant)>,
    mutable: HashMap<NodeId, MutableSlot>,
}

impl Bep44Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an immutable value under its content address.
    pub fn put_immutable(&mut self, value: Value) -> Result<NodeId, PutError> {
        if value.encode().len() >= MAX_VALUE_SIZE {
            return Err(PutError::ValueTooBig);
        }
        let target = immutable_target(&value);
        self.immutable.insert(target, (value, Instant::now()));
        Ok(target)
    }

    /// Fetch an immutable value.
    pub fn get_immutable(&mut self, target: &NodeId) -> Option<Value> {
        match self.immutable.get(target) {
            Some((v, at)) if at.elapsed() < RECORD_TTL => Some(v.clone()),
            Some(_) => {
                self.immutable.remove(target);
                None
            }
            None => None,
        }
    }

    /// Validate and store a mutable item. `cas`, when present, must equal
    /// the currently stored sequence.
    pub fn put_mutable(&mut self, item: MutableItem, cas: Option<i64>) -> Result<NodeId, PutError> {
        if item.value.encode().len() >= MAX_VALUE_SIZE {
            return Err(PutError::ValueTooBig);
        }
        if item.salt.len() > MAX_SALT_SIZE {
            return Err(PutError::SaltTooBig);
        }
        if !item.verify() {
            return Err(PutError::BadSignature);
        }

        let target = item.target();
        if let Some(slot) = self.mutable.get(&target) {
            let current = slot.item.seq;
            if item.seq < current {
                return Err(PutError::SeqNotUpdated);
            }
            match cas {
                Some(cas) => {
                    if cas != current {
                        return Err(PutError::CasMismatch);
                    }
                    // A same-seq swap burns the sequence number.
                    if item.seq == current && slot.cas_consumed_at == Some(current) {
                        return Err(PutError::CasMismatch);
                    }
                }
                None => {
                    if item.seq == current && item.value.encode() != slot.item.value.encode() {
                        return Err(PutError::SeqNotUpdated);
                    }
                }
            }
            let consumed = if item.seq == current {
                cas.map(|_| current).or(slot.cas_consumed_at)
            } else {
                None
            };
            self.mutable.insert(
                target,
                MutableSlot {
                    item,
                    cas_consumed_at: consumed,
                    stored_at: Instant::now(),
                },
            );
        } else {
            if cas.is_some() {
                // Nothing stored: nothing to compare against.
                return Err(PutError::CasMismatch);
            }
            self.mutable.insert(
                target,
                MutableSlot {
                    item,
                    cas_consumed_at: None,
                    stored_at: Instant::now(),
                },
            );
        }
        Ok(target)
    }

    /// Fetch a mutable item.
    pub fn get_mutable(&mut self, target: &NodeId) -> Option<MutableItem> {
        match self.mutable.get(target) {
            Some(slot) if slot.stored_at.elapsed() < RECORD_TTL => Some(slot.item.clone()),
            Some(_) => {
                self.mutable.remove(target);
                None
            }
            None => None,
        }
    }
}
