//! SHA-1, SHA-256 and SHA-512 hashing.
//!
//! Each hash exposes a one-shot function and an incremental hasher. The
//! incremental forms matter here: block chain hashes fold one digest into
//! the next, and body digests are computed while streaming.

use sha1::Digest as _;

/// A 20-byte SHA-1 digest (DHT infohashes, store keys).
pub type Sha1Digest = [u8; 20];

/// A 32-byte SHA-256 digest (full-body `Digest:` headers).
pub type Sha256Digest = [u8; 32];

/// A 64-byte SHA-512 digest (block digests and chain hashes).
pub type Sha512Digest = [u8; 64];

/// SHA-1 of `data` in one shot.
pub fn sha1(data: impl AsRef<[u8]>) -> Sha1Digest {
    let mut h = sha1::Sha1::new();
    h.update(data.as_ref());
    h.finalize().into()
}

/// SHA-256 of `data` in one shot.
pub fn sha256(data: impl AsRef<[u8]>) -> Sha256Digest {
    let mut h = sha2::Sha256::new();
    h.update(data.as_ref());
    h.finalize().into()
}

/// SHA-512 of `data` in one shot.
pub fn sha512(data: impl AsRef<[u8]>) -> Sha512Digest {
    let mut h = sha2::Sha512::new();
    h.update(data.as_ref());
    h.finalize().into()
}

/// Incremental SHA-256.
#[derive(Clone, Default)]
pub struct Sha256 {
    inner: sha2::Sha256,
}

impl Sha256 {
    /// Create a fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more input.
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data.as_ref());
    }

    /// Consume the hasher and return the digest.
    pub fn finalize(self) -> Sha256Digest {
        self.inner.finalize().into()
    }
}

/// Incremental SHA-512.
#[derive(Clone, Default)]
pub struct Sha512 {
    inner: sha2::Sha512,
}

impl Sha512 {
    /// Create a fresh hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more input.
    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        self.inner.update(data.as_ref());
    }

    /// Consume the hasher and return the digest.
    pub fn finalize(self) -> Sha512Digest {
        self.inner.finalize().into()
    }
}

/// The all-zero SHA-512 digest, used as the conventional chain hash before
/// the first block.
pub fn sha512_zero() -> Sha512Digest {
    [0u8; 64]
}
