//! # warren-crypto
//!
//! Cryptographic primitives for the Warren distributed cache.
//!
//! The wire and on-disk formats of the cache are fixed over a small set of
//! algorithms; no negotiation is performed anywhere:
//!
//! - [`sha`] — SHA-1 (DHT infohashes, store keys), SHA-256 (body digests)
//!   and SHA-512 (block digests and chain hashes), with incremental hashers
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032) for head,
//!   block and BEP-44 record signatures

pub mod ed25519;
pub mod sha;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid signature length or encoding.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// Result alias for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
