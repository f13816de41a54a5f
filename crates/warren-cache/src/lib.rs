//! # warren-cache
//!
//! The signed HTTP cache core: a content-addressed, tamper-evident format
//! for HTTP responses split into fixed-size signed blocks, with streaming
//! readers that generate or verify signatures incrementally, and an
//! on-disk store for the result.
//!
//! This crate implements:
//! - [`response`] — HTTP response part model and chunked-transfer codec
//!   (chunk extensions included; they carry the block signatures)
//! - [`chain`] — per-block SHA-512 digests chained across the body
//! - [`head`] — signed response heads and draft-cavage HTTP signatures
//! - [`sign`] — the signing reader (plain response in, signed chunked
//!   response out)
//! - [`verify`] — the verifying reader (strict inverse of [`sign`])
//! - [`store`] — the on-disk `head`/`body`/`sigs` format with full,
//!   range and head-only readers
//! - [`hash_list`] — compact signed manifests of block digests
//!
//! ## Format constants
//!
//! | Parameter | Value |
//! |---|---|
//! | Protocol version | 5 |
//! | Block size | 65 536 bytes |
//! | Max accepted block size | 1 MiB |
//! | Signature algorithm | `hs2019` (Ed25519) |

pub mod chain;
pub mod hash_list;
pub mod head;
pub mod response;
pub mod sign;
pub mod store;
pub mod verify;

pub use head::SignedHead;
pub use response::{ChunkHdr, Fields, Head, Part, PartReader};
pub use sign::SigningReader;
pub use store::HttpStore;
pub use verify::VerifyingReader;

/// Protocol version stamped into `X-Ouinet-Version`.
pub const PROTOCOL_VERSION: u64 = 5;

/// Size of a signed data block.
pub const BLOCK_SIZE: usize = 65_536;

/// Largest block size a verifier accepts.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Error types for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The operation was cancelled.
    #[error("operation aborted")]
    OperationAborted,

    /// The response head was absent, malformed, or failed verification.
    #[error("invalid response head: {0}")]
    InvalidHead(String),

    /// The stream violated the protocol or failed verification mid-body.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// A malformed argument (key, URL, head fields).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A range fell outside the stored data.
    #[error("invalid seek")]
    InvalidSeek,

    /// No stored entry for the key.
    #[error("not found")]
    NotFound,

    /// Filesystem or socket failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
