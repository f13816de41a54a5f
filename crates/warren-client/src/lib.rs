//! # warren-client
//!
//! The client-side composition of the Warren cache: given a URL, find
//! peers through the DHT, fetch the signed response from several of them
//! at once, verify every block on the way in, serve it onward and keep a
//! local copy.
//!
//! This crate implements:
//! - [`swarms`] — BEP-5 swarm names derived from public keys and URIs
//! - [`groups`] — persistent DHT groups (group name → item keys) feeding
//!   the announcer on startup
//! - [`lookup_cache`] — a bounded, single-flight cache of DHT lookups
//! - [`multi_peer`] — the block-racing multi-peer reader
//! - [`peer_server`] — the serving loop answering peers from the store
//! - [`client`] — the [`Client`](client::Client) facade tying the pieces
//!   together

pub mod client;
pub mod groups;
pub mod lookup_cache;
pub mod multi_peer;
pub mod peer_server;
pub mod swarms;

pub use client::{Client, ClientConfig};
pub use multi_peer::MultiPeerReader;

/// Error types for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The operation was cancelled.
    #[error("operation aborted")]
    OperationAborted,

    /// No peer could serve the key.
    #[error("not found")]
    NotFound,

    /// A malformed URL or request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Protocol violation or verification failure.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// DHT failure underneath.
    #[error("dht: {0}")]
    Dht(#[from] warren_dht::DhtError),

    /// Cache failure underneath.
    #[error("cache: {0}")]
    Cache(#[from] warren_cache::CacheError),

    /// Transport failure underneath.
    #[error("transport: {0}")]
    Transport(#[from] warren_transport::TransportError),

    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
