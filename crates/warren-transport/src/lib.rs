//! # warren-transport
//!
//! One UDP socket, two protocols. A Warren node speaks the DHT protocol
//! (bencoded datagrams) and uTP (BEP 29 streams) on the *same* local UDP
//! endpoint, so that the endpoint a peer discovers through the DHT is also
//! the endpoint it can open a stream to.
//!
//! This crate implements:
//! - [`mux`] — the [`UdpMultiplexer`](mux::UdpMultiplexer), which classifies
//!   each incoming datagram as DHT (bencode starts with `d`) or uTP (header
//!   version nibble) and routes it to the right consumer
//! - [`utp`] — a minimal uTP implementation: connect/accept, ordered
//!   delivery, cumulative acks, retransmission and connection teardown
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | uTP payload per packet | 1380 bytes |
//! | In-flight cap | 32 packets |
//! | Initial RTO | 500 ms (doubling) |
//! | Max retransmits per packet | 5 |
//! | Default connect timeout | 30 seconds |

pub mod mux;
pub mod utp;

pub use mux::{DhtSender, DhtSocket, UdpMultiplexer};
pub use utp::{UtpConfig, UtpListener, UtpSocket, UtpStream};

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying socket I/O failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote did not complete the uTP handshake in time.
    #[error("connect timed out")]
    ConnectTimedOut,

    /// The remote reset the connection.
    #[error("connection reset")]
    ConnectionReset,

    /// The stream was closed (FIN seen or handle dropped).
    #[error("connection closed")]
    ConnectionClosed,

    /// The multiplexer driving this stream has shut down.
    #[error("multiplexer closed")]
    MuxClosed,

    /// The operation was cancelled.
    #[error("operation aborted")]
    OperationAborted,
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
