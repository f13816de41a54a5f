//! UDP datagram multiplexer.
//!
//! A single [`tokio::net::UdpSocket`] is shared by the DHT node and all uTP
//! connections bound to the same local endpoint. A background task reads
//! datagrams and classifies them:
//!
//! - bencoded DHT messages always start with `d` (every KRPC message is a
//!   dictionary) and are shorter than a uTP header would allow to confuse
//! - uTP packets have a 20-byte header whose first byte holds the packet
//!   type in the high nibble (0..=4) and protocol version 1 in the low one
//!
//! Unclassifiable datagrams are dropped silently.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::utp::{self, packet::Packet};
use crate::{Result, TransportError};

/// Maximum datagram size accepted from the socket.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Per-connection routing key: remote endpoint plus the connection id the
/// remote stamps on packets it sends us.
pub(crate) type ConnKey = (SocketAddr, u16);

/// Routing state shared between the receive task, streams, and acceptors.
#[derive(Default)]
pub(crate) struct MuxShared {
    /// Established (or half-open) connections by routing key.
    pub(crate) conns: Mutex<HashMap<ConnKey, mpsc::Sender<Packet>>>,
    /// Incoming SYNs, if anybody listens.
    pub(crate) syns: Mutex<Option<mpsc::Sender<(Packet, SocketAddr)>>>,
}

/// A UDP socket demultiplexing DHT datagrams and uTP packets.
pub struct UdpMultiplexer {
    socket: Arc<UdpSocket>,
    shared: Arc<MuxShared>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

/// The DHT half of a [`UdpMultiplexer`]: receives every bencoded datagram
/// and sends raw datagrams out through the shared socket.
pub struct DhtSocket {
    socket: Arc<UdpSocket>,
    rx: mpsc::Receiver<(Bytes, SocketAddr)>,
    local_addr: SocketAddr,
}

impl UdpMultiplexer {
    /// Bind a multiplexer to `addr` and start its receive task.
    ///
    /// Returns the multiplexer and the DHT half. The uTP side is reached
    /// through [`UdpMultiplexer::utp_socket`].
    pub async fn bind(addr: SocketAddr) -> Result<(Self, DhtSocket)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let shared = Arc::new(MuxShared::default());
        let shutdown = CancellationToken::new();

        let (dht_tx, dht_rx) = mpsc::channel(256);

        tokio::spawn(receive_loop(
            socket.clone(),
            shared.clone(),
            dht_tx,
            shutdown.clone(),
        ));

        let mux = Self {
            socket: socket.clone(),
            shared,
            local_addr,
            shutdown,
        };
        let dht = DhtSocket {
            socket,
            rx: dht_rx,
            local_addr,
        };
        Ok((mux, dht))
    }

    /// The local endpoint this multiplexer is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A uTP connector/acceptor over this multiplexer.
    pub fn utp_socket(&self, config: utp::UtpConfig) -> utp::UtpSocket {
        utp::UtpSocket::new(
            self.socket.clone(),
            self.shared.clone(),
            self.local_addr,
            config,
        )
    }
}

impl Drop for UdpMultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A cloneable sending handle onto the shared socket, for code that sends
/// DHT datagrams without owning the receive side.
#[derive(Clone)]
pub struct DhtSender {
    socket: Arc<UdpSocket>,
}

impl DhtSender {
    /// Send a datagram through the shared socket.
    pub async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket.send_to(data, dest).await?;
        Ok(())
    }
}

impl DhtSocket {
    /// The local endpoint of the shared socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A cloneable sender onto the shared socket.
    pub fn sender(&self) -> DhtSender {
        DhtSender {
            socket: self.socket.clone(),
        }
    }

    /// Receive the next bencoded datagram.
    ///
    /// Returns [`TransportError::MuxClosed`] once the multiplexer is gone
    /// and [`TransportError::OperationAborted`] if `cancel` fires first.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Result<(Bytes, SocketAddr)> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::OperationAborted),
            msg = self.rx.recv() => msg.ok_or(TransportError::MuxClosed),
        }
    }

    /// Send a datagram through the shared socket.
    pub async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        self.socket.send_to(data, dest).await?;
        Ok(())
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<MuxShared>,
    dht_tx: mpsc::Sender<(Bytes, SocketAddr)>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.cancelled() => return,
            r = socket.recv_from(&mut buf) => match r {
                Ok(x) => x,
                Err(e) => {
                    // Transient errors (e.g. ICMP-induced) are survivable.
                    debug!(error = %e, "udp recv error");
                    continue;
                }
            },
        };
        let datagram = &buf[..len];

        if datagram.first() == Some(&b'd') {
            // KRPC messages are bencoded dictionaries.
            if dht_tx
                .send((Bytes::copy_from_slice(datagram), from))
                .await
                .is_err()
            {
                return; // DHT half dropped, nothing left to feed
            }
            continue;
        }

        let Some(packet) = Packet::decode(datagram) else {
            trace!(%from, len, "dropping unclassifiable datagram");
            continue;
        };

        if packet.is_syn() {
            let listener = shared.syns.lock().unwrap().clone();
            match listener {
                Some(tx) => {
                    let _ = tx.send((packet, from)).await;
                }
                None => trace!(%from, "dropping SYN, nobody listening"),
            }
            continue;
        }

        let key: ConnKey = (from, packet.connection_id);
        let conn = shared.conns.lock().unwrap().get(&key).cloned();
        match conn {
            Some(tx) => {
                let _ = tx.send(packet).await;
            }
            None => trace!(%from, conn_id = packet.connection_id, "dropping packet for unknown connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dht_datagram_roundtrip() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (mux_a, mut dht_a) = UdpMultiplexer::bind(any).await.unwrap();
        let (_mux_b, dht_b) = UdpMultiplexer::bind(any).await.unwrap();

        let msg = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q4:ping1:t2:xy1:y1:qe";
        dht_b.send_to(msg, mux_a.local_addr()).await.unwrap();

        let cancel = CancellationToken::new();
        let (data, from) = dht_a.recv(&cancel).await.unwrap();
        assert_eq!(&data[..], &msg[..]);
        assert_eq!(from, dht_b.local_addr());
    }

    #[tokio::test]
    async fn test_recv_cancelled() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (_mux, mut dht) = UdpMultiplexer::bind(any).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            dht.recv(&cancel).await,
            Err(TransportError::OperationAborted)
        ));
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (mux_a, mut dht_a) = UdpMultiplexer::bind(any).await.unwrap();
        let (_mux_b, dht_b) = UdpMultiplexer::bind(any).await.unwrap();

        // Neither bencode nor uTP: must be dropped, not surface on DHT side.
        dht_b.send_to(b"\xff\xff\xff", mux_a.local_addr()).await.unwrap();
        dht_b
            .send_to(b"d2:ok1:ye", mux_a.local_addr())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (data, _) = dht_a.recv(&cancel).await.unwrap();
        assert_eq!(&data[..], b"d2:ok1:ye");
    }
}
