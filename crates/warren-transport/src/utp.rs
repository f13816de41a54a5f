//! Minimal uTP (BEP 29) streams over a shared UDP socket.
//!
//! Implements the subset of uTP the cache needs: reliable, ordered,
//! bidirectional byte streams with connection setup/teardown. Congestion
//! control is a fixed-size packet window with exponential-backoff
//! retransmission of the oldest unacked packet; the LEDBAT delay machinery
//! is intentionally absent.
//!
//! ## Connection identifiers
//!
//! The initiator picks a random `recv_id`; its packets are stamped with
//! `recv_id + 1` and the SYN itself with `recv_id`. The acceptor mirrors
//! this: it receives on `syn.connection_id + 1` and sends on
//! `syn.connection_id`. The multiplexer routes established packets by
//! `(remote, connection_id)`.
//!
//! ## Sequence numbers
//!
//! `seq_nr` is the next sequence a side will consume for ST_DATA/ST_FIN;
//! ST_STATE carries the current `seq_nr` without consuming it. `ack_nr` is
//! the last in-order sequence received from the peer.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::mux::{ConnKey, MuxShared};
use crate::{Result, TransportError};

/// Payload bytes per uTP packet (1400 MTU budget minus the 20-byte header).
pub const PACKET_PAYLOAD: usize = 1380;

/// Advertised receive window, in bytes.
const ADVERTISED_WINDOW: u32 = 1024 * 1024;

/// How often the driver checks for retransmission work.
const TICK: Duration = Duration::from_millis(100);

/// uTP transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UtpConfig {
    /// Overall timeout for connection establishment, in seconds.
    pub connect_timeout_secs: u64,
    /// Retransmissions of a packet before the connection is declared dead.
    pub max_retransmits: u32,
    /// Initial retransmission timeout in milliseconds (doubles per attempt).
    pub initial_rto_ms: u64,
    /// Maximum unacked packets in flight.
    pub window_packets: usize,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            max_retransmits: 5,
            initial_rto_ms: 500,
            window_packets: 32,
        }
    }
}

impl UtpConfig {
    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn initial_rto(&self) -> Duration {
        Duration::from_millis(self.initial_rto_ms)
    }
}

/// uTP packet types and header codec.
pub(crate) mod packet {
    /// ST_DATA: payload-carrying packet.
    pub const ST_DATA: u8 = 0;
    /// ST_FIN: sender is done writing.
    pub const ST_FIN: u8 = 1;
    /// ST_STATE: pure acknowledgement.
    pub const ST_STATE: u8 = 2;
    /// ST_RESET: abortive teardown.
    pub const ST_RESET: u8 = 3;
    /// ST_SYN: connection request.
    pub const ST_SYN: u8 = 4;

    const HEADER_LEN: usize = 20;
    const VERSION: u8 = 1;

    /// A decoded uTP packet.
    #[derive(Clone, Debug)]
    pub struct Packet {
        pub ty: u8,
        pub connection_id: u16,
        pub timestamp_micros: u32,
        pub timestamp_diff_micros: u32,
        pub wnd_size: u32,
        pub seq_nr: u16,
        pub ack_nr: u16,
        pub payload: bytes::Bytes,
    }

    impl Packet {
        pub fn is_syn(&self) -> bool {
            self.ty == ST_SYN
        }

        /// Decode a datagram, skipping any extensions. Returns `None` for
        /// datagrams that are not valid uTP version-1 packets.
        pub fn decode(data: &[u8]) -> Option<Packet> {
            if data.len() < HEADER_LEN {
                return None;
            }
            let ty = data[0] >> 4;
            let version = data[0] & 0x0f;
            if version != VERSION || ty > ST_SYN {
                return None;
            }

            let mut next_ext = data[1];
            let connection_id = u16::from_be_bytes([data[2], data[3]]);
            let timestamp_micros = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let timestamp_diff_micros = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            let wnd_size = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
            let seq_nr = u16::from_be_bytes([data[16], data[17]]);
            let ack_nr = u16::from_be_bytes([data[18], data[19]]);

            // Skip extension blocks (we never send any but tolerate them).
            let mut off = HEADER_LEN;
            while next_ext != 0 {
                if data.len() < off + 2 {
                    return None;
                }
                next_ext = data[off];
                let ext_len = data[off + 1] as usize;
                off += 2 + ext_len;
                if data.len() < off {
                    return None;
                }
            }

            Some(Packet {
                ty,
                connection_id,
                timestamp_micros,
                timestamp_diff_micros,
                wnd_size,
                seq_nr,
                ack_nr,
                payload: bytes::Bytes::copy_from_slice(&data[off..]),
            })
        }

        /// Encode the packet into a datagram.
        pub fn encode(&self) -> Vec<u8> {
            let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
            out.push((self.ty << 4) | VERSION);
            out.push(0); // no extensions
            out.extend_from_slice(&self.connection_id.to_be_bytes());
            out.extend_from_slice(&self.timestamp_micros.to_be_bytes());
            out.extend_from_slice(&self.timestamp_diff_micros.to_be_bytes());
            out.extend_from_slice(&self.wnd_size.to_be_bytes());
            out.extend_from_slice(&self.seq_nr.to_be_bytes());
            out.extend_from_slice(&self.ack_nr.to_be_bytes());
            out.extend_from_slice(&self.payload);
            out
        }
    }
}

use packet::{Packet, ST_DATA, ST_FIN, ST_RESET, ST_STATE, ST_SYN};

/// Wrapping `a < b` on 16-bit sequence numbers.
fn seq_lt(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

/// Wrapping `a <= b` on 16-bit sequence numbers.
fn seq_le(a: u16, b: u16) -> bool {
    a == b || seq_lt(a, b)
}

fn now_micros() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u32)
        .unwrap_or(0)
}

/// Connector/acceptor for uTP streams over one multiplexer.
#[derive(Clone)]
pub struct UtpSocket {
    socket: Arc<UdpSocket>,
    shared: Arc<MuxShared>,
    local_addr: SocketAddr,
    config: UtpConfig,
}

impl UtpSocket {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        shared: Arc<MuxShared>,
        local_addr: SocketAddr,
        config: UtpConfig,
    ) -> Self {
        Self {
            socket,
            shared,
            local_addr,
            config,
        }
    }

    /// The local endpoint of the shared socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open a stream to `remote`.
    ///
    /// Fails with [`TransportError::ConnectTimedOut`] after the configured
    /// connect timeout and [`TransportError::OperationAborted`] when
    /// `cancel` fires.
    pub async fn connect(
        &self,
        remote: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<UtpStream> {
        // Pick a receive id not already routed for this remote.
        let (recv_id, packet_rx) = {
            let mut conns = self.shared.conns.lock().unwrap();
            loop {
                let recv_id: u16 = rand::random();
                let key: ConnKey = (remote, recv_id);
                if conns.contains_key(&key) {
                    continue;
                }
                let (tx, rx) = mpsc::channel(128);
                conns.insert(key, tx);
                break (recv_id, rx);
            }
        };
        let send_id = recv_id.wrapping_add(1);
        let seq0: u16 = rand::random();

        let syn = Packet {
            ty: ST_SYN,
            connection_id: recv_id,
            timestamp_micros: now_micros(),
            timestamp_diff_micros: 0,
            wnd_size: ADVERTISED_WINDOW,
            seq_nr: seq0,
            ack_nr: 0,
            payload: Bytes::new(),
        };

        let result = self
            .handshake(remote, recv_id, &syn, packet_rx, cancel)
            .await;
        let (state, packet_rx) = match result {
            Ok(x) => x,
            Err(e) => {
                self.shared.conns.lock().unwrap().remove(&(remote, recv_id));
                return Err(e);
            }
        };

        // The peer's ST_STATE announced its current seq_nr; the first data
        // packet it sends will consume exactly that sequence.
        let conn = Connection {
            socket: self.socket.clone(),
            shared: self.shared.clone(),
            key: (remote, recv_id),
            remote,
            send_id,
            seq_nr: seq0.wrapping_add(1),
            ack_nr: state.seq_nr.wrapping_sub(1),
            config: self.config.clone(),
        };
        Ok(conn.spawn(packet_rx))
    }

    async fn handshake(
        &self,
        remote: SocketAddr,
        recv_id: u16,
        syn: &Packet,
        mut packet_rx: mpsc::Receiver<Packet>,
        cancel: &CancellationToken,
    ) -> Result<(Packet, mpsc::Receiver<Packet>)> {
        let deadline = Instant::now() + self.config.connect_timeout();
        let mut rto = self.config.initial_rto();

        loop {
            self.socket.send_to(&syn.encode(), remote).await?;
            let attempt_deadline = (Instant::now() + rto).min(deadline);

            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::OperationAborted),
                    _ = tokio::time::sleep_until(attempt_deadline.into()) => break,
                    p = packet_rx.recv() => p.ok_or(TransportError::MuxClosed)?,
                };
                match packet.ty {
                    ST_STATE if packet.ack_nr == syn.seq_nr => {
                        return Ok((packet, packet_rx));
                    }
                    ST_RESET => return Err(TransportError::ConnectionReset),
                    _ => {
                        trace!(conn_id = recv_id, ty = packet.ty, "ignoring packet during handshake");
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(TransportError::ConnectTimedOut);
            }
            rto *= 2;
        }
    }

    /// Start accepting incoming connections.
    ///
    /// Only one listener per multiplexer may exist at a time; a later call
    /// replaces the earlier one.
    pub fn listen(&self) -> UtpListener {
        let (tx, rx) = mpsc::channel(64);
        *self.shared.syns.lock().unwrap() = Some(tx);
        UtpListener {
            socket: self.socket.clone(),
            shared: self.shared.clone(),
            config: self.config.clone(),
            syn_rx: rx,
        }
    }
}

/// Acceptor side of [`UtpSocket::listen`].
pub struct UtpListener {
    socket: Arc<UdpSocket>,
    shared: Arc<MuxShared>,
    config: UtpConfig,
    syn_rx: mpsc::Receiver<(Packet, SocketAddr)>,
}

impl UtpListener {
    /// Accept the next incoming stream.
    pub async fn accept(&mut self, cancel: &CancellationToken) -> Result<(UtpStream, SocketAddr)> {
        loop {
            let (syn, from) = tokio::select! {
                _ = cancel.cancelled() => return Err(TransportError::OperationAborted),
                s = self.syn_rx.recv() => s.ok_or(TransportError::MuxClosed)?,
            };

            let recv_id = syn.connection_id.wrapping_add(1);
            let key: ConnKey = (from, recv_id);

            // A retransmitted SYN for a live connection is forwarded to its
            // driver, which re-acks; only fresh SYNs create streams.
            let existing = self.shared.conns.lock().unwrap().get(&key).cloned();
            if let Some(tx) = existing {
                let _ = tx.send(syn).await;
                continue;
            }

            let (tx, packet_rx) = mpsc::channel(128);
            self.shared.conns.lock().unwrap().insert(key, tx);

            let seq0: u16 = rand::random();
            let state = Packet {
                ty: ST_STATE,
                connection_id: syn.connection_id,
                timestamp_micros: now_micros(),
                timestamp_diff_micros: 0,
                wnd_size: ADVERTISED_WINDOW,
                seq_nr: seq0,
                ack_nr: syn.seq_nr,
                payload: Bytes::new(),
            };
            self.socket.send_to(&state.encode(), from).await?;

            let conn = Connection {
                socket: self.socket.clone(),
                shared: self.shared.clone(),
                key,
                remote: from,
                send_id: syn.connection_id,
                seq_nr: seq0,
                ack_nr: syn.seq_nr,
                config: self.config.clone(),
            };
            return Ok((conn.spawn(packet_rx), from));
        }
    }
}

enum WriteCmd {
    Data(Bytes),
    Fin,
}

/// A connected uTP stream implementing [`AsyncRead`] and [`AsyncWrite`].
///
/// Dropping the stream without `shutdown()` still performs an orderly FIN
/// exchange in the background.
pub struct UtpStream {
    read_rx: mpsc::Receiver<std::io::Result<Bytes>>,
    read_leftover: Bytes,
    read_eof: bool,
    write_tx: PollSender<WriteCmd>,
    remote: SocketAddr,
}

impl UtpStream {
    /// The remote endpoint of this stream.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl AsyncRead for UtpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.read_leftover.is_empty() {
                let n = self.read_leftover.len().min(buf.remaining());
                buf.put_slice(&self.read_leftover[..n]);
                let rest = self.read_leftover.split_off(n);
                self.read_leftover = rest;
                return Poll::Ready(Ok(()));
            }
            if self.read_eof {
                return Poll::Ready(Ok(()));
            }
            match std::task::ready!(self.read_rx.poll_recv(cx)) {
                Some(Ok(data)) => {
                    self.read_leftover = data;
                }
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => {
                    self.read_eof = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for UtpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match std::task::ready!(self.write_tx.poll_reserve(cx)) {
            Ok(()) => {}
            Err(_) => {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "utp connection closed",
                )))
            }
        }
        let n = buf.len().min(16 * 1024);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        if self.write_tx.send_item(WriteCmd::Data(chunk)).is_err() {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "utp connection closed",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Data is handed to the driver immediately; flush is a no-op.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match std::task::ready!(self.write_tx.poll_reserve(cx)) {
            Ok(()) => {
                let _ = self.write_tx.send_item(WriteCmd::Fin);
                Poll::Ready(Ok(()))
            }
            // Driver already gone: FIN is implicit.
            Err(_) => Poll::Ready(Ok(())),
        }
    }
}

struct Outgoing {
    seq: u16,
    payload: Bytes,
    ty: u8,
    last_sent: Instant,
    transmissions: u32,
}

/// Per-connection state handed to the driver task.
struct Connection {
    socket: Arc<UdpSocket>,
    shared: Arc<MuxShared>,
    key: ConnKey,
    remote: SocketAddr,
    send_id: u16,
    seq_nr: u16,
    ack_nr: u16,
    config: UtpConfig,
}

impl Connection {
    fn spawn(self, packet_rx: mpsc::Receiver<Packet>) -> UtpStream {
        let (read_tx, read_rx) = mpsc::channel(64);
        let (write_tx, write_rx) = mpsc::channel::<WriteCmd>(8);
        let remote = self.remote;

        tokio::spawn(self.drive(packet_rx, read_tx, write_rx));

        UtpStream {
            read_rx,
            read_leftover: Bytes::new(),
            read_eof: false,
            write_tx: PollSender::new(write_tx),
            remote,
        }
    }

    fn make_packet(&self, ty: u8, seq_nr: u16, payload: Bytes) -> Packet {
        Packet {
            ty,
            connection_id: self.send_id,
            timestamp_micros: now_micros(),
            timestamp_diff_micros: 0,
            wnd_size: ADVERTISED_WINDOW,
            seq_nr,
            ack_nr: self.ack_nr,
            payload,
        }
    }

    async fn drive(
        mut self,
        mut packet_rx: mpsc::Receiver<Packet>,
        read_tx: mpsc::Sender<std::io::Result<Bytes>>,
        mut write_rx: mpsc::Receiver<WriteCmd>,
    ) {
        let mut send_window: VecDeque<Outgoing> = VecDeque::new();
        let mut outbox: VecDeque<(u8, Bytes)> = VecDeque::new();
        let mut ooo: HashMap<u16, Packet> = HashMap::new();
        let mut read_tx = Some(read_tx);
        let mut write_open = true;
        let mut fin_queued = false;
        let mut fin_acked = false;
        let mut remote_fin_seen = false;
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let error_out = |read_tx: &mut Option<mpsc::Sender<std::io::Result<Bytes>>>, kind: std::io::ErrorKind, msg: &str| {
            if let Some(tx) = read_tx.take() {
                let _ = tx.try_send(Err(std::io::Error::new(kind, msg.to_string())));
            }
        };

        loop {
            // Fill the wire from the outbox while the window allows.
            while send_window.len() < self.config.window_packets {
                let Some((ty, payload)) = outbox.pop_front() else { break };
                let seq = self.seq_nr;
                self.seq_nr = self.seq_nr.wrapping_add(1);
                let pkt = self.make_packet(ty, seq, payload.clone());
                if self.socket.send_to(&pkt.encode(), self.remote).await.is_err() {
                    error_out(&mut read_tx, std::io::ErrorKind::Other, "send failed");
                    break;
                }
                send_window.push_back(Outgoing {
                    seq,
                    payload,
                    ty,
                    last_sent: Instant::now(),
                    transmissions: 1,
                });
            }

            let done_writing = fin_acked || (!write_open && outbox.is_empty() && send_window.is_empty() && !fin_queued);
            if done_writing && (remote_fin_seen || read_tx.is_none()) {
                break;
            }

            let window_has_room = send_window.len() < self.config.window_packets;

            tokio::select! {
                pkt = packet_rx.recv() => {
                    let Some(pkt) = pkt else {
                        // Multiplexer gone.
                        error_out(&mut read_tx, std::io::ErrorKind::Other, "multiplexer closed");
                        break;
                    };
                    match pkt.ty {
                        ST_SYN => {
                            // Lost handshake ack; repeat it.
                            let ack = self.make_packet(ST_STATE, self.seq_nr, Bytes::new());
                            let _ = self.socket.send_to(&ack.encode(), self.remote).await;
                        }
                        ST_STATE | ST_DATA | ST_FIN => {
                            // Cumulative ack processing.
                            while let Some(front) = send_window.front() {
                                if seq_le(front.seq, pkt.ack_nr) {
                                    if front.ty == ST_FIN {
                                        fin_acked = true;
                                    }
                                    send_window.pop_front();
                                } else {
                                    break;
                                }
                            }

                            if pkt.ty == ST_DATA || pkt.ty == ST_FIN {
                                let expected = self.ack_nr.wrapping_add(1);
                                if pkt.seq_nr == expected || seq_lt(expected, pkt.seq_nr) {
                                    if pkt.seq_nr != expected {
                                        ooo.insert(pkt.seq_nr, pkt.clone());
                                    } else {
                                        let mut current = pkt.clone();
                                        loop {
                                            self.ack_nr = current.seq_nr;
                                            if current.ty == ST_FIN {
                                                remote_fin_seen = true;
                                                read_tx = None; // EOF downstream
                                            } else if !current.payload.is_empty() {
                                                if let Some(tx) = &read_tx {
                                                    if tx.send(Ok(current.payload.clone())).await.is_err() {
                                                        // Reader dropped; keep acking.
                                                        read_tx = None;
                                                    }
                                                }
                                            }
                                            match ooo.remove(&self.ack_nr.wrapping_add(1)) {
                                                Some(next) => current = next,
                                                None => break,
                                            }
                                        }
                                    }
                                }
                                // Ack whatever we have in order.
                                let ack = self.make_packet(ST_STATE, self.seq_nr, Bytes::new());
                                let _ = self.socket.send_to(&ack.encode(), self.remote).await;
                            }
                        }
                        ST_RESET => {
                            debug!(remote = %self.remote, "connection reset by peer");
                            error_out(&mut read_tx, std::io::ErrorKind::ConnectionReset, "connection reset");
                            self.shared.conns.lock().unwrap().remove(&self.key);
                            return;
                        }
                        _ => {}
                    }
                }

                cmd = write_rx.recv(), if write_open && window_has_room => {
                    match cmd {
                        Some(WriteCmd::Data(data)) => {
                            for chunk in data.chunks(PACKET_PAYLOAD) {
                                outbox.push_back((ST_DATA, Bytes::copy_from_slice(chunk)));
                            }
                        }
                        Some(WriteCmd::Fin) | None => {
                            write_open = false;
                            outbox.push_back((ST_FIN, Bytes::new()));
                            fin_queued = true;
                        }
                    }
                }

                _ = ticker.tick() => {
                    if let Some(front) = send_window.front_mut() {
                        let rto = self.config.initial_rto() * 2u32.saturating_pow(front.transmissions - 1);
                        if front.last_sent.elapsed() >= rto {
                            if front.transmissions > self.config.max_retransmits {
                                warn!(remote = %self.remote, seq = front.seq, "retransmit limit hit, resetting");
                                let reset = self.make_packet(ST_RESET, self.seq_nr, Bytes::new());
                                let _ = self.socket.send_to(&reset.encode(), self.remote).await;
                                error_out(&mut read_tx, std::io::ErrorKind::TimedOut, "retransmit limit");
                                self.shared.conns.lock().unwrap().remove(&self.key);
                                return;
                            }
                            let pkt = self.make_packet(front.ty, front.seq, front.payload.clone());
                            let _ = self.socket.send_to(&pkt.encode(), self.remote).await;
                            front.last_sent = Instant::now();
                            front.transmissions += 1;
                        }
                    }
                }
            }
        }

        trace!(remote = %self.remote, "utp connection finished");
        self.shared.conns.lock().unwrap().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::UdpMultiplexer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pair() -> (UtpStream, UtpStream) {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (mux_a, _dht_a) = UdpMultiplexer::bind(any).await.unwrap();
        let (mux_b, _dht_b) = UdpMultiplexer::bind(any).await.unwrap();
        let addr_b = mux_b.local_addr();

        let sock_a = mux_a.utp_socket(UtpConfig::default());
        let sock_b = mux_b.utp_socket(UtpConfig::default());
        let mut listener = sock_b.listen();

        let cancel = CancellationToken::new();
        let accept = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            listener.accept(&cancel).await.unwrap().0
        });
        let client = sock_a.connect(addr_b, &cancel).await.unwrap();
        let server = accept.await.unwrap();

        // Keep the multiplexers alive for the lifetime of the streams.
        std::mem::forget(mux_a);
        std::mem::forget(mux_b);
        (client, server)
    }

    #[tokio::test]
    async fn test_roundtrip_small() {
        let (mut client, mut server) = pair().await;

        client.write_all(b"hello over utp").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello over utp");
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let (mut client, mut server) = pair().await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_large_transfer_exercises_window() {
        let (mut client, mut server) = pair().await;

        // Several windows worth of data with a recognizable pattern.
        let data: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&data).await.unwrap();
            client.shutdown().await.unwrap();
            client
        });

        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (mux, _dht) = UdpMultiplexer::bind(any).await.unwrap();
        // Nobody listens on the target multiplexer.
        let (mux_target, _dht_t) = UdpMultiplexer::bind(any).await.unwrap();

        let config = UtpConfig {
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let sock = mux.utp_socket(config);
        let cancel = CancellationToken::new();
        let err = sock.connect(mux_target.local_addr(), &cancel).await;
        assert!(matches!(err, Err(TransportError::ConnectTimedOut)));
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (mux, _dht) = UdpMultiplexer::bind(any).await.unwrap();
        let (mux_target, _dht_t) = UdpMultiplexer::bind(any).await.unwrap();

        let sock = mux.utp_socket(UtpConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sock.connect(mux_target.local_addr(), &cancel).await;
        assert!(matches!(err, Err(TransportError::OperationAborted)));
    }
}
