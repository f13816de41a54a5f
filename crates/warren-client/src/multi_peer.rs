//! Multi-peer block racing.
//!
//! For one URL: find peers (local cache first, then the DHT), ask each for
//! the signed hash list, and adopt the first list that verifies as the
//! *reference*. Every peer then streams the body; each incoming block is
//! verified on its own against the reference (data digest and block
//! signature over the precomputed chain), so blocks from different peers
//! interleave freely. The reader emits blocks strictly in order, taking
//! each one from whichever peer delivered it first; a peer that serves one
//! bad byte or signature is dropped on the spot.
//!
//! The emitted stream is a valid signed response: chunk extensions are
//! rebuilt from the collected block signatures and the trailer is implied
//! by the reference head (which already carries the final signature).

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_cache::chain::{ChainHash, ChainHasher};
use warren_cache::hash_list::HashList;
use warren_cache::head::EXT_SIG;
use warren_cache::response::{chunk_ext, ChunkHdr, Fields, Head, Part, PartReader, ResponseReader};
use warren_cache::CacheError;
use warren_crypto::ed25519::{PublicKey, Signature};
use warren_crypto::sha::{sha512, Sha512Digest};
use warren_dht::martian::is_martian_allow_loopback;
use warren_transport::{UtpSocket, UtpStream};

use crate::peer_server::PeerRequest;
use crate::{ClientError, Result};

/// Blocks a peer may run ahead of the emission point.
const STASH_LIMIT: usize = 16;

/// Coordinator-side channel depth; bounds read-ahead across all peers.
const CHANNEL_DEPTH: usize = 16;

/// Everything needed to verify any block in isolation.
struct Reference {
    head: Head,
    injection_id: String,
    block_size: usize,
    data_size: u64,
    /// Data digests `D[i]`.
    digests: Vec<Sha512Digest>,
    /// Chain digests `C[i]` with their offsets.
    chains: Vec<ChainHash>,
    public_key: PublicKey,
}

impl Reference {
    fn from_hash_list(list: HashList) -> Option<Arc<Reference>> {
        let data_size = list.signed_head.data_size()?;
        let block_size = list.signed_head.block_size();
        let injection_id = list.signed_head.injection_id().to_string();
        let public_key = list.signed_head.public_key();

        let mut chain = ChainHasher::new();
        let chains: Vec<ChainHash> = list
            .block_hashes
            .iter()
            .map(|d| chain.push_digest(block_size, *d))
            .collect();

        Some(Arc::new(Reference {
            head: list.signed_head.into_head(),
            injection_id,
            block_size,
            data_size,
            digests: list.block_hashes,
            chains,
            public_key,
        }))
    }

    fn blocks(&self) -> usize {
        self.digests.len()
    }

    fn block_len(&self, index: usize) -> usize {
        if index + 1 < self.blocks() {
            self.block_size
        } else {
            (self.data_size as usize) - (self.blocks() - 1) * self.block_size
        }
    }

    fn verify_block(&self, index: usize, data: &[u8], sig: &Signature) -> bool {
        if index >= self.blocks() || data.len() != self.block_len(index) {
            return false;
        }
        if sha512(data) != self.digests[index] {
            return false;
        }
        self.chains[index].verify(&self.public_key, &self.injection_id, sig)
    }
}

enum PeerMsg {
    HashList(usize, Box<HashList>),
    Block {
        peer: usize,
        index: usize,
        data: Bytes,
        sig: Signature,
    },
    Done(usize),
    Failed(usize),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Head,
    Blocks,
    FinalChunk,
    Trailer,
    Done,
}

/// The block-racing reader; build with [`MultiPeerReader::start`].
pub struct MultiPeerReader {
    reference: Arc<Reference>,
    rx: mpsc::Receiver<PeerMsg>,
    lifetime: CancellationToken,
    /// Keeps the reference broadcast alive for peers still handshaking.
    _ref_tx: watch::Sender<Option<Arc<Reference>>>,

    phase: Phase,
    pending: std::collections::VecDeque<Part>,
    next_index: usize,
    /// Signature of the last emitted block, carried by the next chunk
    /// header.
    prev_sig: Option<Signature>,
    stash: HashMap<usize, (Bytes, Signature)>,
    peers_alive: usize,
    peer_endpoints: HashMap<usize, SocketAddr>,
    good_peers: HashSet<SocketAddr>,
}

impl MultiPeerReader {
    /// Resolve peers and elect a reference; returns a reader positioned
    /// before the head. Fails with [`ClientError::NotFound`] when no peer
    /// serves a usable hash list for `key`.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        key: &str,
        public_key: PublicKey,
        utp: UtpSocket,
        mut candidates: Vec<SocketAddr>,
        own_endpoints: HashSet<SocketAddr>,
        cancel: &CancellationToken,
    ) -> Result<MultiPeerReader> {
        let local = utp.local_addr();
        let mut seen = HashSet::new();
        candidates.retain(|ep| {
            ep.is_ipv4() == local.is_ipv4()
                && !is_martian_allow_loopback(ep)
                && !own_endpoints.contains(ep)
                && seen.insert(*ep)
        });
        if candidates.is_empty() {
            return Err(ClientError::NotFound);
        }
        debug!(key, peers = candidates.len(), "starting multi-peer fetch");

        let lifetime = cancel.child_token();
        let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
        let (ref_tx, ref_rx) = watch::channel::<Option<Arc<Reference>>>(None);

        let mut peer_endpoints = HashMap::new();
        for (idx, ep) in candidates.iter().enumerate() {
            peer_endpoints.insert(idx, *ep);
            tokio::spawn(peer_task(
                idx,
                *ep,
                utp.clone(),
                key.to_string(),
                public_key,
                tx.clone(),
                ref_rx.clone(),
                lifetime.clone(),
            ));
        }
        drop(tx);

        // Phase A: first verified hash list wins.
        let total = candidates.len();
        let mut failed = 0usize;
        let reference = loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    lifetime.cancel();
                    return Err(ClientError::OperationAborted);
                }
                m = rx.recv() => m,
            };
            match msg {
                Some(PeerMsg::HashList(idx, list)) => {
                    match Reference::from_hash_list(*list) {
                        Some(r) => break r,
                        None => {
                            debug!(peer = idx, "hash list without data size, ignoring");
                            failed += 1;
                        }
                    }
                }
                Some(PeerMsg::Failed(idx)) => {
                    debug!(peer = idx, "peer failed before providing a hash list");
                    failed += 1;
                }
                Some(_) => continue,
                None => failed = total,
            }
            if failed >= total {
                lifetime.cancel();
                return Err(ClientError::NotFound);
            }
        };
        let _ = ref_tx.send(Some(reference.clone()));

        Ok(MultiPeerReader {
            reference,
            rx,
            lifetime,
            _ref_tx: ref_tx,
            phase: Phase::Head,
            pending: std::collections::VecDeque::new(),
            next_index: 0,
            prev_sig: None,
            stash: HashMap::new(),
            peers_alive: total - failed,
            peer_endpoints,
            good_peers: HashSet::new(),
        })
    }

    /// Peers that contributed at least one verified block; feed these back
    /// into the local peer cache.
    pub fn good_peers(&self) -> Vec<SocketAddr> {
        self.good_peers.iter().copied().collect()
    }

    /// The reference head (before emission framing).
    pub fn head(&self) -> &Head {
        &self.reference.head
    }

    fn emit_block(&mut self, data: Bytes, sig: Signature) {
        let exts = self
            .prev_sig
            .map(|s| format!(";{EXT_SIG}=\"{}\"", b64(&s)))
            .unwrap_or_default();
        self.pending
            .push_back(Part::ChunkHdr(ChunkHdr::new(data.len(), exts)));
        self.pending.push_back(Part::ChunkBody(data));
        self.prev_sig = Some(sig);
        self.next_index += 1;
    }

    /// Pull verified blocks until the next needed one is available.
    async fn advance(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if let Some((data, sig)) = self.stash.remove(&self.next_index) {
                self.emit_block(data, sig);
                return Ok(());
            }
            if self.peers_alive == 0 {
                warn!(block = self.next_index, "all peers failed");
                return Err(ClientError::NotFound);
            }

            let msg = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::OperationAborted),
                _ = self.lifetime.cancelled() => return Err(ClientError::OperationAborted),
                m = self.rx.recv() => m.ok_or(ClientError::NotFound)?,
            };
            match msg {
                PeerMsg::Block {
                    peer,
                    index,
                    data,
                    sig,
                } => {
                    if let Some(ep) = self.peer_endpoints.get(&peer) {
                        self.good_peers.insert(*ep);
                    }
                    if index < self.next_index || self.stash.contains_key(&index) {
                        continue; // someone else got there first
                    }
                    if index > self.next_index + STASH_LIMIT {
                        // Beyond the reorder window; a peer still behind
                        // the needed block will deliver this one again.
                        continue;
                    }
                    self.stash.insert(index, (data, sig));
                }
                PeerMsg::Done(_) => {}
                PeerMsg::Failed(idx) => {
                    debug!(peer = idx, "peer dropped");
                    if let Some(ep) = self.peer_endpoints.get(&idx) {
                        self.good_peers.remove(ep);
                    }
                    self.peers_alive = self.peers_alive.saturating_sub(1);
                }
                PeerMsg::HashList(..) => {}
            }
        }
    }
}

impl Drop for MultiPeerReader {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[async_trait]
impl PartReader for MultiPeerReader {
    async fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> warren_cache::Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            match self.phase {
                Phase::Head => {
                    let mut head = self.reference.head.clone();
                    head.set("Transfer-Encoding", "chunked");
                    self.phase = Phase::Blocks;
                    return Ok(Some(Part::Head(head)));
                }
                Phase::Blocks => {
                    if self.next_index >= self.reference.blocks() {
                        self.phase = Phase::FinalChunk;
                        continue;
                    }
                    self.advance(cancel).await.map_err(to_cache_error)?;
                }
                Phase::FinalChunk => {
                    let exts = self
                        .prev_sig
                        .map(|s| format!(";{EXT_SIG}=\"{}\"", b64(&s)))
                        .unwrap_or_default();
                    self.phase = Phase::Trailer;
                    self.lifetime.cancel(); // peers are no longer needed
                    return Ok(Some(Part::ChunkHdr(ChunkHdr::new(0, exts))));
                }
                Phase::Trailer => {
                    self.phase = Phase::Done;
                    return Ok(Some(Part::Trailer(Fields::new())));
                }
                Phase::Done => return Ok(None),
            }
        }
    }
}

fn to_cache_error(e: ClientError) -> CacheError {
    match e {
        ClientError::OperationAborted => CacheError::OperationAborted,
        ClientError::NotFound => CacheError::NotFound,
        other => CacheError::BadMessage(other.to_string()),
    }
}

fn b64(data: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode_sig(exts: &str) -> Option<Signature> {
    use base64::Engine as _;
    let value = chunk_ext(exts, EXT_SIG)?;
    let raw = base64::engine::general_purpose::STANDARD.decode(value).ok()?;
    raw.try_into().ok()
}

type PeerConn = (
    ResponseReader<ReadHalf<UtpStream>>,
    WriteHalf<UtpStream>,
);

#[allow(clippy::too_many_arguments)]
async fn peer_task(
    idx: usize,
    ep: SocketAddr,
    utp: UtpSocket,
    key: String,
    public_key: PublicKey,
    tx: mpsc::Sender<PeerMsg>,
    mut reference_rx: watch::Receiver<Option<Arc<Reference>>>,
    cancel: CancellationToken,
) {
    let result = async {
        let stream = utp.connect(ep, &cancel).await.map_err(ClientError::from)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut conn: PeerConn = (ResponseReader::new(read_half), write_half);

        // Phase A: fetch and verify the hash list.
        let request = PeerRequest {
            target: key.clone(),
            range: None,
            hash_list: true,
        };
        write_all(&mut conn.1, &request.to_bytes(), &cancel).await?;
        let list = HashList::load(&mut conn.0, &public_key, &cancel).await?;
        let own_injection = list.signed_head.injection_id().to_string();
        if tx.send(PeerMsg::HashList(idx, Box::new(list))).await.is_err() {
            return Ok(());
        }

        // Wait for the elected reference.
        let reference = loop {
            if let Some(r) = reference_rx.borrow().clone() {
                break r;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::OperationAborted),
                changed = reference_rx.changed() => {
                    changed.map_err(|_| ClientError::OperationAborted)?;
                }
            }
        };
        // An injection mismatch means this peer holds a different version
        // of the URL; its blocks would never verify, so leave early.
        if reference.injection_id != own_injection {
            return Err(ClientError::BadMessage("peer serves another injection".into()));
        }

        // Phase B: stream the body and relay verified blocks.
        let request = PeerRequest {
            target: key,
            range: None,
            hash_list: false,
        };
        write_all(&mut conn.1, &request.to_bytes(), &cancel).await?;
        conn.0.reset();

        let Some(Part::Head(head)) = conn.0.read_part(&cancel).await? else {
            return Err(ClientError::BadMessage("peer sent no head".into()));
        };
        let verified = warren_cache::SignedHead::verify(&head, &public_key)
            .ok_or_else(|| ClientError::BadMessage("peer head does not verify".into()))?;
        let (peer_injection, _) = warren_cache::head::parse_injection(&verified)
            .map_err(ClientError::from)?;
        if peer_injection != reference.injection_id {
            return Err(ClientError::BadMessage("peer switched injections".into()));
        }

        let mut blocks_seen = 0usize;
        let mut pending: Option<(usize, Bytes)> = None;
        loop {
            let part = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::OperationAborted),
                p = conn.0.read_part(&cancel) => p?,
            };
            let Some(part) = part else { break };
            match part {
                Part::ChunkHdr(ch) => {
                    if let Some(sig) = decode_sig(&ch.exts) {
                        let Some((index, data)) = pending.take() else {
                            return Err(ClientError::BadMessage(
                                "signature with no preceding block".into(),
                            ));
                        };
                        if !reference.verify_block(index, &data, &sig) {
                            return Err(ClientError::BadMessage(format!(
                                "block {index} failed verification"
                            )));
                        }
                        if tx
                            .send(PeerMsg::Block {
                                peer: idx,
                                index,
                                data,
                                sig,
                            })
                            .await
                            .is_err()
                        {
                            return Ok(()); // reader gone
                        }
                    }
                }
                Part::ChunkBody(data) => {
                    if pending.is_some() {
                        return Err(ClientError::BadMessage(
                            "chunk not aligned to block boundary".into(),
                        ));
                    }
                    pending = Some((blocks_seen, data));
                    blocks_seen += 1;
                }
                Part::Head(_) => {
                    return Err(ClientError::BadMessage("unexpected second head".into()))
                }
                Part::Trailer(_) => break,
            }
        }
        if pending.is_some() {
            return Err(ClientError::BadMessage("stream ended mid-block".into()));
        }
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            let _ = tx.send(PeerMsg::Done(idx)).await;
        }
        Err(e) => {
            debug!(peer = idx, %ep, error = %e, "peer task failed");
            let _ = tx.send(PeerMsg::Failed(idx)).await;
        }
    }
}

async fn write_all<W: tokio::io::AsyncWrite + Unpin>(
    out: &mut W,
    data: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    tokio::select! {
        _ = cancel.cancelled() => Err(ClientError::OperationAborted),
        r = out.write_all(data) => {
            r?;
            out.flush().await?;
            Ok(())
        }
    }
}
