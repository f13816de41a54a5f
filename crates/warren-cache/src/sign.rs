//! The signing reader: consumes a plain HTTP response, emits the signed,
//! chunked-transfer-encoded form.
//!
//! The head gains the protocol headers and `X-Ouinet-Sig0`; the body is
//! re-quantised into 64 KiB blocks, one output chunk per block, where each
//! chunk header's `ouisig` extension signs the *previous* block (the first
//! chunk has no extension). The final zero-length chunk signs the last
//! block, followed by a trailer with `X-Ouinet-Data-Size`, `Digest` and
//! `X-Ouinet-Sig1`.
//!
//! Origin chunking and chunk extensions are dropped: blocks are the only
//! signable unit.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use warren_crypto::ed25519::SigningKey;
use warren_crypto::sha::{sha512, Sha256};

use crate::chain::{BlockBuffer, ChainHash, ChainHasher};
use crate::head::{is_sig_header, SignedHead, EXT_SIG};
use crate::response::{ChunkHdr, Fields, Head, Part, PartReader};
use crate::{unix_now, CacheError, Result, BLOCK_SIZE};

fn ouisig_ext(signature: &warren_crypto::ed25519::Signature) -> String {
    use base64::Engine as _;
    format!(
        ";{EXT_SIG}=\"{}\"",
        base64::engine::general_purpose::STANDARD.encode(signature)
    )
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHead,
    Streaming,
    Done,
}

/// Streaming response signer.
pub struct SigningReader<R> {
    inner: R,
    uri: String,
    injection_id: String,
    injection_ts: u64,
    /// Explicit stamps make the whole output deterministic; the trailer
    /// signature is then stamped one second after the head's.
    deterministic: bool,
    key: SigningKey,

    phase: Phase,
    signed_head: Option<Head>,
    pending: VecDeque<Part>,

    qbuf: BlockBuffer,
    chain: ChainHasher,
    last_block: Option<ChainHash>,
    body_hash: Sha256,
    body_length: u64,
    trailer_in: Fields,
}

impl<R: PartReader> SigningReader<R> {
    /// Sign with a fresh injection id and the current time.
    pub fn new(inner: R, uri: impl Into<String>, key: SigningKey) -> Self {
        Self::build(inner, uri, Uuid::new_v4().to_string(), unix_now(), false, key)
    }

    /// Sign with explicit injection id and timestamp (deterministic).
    pub fn with_injection(
        inner: R,
        uri: impl Into<String>,
        injection_id: impl Into<String>,
        injection_ts: u64,
        key: SigningKey,
    ) -> Self {
        Self::build(inner, uri, injection_id.into(), injection_ts, true, key)
    }

    fn build(
        inner: R,
        uri: impl Into<String>,
        injection_id: String,
        injection_ts: u64,
        deterministic: bool,
        key: SigningKey,
    ) -> Self {
        Self {
            inner,
            uri: uri.into(),
            injection_id,
            injection_ts,
            deterministic,
            key,
            phase: Phase::AwaitHead,
            signed_head: None,
            pending: VecDeque::new(),
            qbuf: BlockBuffer::new(BLOCK_SIZE),
            chain: ChainHasher::new(),
            last_block: None,
            body_hash: Sha256::new(),
            body_length: 0,
            trailer_in: Fields::new(),
        }
    }

    /// The injection id stamped into the output.
    pub fn injection_id(&self) -> &str {
        &self.injection_id
    }

    /// Queue one completed block: a chunk header carrying the previous
    /// block's signature, then the block as the chunk body.
    fn emit_block(&mut self, block: Vec<u8>) {
        let exts = self
            .last_block
            .map(|prev| ouisig_ext(&prev.sign(&self.key, &self.injection_id)))
            .unwrap_or_default();
        let digest = sha512(&block);
        self.last_block = Some(self.chain.push_digest(block.len(), digest));
        self.pending.push_back(Part::ChunkHdr(ChunkHdr::new(block.len(), exts)));
        self.pending.push_back(Part::ChunkBody(Bytes::from(block)));
    }

    fn process_head(&mut self, head: Head) {
        let signed = SignedHead::sign_response(
            &self.uri,
            head,
            &self.injection_id,
            self.injection_ts,
            &self.key,
        );
        self.signed_head = Some(signed.clone());
        self.phase = Phase::Streaming;
        self.pending.push_back(Part::Head(signed));
    }

    fn process_body(&mut self, data: &[u8]) {
        self.body_length += data.len() as u64;
        self.body_hash.update(data);
        self.qbuf.put(data);
        while let Some(block) = self.qbuf.take_full() {
            self.emit_block(block);
        }
    }

    fn process_end(&mut self) -> Result<()> {
        let Some(signed_head) = self.signed_head.clone() else {
            return Err(CacheError::BadMessage("input ended before a head".into()));
        };

        let rest = self.qbuf.take_rest();
        if !rest.is_empty() {
            self.emit_block(rest);
        }
        if self.last_block.is_none() {
            // An empty body still gets one signature, over the digest of
            // the empty block.
            let digest = sha512(b"");
            self.last_block = Some(self.chain.push_digest(0, digest));
        }

        let last = self.last_block.as_ref().unwrap();
        let exts = ouisig_ext(&last.sign(&self.key, &self.injection_id));
        self.pending.push_back(Part::ChunkHdr(ChunkHdr::new(0, exts)));

        let trailer_ts = if self.deterministic {
            self.injection_ts + 1
        } else {
            unix_now()
        };
        let mut trailer_in = std::mem::take(&mut self.trailer_in);
        trailer_in.retain(|n, _| !is_sig_header(n));
        let trailer = SignedHead::injection_trailer(
            &signed_head,
            trailer_in,
            self.body_length,
            self.body_hash.clone().finalize(),
            &self.key,
            trailer_ts,
        );
        self.pending.push_back(Part::Trailer(trailer));
        self.phase = Phase::Done;
        Ok(())
    }
}

#[async_trait]
impl<R: PartReader> PartReader for SigningReader<R> {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            if self.phase == Phase::Done {
                return Ok(None);
            }

            match self.inner.read_part(cancel).await? {
                None => self.process_end()?,
                Some(Part::Head(h)) => {
                    if self.phase != Phase::AwaitHead {
                        return Err(CacheError::BadMessage("unexpected second head".into()));
                    }
                    self.process_head(h);
                }
                Some(Part::ChunkHdr(_)) => {
                    // Origin chunk boundaries and extensions are not
                    // signable; drop them.
                }
                Some(Part::ChunkBody(data)) => {
                    if self.phase != Phase::Streaming {
                        return Err(CacheError::BadMessage("body before head".into()));
                    }
                    self.process_body(&data);
                }
                Some(Part::Trailer(t)) => {
                    self.trailer_in = t;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::VecPartReader;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn plain_head() -> Head {
        let mut h = Head::new(200);
        h.set("Content-Type", "text/html");
        h.set("Transfer-Encoding", "chunked");
        h
    }

    fn source(body: &[u8]) -> VecPartReader {
        VecPartReader::new([
            Part::Head(plain_head()),
            Part::ChunkHdr(ChunkHdr::new(body.len(), "")),
            Part::ChunkBody(Bytes::copy_from_slice(body)),
            Part::ChunkHdr(ChunkHdr::new(0, "")),
            Part::Trailer(Fields::new()),
        ])
    }

    async fn drain(reader: &mut SigningReader<VecPartReader>) -> Vec<Part> {
        let c = cancel();
        let mut parts = Vec::new();
        while let Some(p) = reader.read_part(&c).await.unwrap() {
            parts.push(p);
        }
        parts
    }

    #[tokio::test]
    async fn test_small_body_single_block() {
        let mut r = SigningReader::with_injection(source(b"0123456789"), "https://x/", "id-1", 100, key());
        let parts = drain(&mut r).await;

        // Head, chunk hdr + body, final chunk, trailer.
        assert_eq!(parts.len(), 5);
        let head = parts[0].as_head().unwrap();
        assert!(head.get("X-Ouinet-Sig0").is_some());

        let ch = parts[1].as_chunk_hdr().unwrap();
        assert_eq!(ch.size, 10);
        assert!(ch.exts.is_empty(), "first chunk carries no signature");
        assert_eq!(&parts[2].as_chunk_body().unwrap()[..], b"0123456789");

        let last = parts[3].as_chunk_hdr().unwrap();
        assert_eq!(last.size, 0);
        assert!(last.exts.contains("ouisig="));

        let trailer = parts[4].as_trailer().unwrap();
        assert_eq!(trailer.get("X-Ouinet-Data-Size"), Some("10"));
        assert!(trailer.get("Digest").unwrap().starts_with("SHA-256="));
        assert!(trailer.get("X-Ouinet-Sig1").is_some());
    }

    #[tokio::test]
    async fn test_multi_block_resplit() {
        // A body of 1.5 blocks arriving in awkward pieces must come out as
        // one full block and one half block.
        let body: Vec<u8> = (0..BLOCK_SIZE + BLOCK_SIZE / 2).map(|i| (i % 256) as u8).collect();
        let mut parts_in = vec![Part::Head(plain_head())];
        for piece in body.chunks(10_000) {
            parts_in.push(Part::ChunkHdr(ChunkHdr::new(piece.len(), "")));
            parts_in.push(Part::ChunkBody(Bytes::copy_from_slice(piece)));
        }
        let mut r = SigningReader::with_injection(
            VecPartReader::new(parts_in),
            "https://x/",
            "id-2",
            100,
            key(),
        );
        let parts = drain(&mut r).await;

        let sizes: Vec<usize> = parts
            .iter()
            .filter_map(|p| p.as_chunk_hdr())
            .map(|c| c.size)
            .collect();
        assert_eq!(sizes, vec![BLOCK_SIZE, BLOCK_SIZE / 2, 0]);

        // First chunk unsigned, the rest signed.
        let exts: Vec<&str> = parts
            .iter()
            .filter_map(|p| p.as_chunk_hdr())
            .map(|c| c.exts.as_str())
            .collect();
        assert!(exts[0].is_empty());
        assert!(exts[1].contains("ouisig="));
        assert!(exts[2].contains("ouisig="));
    }

    #[tokio::test]
    async fn test_deterministic_output() {
        let mut a = SigningReader::with_injection(source(b"abc"), "https://x/", "id", 7, key());
        let mut b = SigningReader::with_injection(source(b"abc"), "https://x/", "id", 7, key());
        assert_eq!(drain(&mut a).await, drain(&mut b).await);
    }

    #[tokio::test]
    async fn test_body_before_head_rejected() {
        let mut r = SigningReader::new(
            VecPartReader::new([Part::ChunkBody(Bytes::from_static(b"zz"))]),
            "https://x/",
            key(),
        );
        assert!(matches!(
            r.read_part(&cancel()).await,
            Err(CacheError::BadMessage(_))
        ));
    }
}
