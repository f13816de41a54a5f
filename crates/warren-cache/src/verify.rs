//! The verifying reader: the strict inverse of the signing reader.
//!
//! The head must carry a signature matching the configured public key;
//! every block signature is checked in order as blocks complete; at end of
//! stream the body length must equal the signed (or range) length and, when
//! the whole body was seen, its digest must match the `Digest` header.
//! Any mismatch fails the stream; nothing unverified is passed along.
//!
//! The output preserves everything needed to verify again downstream: the
//! re-emitted chunk headers carry the previous block's signature and, from
//! the third chunk on, the chain digest two blocks back, so any contiguous
//! suffix of the output remains independently verifiable.

use std::collections::VecDeque;

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warren_crypto::ed25519::{PublicKey, Signature};
use warren_crypto::sha::{sha512, Sha256, Sha512Digest};

use crate::chain::{BlockBuffer, ChainHasher};
use crate::head::{
    is_sig_header, parse_injection, BlockSigs, SignedHead, EXT_HASH, EXT_SIG, HDR_BSIGS,
    HDR_DATA_SIZE, HDR_HTTP_STATUS,
};
use crate::response::{chunk_ext, ChunkHdr, Fields, Head, Part, PartReader};
use crate::{CacheError, Result, MAX_BLOCK_SIZE};

fn b64(data: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn decode64(value: &str) -> Option<[u8; 64]> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(value).ok()?;
    bytes.try_into().ok()
}

/// Format block chunk extensions from optional signature and chain hash.
pub(crate) fn block_chunk_exts(sig: Option<&Signature>, hash: Option<&Sha512Digest>) -> String {
    let mut out = String::new();
    if let Some(sig) = sig {
        out.push_str(&format!(";{EXT_SIG}=\"{}\"", b64(sig)));
    }
    if let Some(hash) = hash {
        out.push_str(&format!(";{EXT_HASH}=\"{}\"", b64(hash)));
    }
    out
}

/// Parse a `Content-Range: bytes F-L/SIZE` value.
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, size) = rest.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let last: u64 = last.trim().parse().ok()?;
    if last < first {
        return None;
    }
    let size = match size.trim() {
        "*" => None,
        s => Some(s.parse::<u64>().ok()?),
    };
    Some((first, last, size))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHead,
    Streaming,
    Done,
}

/// Streaming response verifier.
pub struct VerifyingReader<R> {
    inner: R,
    pk: PublicKey,
    /// Outer statuses whose original status gets restored before
    /// verification (and put back on emission).
    restore_statuses: Vec<u16>,

    phase: Phase,
    pending: VecDeque<Part>,

    head: Option<Head>, // verified inner head, trailer merged in later
    injection_id: String,
    bsigs: Option<BlockSigs>,
    range: Option<(u64, u64)>, // [begin, end)
    block_offset: u64,

    qbuf: Option<BlockBuffer>,
    chain: ChainHasher,
    prev_sig: Option<Signature>,
    prev_prev_sig: Option<Signature>,
    // Chain digests trailing the blocks: C[i] and C[i-1].
    chain_dig: Option<Sha512Digest>,
    prev_chain_dig: Option<Sha512Digest>,

    body_length: u64,
    body_hash: Sha256,
}

impl<R: PartReader> VerifyingReader<R> {
    /// Verify `inner` under `pk`, restoring the original status of
    /// re-framed `206 Partial Content` responses for verification.
    pub fn new(inner: R, pk: PublicKey) -> Self {
        Self::with_statuses(inner, pk, vec![206])
    }

    /// As [`VerifyingReader::new`] with an explicit restore set.
    pub fn with_statuses(inner: R, pk: PublicKey, restore_statuses: Vec<u16>) -> Self {
        Self {
            inner,
            pk,
            restore_statuses,
            phase: Phase::AwaitHead,
            pending: VecDeque::new(),
            head: None,
            injection_id: String::new(),
            bsigs: None,
            range: None,
            block_offset: 0,
            qbuf: None,
            chain: ChainHasher::new(),
            prev_sig: None,
            prev_prev_sig: None,
            chain_dig: None,
            prev_chain_dig: None,
            body_length: 0,
            body_hash: Sha256::new(),
        }
    }

    /// The verified head (available after the head part was emitted).
    pub fn verified_head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    fn process_head(&mut self, mut inh: Head) -> Result<Part> {
        let outer_status = inh.status;
        let mut outer_range: Option<String> = None;

        // Restore the original status before verification; the outer
        // framing is not covered by signatures.
        let restore = self.restore_statuses.contains(&outer_status);
        let original_status = inh
            .get(HDR_HTTP_STATUS)
            .and_then(|v| v.parse::<u16>().ok());
        let restored = match (restore, original_status) {
            (true, Some(orig)) => {
                inh.remove(HDR_HTTP_STATUS);
                if outer_status == 206 {
                    outer_range = inh.get("Content-Range").map(str::to_string);
                    inh.remove("Content-Range");
                }
                inh.set_status(orig);
                true
            }
            _ => false,
        };

        let verified = SignedHead::verify(&inh, &self.pk)
            .ok_or_else(|| CacheError::InvalidHead("head signature verification failed".into()))?;
        if !verified.chunked() {
            return Err(CacheError::InvalidHead(
                "verification of non-chunked responses is not supported".into(),
            ));
        }

        let bsigs = verified
            .get(HDR_BSIGS)
            .and_then(BlockSigs::parse)
            .ok_or_else(|| {
                CacheError::InvalidHead("missing or malformed block signature parameters".into())
            })?;
        if bsigs.size > MAX_BLOCK_SIZE {
            return Err(CacheError::InvalidHead(format!(
                "signed block size too large: {}",
                bsigs.size
            )));
        }
        let (injection_id, _) = parse_injection(&verified)?;

        // Ranges may be unsigned; validate against the signed data size.
        if let Some(range_str) = &outer_range {
            let (first, last, size) = parse_content_range(range_str)
                .ok_or_else(|| CacheError::InvalidHead("malformed byte range".into()))?;
            let data_size: u64 = verified
                .get(HDR_DATA_SIZE)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| CacheError::InvalidHead("range without signed length".into()))?;
            if size != Some(data_size) || last >= data_size {
                return Err(CacheError::InvalidHead("byte range outside signed length".into()));
            }
            if first % bsigs.size as u64 != 0 {
                return Err(CacheError::InvalidHead("range start not block-aligned".into()));
            }
            self.range = Some((first, last + 1));
            self.block_offset = first;
            self.chain = ChainHasher::resume(first, None);
        }

        self.qbuf = Some(BlockBuffer::new(bsigs.size));
        self.bsigs = Some(bsigs);
        self.injection_id = injection_id;
        self.head = Some(verified.clone());
        self.phase = Phase::Streaming;

        // Emit with the outer framing restored.
        let mut out = verified;
        if restored {
            out.set_status(outer_status);
            out.set(HDR_HTTP_STATUS, inh.status.to_string());
            if let Some(r) = outer_range {
                out.set("Content-Range", r);
            }
        }
        Ok(Part::Head(out))
    }

    fn process_chunk_hdr(&mut self, inch: &ChunkHdr) -> Result<Option<Part>> {
        let bsigs = self.bsigs.as_ref().unwrap();
        if inch.size > bsigs.size {
            return Err(CacheError::BadMessage(format!(
                "chunk size exceeds block size: {} > {}",
                inch.size, bsigs.size
            )));
        }

        let qbuf = self.qbuf.as_mut().unwrap();
        let block = match qbuf.take_full() {
            Some(b) => b,
            None if inch.size == 0 => qbuf.take_rest(),
            None => return Ok(None), // need more chunk data first
        };

        let Some(sig) = chunk_ext(&inch.exts, EXT_SIG).as_deref().and_then(decode64) else {
            return Err(CacheError::BadMessage(format!(
                "missing signature for block at offset {}",
                self.block_offset
            )));
        };

        // A range that starts mid-body must supply the preceding chain
        // digest along the first block's signature.
        if let Some((first, _)) = self.range {
            if first > 0 && self.block_offset == first && self.chain.prev_chained().is_none() {
                let Some(prev) = chunk_ext(&inch.exts, EXT_HASH).as_deref().and_then(decode64)
                else {
                    return Err(CacheError::BadMessage(format!(
                        "missing chain hash for block at offset {first}"
                    )));
                };
                self.prev_chain_dig = Some(prev);
                self.chain = ChainHasher::resume(first, Some(prev));
            }
        }

        let digest = sha512(&block);
        let ch = self.chain.push_digest(block.len(), digest);
        if !ch.verify(&bsigs.public_key, &self.injection_id, &sig) {
            return Err(CacheError::BadMessage(format!(
                "block signature verification failed at offset {}",
                ch.offset
            )));
        }
        self.block_offset += block.len() as u64;

        // Shift the signature/digest pipeline: the signature travels one
        // chunk behind its block, the chain digest two.
        self.prev_prev_sig = self.prev_sig.take();
        self.prev_sig = Some(sig);
        let emitted_dig = self.prev_chain_dig.take();
        self.prev_chain_dig = self.chain_dig.take();
        self.chain_dig = Some(ch.digest);

        if block.is_empty() {
            return Ok(None);
        }
        let exts = block_chunk_exts(self.prev_prev_sig.as_ref(), emitted_dig.as_ref());
        let len = block.len();
        self.pending.push_back(Part::ChunkBody(Bytes::from(block)));
        Ok(Some(Part::ChunkHdr(ChunkHdr::new(len, exts))))
    }

    fn process_chunk_body(&mut self, data: &[u8]) -> Result<()> {
        self.body_length += data.len() as u64;
        self.body_hash.update(data);
        let qbuf = self.qbuf.as_mut().unwrap();
        qbuf.put(data);
        if qbuf.len() > self.bsigs.as_ref().unwrap().size {
            return Err(CacheError::BadMessage(
                "chunk data overflows block boundary".into(),
            ));
        }
        Ok(())
    }

    fn process_trailer(&mut self, trailer: Fields) -> Result<Part> {
        let head = self.head.as_mut().unwrap();
        let mut sigs_in_trailer = false;
        for (n, v) in trailer.iter() {
            head.fields.append(n.to_string(), v.to_string());
            if is_sig_header(n) {
                sigs_in_trailer = true;
            }
        }
        if sigs_in_trailer {
            let verified = SignedHead::verify(head, &self.pk).ok_or_else(|| {
                CacheError::BadMessage("trailer signature verification failed".into())
            })?;
            *head = verified;
        }

        let exts = block_chunk_exts(self.prev_sig.as_ref(), self.prev_chain_dig.as_ref());
        self.pending.push_back(Part::Trailer(trailer));
        Ok(Part::ChunkHdr(ChunkHdr::new(0, exts)))
    }

    fn check_body(&mut self) -> Result<()> {
        let head = self.head.as_ref().unwrap();
        let Some(signed_len) = head.get(HDR_DATA_SIZE).and_then(|v| v.parse::<u64>().ok())
        else {
            warn!("missing signed length at end of stream");
            return Err(CacheError::BadMessage("missing signed length".into()));
        };
        let expected = match self.range {
            Some((first, end)) => end - first,
            None => signed_len,
        };
        if expected != self.body_length {
            return Err(CacheError::BadMessage(format!(
                "body length mismatch: {} != {}",
                self.body_length, expected
            )));
        }

        // Digest only covers the full body.
        if let Some((first, end)) = self.range {
            if first > 0 || end < signed_len {
                return Ok(());
            }
        }
        let computed = b64(self.body_hash.clone().finalize());
        for value in head.fields.get_all("Digest") {
            if let Some((algo, digest)) = value.split_once('=') {
                if algo.eq_ignore_ascii_case("SHA-256") && digest != computed {
                    return Err(CacheError::BadMessage("body digest mismatch".into()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<R: PartReader> PartReader for VerifyingReader<R> {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        loop {
            if let Some(part) = self.pending.pop_front() {
                return Ok(Some(part));
            }
            if self.phase == Phase::Done {
                return Ok(None);
            }

            let Some(part) = self.inner.read_part(cancel).await? else {
                if self.phase != Phase::Streaming {
                    return Err(CacheError::InvalidHead("stream ended before a head".into()));
                }
                self.check_body()?;
                self.phase = Phase::Done;
                return Ok(None);
            };

            let produced = match part {
                Part::Head(h) => {
                    if self.phase != Phase::AwaitHead {
                        return Err(CacheError::BadMessage("unexpected second head".into()));
                    }
                    Some(self.process_head(h)?)
                }
                Part::ChunkHdr(ch) => self.process_chunk_hdr(&ch)?,
                Part::ChunkBody(data) => {
                    self.process_chunk_body(&data)?;
                    None
                }
                Part::Trailer(t) => Some(self.process_trailer(t)?),
            };
            if let Some(p) = produced {
                return Ok(Some(p));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::VecPartReader;
    use crate::sign::SigningReader;
    use warren_crypto::ed25519::SigningKey;

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

    async fn signed_parts(body: &[u8]) -> Vec<Part> {
        let src = VecPartReader::new([
            Part::Head(plain_head()),
            Part::ChunkHdr(ChunkHdr::new(body.len(), "")),
            Part::ChunkBody(Bytes::copy_from_slice(body)),
        ]);
        let mut signer = SigningReader::with_injection(src, "https://x/", "id-v", 100, key());
        let mut out = Vec::new();
        while let Some(p) = signer.read_part(&cancel()).await.unwrap() {
            out.push(p);
        }
        out
    }

    async fn verify_parts(parts: Vec<Part>) -> Result<Vec<Part>> {
        let mut v = VerifyingReader::new(VecPartReader::new(parts), key().public_key());
        let mut out = Vec::new();
        while let Some(p) = v.read_part(&cancel()).await? {
            out.push(p);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_roundtrip_verifies() {
        let body = b"hello signed world".to_vec();
        let parts = signed_parts(&body).await;
        let out = verify_parts(parts).await.unwrap();

        let data: Vec<u8> = out
            .iter()
            .filter_map(|p| p.as_chunk_body())
            .flat_map(|b| b.iter().copied())
            .collect();
        assert_eq!(data, body);
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let parts = signed_parts(b"payload").await;
        let other = SigningKey::from_bytes(&[9u8; 32]).public_key();
        let mut v = VerifyingReader::new(VecPartReader::new(parts), other);
        assert!(matches!(
            v.read_part(&cancel()).await,
            Err(CacheError::InvalidHead(_))
        ));
    }

    #[tokio::test]
    async fn test_flipped_body_bit_rejected() {
        let mut parts = signed_parts(b"sensitive data").await;
        for p in parts.iter_mut() {
            if let Part::ChunkBody(b) = p {
                let mut v = b.to_vec();
                v[0] ^= 1;
                *p = Part::ChunkBody(Bytes::from(v));
            }
        }
        let err = verify_parts(parts).await;
        assert!(matches!(err, Err(CacheError::BadMessage(_))), "{err:?}");
    }

    #[tokio::test]
    async fn test_tampered_sig_ext_rejected() {
        let mut parts = signed_parts(b"sensitive data").await;
        for p in parts.iter_mut() {
            if let Part::ChunkHdr(c) = p {
                if !c.exts.is_empty() {
                    // Flip one base64 character of the signature.
                    let mut e = c.exts.clone().into_bytes();
                    let i = e.iter().position(|&b| b == b'"').unwrap() + 1;
                    e[i] = if e[i] == b'A' { b'B' } else { b'A' };
                    c.exts = String::from_utf8(e).unwrap();
                }
            }
        }
        let err = verify_parts(parts).await;
        assert!(matches!(err, Err(CacheError::BadMessage(_))), "{err:?}");
    }

    #[tokio::test]
    async fn test_truncated_body_rejected_at_end() {
        let parts = signed_parts(b"0123456789").await;
        // Drop everything after the first chunk body: missing final chunk
        // and trailer must fail the length check.
        let idx = parts
            .iter()
            .position(|p| matches!(p, Part::ChunkBody(_)))
            .unwrap();
        let cut: Vec<Part> = parts.into_iter().take(idx + 1).collect();
        // Body arrived (10 bytes) but no signature chunk followed: the
        // stream ends with buffered unverified data.
        let err = verify_parts(cut).await;
        assert!(matches!(err, Err(CacheError::BadMessage(_))), "{err:?}");
    }

    #[tokio::test]
    async fn test_output_reverifies() {
        // The verifier's output must itself pass verification.
        let parts = signed_parts(b"twice-checked").await;
        let out = verify_parts(parts).await.unwrap();
        let out2 = verify_parts(out).await.unwrap();
        let data: Vec<u8> = out2
            .iter()
            .filter_map(|p| p.as_chunk_body())
            .flat_map(|b| b.iter().copied())
            .collect();
        assert_eq!(data, b"twice-checked");
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-99/1000"),
            Some((0, 99, Some(1000)))
        );
        assert_eq!(parse_content_range("bytes 5-9/*"), Some((5, 9, None)));
        assert_eq!(parse_content_range("bytes 9-5/10"), None);
        assert_eq!(parse_content_range("chars 0-1/2"), None);
    }
}
