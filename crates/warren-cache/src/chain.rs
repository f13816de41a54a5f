//! Block digests chained across a response body.
//!
//! Block `i` has data digest `D[i] = SHA-512(data[i])`. The chain is
//! `C[0] = D[0]`, `C[i] = SHA-512(C[i-1] ‖ D[i])`, so holding `C[i-1]`
//! allows verifying any contiguous suffix of blocks without the preceding
//! data. Block signatures cover the chain digest together with the
//! injection id and the block's byte offset.

use warren_crypto::ed25519::{PublicKey, Signature, SigningKey};
use warren_crypto::sha::{sha512, Sha512, Sha512Digest};

/// A block's position and chain digest, ready to sign or verify.
#[derive(Clone, Copy, Debug)]
pub struct ChainHash {
    /// Byte offset of the block's first byte.
    pub offset: u64,
    /// `C[i]` for this block.
    pub digest: Sha512Digest,
}

impl ChainHash {
    /// The byte string a block signature covers:
    /// `injection_id ‖ 0x00 ‖ decimal-offset ‖ 0x00 ‖ C[i]`.
    pub fn signing_string(injection_id: &str, offset: u64, digest: &Sha512Digest) -> Vec<u8> {
        let mut out = Vec::with_capacity(injection_id.len() + 24 + digest.len());
        out.extend_from_slice(injection_id.as_bytes());
        out.push(0);
        out.extend_from_slice(offset.to_string().as_bytes());
        out.push(0);
        out.extend_from_slice(digest);
        out
    }

    /// Sign this block.
    pub fn sign(&self, key: &SigningKey, injection_id: &str) -> Signature {
        key.sign(Self::signing_string(injection_id, self.offset, &self.digest))
    }

    /// Verify a block signature.
    pub fn verify(&self, key: &PublicKey, injection_id: &str, signature: &Signature) -> bool {
        key.verify(
            Self::signing_string(injection_id, self.offset, &self.digest),
            signature,
        )
    }
}

/// Rolling chain state while blocks stream past.
#[derive(Clone, Default)]
pub struct ChainHasher {
    offset: u64,
    prev_chained: Option<Sha512Digest>,
}

impl ChainHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a chain mid-stream (range requests): the offset of the next
    /// block and, unless it is the first, the preceding chain digest.
    pub fn resume(offset: u64, prev_chained: Option<Sha512Digest>) -> Self {
        Self {
            offset,
            prev_chained,
        }
    }

    /// The chain digest of the last folded block, if any.
    pub fn prev_chained(&self) -> Option<&Sha512Digest> {
        self.prev_chained.as_ref()
    }

    /// Fold the next block's data digest into the chain. Returns the
    /// block's offset and chain digest.
    pub fn push_digest(&mut self, data_size: usize, data_digest: Sha512Digest) -> ChainHash {
        let mut h = Sha512::new();
        if let Some(prev) = &self.prev_chained {
            h.update(prev);
        }
        h.update(data_digest);
        let chained = h.finalize();

        let at = self.offset;
        self.offset += data_size as u64;
        self.prev_chained = Some(chained);
        ChainHash {
            offset: at,
            digest: chained,
        }
    }

    /// Fold the next block's raw data into the chain.
    pub fn push_block(&mut self, data: &[u8]) -> ChainHash {
        self.push_digest(data.len(), sha512(data))
    }
}

/// Re-quantises an arbitrarily chopped byte stream into fixed-size
/// blocks. Holds at most one block.
pub struct BlockBuffer {
    block_size: usize,
    buf: Vec<u8>,
}

impl BlockBuffer {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            buf: Vec::with_capacity(block_size),
        }
    }

    /// Append input bytes.
    pub fn put(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take one full block if enough input has accumulated.
    pub fn take_full(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < self.block_size {
            return None;
        }
        let rest = self.buf.split_off(self.block_size);
        Some(std::mem::replace(&mut self.buf, rest))
    }

    /// Take whatever is left; only valid once the input has ended.
    pub fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_buffer_quantises() {
        let mut b = BlockBuffer::new(4);
        b.put(b"abc");
        assert!(b.take_full().is_none());
        b.put(b"defgh");
        assert_eq!(b.take_full().as_deref(), Some(&b"abcd"[..]));
        assert_eq!(b.take_full().as_deref(), Some(&b"efgh"[..]));
        assert!(b.take_full().is_none());
        b.put(b"xy");
        assert_eq!(b.take_rest(), b"xy");
        assert!(b.is_empty());
    }

    #[test]
    fn test_chain_layout() {
        let b0 = vec![1u8; 10];
        let b1 = vec![2u8; 10];

        let mut hasher = ChainHasher::new();
        let c0 = hasher.push_block(&b0);
        let c1 = hasher.push_block(&b1);

        assert_eq!(c0.offset, 0);
        assert_eq!(c1.offset, 10);

        // C[0] = SHA512(D[0]), C[1] = SHA512(C[0] || D[1]).
        let d0 = sha512(&b0);
        let d1 = sha512(&b1);
        assert_eq!(c0.digest, sha512(d0));
        let mut h = Sha512::new();
        h.update(c0.digest);
        h.update(d1);
        assert_eq!(c1.digest, h.finalize());
    }

    #[test]
    fn test_resume_matches_continuous() {
        let b0 = vec![3u8; 8];
        let b1 = vec![4u8; 8];

        let mut full = ChainHasher::new();
        let c0 = full.push_block(&b0);
        let c1_full = full.push_block(&b1);

        let mut resumed = ChainHasher::resume(8, Some(c0.digest));
        let c1_res = resumed.push_block(&b1);
        assert_eq!(c1_full.offset, c1_res.offset);
        assert_eq!(c1_full.digest, c1_res.digest);
    }

    #[test]
    fn test_sign_verify() {
        let key = SigningKey::from_bytes(&[11u8; 32]);
        let mut hasher = ChainHasher::new();
        let ch = hasher.push_block(b"block zero");

        let sig = ch.sign(&key, "test-injection");
        assert!(ch.verify(&key.public_key(), "test-injection", &sig));
        assert!(!ch.verify(&key.public_key(), "other-injection", &sig));
    }

    #[test]
    fn test_signing_string_offset_is_decimal() {
        let s = ChainHash::signing_string("id", 65536, &[0u8; 64]);
        let nul = s.iter().position(|&b| b == 0).unwrap();
        let second_nul = s[nul + 1..].iter().position(|&b| b == 0).unwrap() + nul + 1;
        assert_eq!(&s[nul + 1..second_nul], b"65536");
    }
}
