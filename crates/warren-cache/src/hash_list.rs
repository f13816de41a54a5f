//! Signed hash lists: a compact manifest of a response's block digests.
//!
//! Wire format: the magic line, a newline-terminated raw Ed25519
//! signature, then the raw 64-byte block data digests concatenated:
//!
//! ```text
//! OUINET_HASH_LIST_V1 LF SIG LF D[0] D[1] ... D[N-1]
//! ```
//!
//! The signature is the last block's signature, covering
//! `injection_id ‖ 0 ‖ last_offset ‖ 0 ‖ C[N-1]`, so the whole list is
//! verified by refolding the chain from the digests. A peer holding a
//! verified hash list can check any single block it receives from anyone,
//! which is what makes multi-peer block racing safe.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use warren_crypto::ed25519::{PublicKey, Signature, SIGNATURE_LEN};
use warren_crypto::sha::Sha512Digest;

use crate::chain::ChainHasher;
use crate::head::SignedHead;
use crate::response::{Head, Part, PartReader};
use crate::store;
use crate::{CacheError, Result};

/// First line of a serialised hash list.
pub const MAGIC: &str = "OUINET_HASH_LIST_V1";

/// Upper bound on the accepted number of digests (1 TiB of body).
const MAX_BLOCKS: usize = 16 * 1024 * 1024;

/// A verified (or verifiable) block digest manifest.
#[derive(Clone, Debug)]
pub struct HashList {
    pub signed_head: SignedHead,
    pub signature: Signature,
    pub block_hashes: Vec<Sha512Digest>,
}

impl HashList {
    /// Verify the signature over the refolded digest chain.
    pub fn verify(&self) -> bool {
        if self.block_hashes.is_empty() {
            return false;
        }
        let block_size = self.signed_head.block_size() as u64;
        let mut chain = ChainHasher::new();
        let mut last = None;
        for (i, digest) in self.block_hashes.iter().enumerate() {
            let size = if i + 1 < self.block_hashes.len() {
                block_size as usize
            } else {
                0 // the last block's size does not matter for offsets
            };
            last = Some(chain.push_digest(size, *digest));
        }
        let last = last.unwrap();
        last.verify(
            &self.signed_head.public_key(),
            self.signed_head.injection_id(),
            &self.signature,
        )
    }

    /// The digest of block `index`, if the list covers it.
    pub fn block_digest(&self, index: usize) -> Option<&Sha512Digest> {
        self.block_hashes.get(index)
    }

    /// Number of blocks covered.
    pub fn blocks(&self) -> usize {
        self.block_hashes.len()
    }

    /// Check one raw block against the list.
    pub fn verify_block(&self, index: usize, data: &[u8]) -> bool {
        match self.block_digest(index) {
            Some(expected) => &warren_crypto::sha::sha512(data) == expected,
            None => false,
        }
    }

    /// Serialise the list body (everything after the head).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(MAGIC.len() + 2 + SIGNATURE_LEN + self.block_hashes.len() * 64);
        out.extend_from_slice(MAGIC.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&self.signature);
        out.push(b'\n');
        for d in &self.block_hashes {
            out.extend_from_slice(d);
        }
        out
    }

    /// Parse a list body serialised by [`HashList::to_bytes`].
    pub fn from_bytes(signed_head: SignedHead, data: &[u8]) -> Result<HashList> {
        let bad = |m: &str| CacheError::BadMessage(format!("hash list: {m}"));

        let magic_end = MAGIC.len();
        if data.len() < magic_end + 1 + SIGNATURE_LEN + 1 || &data[..magic_end] != MAGIC.as_bytes()
        {
            return Err(bad("bad magic"));
        }
        if data[magic_end] != b'\n' {
            return Err(bad("bad magic terminator"));
        }
        let sig_start = magic_end + 1;
        let sig_end = sig_start + SIGNATURE_LEN;
        let signature: Signature = data[sig_start..sig_end].try_into().unwrap();
        if data.get(sig_end) != Some(&b'\n') {
            return Err(bad("bad signature terminator"));
        }

        let hashes = &data[sig_end + 1..];
        if hashes.is_empty() || hashes.len() % 64 != 0 {
            return Err(bad("digest area not a multiple of 64 bytes"));
        }
        if hashes.len() / 64 > MAX_BLOCKS {
            return Err(bad("too many digests"));
        }
        let block_hashes = hashes
            .chunks_exact(64)
            .map(|c| <Sha512Digest>::try_from(c).unwrap())
            .collect();

        let list = HashList {
            signed_head,
            signature,
            block_hashes,
        };
        if !list.verify() {
            return Err(bad("signature verification failed"));
        }
        Ok(list)
    }

    /// Read a hash-list response (verified head plus list body) from a
    /// part stream.
    pub async fn load(
        reader: &mut (dyn PartReader + '_),
        pk: &PublicKey,
        cancel: &CancellationToken,
    ) -> Result<HashList> {
        let Some(Part::Head(head)) = reader.read_part(cancel).await? else {
            return Err(CacheError::BadMessage("hash list without head".into()));
        };
        let signed_head = SignedHead::verify_and_create(head, pk)?;

        let mut body = Vec::new();
        while let Some(part) = reader.read_part(cancel).await? {
            if let Part::ChunkBody(data) = part {
                body.extend_from_slice(&data);
                if body.len() > MAGIC.len() + 2 + SIGNATURE_LEN + MAX_BLOCKS * 64 {
                    return Err(CacheError::BadMessage("hash list too large".into()));
                }
            }
        }
        Self::from_bytes(signed_head, &body)
    }
}

/// Reconstruct the hash list of a stored entry from its `sigs` records.
pub(crate) async fn load_from_dir(dir: &Path) -> Result<HashList> {
    let signed_head = store::read_trusted_head(dir).await?;
    let entries = store::read_sig_entries(dir).await?;
    let Some(last) = entries.last() else {
        return Err(CacheError::BadMessage("entry with no signed blocks".into()));
    };

    let signature = store::decode_signature(last)?;
    let block_hashes = entries
        .iter()
        .map(|e| store::decode_digest(&e.data_digest))
        .collect::<Result<Vec<_>>>()?;

    Ok(HashList {
        signed_head,
        signature,
        block_hashes,
    })
}

/// Build the [`Head`] of a hash-list response for `list`: the stored
/// signed head re-framed for a chunked hash-list payload.
pub fn response_head(list: &HashList) -> Head {
    let mut head = list.signed_head.head().clone();
    head.set("Transfer-Encoding", "chunked");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{ChunkHdr, VecPartReader};
    use crate::sign::SigningReader;
    use bytes::Bytes;
    use warren_crypto::ed25519::SigningKey;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    async fn signed_entry(body: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let mut h = Head::new(200);
        h.set("Transfer-Encoding", "chunked");
        let src = VecPartReader::new([
            Part::Head(h),
            Part::ChunkHdr(ChunkHdr::new(body.len(), "")),
            Part::ChunkBody(Bytes::copy_from_slice(body)),
        ]);
        let mut signer = SigningReader::with_injection(src, "https://x/", "hl-id", 50, key());

        let tmp = tempfile::tempdir().unwrap();
        let store = crate::HttpStore::open(tmp.path().join("cache")).await.unwrap();
        store.store("k", &mut signer, &cancel()).await.unwrap();
        let dir = store.entry_path("k");
        (tmp, dir)
    }

    #[tokio::test]
    async fn test_load_and_verify() {
        let body: Vec<u8> = (0..crate::BLOCK_SIZE * 2 + 100).map(|i| (i % 7) as u8).collect();
        let (_tmp, dir) = signed_entry(&body).await;

        let list = load_from_dir(&dir).await.unwrap();
        assert_eq!(list.blocks(), 3);
        assert!(list.verify());

        // Per-block verification against raw data.
        assert!(list.verify_block(0, &body[..crate::BLOCK_SIZE]));
        assert!(!list.verify_block(0, &body[1..crate::BLOCK_SIZE]));
        assert!(list.verify_block(2, &body[2 * crate::BLOCK_SIZE..]));
    }

    #[tokio::test]
    async fn test_bytes_roundtrip() {
        let body = vec![5u8; 1000];
        let (_tmp, dir) = signed_entry(&body).await;
        let list = load_from_dir(&dir).await.unwrap();

        let bytes = list.to_bytes();
        assert!(bytes.starts_with(MAGIC.as_bytes()));
        let parsed = HashList::from_bytes(list.signed_head.clone(), &bytes).unwrap();
        assert_eq!(parsed.block_hashes, list.block_hashes);
        assert_eq!(parsed.signature, list.signature);
    }

    #[tokio::test]
    async fn test_tampered_digest_rejected() {
        let body = vec![5u8; 1000];
        let (_tmp, dir) = signed_entry(&body).await;
        let list = load_from_dir(&dir).await.unwrap();

        let mut bytes = list.to_bytes();
        let tail = bytes.len() - 1;
        bytes[tail] ^= 1;
        assert!(HashList::from_bytes(list.signed_head.clone(), &bytes).is_err());
    }
}
