//! Integration-test crate; everything lives under `tests/`.
//!
//! Shared helpers for the end-to-end scenarios: the three-block test body
//! whose digests are pinned as literals, and part-stream builders.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use warren_cache::response::{ChunkHdr, Head, Part, PartReader, VecPartReader};
use warren_cache::sign::SigningReader;
use warren_cache::BLOCK_SIZE;
use warren_crypto::ed25519::SigningKey;

/// The corpus injection id.
pub const INJECTION_ID: &str = "d6076384-2295-462b-a047-fe2c9274e58d";

/// The corpus injection timestamp.
pub const INJECTION_TS: u64 = 1516048310;

/// Base64 SHA-256 of the corpus body, as pinned by the format spec.
pub const CORPUS_DIGEST: &str = "E4RswXyAONCaILm5T/ZezbHI87EKvKIdxURKxiVHwKE=";

/// Base64 SHA-512 of the corpus body's first block (also the first chain
/// digest, since `C[0] = D[0]`).
pub const CORPUS_BLOCK0_SHA512: &str =
    "aERfr5o+kpvR4ZH7xC0mBJ4QjqPUELDzjmzt14WmntxH2p3EQmATZODXMPoFiXaZL6KNI50Ve4WJf/x3ma4ieA==";

/// The corpus body: `"0123" x·65528 "4567" "89AB" x·65528 "CDEF" "abcd"`,
/// 131 076 bytes in three blocks.
pub fn corpus_body() -> Vec<u8> {
    let fill = BLOCK_SIZE - 8;
    let mut body = Vec::with_capacity(2 * BLOCK_SIZE + 4);
    body.extend_from_slice(b"0123");
    body.extend(std::iter::repeat(b'x').take(fill));
    body.extend_from_slice(b"4567");
    body.extend_from_slice(b"89AB");
    body.extend(std::iter::repeat(b'x').take(fill));
    body.extend_from_slice(b"CDEF");
    body.extend_from_slice(b"abcd");
    assert_eq!(body.len(), 131_076);
    body
}

/// The corpus signing key (deterministic for the test suite).
pub fn corpus_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// A plain origin-style response head.
pub fn origin_head() -> Head {
    let mut head = Head::new(200);
    head.fields.append("Date", "Mon, 15 Jan 2018 20:31:50 GMT");
    head.fields.append("Server", "Apache1");
    head.fields.append("Server", "Apache2");
    head.fields.append("Content-Type", "text/html");
    head.fields
        .append("Content-Disposition", "inline; filename=\"foo.html\"");
    head.set("Transfer-Encoding", "chunked");
    head
}

/// Sign `body` with the corpus parameters and collect the output parts.
pub async fn corpus_signed_parts(body: &[u8]) -> Vec<Part> {
    let source = VecPartReader::new([
        Part::Head(origin_head()),
        Part::ChunkHdr(ChunkHdr::new(body.len(), "")),
        Part::ChunkBody(Bytes::copy_from_slice(body)),
    ]);
    let mut signer = SigningReader::with_injection(
        source,
        "https://example.com/foo",
        INJECTION_ID,
        INJECTION_TS,
        corpus_key(),
    );
    drain(&mut signer).await
}

/// Drain any part reader.
pub async fn drain(reader: &mut (dyn PartReader + '_)) -> Vec<Part> {
    let cancel = CancellationToken::new();
    let mut parts = Vec::new();
    while let Some(p) = reader.read_part(&cancel).await.expect("read_part") {
        parts.push(p);
    }
    parts
}

/// Concatenated chunk-body bytes of a part list.
pub fn body_of(parts: &[Part]) -> Vec<u8> {
    parts
        .iter()
        .filter_map(|p| p.as_chunk_body())
        .flat_map(|b| b.iter().copied())
        .collect()
}
