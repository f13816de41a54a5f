//! Store round trips over the pinned corpus: full reads, ranges, and
//! incomplete entries.
//!
//! Exercises:
//! 1. `store` then `reader` reproduces the three chunks with `ouisig`
//!    extensions on every chunk after the first, and re-verifies.
//! 2. A mid-block range expands to whole blocks with the right
//!    `Content-Range` and carries `ouihash` where suffix verification
//!    needs it.
//! 3. A writer cut off after two signed blocks leaves two records; the
//!    entry reads back as exactly those blocks with no trailer, and the
//!    head reader reports the available prefix.

use tokio_util::sync::CancellationToken;

use warren_cache::response::{Part, VecPartReader};
use warren_cache::verify::VerifyingReader;
use warren_cache::{HttpStore, PartReader, BLOCK_SIZE};
use warren_integration_tests::*;

const KEY: &str = "https://example.com/foo";

fn cancel() -> CancellationToken {
    CancellationToken::new()
}

async fn store_corpus(store: &HttpStore, parts: Vec<Part>) {
    let mut reader = VecPartReader::new(parts);
    store.store(KEY, &mut reader, &cancel()).await.unwrap();
}

#[tokio::test]
async fn store_then_read_reverifies() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();
    store_corpus(&store, corpus_signed_parts(&corpus_body()).await).await;

    let reader = store.reader(KEY).await.unwrap();
    let mut verifier = VerifyingReader::new(reader, corpus_key().public_key());
    let out = drain(&mut verifier).await;
    assert_eq!(body_of(&out), corpus_body());
}

#[tokio::test]
async fn reader_chunk_extension_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();
    store_corpus(&store, corpus_signed_parts(&corpus_body()).await).await;

    let mut reader = store.reader(KEY).await.unwrap();
    let parts = drain(&mut reader).await;

    let hdrs: Vec<(usize, String)> = parts
        .iter()
        .filter_map(|p| p.as_chunk_hdr())
        .map(|c| (c.size, c.exts.clone()))
        .collect();
    assert_eq!(hdrs.len(), 4);
    assert_eq!(hdrs[0].0, BLOCK_SIZE);
    assert!(hdrs[0].1.is_empty(), "first chunk carries no signature");
    assert!(hdrs[1].1.contains("ouisig=\""));
    // The chain hash joins in once there is a previous chain digest.
    assert!(!hdrs[1].1.contains("ouihash=\""));
    assert!(hdrs[2].1.contains("ouisig=\"") && hdrs[2].1.contains("ouihash=\""));
    assert_eq!(hdrs[3].0, 0);
    assert!(hdrs[3].1.contains("ouisig=\"") && hdrs[3].1.contains("ouihash=\""));

    // Trailer fields were merged into the head at store time.
    assert!(parts.last().unwrap().as_trailer().unwrap().is_empty());
    let head = parts[0].as_head().unwrap();
    assert_eq!(head.get("X-Ouinet-Data-Size"), Some("131076"));
}

#[tokio::test]
async fn range_covers_whole_blocks() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();
    store_corpus(&store, corpus_signed_parts(&corpus_body()).await).await;

    // Mid-block range across blocks 0 and 1.
    let mut reader = store.range_reader(KEY, 32_768, 98_308).await.unwrap();
    let parts = drain(&mut reader).await;

    let head = parts[0].as_head().unwrap();
    assert_eq!(head.status, 206);
    assert_eq!(head.get("X-Ouinet-HTTP-Status"), Some("200"));
    assert_eq!(head.get("Content-Range"), Some("bytes 0-131071/131076"));

    let body = body_of(&parts);
    assert_eq!(body, &corpus_body()[..2 * BLOCK_SIZE]);

    // The partial output verifies on its own.
    let mut verifier = VerifyingReader::new(VecPartReader::new(parts), corpus_key().public_key());
    let out = drain(&mut verifier).await;
    assert_eq!(body_of(&out), &corpus_body()[..2 * BLOCK_SIZE]);
}

#[tokio::test]
async fn range_tail_verifies_standalone() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();
    store_corpus(&store, corpus_signed_parts(&corpus_body()).await).await;

    // Just the last (short) block; verification needs the ouihash chain
    // link carried on its signature chunk.
    let first = 2 * BLOCK_SIZE as u64;
    let mut reader = store.range_reader(KEY, first, first + 3).await.unwrap();
    let parts = drain(&mut reader).await;

    let head = parts[0].as_head().unwrap();
    assert_eq!(head.get("Content-Range"), Some("bytes 131072-131075/131076"));

    let mut verifier = VerifyingReader::new(VecPartReader::new(parts), corpus_key().public_key());
    let out = drain(&mut verifier).await;
    assert_eq!(body_of(&out), b"abcd");
}

#[tokio::test]
async fn range_outside_data_is_invalid_seek() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();
    store_corpus(&store, corpus_signed_parts(&corpus_body()).await).await;

    assert!(matches!(
        store.range_reader(KEY, 0, 42_000_000).await,
        Err(warren_cache::CacheError::InvalidSeek)
    ));
}

#[tokio::test]
async fn incomplete_writer_leaves_readable_prefix() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();

    // Cut the signed stream after block 1's data and block 1's signature
    // carrier (the third chunk header), before block 2's data.
    let full = corpus_signed_parts(&corpus_body()).await;
    let mut cut = Vec::new();
    let mut hdrs = 0;
    for p in full {
        if matches!(p, Part::ChunkHdr(_)) {
            hdrs += 1;
            if hdrs == 4 {
                break;
            }
        }
        cut.push(p);
    }
    store_corpus(&store, cut).await;

    // Two records on disk.
    let sigs = tokio::fs::read(store.entry_path(KEY).join("sigs"))
        .await
        .unwrap();
    assert_eq!(sigs.len() / 284, 2);

    // The reader serves blocks 0 and 1, a signature carrier for block 1,
    // and no trailer.
    let mut reader = store.reader(KEY).await.unwrap();
    let parts = drain(&mut reader).await;
    assert!(parts.iter().all(|p| !matches!(p, Part::Trailer(_))));
    assert_eq!(body_of(&parts), &corpus_body()[..2 * BLOCK_SIZE]);

    // The head reader reports the signed prefix with unknown total size.
    let mut head_reader = store.head_reader(KEY).await.unwrap();
    let parts = drain(&mut head_reader).await;
    assert_eq!(parts.len(), 1);
    assert_eq!(
        parts[0].as_head().unwrap().get("X-Ouinet-Avail-Data"),
        Some("bytes 0-131071/*")
    );
}

#[tokio::test]
async fn hash_list_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = HttpStore::open(tmp.path()).await.unwrap();
    store_corpus(&store, corpus_signed_parts(&corpus_body()).await).await;

    let list = store.load_hash_list(KEY).await.unwrap();
    assert_eq!(list.blocks(), 3);
    assert!(list.verify());
    let body = corpus_body();
    assert!(list.verify_block(0, &body[..BLOCK_SIZE]));
    assert!(list.verify_block(2, &body[2 * BLOCK_SIZE..]));
    assert!(!list.verify_block(1, &body[..BLOCK_SIZE]));
}
