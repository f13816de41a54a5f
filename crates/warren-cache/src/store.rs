//! The on-disk response store.
//!
//! Each entry is a directory `<hex[0..2]>/<hex[2..]>` of the lowercase
//! SHA-1 of its key, holding three files:
//!
//! - `head` — the signed head, framing removed, trailer merged in
//! - `body` — the raw concatenated block data
//! - `sigs` — one fixed-width record per block:
//!   `HEX16(offset) SP BASE64(signature) SP BASE64(data-digest) SP
//!   BASE64(previous-chain-digest) LF`, 284 bytes each, so record `i` sits
//!   at byte `284·i`
//!
//! Writes happen in a `tmp.`-prefixed sibling directory committed by
//! rename; `body` and `sigs` are append-only and flushed per record, so a
//! torn tail record after a crash is tolerated on read. An entry whose
//! `sigs` holds fewer records than the body has blocks is *incomplete*:
//! still readable up to its last signed block.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_crypto::ed25519::SIGNATURE_LEN;
use warren_crypto::sha::{sha1, Sha512, Sha512Digest};

use crate::chain::ChainHasher;
use crate::head::{BlockSigs, SignedHead, EXT_HASH, EXT_SIG, HDR_AVAIL_DATA, HDR_BSIGS, HDR_HTTP_STATUS};
use crate::response::{chunk_ext, ChunkHdr, Fields, Head, Part, PartReader};
use crate::{CacheError, Result};

const HEAD_FNAME: &str = "head";
const BODY_FNAME: &str = "body";
const SIGS_FNAME: &str = "sigs";

/// Temporary directories carry this prefix until committed.
const TMP_PREFIX: &str = "tmp.";

/// A temporary directory modified less than this long ago may still be
/// written to and is left alone by maintenance.
const RECENTLY_UPDATED_SECS: u64 = 10 * 60;

fn b64(data: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn b64_decode(s: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

/// One `sigs` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SigEntry {
    pub offset: u64,
    /// Base64 block signature (88 chars).
    pub signature: String,
    /// Base64 block data digest (88 chars).
    pub data_digest: String,
    /// Base64 chain digest of the previous block; empty for the first
    /// block (stored as the padding digest).
    pub prev_digest: String,
}

/// Fixed record width: offset, three Base64 fields, separators, newline.
pub(crate) const SIG_RECORD_LEN: usize = 16 + 1 + 88 + 1 + 88 + 1 + 88 + 1;

impl SigEntry {
    /// Base64 of 64 zero bytes, standing in for the chain digest before
    /// the first block.
    fn pad_digest() -> &'static str {
        static PAD: std::sync::OnceLock<String> = std::sync::OnceLock::new();
        PAD.get_or_init(|| b64([0u8; 64]))
    }

    fn line(&self) -> String {
        let prev = if self.prev_digest.is_empty() {
            Self::pad_digest()
        } else {
            &self.prev_digest
        };
        format!(
            "{:016x} {} {} {}\n",
            self.offset, self.signature, self.data_digest, prev
        )
    }

    fn parse(record: &[u8]) -> Result<SigEntry> {
        let malformed = || CacheError::BadMessage("malformed signature record".into());
        if record.len() != SIG_RECORD_LEN || record[SIG_RECORD_LEN - 1] != b'\n' {
            return Err(malformed());
        }
        let text = std::str::from_utf8(&record[..SIG_RECORD_LEN - 1]).map_err(|_| malformed())?;
        let mut fields = text.split(' ');
        let (offset_s, sig, dig, prev) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(o), Some(s), Some(d), Some(p), None) => (o, s, d, p),
            _ => return Err(malformed()),
        };
        if offset_s.len() != 16 || sig.len() != 88 || dig.len() != 88 || prev.len() != 88 {
            return Err(malformed());
        }
        let offset = u64::from_str_radix(offset_s, 16).map_err(|_| malformed())?;
        let b64_ok = |s: &str| s.bytes().all(|b| b.is_ascii_alphanumeric() || b"+/=".contains(&b));
        if !b64_ok(sig) || !b64_ok(dig) || !b64_ok(prev) {
            return Err(malformed());
        }
        Ok(SigEntry {
            offset,
            signature: sig.to_string(),
            data_digest: dig.to_string(),
            prev_digest: if prev == Self::pad_digest() {
                String::new()
            } else {
                prev.to_string()
            },
        })
    }

    /// The chunk extensions this record contributes when re-serving.
    fn chunk_exts(&self) -> String {
        let mut out = format!(";{EXT_SIG}=\"{}\"", self.signature);
        if !self.prev_digest.is_empty() {
            out.push_str(&format!(";{EXT_HASH}=\"{}\"", self.prev_digest));
        }
        out
    }
}

/// Entry directory for a key: `<root>/<hex[0..2]>/<hex[2..]>`.
fn path_from_key(root: &Path, key: &str) -> PathBuf {
    let digest = hex::encode(sha1(key));
    root.join(&digest[..2]).join(&digest[2..])
}

/// Streams one response into an entry directory, file by file.
pub struct StoreWriter {
    dir: PathBuf,
    head: Option<Head>,
    block_size: Option<usize>,
    headf: Option<fs::File>,
    bodyf: Option<fs::File>,
    sigsf: Option<fs::File>,
    byte_count: u64,
    block_count: u64,
    block_hash: Sha512,
    chain: ChainHasher,
}

impl StoreWriter {
    async fn create(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            head: None,
            block_size: None,
            headf: None,
            bodyf: None,
            sigsf: None,
            byte_count: 0,
            block_count: 0,
            block_hash: Sha512::new(),
            chain: ChainHasher::new(),
        })
    }

    /// Append one response part.
    pub async fn write_part(&mut self, part: Part, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(CacheError::OperationAborted);
        }
        match part {
            Part::Head(h) => self.write_head(h).await,
            Part::ChunkHdr(ch) => self.write_chunk_hdr(&ch).await,
            Part::ChunkBody(data) => self.write_body(&data).await,
            Part::Trailer(t) => self.write_trailer(t).await,
        }
    }

    async fn write_head(&mut self, head: Head) -> Result<()> {
        if self.headf.is_some() {
            return Err(CacheError::BadMessage("second head in stream".into()));
        }
        let bsigs = head
            .get(HDR_BSIGS)
            .and_then(BlockSigs::parse)
            .ok_or_else(|| {
                CacheError::InvalidArgument("head without block signature parameters".into())
            })?;
        self.block_size = Some(bsigs.size);

        // Stored heads carry no framing.
        let merged = SignedHead::merge(head, &Fields::new());
        let mut f = fs::File::create(self.dir.join(HEAD_FNAME)).await?;
        f.write_all(&merged.to_bytes()).await?;
        f.flush().await?;
        self.headf = Some(f);
        self.head = Some(merged);
        Ok(())
    }

    async fn write_chunk_hdr(&mut self, ch: &ChunkHdr) -> Result<()> {
        // Only chunk headers carrying a signature advance the record file;
        // the signer placed them at block boundaries.
        let Some(signature) = chunk_ext(&ch.exts, EXT_SIG) else {
            return Ok(());
        };
        let block_size = self
            .block_size
            .ok_or_else(|| CacheError::BadMessage("chunk before head".into()))? as u64;

        let offset = self.block_count * block_size;
        self.block_count += 1;
        if ch.size > 0 && self.byte_count != self.block_count * block_size {
            return Err(CacheError::InvalidArgument(
                "block signature not aligned to a block boundary".into(),
            ));
        }

        let data_digest: Sha512Digest = std::mem::take(&mut self.block_hash).finalize();
        let prev_digest = self.chain.prev_chained().map(b64).unwrap_or_default();
        self.chain.push_digest(0, data_digest); // offsets tracked separately

        let entry = SigEntry {
            offset,
            signature,
            data_digest: b64(data_digest),
            prev_digest,
        };

        if self.sigsf.is_none() {
            self.sigsf = Some(fs::File::create(self.dir.join(SIGS_FNAME)).await?);
        }
        let f = self.sigsf.as_mut().unwrap();
        f.write_all(entry.line().as_bytes()).await?;
        // One flush per record: a crash can tear at most the tail record.
        f.flush().await?;
        Ok(())
    }

    async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        if self.bodyf.is_none() {
            self.bodyf = Some(fs::File::create(self.dir.join(BODY_FNAME)).await?);
        }
        self.byte_count += data.len() as u64;
        self.block_hash.update(data);
        let f = self.bodyf.as_mut().unwrap();
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn write_trailer(&mut self, trailer: Fields) -> Result<()> {
        let Some(head) = self.head.take() else {
            return Err(CacheError::BadMessage("trailer before head".into()));
        };
        if trailer.is_empty() {
            self.head = Some(head);
            return Ok(());
        }
        let merged = SignedHead::merge(head, &trailer);
        let f = self.headf.as_mut().unwrap();
        f.set_len(0).await?;
        f.seek(std::io::SeekFrom::Start(0)).await?;
        f.write_all(&merged.to_bytes()).await?;
        f.flush().await?;
        self.head = Some(merged);
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        if self.headf.is_none() {
            return Err(CacheError::BadMessage("response without a head".into()));
        }
        if let Some(f) = self.bodyf.as_mut() {
            f.sync_data().await?;
        }
        if let Some(f) = self.sigsf.as_mut() {
            f.sync_data().await?;
        }
        Ok(())
    }
}

/// The response store rooted at one directory.
pub struct HttpStore {
    root: PathBuf,
}

impl HttpStore {
    /// Open (creating if needed) a store at `root`. The root is created
    /// with mode 0700: cached browsing history is private.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            fs::set_permissions(&root, perms).await?;
        }
        Ok(Self { root })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry directory for `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        path_from_key(&self.root, key)
    }

    /// Store the response streamed by `reader` under `key`.
    ///
    /// The entry is written to a temporary directory and committed by
    /// rename; an input stream that ends early yields a valid *incomplete*
    /// entry, while cancellation and I/O errors roll back.
    pub async fn store(
        &self,
        key: &str,
        reader: &mut (dyn PartReader + '_),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = self.entry_path(key);
        let parent = target.parent().unwrap().to_path_buf();
        fs::create_dir_all(&parent).await?;
        let tmp = parent.join(format!("{TMP_PREFIX}{:08x}", rand::random::<u32>()));

        let result = async {
            let mut writer = StoreWriter::create(tmp.clone()).await?;
            while let Some(part) = reader.read_part(cancel).await? {
                writer.write_part(part, cancel).await?;
            }
            writer.finish().await
        }
        .await;

        match result {
            Ok(()) => {
                // Last writer wins; rename over the previous entry.
                if fs::metadata(&target).await.is_ok() {
                    let _ = fs::remove_dir_all(&target).await;
                }
                fs::rename(&tmp, &target).await?;
                debug!(key, path = %target.display(), "stored response");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp).await;
                Err(e)
            }
        }
    }

    /// An incremental writer for `key`; commit with
    /// [`PendingEntry::commit`].
    pub async fn writer(&self, key: &str) -> Result<PendingEntry> {
        let target = self.entry_path(key);
        let parent = target.parent().unwrap().to_path_buf();
        fs::create_dir_all(&parent).await?;
        let tmp = parent.join(format!("{TMP_PREFIX}{:08x}", rand::random::<u32>()));
        Ok(PendingEntry {
            writer: Some(StoreWriter::create(tmp.clone()).await?),
            tmp,
            target,
        })
    }

    /// Full-entry reader.
    pub async fn reader(&self, key: &str) -> Result<StoreReader> {
        StoreReader::open(self.entry_path(key), None).await
    }

    /// Block-aligned range reader over `[first, last]` (inclusive bytes).
    pub async fn range_reader(&self, key: &str, first: u64, last: u64) -> Result<StoreReader> {
        if first > last {
            warn!(first, last, "inverted range boundaries");
            return Err(CacheError::InvalidSeek);
        }
        let dir = self.entry_path(key);
        let body_size = match fs::metadata(dir.join(BODY_FNAME)).await {
            Ok(m) => m.len(),
            Err(_) => {
                warn!("range requested for response with no stored data");
                return Err(CacheError::InvalidSeek);
            }
        };
        if first >= body_size || last >= body_size {
            warn!(first, last, body_size, "requested range goes beyond stored data");
            return Err(CacheError::InvalidSeek);
        }
        StoreReader::open(dir, Some((first, last + 1))).await
    }

    /// Head-only reader: the stored head plus `X-Ouinet-Avail-Data`.
    pub async fn head_reader(&self, key: &str) -> Result<HeadReader> {
        HeadReader::open(self.entry_path(key)).await
    }

    /// Load the signed hash list of a stored entry.
    pub async fn load_hash_list(&self, key: &str) -> Result<crate::hash_list::HashList> {
        crate::hash_list::load_from_dir(&self.entry_path(key)).await
    }

    /// Remove an entry.
    pub async fn remove(&self, key: &str) -> Result<()> {
        fs::remove_dir_all(self.entry_path(key)).await?;
        Ok(())
    }

    /// Walk all entries: malformed ones and stale temporaries are removed,
    /// and entries `keep` rejects are removed too.
    pub async fn for_each(
        &self,
        mut keep: impl FnMut(&SignedHead) -> bool + Send,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut outer = match fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(_) => return Ok(()),
        };
        while let Some(parent) = outer.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(CacheError::OperationAborted);
            }
            let parent_path = parent.path();
            if !parent.file_type().await?.is_dir() {
                warn!(path = %parent_path.display(), "found non-directory in store");
                continue;
            }
            let name = parent.file_name();
            let name = name.to_string_lossy();
            if name.len() != 2 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                warn!(path = %parent_path.display(), "found unknown directory in store");
                continue;
            }

            let mut inner = fs::read_dir(&parent_path).await?;
            while let Some(entry) = inner.next_entry().await? {
                if cancel.is_cancelled() {
                    return Err(CacheError::OperationAborted);
                }
                let path = entry.path();
                let fname = entry.file_name();
                let fname = fname.to_string_lossy().into_owned();

                if fname.starts_with(TMP_PREFIX) {
                    if !recently_updated(&path).await {
                        debug!(path = %path.display(), "removing stale temporary directory");
                        let _ = fs::remove_dir_all(&path).await;
                    }
                    continue;
                }
                if fname.len() != 38 || !fname.bytes().all(|b| b.is_ascii_hexdigit()) {
                    warn!(path = %path.display(), "found unknown directory in store");
                    continue;
                }

                match read_trusted_head(&path).await {
                    Ok(head) => {
                        if !keep(&head) {
                            let _ = fs::remove_dir_all(&path).await;
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "removing unreadable entry");
                        let _ = fs::remove_dir_all(&path).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Total bytes used by the store.
    pub async fn size(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut rd = match fs::read_dir(&dir).await {
                Ok(d) => d,
                Err(_) => continue,
            };
            while let Some(entry) = rd.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

async fn recently_updated(path: &Path) -> bool {
    for p in [
        path.to_path_buf(),
        path.join(HEAD_FNAME),
        path.join(BODY_FNAME),
        path.join(SIGS_FNAME),
    ] {
        if let Ok(meta) = fs::metadata(&p).await {
            if let Ok(modified) = meta.modified() {
                if let Ok(age) = modified.elapsed() {
                    if age.as_secs() <= RECENTLY_UPDATED_SECS {
                        return true;
                    }
                }
            }
        }
    }
    false
}

pub(crate) async fn read_trusted_head(dir: &Path) -> Result<SignedHead> {
    let raw = fs::read(dir.join(HEAD_FNAME)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CacheError::NotFound
        } else {
            CacheError::Io(e)
        }
    })?;
    SignedHead::from_trusted_source(Head::parse(&raw)?)
}

/// An in-progress store entry; committed explicitly, rolled back on drop.
pub struct PendingEntry {
    writer: Option<StoreWriter>,
    tmp: PathBuf,
    target: PathBuf,
}

impl PendingEntry {
    /// Append one part.
    pub async fn write_part(&mut self, part: Part, cancel: &CancellationToken) -> Result<()> {
        self.writer
            .as_mut()
            .expect("write after commit")
            .write_part(part, cancel)
            .await
    }

    /// Flush and rename the entry into place.
    pub async fn commit(mut self) -> Result<()> {
        let writer = self.writer.take().unwrap();
        writer.finish().await?;
        if fs::metadata(&self.target).await.is_ok() {
            let _ = fs::remove_dir_all(&self.target).await;
        }
        fs::rename(&self.tmp, &self.target).await?;
        Ok(())
    }
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if self.writer.is_some() {
            let tmp = self.tmp.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = fs::remove_dir_all(&tmp).await;
                });
            } else {
                let _ = std::fs::remove_dir_all(&tmp);
            }
        }
    }
}

/// Reader over a stored entry, re-chunking the body into signed blocks.
pub struct StoreReader {
    sigsf: Option<fs::File>,
    bodyf: Option<fs::File>,
    head: Option<SignedHead>,
    /// Aligned, clipped byte range `[begin, end)` to serve.
    range: Option<(u64, u64)>,
    requested_range: Option<(u64, u64)>,
    block_size: usize,
    data_size: Option<u64>,
    block_offset: u64,
    head_done: bool,
    body_done: bool,
    done: bool,
    next_chunk_exts: String,
    next_chunk_body: Option<Bytes>,
}

impl StoreReader {
    async fn open(dir: PathBuf, range: Option<(u64, u64)>) -> Result<StoreReader> {
        let head = read_trusted_head(&dir).await?;
        let sigsf = fs::File::open(dir.join(SIGS_FNAME)).await.ok();
        let bodyf = fs::File::open(dir.join(BODY_FNAME)).await.ok();
        Ok(StoreReader {
            sigsf,
            bodyf,
            block_size: head.block_size(),
            data_size: head.data_size(),
            head: Some(head),
            range: None,
            requested_range: range,
            block_offset: 0,
            head_done: false,
            body_done: false,
            done: false,
            next_chunk_exts: String::new(),
            next_chunk_body: None,
        })
    }

    async fn produce_head(&mut self) -> Result<Head> {
        let signed = self.head.take().unwrap();
        if self.data_size.is_none() {
            warn!(uri = signed.uri(), "loading incomplete stored response");
        }
        let mut head = signed.into_head();

        if let Some((first, last_excl)) = self.requested_range {
            let bs = self.block_size as u64;
            let mut begin = (first / bs) * bs;
            let mut end = (last_excl.saturating_sub(1) / bs + 1) * bs;
            let body_size = match self.bodyf.as_ref() {
                Some(f) => f.metadata().await?.len(),
                None => 0,
            };
            if end > body_size {
                end = body_size;
            }
            if begin > end {
                begin = end;
            }

            let orig_status = head.status;
            head.set_status(206);
            head.set(HDR_HTTP_STATUS, orig_status.to_string());
            let total = self
                .data_size
                .map(|s| s.to_string())
                .unwrap_or_else(|| "*".to_string());
            head.set(
                "Content-Range",
                format!("bytes {}-{}/{}", begin, end.saturating_sub(1), total),
            );
            self.range = Some((begin, end));

            // Seek straight to the range: body to the byte, sigs to the
            // record (fixed-width records make this O(1)).
            let start_block = begin / bs;
            if let Some(f) = self.bodyf.as_mut() {
                f.seek(std::io::SeekFrom::Start(begin)).await?;
            }
            if let Some(f) = self.sigsf.as_mut() {
                f.seek(std::io::SeekFrom::Start(start_block * SIG_RECORD_LEN as u64))
                    .await?;
            }
            self.block_offset = begin;
        }

        head.set("Transfer-Encoding", "chunked");
        Ok(head)
    }

    async fn next_sig_entry(&mut self) -> Result<Option<SigEntry>> {
        let Some(f) = self.sigsf.as_mut() else {
            return Ok(None);
        };
        let mut record = vec![0u8; SIG_RECORD_LEN];
        let mut filled = 0;
        while filled < SIG_RECORD_LEN {
            let n = f.read(&mut record[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < SIG_RECORD_LEN {
            // Torn tail record from an interrupted writer.
            warn!("truncated signature record ignored");
            return Ok(None);
        }
        SigEntry::parse(&record).map(Some)
    }

    async fn next_block(&mut self) -> Result<Bytes> {
        let Some(f) = self.bodyf.as_mut() else {
            return Ok(Bytes::new());
        };
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = f.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn next_chunk_part(&mut self) -> Result<Option<Part>> {
        if let Some(body) = self.next_chunk_body.take() {
            return Ok(Some(Part::ChunkBody(body)));
        }

        let sig_entry = self.next_sig_entry().await?;
        // Without a fresh record, a pending extension may still need a
        // carrier chunk; with neither, the body is exhausted.
        if sig_entry.is_none() && self.next_chunk_exts.is_empty() {
            return Ok(None);
        }

        let block = self.next_block().await?;
        if let Some(e) = &sig_entry {
            if e.offset != self.block_offset {
                return Err(CacheError::BadMessage(format!(
                    "data block offset mismatch: {} != {}",
                    e.offset, self.block_offset
                )));
            }
        }
        self.block_offset += block.len() as u64;

        if let Some((_, end)) = self.range {
            if self.block_offset >= end {
                // Range served: stop reading further blocks.
                self.sigsf = None;
                self.bodyf = None;
            }
        }

        if block.is_empty() && self.next_chunk_exts.is_empty() {
            if let Some(e) = sig_entry {
                // Empty body with a signature: last chunk carries it.
                return Ok(Some(Part::ChunkHdr(ChunkHdr::new(0, e.chunk_exts()))));
            }
            return Ok(None);
        }

        let hdr = ChunkHdr::new(block.len(), std::mem::take(&mut self.next_chunk_exts));
        self.next_chunk_exts = sig_entry.map(|e| e.chunk_exts()).unwrap_or_default();
        if !block.is_empty() && !self.next_chunk_exts.is_empty() {
            self.next_chunk_body = Some(block);
        } else if !block.is_empty() && self.next_chunk_exts.is_empty() {
            // Data beyond the last signed block is withheld.
            self.next_chunk_body = None;
        }
        Ok(Some(Part::ChunkHdr(hdr)))
    }
}

#[async_trait]
impl PartReader for StoreReader {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        if cancel.is_cancelled() {
            return Err(CacheError::OperationAborted);
        }
        if self.done {
            return Ok(None);
        }

        if !self.head_done {
            let head = self.produce_head().await?;
            self.head_done = true;
            return Ok(Some(Part::Head(head)));
        }

        if !self.body_done {
            let Some(part) = self.next_chunk_part().await? else {
                // Incomplete entry: end without a final chunk or trailer.
                self.done = true;
                return Ok(None);
            };
            if let Part::ChunkHdr(ch) = &part {
                self.body_done = ch.size == 0;
            }
            return Ok(Some(part));
        }

        self.done = true;
        Ok(Some(Part::Trailer(Fields::new())))
    }
}

/// Head-only reader: one part, the head with `X-Ouinet-Avail-Data`.
pub struct HeadReader {
    head: Option<Head>,
}

impl HeadReader {
    async fn open(dir: PathBuf) -> Result<HeadReader> {
        let signed = read_trusted_head(&dir).await?;
        let block_size = signed.block_size() as u64;
        let data_size = signed.data_size();

        let sigs_len = fs::metadata(dir.join(SIGS_FNAME)).await.map(|m| m.len()).ok();
        let body_size = fs::metadata(dir.join(BODY_FNAME)).await.map(|m| m.len()).ok();

        let size_str = data_size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "*".to_string());
        let records = sigs_len.map(|l| l / SIG_RECORD_LEN as u64).unwrap_or(0);
        let avail = match (records, body_size) {
            (0, _) | (_, None) | (_, Some(0)) => format!("bytes */{size_str}"),
            (records, Some(body_size)) => {
                let last_sig_offset = (records - 1) * block_size;
                let end = if body_size > last_sig_offset {
                    last_sig_offset + (body_size - last_sig_offset).min(block_size)
                } else {
                    (body_size / block_size) * block_size
                };
                if end == 0 {
                    format!("bytes */{size_str}")
                } else {
                    format!("bytes 0-{}/{size_str}", end - 1)
                }
            }
        };

        let mut head = signed.into_head();
        head.set(HDR_AVAIL_DATA, avail);
        Ok(HeadReader { head: Some(head) })
    }
}

#[async_trait]
impl PartReader for HeadReader {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        if cancel.is_cancelled() {
            return Err(CacheError::OperationAborted);
        }
        Ok(self.head.take().map(Part::Head))
    }
}

/// Iterate the `sigs` records of an entry directory.
pub(crate) async fn read_sig_entries(dir: &Path) -> Result<Vec<SigEntry>> {
    let raw = fs::read(dir.join(SIGS_FNAME)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CacheError::NotFound
        } else {
            CacheError::Io(e)
        }
    })?;
    let mut out = Vec::with_capacity(raw.len() / SIG_RECORD_LEN);
    for record in raw.chunks(SIG_RECORD_LEN) {
        if record.len() < SIG_RECORD_LEN {
            warn!("truncated signature record ignored");
            break;
        }
        out.push(SigEntry::parse(record)?);
    }
    Ok(out)
}

pub(crate) fn decode_signature(entry: &SigEntry) -> Result<[u8; SIGNATURE_LEN]> {
    b64_decode(&entry.signature)
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| CacheError::BadMessage("undecodable stored signature".into()))
}

pub(crate) fn decode_digest(s: &str) -> Result<Sha512Digest> {
    b64_decode(s)
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| CacheError::BadMessage("undecodable stored digest".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::VecPartReader;
    use crate::sign::SigningReader;
    use crate::verify::VerifyingReader;
    use crate::BLOCK_SIZE;
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

    /// The corpus body: three blocks, the last short.
    fn corpus_body() -> Vec<u8> {
        let fill = BLOCK_SIZE - 8;
        let mut body = Vec::new();
        body.extend_from_slice(b"0123");
        body.extend(std::iter::repeat(b'x').take(fill));
        body.extend_from_slice(b"4567");
        body.extend_from_slice(b"89AB");
        body.extend(std::iter::repeat(b'x').take(fill));
        body.extend_from_slice(b"CDEF");
        body.extend_from_slice(b"abcd");
        body
    }

    async fn signed_parts(body: &[u8]) -> Vec<Part> {
        let src = VecPartReader::new([
            Part::Head(plain_head()),
            Part::ChunkHdr(ChunkHdr::new(body.len(), "")),
            Part::ChunkBody(Bytes::copy_from_slice(body)),
        ]);
        let mut signer = SigningReader::with_injection(
            src,
            "https://example.com/foo",
            "d6076384-2295-462b-a047-fe2c9274e58d",
            1516048310,
            key(),
        );
        let mut parts = Vec::new();
        while let Some(p) = signer.read_part(&cancel()).await.unwrap() {
            parts.push(p);
        }
        parts
    }

    async fn store_with(body: &[u8]) -> (tempfile::TempDir, HttpStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = HttpStore::open(tmp.path().join("cache")).await.unwrap();
        let parts = signed_parts(body).await;
        let mut reader = VecPartReader::new(parts);
        store
            .store("https://example.com/foo", &mut reader, &cancel())
            .await
            .unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn test_store_layout() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let dir = store.entry_path("https://example.com/foo");
        assert!(dir.join("head").exists());
        assert!(dir.join("body").exists());
        assert!(dir.join("sigs").exists());

        let body = fs::read(dir.join("body")).await.unwrap();
        assert_eq!(body, corpus_body());

        let sigs = fs::read(dir.join("sigs")).await.unwrap();
        assert_eq!(sigs.len(), 3 * SIG_RECORD_LEN, "one record per block");
        let entries = read_sig_entries(&dir).await.unwrap();
        assert_eq!(entries[0].offset, 0);
        assert_eq!(entries[1].offset, BLOCK_SIZE as u64);
        assert_eq!(entries[2].offset, 2 * BLOCK_SIZE as u64);
        assert!(entries[0].prev_digest.is_empty());
        assert!(!entries[1].prev_digest.is_empty());

        // The head keeps the merged trailer, not the framing.
        let head = read_trusted_head(&dir).await.unwrap();
        assert_eq!(head.data_size(), Some(corpus_body().len() as u64));
        assert!(!head.head().chunked());
    }

    #[tokio::test]
    async fn test_reader_roundtrip_verifies() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let reader = store.reader("https://example.com/foo").await.unwrap();
        let mut verifier = VerifyingReader::new(reader, key().public_key());

        let mut data = Vec::new();
        let mut chunk_exts = Vec::new();
        while let Some(part) = verifier.read_part(&cancel()).await.unwrap() {
            match part {
                Part::ChunkBody(b) => data.extend_from_slice(&b),
                Part::ChunkHdr(c) => chunk_exts.push(c.exts),
                _ => {}
            }
        }
        assert_eq!(data, corpus_body());
        // First chunk unsigned, all later ones signed.
        assert!(chunk_exts[0].is_empty());
        for e in &chunk_exts[1..] {
            assert!(e.contains("ouisig="), "{e}");
        }
    }

    #[tokio::test]
    async fn test_missing_entry_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = HttpStore::open(tmp.path().join("cache")).await.unwrap();
        assert!(matches!(
            store.reader("https://nothing/").await,
            Err(CacheError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_range_reader_alignment() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let size = corpus_body().len() as u64;

        // Mid-block boundaries expand to blocks 0..=1.
        let mut r = store
            .range_reader("https://example.com/foo", 32_768, 98_308)
            .await
            .unwrap();
        let c = cancel();
        let head = r.read_part(&c).await.unwrap().unwrap();
        let head = head.as_head().unwrap();
        assert_eq!(head.status, 206);
        assert_eq!(head.get(HDR_HTTP_STATUS), Some("200"));
        assert_eq!(
            head.get("Content-Range"),
            Some(format!("bytes 0-131071/{size}").as_str())
        );

        let mut sizes = Vec::new();
        let mut exts = Vec::new();
        while let Some(p) = r.read_part(&c).await.unwrap() {
            if let Part::ChunkHdr(ch) = p {
                sizes.push(ch.size);
                exts.push(ch.exts);
            }
        }
        assert_eq!(sizes, vec![BLOCK_SIZE, BLOCK_SIZE, 0]);
        assert!(exts[0].is_empty());
        assert!(exts[1].contains("ouisig=") && !exts[1].contains("ouihash="));
        // The final chunk carries the chain hash for suffix verification.
        assert!(exts[2].contains("ouisig=") && exts[2].contains("ouihash="));
    }

    #[tokio::test]
    async fn test_range_reader_tail_has_ouihash_on_first_signed_chunk() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        // Last block only.
        let first = 2 * BLOCK_SIZE as u64;
        let mut r = store
            .range_reader("https://example.com/foo", first + 1, first + 2)
            .await
            .unwrap();
        let c = cancel();
        let head = r.read_part(&c).await.unwrap().unwrap();
        assert_eq!(
            head.as_head().unwrap().get("Content-Range"),
            Some(format!("bytes {first}-{}/131076", 131075).as_str())
        );
        let mut exts = Vec::new();
        while let Some(p) = r.read_part(&c).await.unwrap() {
            if let Part::ChunkHdr(ch) = p {
                exts.push(ch.exts);
            }
        }
        // One data chunk plus the final: the final carries sig + hash.
        assert_eq!(exts.len(), 2);
        assert!(exts[0].is_empty());
        assert!(exts[1].contains("ouisig=") && exts[1].contains("ouihash="));
    }

    #[tokio::test]
    async fn test_range_out_of_bounds() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let err = store
            .range_reader("https://example.com/foo", 0, 42_000_000)
            .await;
        assert!(matches!(err, Err(CacheError::InvalidSeek)));
        let err = store.range_reader("https://example.com/foo", 9, 3).await;
        assert!(matches!(err, Err(CacheError::InvalidSeek)));
    }

    #[tokio::test]
    async fn test_incomplete_store_readable_prefix() {
        // Input ends after the second block's signature: the store keeps
        // two records and the reader serves exactly two verified blocks.
        let full = signed_parts(&corpus_body()).await;
        // Keep: head, hdr0, body0, hdr1(S0), body1, hdr2(S1) and stop.
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

        let tmp = tempfile::tempdir().unwrap();
        let store = HttpStore::open(tmp.path().join("cache")).await.unwrap();
        let mut reader = VecPartReader::new(cut);
        store
            .store("https://example.com/foo", &mut reader, &cancel())
            .await
            .unwrap();

        let dir = store.entry_path("https://example.com/foo");
        let entries = read_sig_entries(&dir).await.unwrap();
        assert_eq!(entries.len(), 2);

        // Reader: two blocks, a carrier chunk for the second signature,
        // EOF, no trailer.
        let mut r = store.reader("https://example.com/foo").await.unwrap();
        let c = cancel();
        let mut parts = Vec::new();
        while let Some(p) = r.read_part(&c).await.unwrap() {
            parts.push(p);
        }
        assert!(parts.iter().all(|p| !matches!(p, Part::Trailer(_))));
        let data: usize = parts
            .iter()
            .filter_map(|p| p.as_chunk_body())
            .map(|b| b.len())
            .sum();
        assert_eq!(data, 2 * BLOCK_SIZE);

        // Head reader advertises the signed prefix.
        let mut hr = store.head_reader("https://example.com/foo").await.unwrap();
        let head = hr.read_part(&c).await.unwrap().unwrap();
        assert_eq!(
            head.as_head().unwrap().get(HDR_AVAIL_DATA),
            Some("bytes 0-131071/*")
        );
        assert!(hr.read_part(&c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_head_reader_complete() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let mut hr = store.head_reader("https://example.com/foo").await.unwrap();
        let head = hr.read_part(&cancel()).await.unwrap().unwrap();
        let head = head.as_head().unwrap();
        assert_eq!(head.get(HDR_AVAIL_DATA), Some("bytes 0-131075/131076"));
    }

    #[tokio::test]
    async fn test_torn_sig_record_tolerated() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let dir = store.entry_path("https://example.com/foo");
        // Append half a record, as an interrupted writer would.
        let mut raw = fs::read(dir.join("sigs")).await.unwrap();
        let half: Vec<u8> = raw[..SIG_RECORD_LEN / 2].to_vec();
        raw.extend_from_slice(&half);
        fs::write(dir.join("sigs"), raw).await.unwrap();

        let mut r = store.reader("https://example.com/foo").await.unwrap();
        let c = cancel();
        let mut blocks = 0;
        while let Some(p) = r.read_part(&c).await.unwrap() {
            if p.as_chunk_body().is_some() {
                blocks += 1;
            }
        }
        assert_eq!(blocks, 3);
    }

    #[tokio::test]
    async fn test_store_overwrites() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let mut reader = VecPartReader::new(signed_parts(b"tiny").await);
        store
            .store("https://example.com/foo", &mut reader, &cancel())
            .await
            .unwrap();
        let dir = store.entry_path("https://example.com/foo");
        let body = fs::read(dir.join("body")).await.unwrap();
        assert_eq!(body, b"tiny");
    }

    #[tokio::test]
    async fn test_for_each_removes_rejected() {
        let (_tmp, store) = store_with(&corpus_body()).await;
        let c = cancel();
        store.for_each(|_| false, &c).await.unwrap();
        assert!(matches!(
            store.reader("https://example.com/foo").await,
            Err(CacheError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_sig_entry_roundtrip() {
        let e = SigEntry {
            offset: 0x10000,
            signature: "A".repeat(88),
            data_digest: "B".repeat(88),
            prev_digest: "C".repeat(88),
        };
        let line = e.line();
        assert_eq!(line.len(), SIG_RECORD_LEN);
        assert_eq!(SigEntry::parse(line.as_bytes()).unwrap(), e);

        // First-block records store the pad digest and parse back empty.
        let first = SigEntry {
            offset: 0,
            signature: "A".repeat(88),
            data_digest: "B".repeat(88),
            prev_digest: String::new(),
        };
        let line = first.line();
        assert!(line.contains(SigEntry::pad_digest()));
        assert_eq!(SigEntry::parse(line.as_bytes()).unwrap(), first);
    }
}
