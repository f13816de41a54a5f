//! HTTP/1.1 response parts and the chunked-transfer codec.
//!
//! Responses flow through the cache as a sequence of [`Part`]s: one
//! [`Head`], then alternating [`ChunkHdr`]/chunk-body pairs, then an
//! optional [`Trailer`](Fields). Chunk extensions are first-class here:
//! block signatures travel in them, so the stock HTTP stacks (which drop
//! extensions on both ends) are unusable and the codec is explicit.
//!
//! Header fields keep their received spelling and order; lookups are
//! case-insensitive. Repeated fields are preserved as repeats.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::{CacheError, Result};

/// Hard cap on a head, one header line, or one chunk-size line.
const MAX_LINE: usize = 16 * 1024;

/// Hard cap on total head size.
const MAX_HEAD: usize = 64 * 1024;

/// An ordered multimap of header fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Fields {
    entries: Vec<(String, String)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// First value of `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of `name` with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    /// Append a field, keeping existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Drop all values of `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Keep only fields `keep` approves of.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.entries.retain(|(n, v)| keep(n, v));
    }

    fn parse_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CacheError::BadMessage(format!("malformed header line: {line:?}")))?;
        if name.is_empty() || name.contains(' ') {
            return Err(CacheError::BadMessage(format!(
                "malformed header name: {name:?}"
            )));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        for (n, v) in &self.entries {
            out.extend_from_slice(n.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(v.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

impl FromIterator<(String, String)> for Fields {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A response head: status line plus header fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Head {
    pub status: u16,
    pub reason: String,
    pub fields: Fields,
}

impl Head {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            fields: Fields::new(),
        }
    }

    /// Set the status and refresh the canonical reason phrase.
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.reason = reason_phrase(status).to_string();
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.fields.set(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.remove(name);
    }

    /// Whether the head declares chunked transfer encoding.
    pub fn chunked(&self) -> bool {
        self.fields
            .get_all("Transfer-Encoding")
            .any(|v| v.to_ascii_lowercase().split(',').any(|t| t.trim() == "chunked"))
    }

    /// Serialise as `HTTP/1.1 <status> <reason>` CRLF headers CRLF CRLF.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        self.fields.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Parse a serialised head (terminated by an empty line).
    pub fn parse(data: &[u8]) -> Result<Head> {
        let text = std::str::from_utf8(data)
            .map_err(|_| CacheError::BadMessage("head is not UTF-8".into()))?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .ok_or_else(|| CacheError::BadMessage("empty head".into()))?;
        let mut sl = status_line.splitn(3, ' ');
        let version = sl.next().unwrap_or_default();
        if !version.starts_with("HTTP/1.") {
            return Err(CacheError::BadMessage(format!(
                "unsupported version: {version:?}"
            )));
        }
        let status: u16 = sl
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CacheError::BadMessage("malformed status".into()))?;
        let reason = sl.next().unwrap_or_default().to_string();

        let mut fields = Fields::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (n, v) = Fields::parse_line(line)?;
            fields.append(n, v);
        }
        Ok(Head {
            status,
            reason,
            fields,
        })
    }
}

/// A chunk header: payload size plus raw extension string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkHdr {
    pub size: usize,
    /// Raw extensions, including the leading `;` of each, e.g.
    /// `;ouisig="..."`.
    pub exts: String,
}

impl ChunkHdr {
    pub fn new(size: usize, exts: impl Into<String>) -> Self {
        Self {
            size,
            exts: exts.into(),
        }
    }

    fn to_line(&self) -> String {
        format!("{:x}{}\r\n", self.size, self.exts)
    }

    fn parse(line: &str) -> Result<ChunkHdr> {
        let (size_part, exts) = match line.find(';') {
            Some(i) => (&line[..i], &line[i..]),
            None => (line, ""),
        };
        let size = usize::from_str_radix(size_part.trim(), 16)
            .map_err(|_| CacheError::BadMessage(format!("malformed chunk size: {line:?}")))?;
        Ok(ChunkHdr {
            size,
            exts: exts.to_string(),
        })
    }
}

/// Parse chunk extensions into `(name, value)` pairs.
///
/// Values may be quoted; a comma inside a quoted value is rejected, the
/// same restriction the signature-header parser imposes.
pub fn parse_chunk_exts(exts: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut rest = exts;
    while let Some(stripped) = rest.strip_prefix(';') {
        // Find the end of this extension: the next ';' outside quotes.
        let mut in_quotes = false;
        let mut end = stripped.len();
        for (i, c) in stripped.char_indices() {
            match c {
                '"' => in_quotes = !in_quotes,
                ',' if in_quotes => {
                    return Err(CacheError::BadMessage(
                        "comma in quoted chunk extension".into(),
                    ))
                }
                ';' if !in_quotes => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let item = &stripped[..end];
        rest = &stripped[end..];

        let (name, value) = match item.split_once('=') {
            Some((n, v)) => {
                let v = v.trim();
                let v = v
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(v);
                (n.trim(), v)
            }
            None => (item.trim(), ""),
        };
        if name.is_empty() {
            return Err(CacheError::BadMessage("empty chunk extension name".into()));
        }
        out.push((name.to_string(), value.to_string()));
    }
    if !rest.is_empty() {
        return Err(CacheError::BadMessage(format!(
            "garbage in chunk extensions: {rest:?}"
        )));
    }
    Ok(out)
}

/// Get one chunk extension value by name.
pub fn chunk_ext(exts: &str, name: &str) -> Option<String> {
    parse_chunk_exts(exts)
        .ok()?
        .into_iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v)
}

/// One piece of a response stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Part {
    Head(Head),
    ChunkHdr(ChunkHdr),
    /// The full payload of one chunk.
    ChunkBody(Bytes),
    Trailer(Fields),
}

impl Part {
    pub fn as_head(&self) -> Option<&Head> {
        match self {
            Part::Head(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_chunk_hdr(&self) -> Option<&ChunkHdr> {
        match self {
            Part::ChunkHdr(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_chunk_body(&self) -> Option<&Bytes> {
        match self {
            Part::ChunkBody(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_trailer(&self) -> Option<&Fields> {
        match self {
            Part::Trailer(t) => Some(t),
            _ => None,
        }
    }
}

/// Anything that yields response parts in order.
#[async_trait]
pub trait PartReader: Send {
    /// The next part, or `None` at (possibly premature) end of stream.
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>>;
}

#[async_trait]
impl<T: PartReader + ?Sized> PartReader for &mut T {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        (**self).read_part(cancel).await
    }
}

#[async_trait]
impl<T: PartReader + ?Sized> PartReader for Box<T> {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        (**self).read_part(cancel).await
    }
}

/// A [`PartReader`] over a preloaded part list; test and replay helper.
pub struct VecPartReader {
    parts: std::collections::VecDeque<Part>,
}

impl VecPartReader {
    pub fn new(parts: impl IntoIterator<Item = Part>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl PartReader for VecPartReader {
    async fn read_part(&mut self, _cancel: &CancellationToken) -> Result<Option<Part>> {
        Ok(self.parts.pop_front())
    }
}

enum ReadState {
    Head,
    ChunkHdr,
    ChunkBody { remaining: usize },
    Trailer,
    Done,
}

/// Incremental response parser over any byte stream.
pub struct ResponseReader<R> {
    input: BufReader<R>,
    state: ReadState,
}

impl<R: AsyncRead + Unpin + Send> ResponseReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: BufReader::new(input),
            state: ReadState::Head,
        }
    }

    /// Recover the underlying stream (e.g. to reuse a connection).
    pub fn into_inner(self) -> R {
        self.input.into_inner()
    }

    /// Prepare for the next response on the same connection (keep-alive).
    pub fn reset(&mut self) {
        self.state = ReadState::Head;
    }

    async fn read_line(&mut self, cancel: &CancellationToken) -> Result<Option<String>> {
        let mut line = Vec::new();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::OperationAborted),
            r = self.input.read_until(b'\n', &mut line) => r?,
        };
        if n == 0 {
            return Ok(None); // EOF
        }
        if line.len() > MAX_LINE {
            return Err(CacheError::BadMessage("line too long".into()));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| CacheError::BadMessage("non-UTF-8 line".into()))
    }

    async fn read_head(&mut self, cancel: &CancellationToken) -> Result<Option<Head>> {
        let Some(status_line) = self.read_line(cancel).await? else {
            return Ok(None); // clean EOF before any response
        };
        let mut raw = status_line.into_bytes();
        raw.extend_from_slice(b"\r\n");
        loop {
            let line = self
                .read_line(cancel)
                .await?
                .ok_or_else(|| CacheError::BadMessage("EOF inside head".into()))?;
            if line.is_empty() {
                raw.extend_from_slice(b"\r\n");
                break;
            }
            raw.extend_from_slice(line.as_bytes());
            raw.extend_from_slice(b"\r\n");
            if raw.len() > MAX_HEAD {
                return Err(CacheError::BadMessage("head too large".into()));
            }
        }
        Head::parse(&raw).map(Some)
    }

    async fn read_fields(&mut self, cancel: &CancellationToken) -> Result<Fields> {
        let mut fields = Fields::new();
        loop {
            let Some(line) = self.read_line(cancel).await? else {
                // Trailers may legitimately be absent at EOF.
                return Ok(fields);
            };
            if line.is_empty() {
                return Ok(fields);
            }
            let (n, v) = Fields::parse_line(&line)?;
            fields.append(n, v);
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> PartReader for ResponseReader<R> {
    async fn read_part(&mut self, cancel: &CancellationToken) -> Result<Option<Part>> {
        loop {
            match self.state {
                ReadState::Head => {
                    let Some(head) = self.read_head(cancel).await? else {
                        self.state = ReadState::Done;
                        return Ok(None);
                    };
                    if !head.chunked() {
                        return Err(CacheError::BadMessage(
                            "only chunked responses are supported".into(),
                        ));
                    }
                    self.state = ReadState::ChunkHdr;
                    return Ok(Some(Part::Head(head)));
                }
                ReadState::ChunkHdr => {
                    let Some(line) = self.read_line(cancel).await? else {
                        // Truncated stream; tolerated, verification layers
                        // decide whether that is acceptable.
                        self.state = ReadState::Done;
                        return Ok(None);
                    };
                    let hdr = ChunkHdr::parse(&line)?;
                    self.state = if hdr.size == 0 {
                        ReadState::Trailer
                    } else {
                        ReadState::ChunkBody {
                            remaining: hdr.size,
                        }
                    };
                    return Ok(Some(Part::ChunkHdr(hdr)));
                }
                ReadState::ChunkBody { remaining } => {
                    let mut data = vec![0u8; remaining];
                    let read = tokio::select! {
                        _ = cancel.cancelled() => return Err(CacheError::OperationAborted),
                        r = self.input.read_exact(&mut data) => r,
                    };
                    if read.is_err() {
                        self.state = ReadState::Done;
                        return Ok(None); // truncated chunk body
                    }
                    // Consume the CRLF after the chunk payload.
                    let mut crlf = [0u8; 2];
                    let _ = tokio::select! {
                        _ = cancel.cancelled() => return Err(CacheError::OperationAborted),
                        r = self.input.read_exact(&mut crlf) => r,
                    };
                    self.state = ReadState::ChunkHdr;
                    return Ok(Some(Part::ChunkBody(Bytes::from(data))));
                }
                ReadState::Trailer => {
                    let fields = self.read_fields(cancel).await?;
                    self.state = ReadState::Done;
                    return Ok(Some(Part::Trailer(fields)));
                }
                ReadState::Done => return Ok(None),
            }
        }
    }
}

/// Serialise one part onto a byte stream.
pub async fn write_part<W: AsyncWrite + Unpin>(out: &mut W, part: &Part) -> Result<()> {
    match part {
        Part::Head(h) => out.write_all(&h.to_bytes()).await?,
        Part::ChunkHdr(c) => out.write_all(c.to_line().as_bytes()).await?,
        Part::ChunkBody(b) => {
            out.write_all(b).await?;
            out.write_all(b"\r\n").await?;
        }
        Part::Trailer(t) => {
            let mut buf = Vec::new();
            t.write_to(&mut buf);
            buf.extend_from_slice(b"\r\n");
            out.write_all(&buf).await?;
        }
    }
    Ok(())
}

/// Drain `reader`, serialising every part onto `out`.
pub async fn flush_response<W: AsyncWrite + Unpin>(
    reader: &mut (dyn PartReader + '_),
    out: &mut W,
    cancel: &CancellationToken,
) -> Result<()> {
    while let Some(part) = reader.read_part(cancel).await? {
        write_part(out, &part).await?;
    }
    out.flush().await?;
    Ok(())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[test]
    fn test_head_roundtrip() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nServer: a\r\nServer: b\r\n\r\n";
        let head = Head::parse(raw).unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.get("content-type"), Some("text/html"));
        assert_eq!(head.fields.get_all("Server").count(), 2);
        assert_eq!(head.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_chunk_hdr_parse() {
        let h = ChunkHdr::parse("10000;ouisig=\"abc\"").unwrap();
        assert_eq!(h.size, 0x10000);
        assert_eq!(h.exts, ";ouisig=\"abc\"");
        assert!(ChunkHdr::parse("zz").is_err());
    }

    #[test]
    fn test_chunk_ext_tokenizer() {
        let exts = ";ouisig=\"s0+/=\";ouihash=\"h0\"";
        let parsed = parse_chunk_exts(exts).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("ouisig".to_string(), "s0+/=".to_string()),
                ("ouihash".to_string(), "h0".to_string()),
            ]
        );
        assert_eq!(chunk_ext(exts, "ouisig").as_deref(), Some("s0+/="));
        assert_eq!(chunk_ext(exts, "missing"), None);
    }

    #[test]
    fn test_chunk_ext_comma_in_quotes_rejected() {
        assert!(parse_chunk_exts(";x=\"a,b\"").is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            4;foo=\"bar\"\r\nbody\r\n0;last=\"x\"\r\nX-Trail: 1\r\n\r\n";
        let mut r = ResponseReader::new(&wire[..]);
        let c = cancel();

        let head = r.read_part(&c).await.unwrap().unwrap();
        assert_eq!(head.as_head().unwrap().status, 200);

        let ch = r.read_part(&c).await.unwrap().unwrap();
        assert_eq!(ch.as_chunk_hdr().unwrap().size, 4);
        let cb = r.read_part(&c).await.unwrap().unwrap();
        assert_eq!(&cb.as_chunk_body().unwrap()[..], b"body");

        let last = r.read_part(&c).await.unwrap().unwrap();
        assert_eq!(last.as_chunk_hdr().unwrap().size, 0);
        assert_eq!(last.as_chunk_hdr().unwrap().exts, ";last=\"x\"");

        let trailer = r.read_part(&c).await.unwrap().unwrap();
        assert_eq!(trailer.as_trailer().unwrap().get("X-Trail"), Some("1"));

        assert!(r.read_part(&c).await.unwrap().is_none());

        // Re-serialise and reparse: identical parts.
        let mut out = Vec::new();
        let mut r2 = ResponseReader::new(&wire[..]);
        flush_response(&mut r2, &mut out, &c).await.unwrap();
        assert_eq!(out, wire.to_vec());
    }

    #[tokio::test]
    async fn test_truncated_stream_tolerated() {
        // Head plus one full chunk, then EOF mid-way.
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nbody\r\n";
        let mut r = ResponseReader::new(&wire[..]);
        let c = cancel();
        assert!(r.read_part(&c).await.unwrap().unwrap().as_head().is_some());
        assert!(r.read_part(&c).await.unwrap().unwrap().as_chunk_hdr().is_some());
        assert!(r.read_part(&c).await.unwrap().unwrap().as_chunk_body().is_some());
        assert!(r.read_part(&c).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_chunked_rejected() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody";
        let mut r = ResponseReader::new(&wire[..]);
        assert!(matches!(
            r.read_part(&cancel()).await,
            Err(CacheError::BadMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_read() {
        let wire = b"HTTP/1.1 200 OK\r\n";
        let mut r = ResponseReader::new(&wire[..]);
        let c = cancel();
        c.cancel();
        assert!(matches!(
            r.read_part(&c).await,
            Err(CacheError::OperationAborted)
        ));
    }
}
