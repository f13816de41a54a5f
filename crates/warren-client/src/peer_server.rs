//! The serving loop: answering cache requests from other peers.
//!
//! One incoming uTP stream carries a sequence of requests in lockstep:
//!
//! - `GET <uri>` — the full stored response
//! - `GET <uri>` with `Range: bytes=a-b` — the block-aligned range
//! - `GET <uri>` with `X-Ouinet-Hash-List: true` — the signed hash list
//!
//! Responses are the store readers' part streams. A missing entry yields
//! `404`, a range outside the stored data `416` with
//! `X-Ouinet-Avail-Data`. After serving an incomplete entry (a response
//! with no trailer) the connection closes, since the peer cannot tell
//! where that response ends otherwise.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_cache::head::{HDR_AVAIL_DATA, HDR_VERSION};
use warren_cache::response::{write_part, ChunkHdr, Fields, Head, Part, PartReader};
use warren_cache::{hash_list, CacheError, HttpStore, PROTOCOL_VERSION};
use warren_transport::UtpStream;

use crate::{ClientError, Result};

/// Request header asking for the hash list instead of the body.
pub const HDR_HASH_LIST: &str = "X-Ouinet-Hash-List";

/// A parsed peer request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRequest {
    pub target: String,
    pub range: Option<(u64, u64)>,
    pub hash_list: bool,
}

impl PeerRequest {
    /// Serialise for sending.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = format!("GET {} HTTP/1.1\r\n{HDR_VERSION}: {PROTOCOL_VERSION}\r\n", self.target);
        if let Some((first, last)) = self.range {
            out.push_str(&format!("Range: bytes={first}-{last}\r\n"));
        }
        if self.hash_list {
            out.push_str(&format!("{HDR_HASH_LIST}: true\r\n"));
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Read one request off the wire. `None` on clean EOF before a request.
pub async fn read_request<R: AsyncRead + Unpin>(
    input: &mut BufReader<R>,
    cancel: &CancellationToken,
) -> Result<Option<PeerRequest>> {
    let mut request_line = String::new();
    let n = tokio::select! {
        _ = cancel.cancelled() => return Err(ClientError::OperationAborted),
        r = input.read_line(&mut request_line) => r?,
    };
    if n == 0 {
        return Ok(None);
    }
    let mut pieces = request_line.trim_end().splitn(3, ' ');
    let method = pieces.next().unwrap_or_default();
    let target = pieces.next().unwrap_or_default().to_string();
    if method != "GET" || target.is_empty() {
        return Err(ClientError::BadMessage(format!(
            "malformed request line: {request_line:?}"
        )));
    }

    let mut range = None;
    let mut hash_list = false;
    loop {
        let mut line = String::new();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::OperationAborted),
            r = input.read_line(&mut line) => r?,
        };
        if n == 0 {
            return Err(ClientError::BadMessage("EOF inside request head".into()));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ClientError::BadMessage(format!("malformed header: {line:?}")));
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("Range") {
            range = parse_range(value);
        } else if name.eq_ignore_ascii_case(HDR_HASH_LIST) {
            hash_list = value.eq_ignore_ascii_case("true");
        }
    }
    Ok(Some(PeerRequest {
        target,
        range,
        hash_list,
    }))
}

/// Parse `bytes=a-b`; open-ended and suffix forms are not served.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (a, b) = rest.split_once('-')?;
    let first: u64 = a.trim().parse().ok()?;
    let last: u64 = b.trim().parse().ok()?;
    (first <= last).then_some((first, last))
}

/// Serve requests on one accepted stream until it closes.
pub async fn serve(stream: UtpStream, store: Arc<HttpStore>, cancel: CancellationToken) {
    let remote = stream.remote_addr();
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut input = BufReader::new(read_half);

    loop {
        let request = match read_request(&mut input, &cancel).await {
            Ok(Some(r)) => r,
            Ok(None) => return,
            Err(e) => {
                debug!(%remote, error = %e, "dropping peer after bad request");
                return;
            }
        };
        debug!(%remote, target = %request.target, range = ?request.range, hash_list = request.hash_list, "peer request");

        let complete = match serve_one(&request, &store, &mut write_half, &cancel).await {
            Ok(complete) => complete,
            Err(e) => {
                warn!(%remote, error = %e, "error serving peer");
                return;
            }
        };
        if !complete {
            // The response had no trailer; only closing marks its end.
            return;
        }
    }
}

/// Serve one request; returns whether the response was self-delimiting.
async fn serve_one<W: AsyncWrite + Unpin>(
    request: &PeerRequest,
    store: &HttpStore,
    out: &mut W,
    cancel: &CancellationToken,
) -> Result<bool> {
    if request.hash_list {
        return match store.load_hash_list(&request.target).await {
            Ok(list) => {
                let head = hash_list::response_head(&list);
                let body = list.to_bytes();
                write_part(out, &Part::Head(head)).await?;
                write_part(out, &Part::ChunkHdr(ChunkHdr::new(body.len(), ""))).await?;
                write_part(out, &Part::ChunkBody(Bytes::from(body))).await?;
                write_part(out, &Part::ChunkHdr(ChunkHdr::new(0, ""))).await?;
                write_part(out, &Part::Trailer(Fields::new())).await?;
                out.flush().await?;
                Ok(true)
            }
            Err(CacheError::NotFound) | Err(CacheError::BadMessage(_)) => {
                write_empty(out, 404, Fields::new()).await?;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        };
    }

    let reader = match request.range {
        Some((first, last)) => store.range_reader(&request.target, first, last).await,
        None => store.reader(&request.target).await,
    };

    match reader {
        Ok(mut reader) => {
            let mut complete = false;
            while let Some(part) = reader.read_part(cancel).await? {
                if matches!(part, Part::Trailer(_)) {
                    complete = true;
                }
                write_part(out, &part).await?;
            }
            out.flush().await?;
            Ok(complete)
        }
        Err(CacheError::NotFound) => {
            write_empty(out, 404, Fields::new()).await?;
            Ok(true)
        }
        Err(CacheError::InvalidSeek) => {
            // Tell the peer what is available instead.
            let mut fields = Fields::new();
            if let Ok(mut hr) = store.head_reader(&request.target).await {
                if let Ok(Some(Part::Head(h))) = hr.read_part(cancel).await {
                    if let Some(avail) = h.get(HDR_AVAIL_DATA) {
                        fields.set(HDR_AVAIL_DATA, avail);
                    }
                }
            }
            write_empty(out, 416, fields).await?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// A complete chunked response with no body.
async fn write_empty<W: AsyncWrite + Unpin>(out: &mut W, status: u16, fields: Fields) -> Result<()> {
    let mut head = Head::new(status);
    head.fields = fields;
    head.set("Transfer-Encoding", "chunked");
    write_part(out, &Part::Head(head)).await?;
    write_part(out, &Part::ChunkHdr(ChunkHdr::new(0, ""))).await?;
    write_part(out, &Part::Trailer(Fields::new())).await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let r = PeerRequest {
            target: "https://example.com/foo".into(),
            range: Some((5, 9)),
            hash_list: false,
        };
        let bytes = r.to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET https://example.com/foo HTTP/1.1\r\n"));
        assert!(text.contains("Range: bytes=5-9\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_request() {
        let wire = b"GET https://x/ HTTP/1.1\r\nX-Ouinet-Version: 5\r\nX-Ouinet-Hash-List: true\r\n\r\n";
        let mut input = BufReader::new(&wire[..]);
        let r = read_request(&mut input, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(r.target, "https://x/");
        assert!(r.hash_list);
        assert_eq!(r.range, None);
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let mut input = BufReader::new(&b""[..]);
        assert!(read_request(&mut input, &CancellationToken::new())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-99"), Some((0, 99)));
        assert_eq!(parse_range("bytes=9-5"), None);
        assert_eq!(parse_range("bytes=-5"), None);
        assert_eq!(parse_range("items=0-1"), None);
    }
}
