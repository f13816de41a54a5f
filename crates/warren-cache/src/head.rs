//! Signed response heads and draft-cavage HTTP signatures.
//!
//! A signed head carries the cache-protocol headers
//! (`X-Ouinet-Version/URI/Injection/BSigs`), an initial signature
//! `X-Ouinet-Sig0` over the head itself, and declares a trailer with the
//! final signature `X-Ouinet-Sig1` that additionally covers the body size
//! and digest.
//!
//! Signatures follow the "Signing HTTP Messages" draft with the
//! `(response-status)` and `(created)` pseudo-headers: header names are
//! lowercased, values trimmed, repeated fields folded with `", "`, and the
//! signing string is the covered `name: value` lines joined by newlines.
//!
//! Framing headers (`Content-Length`, `Transfer-Encoding`, `Trailer`) are
//! never covered: re-framing a response must not break its signatures.

use base64::Engine as _;
use tracing::{debug, warn};

use warren_crypto::ed25519::{PublicKey, SigningKey, SIGNATURE_LEN};
use warren_crypto::sha::Sha256Digest;

use crate::response::{Fields, Head};
use crate::{CacheError, Result, BLOCK_SIZE, PROTOCOL_VERSION};

/// `X-Ouinet-Version`: protocol version of the injection.
pub const HDR_VERSION: &str = "X-Ouinet-Version";
/// `X-Ouinet-URI`: the absolute URI this response was injected for.
pub const HDR_URI: &str = "X-Ouinet-URI";
/// `X-Ouinet-Injection`: `id=<uuid>,ts=<epoch-seconds>`.
pub const HDR_INJECTION: &str = "X-Ouinet-Injection";
/// `X-Ouinet-BSigs`: block signature parameters.
pub const HDR_BSIGS: &str = "X-Ouinet-BSigs";
/// Prefix of the numbered signature headers (`X-Ouinet-Sig0`, ...).
pub const HDR_SIG_PREFIX: &str = "X-Ouinet-Sig";
/// `X-Ouinet-Data-Size`: signed body length (framing-independent).
pub const HDR_DATA_SIZE: &str = "X-Ouinet-Data-Size";
/// `X-Ouinet-HTTP-Status`: original status of a re-framed response.
pub const HDR_HTTP_STATUS: &str = "X-Ouinet-HTTP-Status";
/// `X-Ouinet-Avail-Data`: byte range available in a stored entry.
pub const HDR_AVAIL_DATA: &str = "X-Ouinet-Avail-Data";

/// Chunk extension carrying a block signature.
pub const EXT_SIG: &str = "ouisig";
/// Chunk extension carrying the preceding chain digest.
pub const EXT_HASH: &str = "ouihash";

/// The only supported signature algorithm identifier.
pub const SIG_ALGORITHM: &str = "hs2019";

const KEY_ID_PREFIX: &str = "ed25519=";

fn b64(data: impl AsRef<[u8]>) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn b64_decode(data: &str) -> Option<Vec<u8>> {
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}

/// `keyId` encoding a public key itself: `ed25519=<base64>`.
pub fn key_id_for(pk: &PublicKey) -> String {
    format!("{KEY_ID_PREFIX}{}", b64(pk.to_bytes()))
}

/// Decode a `keyId` back into a public key.
pub fn decode_key_id(key_id: &str) -> Option<PublicKey> {
    let encoded = key_id.strip_prefix(KEY_ID_PREFIX)?;
    let bytes = b64_decode(encoded)?;
    PublicKey::from_slice(&bytes).ok()
}

/// Whether `name` is a numbered signature header.
pub fn is_sig_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let Some(rest) = lower.strip_prefix(&HDR_SIG_PREFIX.to_ascii_lowercase()) else {
        return false;
    };
    !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit())
}

fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Transfer-Encoding")
        || name.eq_ignore_ascii_case("Trailer")
}

/// Copy of `head` with framing headers removed.
pub fn without_framing(head: &Head) -> Head {
    let mut out = head.clone();
    out.fields.retain(|n, _| !is_framing_header(n));
    out
}

// A comma is between quotes if the number of quotes before it is odd.
fn has_comma_in_quotes(s: &str) -> bool {
    let mut quotes = 0usize;
    for c in s.chars() {
        match c {
            '"' => quotes += 1,
            ',' if quotes % 2 != 0 => return true,
            _ => {}
        }
    }
    false
}

/// A parsed `keyId=...,algorithm=...,...` HTTP signature header value.
#[derive(Clone, Debug, Default)]
pub struct HttpSignature {
    pub key_id: String,
    pub algorithm: String,
    pub created: String,
    pub expires: String,
    pub headers: String,
    pub signature: String,
}

impl HttpSignature {
    /// Parse a signature header value. Quoted commas are unsupported, as
    /// in the reference implementation.
    pub fn parse(value: &str) -> Option<HttpSignature> {
        if has_comma_in_quotes(value) {
            warn!("commas in quoted arguments of HTTP signatures are not supported");
            return None;
        }

        let mut sig = HttpSignature {
            headers: "(created)".to_string(), // missing is not the same as empty
            ..Default::default()
        };
        for item in value.split(',') {
            let (key, val) = item.split_once('=')?;
            let key = key.trim();
            match key {
                // Unquoted values.
                "created" => sig.created = val.to_string(),
                "expires" => sig.expires = val.to_string(),
                _ => {
                    let val = val.strip_prefix('"')?.strip_suffix('"')?;
                    match key {
                        "keyId" => sig.key_id = val.to_string(),
                        "algorithm" => sig.algorithm = val.to_string(),
                        "headers" => sig.headers = val.to_string(),
                        "signature" => sig.signature = val.to_string(),
                        _ => return None,
                    }
                }
            }
        }
        if sig.key_id.is_empty() || sig.signature.is_empty() {
            warn!("HTTP signature contains empty key identifier or signature");
            return None;
        }
        Some(sig)
    }

    /// Check this signature against `head` under `pk`.
    ///
    /// On success, also return the set of lowercased header names the
    /// signature covers.
    pub fn verify(&self, head: &Head, pk: &PublicKey) -> Option<std::collections::HashSet<String>> {
        let vfy = self.verification_head(head)?;
        let sig_string = signing_string(&vfy);

        let decoded = b64_decode(&self.signature)?;
        let signature: [u8; SIGNATURE_LEN] = decoded.try_into().ok()?;
        if !pk.verify(sig_string, &signature) {
            return None;
        }
        Some(vfy.iter().map(|(n, _)| n.to_string()).collect())
    }

    /// Build the ordered `name: value` list the signature covers, or
    /// `None` if a listed header is missing.
    fn verification_head(&self, head: &Head) -> Option<Vec<(String, String)>> {
        let mut out = Vec::new();
        for name in self.headers.split(' ').filter(|n| !n.is_empty()) {
            if let Some(stripped) = name.strip_prefix('(') {
                let value = match stripped.strip_suffix(')')? {
                    "response-status" => head.status.to_string(),
                    "created" => self.created.clone(),
                    "expires" => self.expires.clone(),
                    other => {
                        warn!(pseudo = other, "unknown HTTP signature pseudo-header");
                        return None;
                    }
                };
                if value.is_empty() {
                    return None;
                }
                out.push((name.to_string(), value));
            } else {
                // Referring to an empty header is fine, a missing one is
                // not.
                let mut values = head.fields.get_all(name).peekable();
                values.peek()?;
                let joined = values
                    .map(str::trim)
                    .collect::<Vec<_>>()
                    .join(", ");
                out.push((name.to_string(), joined));
            }
        }
        Some(out)
    }
}

/// The signing string: covered `name: value` lines joined by newlines.
fn signing_string(entries: &[(String, String)]) -> String {
    entries
        .iter()
        .map(|(n, v)| format!("{n}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Normalised signable view of a head: `(response-status)`, `(created)`,
/// then every field lowercased and trimmed, repeats folded, first-seen
/// order.
fn prep_sig_entries(head: &Head, created: u64) -> Vec<(String, String)> {
    let mut out = vec![
        ("(response-status)".to_string(), head.status.to_string()),
        ("(created)".to_string(), created.to_string()),
    ];
    let mut order: Vec<String> = Vec::new();
    let mut values: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for (name, value) in head.fields.iter() {
        let name = name.to_ascii_lowercase();
        let value = value.trim();
        match values.get_mut(&name) {
            Some(v) => {
                v.push_str(", ");
                v.push_str(value);
            }
            None => {
                values.insert(name.clone(), value.to_string());
                order.push(name);
            }
        }
    }
    for name in order {
        let value = values.remove(&name).unwrap_or_default();
        out.push((name, value));
    }
    out
}

/// Produce an HTTP signature header value over `head`.
pub fn http_signature(head: &Head, key: &SigningKey, key_id: &str, created: u64) -> String {
    let entries = prep_sig_entries(head, created);
    let sig_string = signing_string(&entries);
    let headers = entries
        .iter()
        .map(|(n, _)| n.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let signature = b64(key.sign(sig_string));
    format!(
        "keyId=\"{key_id}\",algorithm=\"{SIG_ALGORITHM}\",created={created},headers=\"{headers}\",signature=\"{signature}\""
    )
}

/// Parsed `X-Ouinet-BSigs` parameters.
#[derive(Clone, Copy, Debug)]
pub struct BlockSigs {
    pub public_key: PublicKey,
    pub size: usize,
}

impl BlockSigs {
    /// Parse a `keyId="...",algorithm="hs2019",size=N` header value.
    pub fn parse(value: &str) -> Option<BlockSigs> {
        if has_comma_in_quotes(value) {
            warn!("commas in quoted arguments of block signature parameters are not supported");
            return None;
        }
        let mut public_key = None;
        let mut algorithm = String::new();
        let mut size = 0usize;
        for item in value.split(',') {
            let (key, val) = item.split_once('=')?;
            match key.trim() {
                "size" => size = val.parse().ok()?,
                k => {
                    let val = val.strip_prefix('"')?.strip_suffix('"')?;
                    match k {
                        "keyId" => public_key = decode_key_id(val),
                        "algorithm" => algorithm = val.to_string(),
                        _ => return None,
                    }
                }
            }
        }
        let public_key = public_key?;
        if algorithm != SIG_ALGORITHM {
            warn!("missing or invalid algorithm in block signature parameters");
            return None;
        }
        if size == 0 {
            warn!("missing or invalid size in block signature parameters");
            return None;
        }
        Some(BlockSigs { public_key, size })
    }

    /// Format the header value.
    pub fn format(&self) -> String {
        format!(
            "keyId=\"{}\",algorithm=\"{SIG_ALGORITHM}\",size={}",
            key_id_for(&self.public_key),
            self.size
        )
    }
}

/// A response head whose protocol fields have been parsed out, either
/// after verification or from a trusted (local) source.
#[derive(Clone, Debug)]
pub struct SignedHead {
    head: Head,
    uri: String,
    injection_id: String,
    injection_ts: u64,
    bsigs: BlockSigs,
}

impl SignedHead {
    /// Sign a response head for injection: set the protocol headers, the
    /// initial head signature, and chunked framing with the final-trailer
    /// declaration.
    pub fn sign_response(
        uri: &str,
        mut head: Head,
        injection_id: &str,
        injection_ts: u64,
        key: &SigningKey,
    ) -> Head {
        let key_id = key_id_for(&key.public_key());
        head.set(HDR_VERSION, PROTOCOL_VERSION.to_string());
        head.set(HDR_URI, uri);
        head.set(
            HDR_INJECTION,
            format!("id={injection_id},ts={injection_ts}"),
        );
        head.set(
            HDR_BSIGS,
            BlockSigs {
                public_key: key.public_key(),
                size: BLOCK_SIZE,
            }
            .format(),
        );

        let to_sign = without_framing(&head);
        head.set(
            &format!("{HDR_SIG_PREFIX}0"),
            http_signature(&to_sign, key, &key_id, injection_ts),
        );

        head.remove("Content-Length");
        head.set("Transfer-Encoding", "chunked");
        let trailer = match head.get("Trailer") {
            Some(existing) if !existing.is_empty() => {
                format!("{existing}, {HDR_DATA_SIZE}, Digest, {HDR_SIG_PREFIX}1")
            }
            _ => format!("{HDR_DATA_SIZE}, Digest, {HDR_SIG_PREFIX}1"),
        };
        head.set("Trailer", trailer);
        head
    }

    /// Build the trailer completing a signed response: body size, digest
    /// and the final head signature over head-plus-trailer.
    pub fn injection_trailer(
        signed_head: &Head,
        mut trailer: Fields,
        content_length: u64,
        content_digest: Sha256Digest,
        key: &SigningKey,
        created: u64,
    ) -> Fields {
        let key_id = key_id_for(&key.public_key());
        trailer.set(HDR_DATA_SIZE, content_length.to_string());
        trailer.set("Digest", format!("SHA-256={}", b64(content_digest)));

        // Head to sign: the initial head minus framing and minus its own
        // signature, extended with the trailer fields.
        let mut to_sign = without_framing(signed_head);
        to_sign.remove(&format!("{HDR_SIG_PREFIX}0"));
        for (n, v) in trailer.iter() {
            to_sign.set(n, v);
        }

        trailer.set(
            &format!("{HDR_SIG_PREFIX}1"),
            http_signature(&to_sign, key, &key_id, created),
        );
        trailer
    }

    /// Merge trailer fields into a head, dropping framing and redundant
    /// signatures. A signature is redundant next to another with the same
    /// `keyId` and algorithm, an equal-or-newer creation stamp and an
    /// equal-or-larger covered header set.
    pub fn merge(head: Head, trailer: &Fields) -> Head {
        let mut out = without_framing(&head);
        for (name, value) in trailer.iter() {
            if !is_sig_header(name) {
                out.fields.append(name.to_string(), value.to_string());
                continue;
            }
            insert_trailer_signature(&mut out, name, value);
        }
        out
    }

    /// Verify head signatures under `pk`.
    ///
    /// On success the returned head keeps only headers covered by at least
    /// one good signature, the good signatures themselves (renumbered) and
    /// signatures by unknown keys. Bad signatures are dropped. Framing
    /// headers are preserved.
    pub fn verify(head: &Head, pk: &PublicKey) -> Option<Head> {
        let mut out = head.clone();

        // Pull signature headers aside.
        let mut sig_values: Vec<String> = Vec::new();
        for (n, v) in head.fields.iter() {
            if is_sig_header(n) {
                sig_values.push(v.to_string());
            }
        }
        out.fields.retain(|n, _| !is_sig_header(n));

        let mut to_verify = without_framing(&out);
        to_verify.fields.retain(|n, _| !is_sig_header(n));

        let our_key_id = key_id_for(pk);
        let mut sig_ok = false;
        let mut kept: Vec<String> = Vec::new();
        // Names not yet proven covered by any good signature. Framing
        // headers are exempt: they are never signed and always preserved.
        let mut extra: std::collections::HashSet<String> = out
            .fields
            .iter()
            .filter(|(n, _)| !is_framing_header(n))
            .map(|(n, _)| n.to_ascii_lowercase())
            .collect();

        for value in sig_values {
            let Some(sig) = HttpSignature::parse(&value) else {
                warn!("malformed HTTP signature dropped");
                continue;
            };
            if sig.key_id != our_key_id {
                debug!("keeping HTTP signature by unknown key");
                kept.push(value);
                continue;
            }
            if !sig.algorithm.is_empty() && sig.algorithm != SIG_ALGORITHM {
                warn!(algorithm = %sig.algorithm, "unsupported HTTP signature algorithm dropped");
                continue;
            }
            let Some(covered) = sig.verify(&to_verify, pk) else {
                warn!("head does not match HTTP signature, dropped");
                continue;
            };
            sig_ok = true;
            kept.push(value);
            extra.retain(|name| !covered.contains(name));
        }

        if !sig_ok {
            return None;
        }

        for name in &extra {
            warn!(header = %name, "dropping header not covered by any signature");
        }
        out.fields.retain(|n, _| !extra.contains(&n.to_ascii_lowercase()));
        for (i, value) in kept.into_iter().enumerate() {
            out.fields.append(format!("{HDR_SIG_PREFIX}{i}"), value);
        }
        Some(out)
    }

    /// Verify `head` under `pk` and parse the protocol fields.
    pub fn verify_and_create(head: Head, pk: &PublicKey) -> Result<SignedHead> {
        let verified = Self::verify(&head, pk)
            .ok_or_else(|| CacheError::InvalidHead("no valid signature".into()))?;
        Self::from_trusted_source(verified)
    }

    /// Parse the protocol fields without verifying signatures; for heads
    /// read back from our own store.
    pub fn from_trusted_source(head: Head) -> Result<SignedHead> {
        let uri = head
            .get(HDR_URI)
            .ok_or_else(|| CacheError::InvalidHead("missing URI header".into()))?
            .to_string();
        let (injection_id, injection_ts) = parse_injection(&head)?;
        let bsigs = head
            .get(HDR_BSIGS)
            .and_then(BlockSigs::parse)
            .ok_or_else(|| {
                CacheError::InvalidHead("missing or malformed block signature parameters".into())
            })?;
        Ok(SignedHead {
            head,
            uri,
            injection_id,
            injection_ts,
            bsigs,
        })
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn into_head(self) -> Head {
        self.head
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn injection_id(&self) -> &str {
        &self.injection_id
    }

    pub fn injection_ts(&self) -> u64 {
        self.injection_ts
    }

    pub fn block_size(&self) -> usize {
        self.bsigs.size
    }

    pub fn public_key(&self) -> PublicKey {
        self.bsigs.public_key
    }

    /// The signed body length, once the trailer has been merged in.
    pub fn data_size(&self) -> Option<u64> {
        self.head.get(HDR_DATA_SIZE)?.parse().ok()
    }
}

/// Parse `X-Ouinet-Injection: id=...,ts=...`.
pub fn parse_injection(head: &Head) -> Result<(String, u64)> {
    let value = head
        .get(HDR_INJECTION)
        .ok_or_else(|| CacheError::InvalidHead("missing injection header".into()))?;
    let mut id = None;
    let mut ts = None;
    for item in value.split(',') {
        match item.trim().split_once('=') {
            Some(("id", v)) => id = Some(v.to_string()),
            Some(("ts", v)) => ts = v.parse::<u64>().ok(),
            _ => {}
        }
    }
    match (id, ts) {
        (Some(id), Some(ts)) if !id.is_empty() => Ok((id, ts)),
        _ => Err(CacheError::InvalidHead(format!(
            "malformed injection header: {value:?}"
        ))),
    }
}

fn sig_headers_set(headers: &str) -> std::collections::HashSet<&str> {
    headers.split(' ').filter(|h| !h.is_empty()).collect()
}

fn has_extra_items(a: &std::collections::HashSet<&str>, b: &std::collections::HashSet<&str>) -> bool {
    a.iter().any(|x| !b.contains(x))
}

fn insert_trailer_signature(head: &mut Head, name: &str, value: &str) {
    let Some(new_sig) = HttpSignature::parse(value) else {
        warn!(header = name, "dropping malformed trailer signature");
        return;
    };
    let new_headers = sig_headers_set(&new_sig.headers);
    let Ok(new_ts) = new_sig.created.parse::<u64>() else {
        warn!(key_id = %new_sig.key_id, "dropping new signature with empty creation time stamp");
        return;
    };

    let mut insert = true;
    let mut keep_flags: Vec<(String, String, bool)> = Vec::new();
    for (n, v) in head.fields.iter() {
        if !is_sig_header(n) {
            keep_flags.push((n.to_string(), v.to_string(), true));
            continue;
        }
        let Some(old_sig) = HttpSignature::parse(v) else {
            keep_flags.push((n.to_string(), v.to_string(), true));
            continue;
        };
        if old_sig.key_id != new_sig.key_id || old_sig.algorithm != new_sig.algorithm {
            keep_flags.push((n.to_string(), v.to_string(), true));
            continue;
        }
        let old_headers = sig_headers_set(&old_sig.headers);
        let old_ts = old_sig.created.parse::<u64>().unwrap_or(0);

        insert = insert && (new_ts > old_ts || has_extra_items(&new_headers, &old_headers));
        let keep = old_ts > new_ts || has_extra_items(&old_headers, &new_headers);
        keep_flags.push((n.to_string(), v.to_string(), keep));
    }

    let kept: Vec<(String, String)> = keep_flags
        .into_iter()
        .filter(|(_, _, k)| *k)
        .map(|(n, v, _)| (n, v))
        .collect();
    head.fields = kept.into_iter().collect();
    if insert {
        head.fields.append(name.to_string(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_head() -> Head {
        let mut head = Head::new(200);
        head.fields.append("Date", "Mon, 15 Jan 2018 20:31:50 GMT");
        head.fields.append("Server", "Apache1");
        head.fields.append("Server", "Apache2");
        head.fields.append("Content-Type", "text/html");
        head.fields
            .append("Content-Disposition", "inline; filename=\"foo.html\"");
        head
    }

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    const INJECTION_ID: &str = "d6076384-2295-462b-a047-fe2c9274e58d";
    const INJECTION_TS: u64 = 1516048310;

    fn signed() -> Head {
        SignedHead::sign_response(
            "https://example.com/foo",
            sample_head(),
            INJECTION_ID,
            INJECTION_TS,
            &key(),
        )
    }

    #[test]
    fn test_sign_sets_protocol_headers() {
        let h = signed();
        assert_eq!(h.get(HDR_VERSION), Some("5"));
        assert_eq!(h.get(HDR_URI), Some("https://example.com/foo"));
        assert_eq!(
            h.get(HDR_INJECTION),
            Some(format!("id={INJECTION_ID},ts={INJECTION_TS}").as_str())
        );
        assert!(h.get("X-Ouinet-Sig0").is_some());
        assert_eq!(h.get("Transfer-Encoding"), Some("chunked"));
        assert_eq!(
            h.get("Trailer"),
            Some("X-Ouinet-Data-Size, Digest, X-Ouinet-Sig1")
        );
        let bs = BlockSigs::parse(h.get(HDR_BSIGS).unwrap()).unwrap();
        assert_eq!(bs.size, BLOCK_SIZE);
        assert_eq!(bs.public_key, key().public_key());
    }

    #[test]
    fn test_sig0_covers_expected_headers() {
        let h = signed();
        let sig = HttpSignature::parse(h.get("X-Ouinet-Sig0").unwrap()).unwrap();
        assert_eq!(
            sig.headers,
            "(response-status) (created) date server content-type content-disposition \
             x-ouinet-version x-ouinet-uri x-ouinet-injection x-ouinet-bsigs"
        );
        assert_eq!(sig.created, INJECTION_TS.to_string());
        assert_eq!(sig.algorithm, SIG_ALGORITHM);
    }

    #[test]
    fn test_verify_roundtrip() {
        let h = signed();
        let verified = SignedHead::verify(&h, &key().public_key()).expect("must verify");
        // Covered headers survive.
        assert_eq!(verified.get("Content-Type"), Some("text/html"));
        assert_eq!(verified.fields.get_all("Server").count(), 2);
        assert!(verified.get("X-Ouinet-Sig0").is_some());
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let h = signed();
        let other = SigningKey::from_bytes(&[1u8; 32]).public_key();
        assert!(SignedHead::verify(&h, &other).is_none());
    }

    #[test]
    fn test_tampered_header_fails() {
        let mut h = signed();
        h.set("Content-Type", "text/plain");
        assert!(SignedHead::verify(&h, &key().public_key()).is_none());
    }

    #[test]
    fn test_uncovered_header_dropped() {
        let mut h = signed();
        h.fields.append("X-Sneaky", "yes");
        let verified = SignedHead::verify(&h, &key().public_key()).unwrap();
        assert_eq!(verified.get("X-Sneaky"), None);
    }

    #[test]
    fn test_unknown_key_signature_kept() {
        let mut h = signed();
        // A second signature by some other key; opaque but preserved.
        h.fields.append(
            "X-Ouinet-Sig1",
            "keyId=\"ed25519=AAAA\",algorithm=\"hs2019\",created=1,headers=\"(created)\",signature=\"Zm9v\"",
        );
        let verified = SignedHead::verify(&h, &key().public_key()).unwrap();
        let sigs: Vec<_> = verified
            .fields
            .iter()
            .filter(|(n, _)| is_sig_header(n))
            .collect();
        assert_eq!(sigs.len(), 2);
    }

    #[test]
    fn test_trailer_then_merge_verifies() {
        let h = signed();
        let digest = warren_crypto::sha::sha256(b"0123456789");
        let trailer = SignedHead::injection_trailer(
            &h,
            Fields::new(),
            10,
            digest,
            &key(),
            INJECTION_TS + 1,
        );
        assert_eq!(trailer.get(HDR_DATA_SIZE), Some("10"));
        assert!(trailer.get("Digest").unwrap().starts_with("SHA-256="));
        assert!(trailer.get("X-Ouinet-Sig1").is_some());

        let merged = SignedHead::merge(h, &trailer);
        // Sig1 covers more headers than Sig0 (data size + digest), so both
        // survive the redundancy rules and the merged head verifies.
        assert!(merged.get(HDR_DATA_SIZE).is_some());
        let verified = SignedHead::verify(&merged, &key().public_key()).unwrap();
        assert!(verified.get(HDR_DATA_SIZE).is_some());
        assert_eq!(verified.get("Digest"), merged.get("Digest"));
    }

    #[test]
    fn test_merge_drops_framing() {
        let h = signed();
        let merged = SignedHead::merge(h, &Fields::new());
        assert_eq!(merged.get("Transfer-Encoding"), None);
        assert_eq!(merged.get("Trailer"), None);
    }

    #[test]
    fn test_signed_head_accessors() {
        let h = signed();
        let sh = SignedHead::verify_and_create(h, &key().public_key()).unwrap();
        assert_eq!(sh.uri(), "https://example.com/foo");
        assert_eq!(sh.injection_id(), INJECTION_ID);
        assert_eq!(sh.injection_ts(), INJECTION_TS);
        assert_eq!(sh.block_size(), BLOCK_SIZE);
        assert_eq!(sh.public_key(), key().public_key());
        assert_eq!(sh.data_size(), None);
    }

    #[test]
    fn test_key_id_roundtrip() {
        let pk = key().public_key();
        let id = key_id_for(&pk);
        assert!(id.starts_with("ed25519="));
        assert_eq!(decode_key_id(&id), Some(pk));
        assert_eq!(decode_key_id("rsa=abcd"), None);
    }

    #[test]
    fn test_signature_parse_rejects_quoted_comma() {
        assert!(HttpSignature::parse("keyId=\"a,b\",signature=\"x\"").is_none());
    }

    #[test]
    fn test_is_sig_header() {
        assert!(is_sig_header("X-Ouinet-Sig0"));
        assert!(is_sig_header("x-ouinet-sig12"));
        assert!(!is_sig_header("X-Ouinet-Signature"));
        assert!(!is_sig_header("X-Ouinet-Sig"));
        assert!(!is_sig_header("X-Ouinet-BSigs"));
    }
}
