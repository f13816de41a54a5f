//! BEP-5 swarm names.
//!
//! Peers find each other under infohashes derived from well-known names:
//!
//! - `ed25519:<BASE32UP(pubkey)>/v<N>/injectors` — all injectors signing
//!   with one key
//! - `ed25519:<BASE32UP(pubkey)>/v<N>/bridges` — bridge nodes for that key
//! - `ed25519:<BASE32UP(pubkey)>/v<N>/uri/<key>` — holders of one cached
//!   group (usually a host name)
//!
//! The infohash of a swarm is the SHA-1 of its name.

use data_encoding::BASE32_NOPAD;

use warren_crypto::ed25519::PublicKey;
use warren_crypto::sha::sha1;
use warren_dht::NodeId;

use crate::Result;

/// Upper-case unpadded Base32 of a public key.
fn base32up(pk: &PublicKey) -> String {
    BASE32_NOPAD.encode(&pk.to_bytes())
}

/// Swarm of injectors publishing under `pk`.
pub fn injector_swarm_name(pk: &PublicKey, protocol_version: u64) -> String {
    format!("ed25519:{}/v{protocol_version}/injectors", base32up(pk))
}

/// Swarm of bridges relaying for `pk`.
pub fn bridge_swarm_name(pk: &PublicKey, protocol_version: u64) -> String {
    format!("ed25519:{}/v{protocol_version}/bridges", base32up(pk))
}

/// Swarm of cache holders of `key` (a group name) under `pk`.
pub fn uri_swarm_name(pk: &PublicKey, protocol_version: u64, key: &str) -> String {
    format!("ed25519:{}/v{protocol_version}/uri/{key}", base32up(pk))
}

/// The DHT infohash of a swarm name.
pub fn swarm_infohash(name: &str) -> NodeId {
    NodeId::from_digest(sha1(name))
}

/// The group a URL belongs to: its host name.
pub fn group_for_url(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url)
        .map_err(|e| crate::ClientError::InvalidArgument(format!("bad url {url:?}: {e}")))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| crate::ClientError::InvalidArgument(format!("url without host: {url:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_crypto::ed25519::SigningKey;

    fn pk() -> PublicKey {
        SigningKey::from_bytes(&[1u8; 32]).public_key()
    }

    #[test]
    fn test_swarm_name_shapes() {
        let pk = pk();
        let b32 = base32up(&pk);
        // 32 bytes of key need 52 unpadded Base32 characters.
        assert_eq!(b32.len(), 52);
        assert!(b32.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        assert_eq!(
            injector_swarm_name(&pk, 5),
            format!("ed25519:{b32}/v5/injectors")
        );
        assert_eq!(bridge_swarm_name(&pk, 5), format!("ed25519:{b32}/v5/bridges"));
        assert_eq!(
            uri_swarm_name(&pk, 5, "example.com"),
            format!("ed25519:{b32}/v5/uri/example.com")
        );
    }

    #[test]
    fn test_infohash_is_sha1_of_name() {
        let name = injector_swarm_name(&pk(), 5);
        assert_eq!(swarm_infohash(&name), NodeId::from_digest(sha1(&name)));
        // Different names, different swarms.
        assert_ne!(
            swarm_infohash(&injector_swarm_name(&pk(), 5)),
            swarm_infohash(&bridge_swarm_name(&pk(), 5)),
        );
    }

    #[test]
    fn test_group_for_url() {
        assert_eq!(
            group_for_url("https://example.com/a/b?c=d").unwrap(),
            "example.com"
        );
        assert!(group_for_url("not a url").is_err());
        assert!(group_for_url("file:///etc/passwd").is_err());
    }
}
