//! Ed25519 signing and verification (RFC 8032).
//!
//! Thin wrappers around `ed25519-dalek` with fixed-size array types at the
//! boundaries, so the rest of the workspace never touches dalek types
//! directly.

use ed25519_dalek::{Signer as _, Verifier as _};

use crate::{CryptoError, Result};

/// Length of a serialized public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// A detached Ed25519 signature.
pub type Signature = [u8; SIGNATURE_LEN];

/// An Ed25519 signing (private) key.
#[derive(Clone)]
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

impl SigningKey {
    /// Generate a fresh random signing key.
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_bytes(&seed)
    }

    /// Build a signing key from its 32-byte seed.
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// The corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: self.inner.verifying_key(),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: impl AsRef<[u8]>) -> Signature {
        self.inner.sign(message.as_ref()).to_bytes()
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("SigningKey(..)")
    }
}

/// An Ed25519 verifying (public) key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    /// Decode a public key from its 32-byte serialization.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<Self> {
        let inner = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Decode a public key from a byte slice of any length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("bad length {}", bytes.len())))?;
        Self::from_bytes(&arr)
    }

    /// The 32-byte serialization of this key.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.inner.to_bytes()
    }

    /// Return whether `signature` is a valid signature of `message` under
    /// this key.
    pub fn verify(&self, message: impl AsRef<[u8]>, signature: &Signature) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.inner.verify(message.as_ref(), &sig).is_ok()
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex_short(&self.to_bytes()))
    }
}

fn hex_short(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(12);
    for b in &bytes[..6] {
        s.push_str(&format!("{b:02x}"));
    }
    s.push_str("..");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_roundtrip() {
        let sk = SigningKey::from_bytes(&[7u8; 32]);
        let pk = sk.public_key();
        let sig = sk.sign(b"the message");
        assert!(pk.verify(b"the message", &sig));
        assert!(!pk.verify(b"another message", &sig));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let sk = SigningKey::from_bytes(&[9u8; 32]);
        let pk = sk.public_key();
        let mut sig = sk.sign(b"payload");
        sig[0] ^= 0x01;
        assert!(!pk.verify(b"payload", &sig));
    }

    #[test]
    fn test_public_key_roundtrip() {
        let pk = SigningKey::from_bytes(&[1u8; 32]).public_key();
        let decoded = PublicKey::from_bytes(&pk.to_bytes()).unwrap();
        assert_eq!(pk, decoded);
    }

    #[test]
    fn test_bad_key_length_rejected() {
        assert!(PublicKey::from_slice(&[0u8; 31]).is_err());
    }
}
