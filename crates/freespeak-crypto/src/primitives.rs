//! Thin wrappers over the hash, cipher, key agreement and RNG.
//!
//! Every other module reaches the underlying crates only through these
//! functions:
//!
//! | Concern        | Algorithm                  |
//! |----------------|----------------------------|
//! | hash           | SHA-256                    |
//! | cipher         | XChaCha20-Poly1305         |
//! | key agreement  | X25519                     |
//! | randomness     | OS CSPRNG                  |
//!
//! Byte values are raw internally and standard base64 at the wire boundary.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest as _, Sha256};
use std::fmt;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Symmetric key length in bytes.
pub const KEY_LEN: usize = 32;
/// Cipher IV length in bytes (the XChaCha20 nonce size).
pub const IV_LEN: usize = 24;
/// Digest length in bytes.
pub const DIGEST_LEN: usize = 32;
/// Length of the hex suffix used for ids and ciphertext fingerprints.
pub const TRUNCATED_HASH_LEN: usize = 8;
/// The only keypair size the X25519 backend supports.
pub const KEYPAIR_BITS: usize = 256;

pub type Digest = [u8; DIGEST_LEN];

pub fn hash(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Hash of the concatenation of `parts`.
pub fn hash_parts(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Last eight lowercase hex characters of `sha256(data)`.
pub fn truncated_hash(data: &[u8]) -> String {
    let full = hex::encode(hash(data));
    full[full.len() - TRUNCATED_HASH_LEN..].to_string()
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Uniform integer in `[0, max)`.
pub fn random_below(max: usize) -> usize {
    if max == 0 {
        return 0;
    }
    OsRng.gen_range(0..max)
}

pub fn to_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn from_base64(value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::Malformed(format!("invalid base64: {e}")))
}

/// 256-bit symmetric key. Zeroized on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Self {
        Self(random_array())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::Malformed("invalid key length".into()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short non-secret tag identifying this key, safe to log or compare.
    pub fn fingerprint(&self) -> String {
        truncated_hash(&self.0)
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey({})", self.fingerprint())
    }
}

pub fn encrypt(
    key: &SymmetricKey,
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(XNonce::from_slice(iv), plaintext)
        .map_err(|_| CryptoError::Malformed("encryption failed".into()))
}

/// Decrypt and authenticate. Any failure is an integrity failure.
pub fn decrypt(
    key: &SymmetricKey,
    iv: &[u8; IV_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(XNonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Integrity)
}

/// X25519 private key.
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw private key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes recreate the identity.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Serialized form used on the wire and as the id hash input.
    pub fn to_base64(&self) -> String {
        to_base64(&self.0)
    }

    /// Parse a serialized public key, validating encoding and length.
    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(value)
            .map_err(|_| CryptoError::KeyAgreement("public key is not base64".into()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            CryptoError::KeyAgreement(format!(
                "invalid public key length: expected 32 bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Generate a fresh keypair using the OS CSPRNG.
pub fn make_keypair(bits: usize) -> Result<(PrivateKey, PublicKey), CryptoError> {
    if bits != KEYPAIR_BITS {
        return Err(CryptoError::UnsupportedKeySize(bits));
    }
    let private = PrivateKey(StaticSecret::random_from_rng(OsRng));
    let public = private.public_key();
    Ok((private, public))
}

/// Derive the symmetric secret shared with `peer`.
///
/// This is the only potentially slow step of the handshake, so it yields to
/// the scheduler before computing rather than occupying a thread of its own.
pub async fn derive_shared_secret(
    private: &PrivateKey,
    peer: &PublicKey,
) -> Result<SymmetricKey, CryptoError> {
    tokio::task::yield_now().await;

    let shared = private
        .0
        .diffie_hellman(&x25519_dalek::PublicKey::from(peer.0));
    if !shared.was_contributory() {
        return Err(CryptoError::KeyAgreement(
            "peer public key is a low-order point".into(),
        ));
    }

    Ok(SymmetricKey(hash(shared.as_bytes())))
}
