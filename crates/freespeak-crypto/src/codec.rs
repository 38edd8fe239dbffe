//! Padded, double-layer message codec.
//!
//! Every ciphertext that crosses the relay is produced here. Given a
//! long-lived session key and a plaintext:
//!
//! ```text
//! inner   = encrypt(inner_key, inner_iv, sha256(plaintext) || plaintext)
//! outer   = left_len(1) || right_len(1) || left_pad || inner_key || inner_iv
//!           || inner || right_pad
//! wire    = base64(outer_iv || encrypt(session_key, outer_iv, outer))
//! ```
//!
//! The inner key is single-use, and the random padding (0..256 bytes on each
//! side) hides the true plaintext length from the relay. Decoding treats the
//! two padding length bytes as untrusted and re-verifies the plaintext digest
//! before anything is handed back.

use freespeak_common::helpers::constant_time_eq;
use rand::RngCore;

use crate::error::CryptoError;
use crate::primitives::{
    self, Digest, SymmetricKey, DIGEST_LEN, IV_LEN, KEY_LEN,
};

/// Exclusive upper bound for each padding run; lengths travel in one byte.
pub const MAX_PADDING: usize = 256;

/// Bytes of the outer payload that are not padding or inner ciphertext.
const OUTER_HEADER_LEN: usize = 2;

/// Encrypt `plaintext` under `session_key` into a base64 wire value.
pub fn encode(session_key: &SymmetricKey, plaintext: &[u8]) -> Result<String, CryptoError> {
    let left = primitives::random_below(MAX_PADDING);
    let right = primitives::random_below(MAX_PADDING);
    encode_with_padding(session_key, plaintext, left, right)
}

fn encode_with_padding(
    session_key: &SymmetricKey,
    plaintext: &[u8],
    left: usize,
    right: usize,
) -> Result<String, CryptoError> {
    let (Ok(left_len), Ok(right_len)) = (u8::try_from(left), u8::try_from(right)) else {
        return Err(CryptoError::Malformed("padding length exceeds one byte".into()));
    };

    let inner_key = SymmetricKey::generate();
    let inner_iv = primitives::random_array::<IV_LEN>();
    let outer_iv = primitives::random_array::<IV_LEN>();

    let digest: Digest = primitives::hash(plaintext);
    let mut inner_payload = Vec::with_capacity(DIGEST_LEN + plaintext.len());
    inner_payload.extend_from_slice(&digest);
    inner_payload.extend_from_slice(plaintext);
    let inner_ciphertext = primitives::encrypt(&inner_key, &inner_iv, &inner_payload)?;

    let mut outer_payload = Vec::with_capacity(
        OUTER_HEADER_LEN + left + KEY_LEN + IV_LEN + inner_ciphertext.len() + right,
    );
    outer_payload.push(left_len);
    outer_payload.push(right_len);
    outer_payload.extend_from_slice(&padding(left));
    outer_payload.extend_from_slice(inner_key.as_bytes());
    outer_payload.extend_from_slice(&inner_iv);
    outer_payload.extend_from_slice(&inner_ciphertext);
    outer_payload.extend_from_slice(&padding(right));

    let outer_ciphertext = primitives::encrypt(session_key, &outer_iv, &outer_payload)?;

    let mut wire = Vec::with_capacity(IV_LEN + outer_ciphertext.len());
    wire.extend_from_slice(&outer_iv);
    wire.extend_from_slice(&outer_ciphertext);
    Ok(primitives::to_base64(&wire))
}

/// Decrypt a wire value produced by [`encode`] and verify its digest.
pub fn decode(session_key: &SymmetricKey, wire: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = primitives::from_base64(wire)?;
    if raw.len() < IV_LEN {
        return Err(CryptoError::Malformed("ciphertext shorter than IV".into()));
    }
    let (outer_iv, outer_ciphertext) = raw.split_at(IV_LEN);
    let outer_iv = to_iv(outer_iv)?;
    let outer = primitives::decrypt(session_key, &outer_iv, outer_ciphertext)?;

    if outer.len() < OUTER_HEADER_LEN {
        return Err(CryptoError::Malformed("outer payload too short".into()));
    }
    let left = outer[0] as usize;
    let right = outer[1] as usize;

    let key_start = OUTER_HEADER_LEN + left;
    let iv_start = key_start + KEY_LEN;
    let inner_start = iv_start + IV_LEN;
    let inner_end = outer
        .len()
        .checked_sub(right)
        .filter(|end| *end >= inner_start)
        .ok_or_else(|| CryptoError::Malformed("padding lengths exceed payload".into()))?;

    let inner_key = SymmetricKey::from_slice(&outer[key_start..iv_start])?;
    let inner_iv = to_iv(&outer[iv_start..inner_start])?;
    let inner = primitives::decrypt(&inner_key, &inner_iv, &outer[inner_start..inner_end])?;

    if inner.len() < DIGEST_LEN {
        return Err(CryptoError::Malformed("inner payload too short".into()));
    }
    let (claimed, plaintext) = inner.split_at(DIGEST_LEN);
    if !constant_time_eq(claimed, &primitives::hash(plaintext)) {
        return Err(CryptoError::Integrity);
    }

    Ok(plaintext.to_vec())
}

fn to_iv(bytes: &[u8]) -> Result<[u8; IV_LEN], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::Malformed("invalid IV length".into()))
}

fn padding(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
