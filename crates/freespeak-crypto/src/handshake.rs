//! Offer/accept key confirmation.
//!
//! The handshake mixes three random values into the session key: each side's
//! per-connection [`HandshakeNonce`] and a per-exchange supplement nonce chosen
//! by the offerer. The supplement travels encrypted under the X25519 shared
//! secret together with a SHA-256 commitment, so a relay that swaps the
//! ciphertext is caught before the responder trusts the derived key.
//!
//! ```text
//! Offerer (A)                                  Responder (B)
//! -----------                                  -------------
//! shared   = sha256(x25519(a, B))
//! supp     = random(32)
//! key      = sha256(supp || nA || nB)
//! expected = sha256(idA || supp || nB)
//!          ---- codec(shared, supp), b64(sha256(supp)) ---->
//!                                              shared   = sha256(x25519(b, A))
//!                                              check sha256(supp) == commitment
//!                                              key      = sha256(supp || nA || nB)
//!                                              response = sha256(idA || supp || nB)
//!          <------------ codec(key, response) --------------
//! check response == expected
//! ```
//!
//! Every function here is pure apart from the random draws; sending frames
//! and tracking per-peer state is the client's job.

use freespeak_common::helpers::constant_time_eq;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::codec;
use crate::error::CryptoError;
use crate::identity::{Identity, PeerId};
use crate::primitives::{self, Digest, PublicKey, SymmetricKey};

/// Length of both the handshake nonce and the supplement nonce.
pub const NONCE_LEN: usize = 32;

/// Random value mixed into session keys.
///
/// One is generated per relay connection and registered alongside the public
/// key; a fresh one is drawn as the supplement for every offer.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct HandshakeNonce([u8; NONCE_LEN]);

impl HandshakeNonce {
    pub fn generate() -> Self {
        Self(primitives::random_array())
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_base64(value: &str) -> Result<Self, CryptoError> {
        let bytes = primitives::from_base64(value)?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NONCE_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::Malformed(format!(
                "invalid nonce length: expected {NONCE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        primitives::to_base64(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl fmt::Debug for HandshakeNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandshakeNonce(..)")
    }
}

/// The two offer fields that travel through the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedOffer {
    /// Supplement nonce, encoded under the shared secret.
    pub encrypted_nonce: String,
    /// `base64(sha256(supplement))`.
    pub nonce_hash: String,
}

/// Offerer-side state kept until the accept arrives.
#[derive(Clone)]
pub struct OfferState {
    session_key: SymmetricKey,
    expected_response_hash: Digest,
}

impl OfferState {
    /// Session key the offerer will use once the accept verifies.
    pub fn session_key(&self) -> &SymmetricKey {
        &self.session_key
    }
}

impl fmt::Debug for OfferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfferState")
            .field("session_key", &self.session_key)
            .finish_non_exhaustive()
    }
}

/// Responder-side result of a verified offer.
#[derive(Clone)]
pub struct AcceptState {
    session_key: SymmetricKey,
    response_hash: Digest,
}

impl AcceptState {
    pub fn session_key(&self) -> &SymmetricKey {
        &self.session_key
    }
}

impl fmt::Debug for AcceptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptState")
            .field("session_key", &self.session_key)
            .finish_non_exhaustive()
    }
}

/// Build an offer for a peer whose key and nonce came back from `getkey`.
pub async fn create_offer(
    identity: &Identity,
    own_nonce: &HandshakeNonce,
    peer_key: &PublicKey,
    peer_nonce: &HandshakeNonce,
) -> Result<(SealedOffer, OfferState), CryptoError> {
    let shared = primitives::derive_shared_secret(identity.private_key(), peer_key).await?;
    let supplement = HandshakeNonce::generate();

    let session_key = derive_session_key(&supplement, own_nonce, peer_nonce);
    let expected_response_hash = response_hash(identity.id(), &supplement, peer_nonce);

    let sealed = SealedOffer {
        encrypted_nonce: codec::encode(&shared, supplement.as_bytes())?,
        nonce_hash: primitives::to_base64(&primitives::hash(supplement.as_bytes())),
    };

    Ok((
        sealed,
        OfferState {
            session_key,
            expected_response_hash,
        },
    ))
}

/// Verify an incoming offer and derive the responder's side of the session.
///
/// Fails with [`CryptoError::HandshakeMismatch`] when the decrypted supplement
/// does not match its commitment; callers drop the offer without replying.
pub async fn receive_offer(
    identity: &Identity,
    own_nonce: &HandshakeNonce,
    sender_id: &PeerId,
    sender_key: &PublicKey,
    sender_nonce: &HandshakeNonce,
    encrypted_nonce: &str,
    nonce_hash: &str,
) -> Result<AcceptState, CryptoError> {
    let shared = primitives::derive_shared_secret(identity.private_key(), sender_key).await?;
    let supplement = HandshakeNonce::from_slice(&codec::decode(&shared, encrypted_nonce)?)?;

    let commitment = primitives::from_base64(nonce_hash)?;
    if !constant_time_eq(&commitment, &primitives::hash(supplement.as_bytes())) {
        return Err(CryptoError::HandshakeMismatch("nonce hash"));
    }

    Ok(AcceptState {
        session_key: derive_session_key(&supplement, sender_nonce, own_nonce),
        response_hash: response_hash(sender_id, &supplement, own_nonce),
    })
}

/// Encode the responder's proof of derivation for the `accept` frame.
pub fn seal_response(state: &AcceptState) -> Result<String, CryptoError> {
    codec::encode(&state.session_key, &state.response_hash)
}

/// Check an `accept` payload against the hash precomputed at offer time.
pub fn verify_response(state: &OfferState, encrypted_response_hash: &str) -> Result<(), CryptoError> {
    let response = codec::decode(&state.session_key, encrypted_response_hash)?;
    if !constant_time_eq(&response, &state.expected_response_hash) {
        return Err(CryptoError::HandshakeMismatch("response hash"));
    }
    Ok(())
}

fn derive_session_key(
    supplement: &HandshakeNonce,
    offerer_nonce: &HandshakeNonce,
    responder_nonce: &HandshakeNonce,
) -> SymmetricKey {
    SymmetricKey::from_bytes(primitives::hash_parts(&[
        supplement.as_bytes(),
        offerer_nonce.as_bytes(),
        responder_nonce.as_bytes(),
    ]))
}

fn response_hash(
    offerer_id: &PeerId,
    supplement: &HandshakeNonce,
    responder_nonce: &HandshakeNonce,
) -> Digest {
    primitives::hash_parts(&[
        offerer_id.as_bytes(),
        supplement.as_bytes(),
        responder_nonce.as_bytes(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Party {
        identity: Identity,
        nonce: HandshakeNonce,
    }

    impl Party {
        fn new() -> Self {
            Self {
                identity: Identity::generate(),
                nonce: HandshakeNonce::generate(),
            }
        }
    }

    async fn offer(a: &Party, b: &Party) -> (SealedOffer, OfferState) {
        create_offer(&a.identity, &a.nonce, b.identity.public_key(), &b.nonce)
            .await
            .unwrap()
    }

    async fn respond(b: &Party, a: &Party, sealed: &SealedOffer) -> Result<AcceptState, CryptoError> {
        receive_offer(
            &b.identity,
            &b.nonce,
            a.identity.id(),
            a.identity.public_key(),
            &a.nonce,
            &sealed.encrypted_nonce,
            &sealed.nonce_hash,
        )
        .await
    }

    #[tokio::test]
    async fn test_both_sides_derive_same_key() {
        let a = Party::new();
        let b = Party::new();

        let (sealed, offer_state) = offer(&a, &b).await;
        let accept_state = respond(&b, &a, &sealed).await.unwrap();
        assert_eq!(offer_state.session_key(), accept_state.session_key());
        assert_eq!(offer_state.expected_response_hash, accept_state.response_hash);

        let accept = seal_response(&accept_state).unwrap();
        verify_response(&offer_state, &accept).unwrap();
    }

    #[tokio::test]
    async fn test_each_offer_derives_fresh_key() {
        let a = Party::new();
        let b = Party::new();
        let (_, first) = offer(&a, &b).await;
        let (_, second) = offer(&a, &b).await;
        assert_ne!(first.session_key(), second.session_key());
    }

    #[tokio::test]
    async fn test_tampered_nonce_hash_aborts() {
        let a = Party::new();
        let b = Party::new();
        let (mut sealed, _) = offer(&a, &b).await;
        sealed.nonce_hash = primitives::to_base64(&primitives::hash(b"something else"));

        assert_eq!(
            respond(&b, &a, &sealed).await.unwrap_err(),
            CryptoError::HandshakeMismatch("nonce hash")
        );
    }

    #[tokio::test]
    async fn test_substituted_supplement_aborts() {
        // A relay that knows neither private key re-encrypts a nonce of its
        // choosing under a key it made up.
        let a = Party::new();
        let b = Party::new();
        let (mut sealed, _) = offer(&a, &b).await;
        sealed.encrypted_nonce = codec::encode(&SymmetricKey::generate(), &[9u8; NONCE_LEN]).unwrap();

        assert_eq!(respond(&b, &a, &sealed).await.unwrap_err(), CryptoError::Integrity);
    }

    #[tokio::test]
    async fn test_offer_from_wrong_sender_aborts() {
        let a = Party::new();
        let b = Party::new();
        let mallory = Party::new();
        let (sealed, _) = offer(&a, &b).await;

        let result = receive_offer(
            &b.identity,
            &b.nonce,
            mallory.identity.id(),
            mallory.identity.public_key(),
            &a.nonce,
            &sealed.encrypted_nonce,
            &sealed.nonce_hash,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tampered_accept_aborts() {
        let a = Party::new();
        let b = Party::new();
        let (sealed, offer_state) = offer(&a, &b).await;
        let accept_state = respond(&b, &a, &sealed).await.unwrap();

        let forged = codec::encode(accept_state.session_key(), &[0u8; 32]).unwrap();
        assert_eq!(
            verify_response(&offer_state, &forged).unwrap_err(),
            CryptoError::HandshakeMismatch("response hash")
        );

        let wrong_key = codec::encode(&SymmetricKey::generate(), &accept_state.response_hash).unwrap();
        assert!(verify_response(&offer_state, &wrong_key).is_err());
    }

    #[tokio::test]
    async fn test_responder_nonce_change_breaks_session() {
        // B reconnected with a new handshake nonce after A fetched the old one.
        let a = Party::new();
        let b_old = Party::new();
        let b = Party {
            identity: Identity::from_private_bytes(b_old.identity.private_key_bytes()),
            nonce: HandshakeNonce::generate(),
        };

        let (sealed, offer_state) = offer(&a, &b_old).await;
        let accept_state = respond(&b, &a, &sealed).await.unwrap();
        assert_ne!(offer_state.session_key(), accept_state.session_key());

        let accept = seal_response(&accept_state).unwrap();
        assert!(verify_response(&offer_state, &accept).is_err());
    }

    #[test]
    fn test_nonce_parse_validation() {
        let nonce = HandshakeNonce::generate();
        assert_eq!(HandshakeNonce::from_base64(&nonce.to_base64()).unwrap(), nonce);
        assert!(HandshakeNonce::from_base64(&primitives::to_base64(&[1u8; 16])).is_err());
        assert!(HandshakeNonce::from_base64("???").is_err());
        assert_eq!(format!("{nonce:?}"), "HandshakeNonce(..)");
    }
}
