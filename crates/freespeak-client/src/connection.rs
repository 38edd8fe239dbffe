//! Per-peer handshake and delivery state held by the client.

use freespeak_crypto::{primitives, AcceptState, CryptoError, OfferState, PeerId, SymmetricKey};
use serde::Serialize;

/// Relay connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    /// Transport is up but the relay has not acknowledged `key` yet.
    Connected,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    OfferSent,
    /// A verified offer whose `accept` has not gone out yet.
    OfferReceived,
    Established,
    /// The relay reported the peer gone, or our own relay connection closed.
    Disconnected,
}

/// Connection info for one peer.
///
/// The session key survives a re-handshake until the new exchange verifies,
/// so messages keep flowing under the old key in the meantime.
#[derive(Debug)]
pub struct ConnectionInfo {
    id: PeerId,
    state: PeerState,
    session_key: Option<SymmetricKey>,
    pending_offer: Option<OfferState>,
    pending_accept: Option<AcceptState>,
    last_plaintext: Option<String>,
    last_ciphertext_hash: Option<String>,
    retransmit: Option<String>,
}

impl ConnectionInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            state: PeerState::Disconnected,
            session_key: None,
            pending_offer: None,
            pending_accept: None,
            last_plaintext: None,
            last_ciphertext_hash: None,
            retransmit: None,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn session_key(&self) -> Option<&SymmetricKey> {
        self.session_key.as_ref()
    }

    pub fn offer_sent(&mut self, offer: OfferState) {
        self.pending_offer = Some(offer);
        self.state = PeerState::OfferSent;
    }

    /// Check an `accept` against the outstanding offer and install its key.
    pub fn accept_received(&mut self, encrypted_response_hash: &str) -> Result<&SymmetricKey, CryptoError> {
        let offer = self
            .pending_offer
            .as_ref()
            .ok_or(CryptoError::HandshakeMismatch("no offer outstanding"))?;
        freespeak_crypto::handshake::verify_response(offer, encrypted_response_hash)?;

        let key = offer.session_key().clone();
        self.pending_offer = None;
        self.state = PeerState::Established;
        Ok(self.session_key.insert(key))
    }

    /// Install the key from a verified offer. A later offer replaces an
    /// earlier one that was never accepted.
    pub fn offer_received(&mut self, accept: AcceptState) -> &SymmetricKey {
        let key = accept.session_key().clone();
        self.pending_offer = None;
        self.pending_accept = Some(accept);
        self.state = PeerState::OfferReceived;
        self.session_key.insert(key)
    }

    /// Hand out the state needed to seal an `accept`, if an offer is waiting.
    pub fn take_accept(&mut self) -> Option<AcceptState> {
        let accept = self.pending_accept.take()?;
        self.state = PeerState::Established;
        Some(accept)
    }

    pub fn has_pending_accept(&self) -> bool {
        self.pending_accept.is_some()
    }

    /// Remember what went out so a matching `cryptofail` can recover it.
    /// Only real messages are tracked; decoys are never retransmitted.
    pub fn record_text(&mut self, plaintext: &str, ciphertext: &str) {
        self.last_plaintext = Some(plaintext.to_string());
        self.last_ciphertext_hash = Some(primitives::truncated_hash(ciphertext.as_bytes()));
        self.retransmit = None;
    }

    /// Queue the last message for resending if `hash` names its ciphertext.
    pub fn crypto_failed(&mut self, hash: Option<&str>) -> bool {
        let matches = matches!(
            (hash, self.last_ciphertext_hash.as_deref()),
            (Some(failed), Some(sent)) if failed == sent
        );
        if matches {
            self.retransmit = self.last_plaintext.clone();
        }
        matches
    }

    pub fn take_retransmit(&mut self) -> Option<String> {
        self.retransmit.take()
    }

    pub fn retransmit_pending(&self) -> bool {
        self.retransmit.is_some()
    }

    pub fn mark_disconnected(&mut self) {
        self.state = PeerState::Disconnected;
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            state: self.state,
            fingerprint: self.session_key.as_ref().map(SymmetricKey::fingerprint),
            awaiting_accept: self.has_pending_accept(),
            retransmit_pending: self.retransmit.is_some(),
        }
    }
}

/// Read-only view of a peer handed out through the client handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub state: PeerState,
    pub fingerprint: Option<String>,
    /// A verified offer is waiting for [`ClientHandle::accept`](crate::ClientHandle::accept).
    pub awaiting_accept: bool,
    pub retransmit_pending: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use freespeak_crypto::handshake::{create_offer, receive_offer, seal_response};
    use freespeak_crypto::{HandshakeNonce, Identity};

    struct Pair {
        offerer: ConnectionInfo,
        responder: ConnectionInfo,
        accept_payload: String,
    }

    async fn handshake() -> Pair {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let alice_nonce = HandshakeNonce::generate();
        let bob_nonce = HandshakeNonce::generate();

        let (sealed, offer) = create_offer(&alice, &alice_nonce, bob.public_key(), &bob_nonce)
            .await
            .unwrap();
        let mut offerer = ConnectionInfo::new(bob.id().clone());
        offerer.offer_sent(offer);

        let accept = receive_offer(
            &bob,
            &bob_nonce,
            alice.id(),
            alice.public_key(),
            &alice_nonce,
            &sealed.encrypted_nonce,
            &sealed.nonce_hash,
        )
        .await
        .unwrap();
        let mut responder = ConnectionInfo::new(alice.id().clone());
        responder.offer_received(accept);
        let accept_payload = seal_response(&responder.take_accept().unwrap()).unwrap();

        Pair {
            offerer,
            responder,
            accept_payload,
        }
    }

    #[tokio::test]
    async fn test_both_sides_reach_established() {
        let Pair {
            mut offerer,
            responder,
            accept_payload,
        } = handshake().await;
        assert_eq!(offerer.state(), PeerState::OfferSent);
        assert!(offerer.session_key().is_none());
        assert_eq!(responder.state(), PeerState::Established);

        let key = offerer.accept_received(&accept_payload).unwrap().clone();
        assert_eq!(offerer.state(), PeerState::Established);
        assert_eq!(
            offerer.snapshot().fingerprint,
            Some(key.fingerprint())
        );
        assert_eq!(offerer.snapshot().fingerprint, responder.snapshot().fingerprint);
    }

    #[tokio::test]
    async fn test_snapshot_shows_offer_waiting_for_accept() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let alice_nonce = HandshakeNonce::generate();
        let bob_nonce = HandshakeNonce::generate();
        let (sealed, _) = create_offer(&alice, &alice_nonce, bob.public_key(), &bob_nonce)
            .await
            .unwrap();
        let accept = receive_offer(
            &bob,
            &bob_nonce,
            alice.id(),
            alice.public_key(),
            &alice_nonce,
            &sealed.encrypted_nonce,
            &sealed.nonce_hash,
        )
        .await
        .unwrap();

        let mut info = ConnectionInfo::new(alice.id().clone());
        assert!(!info.snapshot().awaiting_accept);
        info.offer_received(accept);
        let snapshot = info.snapshot();
        assert_eq!(snapshot.state, PeerState::OfferReceived);
        assert!(snapshot.awaiting_accept);

        assert!(info.take_accept().is_some());
        assert!(!info.snapshot().awaiting_accept);
        assert_eq!(info.state(), PeerState::Established);
    }

    #[tokio::test]
    async fn test_accept_without_offer_is_rejected() {
        let Pair { accept_payload, .. } = handshake().await;
        let mut info = ConnectionInfo::new(PeerId::parse("a1b2c3d4").unwrap());
        assert!(matches!(
            info.accept_received(&accept_payload),
            Err(CryptoError::HandshakeMismatch(_))
        ));
        assert_eq!(info.state(), PeerState::Disconnected);
    }

    #[test]
    fn test_cryptofail_queues_only_matching_hash() {
        let mut info = ConnectionInfo::new(PeerId::parse("a1b2c3d4").unwrap());
        assert!(!info.crypto_failed(Some("00000000")));

        info.record_text("hello", "ciphertext-one");
        let hash = primitives::truncated_hash(b"ciphertext-one");
        assert!(!info.crypto_failed(Some("ffffffff")));
        assert!(!info.crypto_failed(None));
        assert!(!info.retransmit_pending());

        assert!(info.crypto_failed(Some(&hash)));
        assert!(info.snapshot().retransmit_pending);

        // A newer send supersedes the queued one.
        info.record_text("newer", "ciphertext-two");
        assert!(info.take_retransmit().is_none());

        let hash = primitives::truncated_hash(b"ciphertext-two");
        info.crypto_failed(Some(&hash));
        assert_eq!(info.take_retransmit().as_deref(), Some("newer"));
        assert!(info.take_retransmit().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_key_material() {
        let Pair { mut responder, .. } = handshake().await;
        responder.record_text("hi", "ct");
        responder.mark_disconnected();

        let snapshot = responder.snapshot();
        assert_eq!(snapshot.state, PeerState::Disconnected);
        assert!(snapshot.fingerprint.is_some());
        assert!(responder.crypto_failed(Some(&primitives::truncated_hash(b"ct"))));
    }
}
