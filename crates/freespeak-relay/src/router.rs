//! Per-connection frame dispatch.
//!
//! A [`Connection`] handles the frames of one socket strictly in arrival
//! order. It never interprets ciphertext: offers, accepts and messages are
//! forwarded with only the sender's id (and, for offers, its registered key
//! and nonce) attached.

use std::sync::Arc;

use freespeak_common::protocol::check_frame_len;
use freespeak_common::{ClientFrame, ProtocolError, ServerFrame};
use freespeak_crypto::primitives::TRUNCATED_HASH_LEN;
use freespeak_crypto::{HandshakeNonce, PeerId, PublicKey};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::registry::{ConnectionId, Entry, Outbox, SharedRegistry};

/// Rejection returned to the offending connection as an `error` frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("You must register a public key to do that")]
    NotRegistered,

    #[error("No such peer")]
    NoSuchPeer,

    #[error("Invalid public key")]
    InvalidKey,

    #[error("{0}")]
    InvalidField(&'static str),
}

pub struct Connection {
    conn: ConnectionId,
    outbox: Outbox,
    registry: SharedRegistry,
    config: Arc<RelayConfig>,
    id: Option<PeerId>,
}

impl Connection {
    pub fn new(registry: SharedRegistry, config: Arc<RelayConfig>, outbox: Outbox) -> Self {
        Self {
            conn: Uuid::new_v4(),
            outbox,
            registry,
            config,
            id: None,
        }
    }

    /// Id this connection last registered, whether or not it still owns it.
    pub fn id(&self) -> Option<&PeerId> {
        self.id.as_ref()
    }

    /// Handle one raw text frame. Every failure becomes an `error` frame; the
    /// connection stays usable.
    pub async fn handle_text(&mut self, text: &str) {
        let result = match check_frame_len(text, self.config.max_frame_bytes)
            .and_then(|()| ClientFrame::parse(text))
        {
            Ok(frame) => self.dispatch(frame).await,
            Err(err) => Err(err.into()),
        };

        if let Err(err) = result {
            debug!(conn = %self.conn, "rejected frame: {}", err);
            self.reply(ServerFrame::error(err)).await;
        }
    }

    pub async fn dispatch(&mut self, frame: ClientFrame) -> Result<(), RouteError> {
        match frame {
            ClientFrame::Key { pubkey, nonce } => self.register(pubkey, nonce).await,
            ClientFrame::GetKey { id } => {
                self.get_key(id).await;
                Ok(())
            }
            ClientFrame::Offer {
                peer_id,
                encrypted_nonce,
                nonce_hash,
            } => self.offer(&peer_id, encrypted_nonce, nonce_hash).await,
            ClientFrame::Accept {
                peer_id,
                encrypted_response_hash,
            } => {
                self.forward(&peer_id, true, |sender| ServerFrame::Accept {
                    peer_id: sender.id.to_string(),
                    encrypted_response_hash,
                })
                .await
            }
            ClientFrame::Msg {
                peer_id,
                ciphertext,
                retransmit,
            } => {
                self.forward(&peer_id, true, |sender| ServerFrame::Msg {
                    peer_id: sender.id.to_string(),
                    ciphertext,
                    retransmit,
                })
                .await
            }
            ClientFrame::CryptoFail { peer_id, hash } => {
                if hash.as_ref().is_some_and(|h| h.len() != TRUNCATED_HASH_LEN) {
                    return Err(RouteError::InvalidField(
                        "Hash should be last 8 characters of failed message ciphertext, or null",
                    ));
                }
                self.forward(&peer_id, false, |sender| ServerFrame::CryptoFail {
                    peer_id: sender.id.to_string(),
                    hash,
                })
                .await
            }
            ClientFrame::Heartbeat => {
                self.reply(ServerFrame::Heartbeat).await;
                Ok(())
            }
        }
    }

    async fn register(&mut self, pubkey: String, nonce: String) -> Result<(), RouteError> {
        let key = PublicKey::from_base64(&pubkey).map_err(|_| RouteError::InvalidKey)?;
        HandshakeNonce::from_base64(&nonce)
            .map_err(|_| RouteError::InvalidField("Invalid handshake nonce"))?;
        let id = PeerId::from_public_key(&key);

        {
            let mut registry = self.registry.write().await;

            // Re-registering under a new key retires the previous identity.
            if let Some(previous) = self.id.take().filter(|previous| *previous != id) {
                if let Some((_, notify)) = registry.remove_owned(previous.as_str(), self.conn) {
                    notify_disconnect(&previous, &notify);
                }
            }

            // Re-sending the same key keeps the links this connection built.
            let peers = registry
                .get_owned(id.as_str(), self.conn)
                .map(|entry| entry.peers.clone())
                .unwrap_or_default();
            let replaced = registry.insert(Entry {
                id: id.clone(),
                pubkey,
                nonce,
                conn: self.conn,
                outbox: self.outbox.clone(),
                peers,
            });
            if let Some(replaced) = replaced.filter(|replaced| replaced.conn != self.conn) {
                warn!("id {} re-registered by another connection", id);
                let _ = replaced.outbox.try_send(&ServerFrame::error(format!(
                    "Id {id} was registered by another connection"
                )));
            }
        }

        info!(conn = %self.conn, "registered {}", id);
        self.id = Some(id.clone());
        self.reply(ServerFrame::Key {
            id: id.to_string(),
            motd: self.config.motd.clone(),
        })
        .await;
        Ok(())
    }

    async fn get_key(&self, id: String) {
        let (pubkey, nonce) = {
            let registry = self.registry.read().await;
            match registry.get(&id) {
                Some(entry) => (Some(entry.pubkey.clone()), Some(entry.nonce.clone())),
                None => (None, None),
            }
        };
        self.reply(ServerFrame::GetKey { id, pubkey, nonce }).await;
    }

    async fn offer(
        &self,
        peer_id: &str,
        encrypted_nonce: String,
        nonce_hash: String,
    ) -> Result<(), RouteError> {
        self.forward(peer_id, false, |sender| ServerFrame::Offer {
            peer_id: sender.id.to_string(),
            pubkey: sender.pubkey.clone(),
            nonce: sender.nonce.clone(),
            encrypted_nonce,
            nonce_hash,
        })
        .await
    }

    /// Forward a frame built from the sender's registry entry to `peer_id`.
    ///
    /// With `link` set, both ids are recorded as connected so each is told
    /// when the other goes away.
    async fn forward<F>(&self, peer_id: &str, link: bool, build: F) -> Result<(), RouteError>
    where
        F: FnOnce(&Entry) -> ServerFrame,
    {
        let Some(own_id) = self.id.as_ref() else {
            return Err(RouteError::NotRegistered);
        };

        let (target, frame) = {
            let mut registry = self.registry.write().await;
            let Some(sender) = registry.get_owned(own_id.as_str(), self.conn) else {
                return Err(RouteError::NotRegistered);
            };
            let frame = build(sender);
            let Some(peer) = registry.get(peer_id) else {
                return Err(RouteError::NoSuchPeer);
            };
            let target = (peer.id.clone(), peer.outbox.clone());
            if link {
                registry.link(own_id, &target.0);
            }
            (target, frame)
        };

        let (target_id, target_outbox) = target;
        if !target_outbox.try_send(&frame) {
            warn!("failed to queue {} for {}", frame.opcode().as_str(), target_id);
        } else {
            debug!("{} {} -> {}", frame.opcode().as_str(), own_id, target_id);
        }
        Ok(())
    }

    async fn reply(&self, frame: ServerFrame) {
        if !self.outbox.send(&frame).await {
            debug!(conn = %self.conn, "dropping reply to closed connection");
        }
    }

    /// Tear down: drop the registration this connection still owns and tell
    /// its linked peers.
    pub async fn close(self) {
        let Some(id) = self.id else {
            return;
        };

        let removed = self.registry.write().await.remove_owned(id.as_str(), self.conn);
        match removed {
            Some((_, notify)) => {
                info!("client disconnected: {}", id);
                notify_disconnect(&id, &notify);
            }
            None => debug!("{} already owned by another connection", id),
        }
    }
}

fn notify_disconnect(id: &PeerId, outboxes: &[Outbox]) {
    let frame = ServerFrame::Disconnect {
        peer_id: id.to_string(),
    };
    for outbox in outboxes {
        let _ = outbox.try_send(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use freespeak_crypto::Identity;
    use tokio::sync::mpsc;

    struct TestClient {
        conn: Connection,
        rx: mpsc::Receiver<String>,
        identity: Identity,
        nonce: HandshakeNonce,
    }

    impl TestClient {
        fn new(registry: &SharedRegistry) -> Self {
            let (tx, rx) = mpsc::channel(16);
            Self {
                conn: Connection::new(
                    registry.clone(),
                    Arc::new(RelayConfig::default()),
                    Outbox::new(tx),
                ),
                rx,
                identity: Identity::generate(),
                nonce: HandshakeNonce::generate(),
            }
        }

        fn id(&self) -> String {
            self.identity.id().to_string()
        }

        async fn send(&mut self, frame: ClientFrame) {
            self.conn.handle_text(&frame.to_json()).await;
        }

        async fn register(&mut self) {
            let frame = ClientFrame::Key {
                pubkey: self.identity.serialized_public_key().to_string(),
                nonce: self.nonce.to_base64(),
            };
            self.send(frame).await;
            assert!(matches!(self.recv(), ServerFrame::Key { .. }));
        }

        fn recv(&mut self) -> ServerFrame {
            let text = self.rx.try_recv().expect("expected a queued frame");
            ServerFrame::parse(&text).unwrap()
        }

        fn expect_error(&mut self) -> String {
            match self.recv() {
                ServerFrame::Error { message } => message,
                other => panic!("expected error frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_register_assigns_hash_derived_id() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        alice
            .send(ClientFrame::Key {
                pubkey: alice.identity.serialized_public_key().to_string(),
                nonce: alice.nonce.to_base64(),
            })
            .await;

        match alice.recv() {
            ServerFrame::Key { id, motd } => {
                assert_eq!(id, alice.id());
                assert_eq!(motd, crate::config::DEFAULT_MOTD);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(registry.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_bad_key() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        alice
            .send(ClientFrame::Key {
                pubkey: "bm90IGEga2V5".into(),
                nonce: alice.nonce.to_base64(),
            })
            .await;
        assert_eq!(alice.expect_error(), "Invalid public key");
        assert!(registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_getkey_unknown_returns_nulls() {
        let registry = Registry::shared();
        let mut bob = TestClient::new(&registry);
        bob.send(ClientFrame::GetKey { id: "a1b2c3d4".into() }).await;
        assert_eq!(
            bob.recv(),
            ServerFrame::GetKey {
                id: "a1b2c3d4".into(),
                pubkey: None,
                nonce: None
            }
        );
    }

    #[tokio::test]
    async fn test_offer_requires_registration() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        alice
            .send(ClientFrame::Offer {
                peer_id: "a1b2c3d4".into(),
                encrypted_nonce: "x".into(),
                nonce_hash: "y".into(),
            })
            .await;
        assert_eq!(alice.expect_error(), "You must register a public key to do that");
    }

    #[tokio::test]
    async fn test_offer_forwarded_with_sender_key_and_nonce() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        let mut bob = TestClient::new(&registry);
        alice.register().await;
        bob.register().await;

        alice
            .send(ClientFrame::Offer {
                peer_id: bob.id(),
                encrypted_nonce: "enc".into(),
                nonce_hash: "hash".into(),
            })
            .await;

        assert_eq!(
            bob.recv(),
            ServerFrame::Offer {
                peer_id: alice.id(),
                pubkey: alice.identity.serialized_public_key().to_string(),
                nonce: alice.nonce.to_base64(),
                encrypted_nonce: "enc".into(),
                nonce_hash: "hash".into(),
            }
        );
        assert!(alice.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_to_unknown_peer_is_rejected() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        alice.register().await;
        alice
            .send(ClientFrame::Offer {
                peer_id: "00000000".into(),
                encrypted_nonce: "enc".into(),
                nonce_hash: "hash".into(),
            })
            .await;
        assert_eq!(alice.expect_error(), "No such peer");
    }

    #[tokio::test]
    async fn test_accept_links_peers_for_disconnect() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        let mut bob = TestClient::new(&registry);
        alice.register().await;
        bob.register().await;

        bob.send(ClientFrame::Accept {
            peer_id: alice.id(),
            encrypted_response_hash: "proof".into(),
        })
        .await;
        assert!(matches!(alice.recv(), ServerFrame::Accept { .. }));

        let bob_id = bob.id();
        bob.conn.close().await;
        assert_eq!(alice.recv(), ServerFrame::Disconnect { peer_id: bob_id });
        assert_eq!(registry.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_msg_forwarded_verbatim_and_links() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        let mut bob = TestClient::new(&registry);
        alice.register().await;
        bob.register().await;

        alice
            .send(ClientFrame::Msg {
                peer_id: bob.id(),
                ciphertext: "opaque".into(),
                retransmit: true,
            })
            .await;
        assert_eq!(
            bob.recv(),
            ServerFrame::Msg {
                peer_id: alice.id(),
                ciphertext: "opaque".into(),
                retransmit: true
            }
        );

        let alice_id = alice.id();
        alice.conn.close().await;
        assert_eq!(bob.recv(), ServerFrame::Disconnect { peer_id: alice_id });
    }

    #[tokio::test]
    async fn test_cryptofail_hash_validation() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        let mut bob = TestClient::new(&registry);
        alice.register().await;
        bob.register().await;

        alice
            .send(ClientFrame::CryptoFail {
                peer_id: bob.id(),
                hash: Some("short".into()),
            })
            .await;
        assert!(alice.expect_error().starts_with("Hash should be"));

        alice
            .send(ClientFrame::CryptoFail {
                peer_id: bob.id(),
                hash: None,
            })
            .await;
        assert_eq!(
            bob.recv(),
            ServerFrame::CryptoFail {
                peer_id: alice.id(),
                hash: None
            }
        );
    }

    #[tokio::test]
    async fn test_later_registration_wins_and_evicts() {
        let registry = Registry::shared();
        let mut first = TestClient::new(&registry);
        let mut second = TestClient::new(&registry);
        second.identity = Identity::from_private_bytes(first.identity.private_key_bytes());

        first.register().await;
        second.register().await;
        assert!(first.expect_error().contains("registered by another connection"));

        {
            let registry = registry.read().await;
            assert_eq!(registry.len(), 1);
            assert_eq!(
                registry.get(&first.id()).unwrap().nonce,
                second.nonce.to_base64()
            );
        }

        // The evicted connection can no longer act under the id.
        first
            .send(ClientFrame::Msg {
                peer_id: second.id(),
                ciphertext: "x".into(),
                retransmit: false,
            })
            .await;
        assert_eq!(first.expect_error(), "You must register a public key to do that");

        // Nor does closing it remove the newer registration.
        first.conn.close().await;
        assert_eq!(registry.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reregistering_new_key_retires_old_id() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        alice.register().await;
        let old_id = alice.id();

        alice.identity = Identity::generate();
        alice.register().await;

        let registry = registry.read().await;
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&old_id).is_none());
    }

    #[tokio::test]
    async fn test_reregistering_same_key_keeps_links() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        let mut bob = TestClient::new(&registry);
        alice.register().await;
        bob.register().await;

        bob.send(ClientFrame::Accept {
            peer_id: alice.id(),
            encrypted_response_hash: "proof".into(),
        })
        .await;
        assert!(matches!(alice.recv(), ServerFrame::Accept { .. }));

        bob.nonce = HandshakeNonce::generate();
        bob.register().await;
        assert_eq!(
            registry.read().await.get(&bob.id()).unwrap().nonce,
            bob.nonce.to_base64()
        );

        let bob_id = bob.id();
        bob.conn.close().await;
        assert_eq!(alice.recv(), ServerFrame::Disconnect { peer_id: bob_id });
        assert!(registry.read().await.get(&alice.id()).unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_does_not_register() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);
        let frame = ClientFrame::Key {
            pubkey: alice.identity.serialized_public_key().to_string(),
            nonce: "A".repeat(20_000),
        };
        alice.send(frame).await;
        assert!(alice.expect_error().starts_with("Request is too long"));
        assert!(registry.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_usable() {
        let registry = Registry::shared();
        let mut alice = TestClient::new(&registry);

        for bad in ["not json", "{}", "[]", "[1]", "[\"nope\"]", "[\"getkey\"]"] {
            alice.conn.handle_text(bad).await;
            alice.expect_error();
        }

        alice.send(ClientFrame::Heartbeat).await;
        assert_eq!(alice.recv(), ServerFrame::Heartbeat);
    }
}
