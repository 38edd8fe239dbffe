//! Events published by the client and the envelope carried inside every
//! message ciphertext.

use freespeak_crypto::primitives;
use freespeak_crypto::{CryptoError, HandshakeNonce, PeerId, PublicKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Text,
    Decoy,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Text => "text",
            EnvelopeKind::Decoy => "decoy",
        }
    }
}

/// Plaintext of a `msg` frame. The kind is only visible after decryption, so
/// the relay cannot tell decoys from real messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Base64 body.
    pub text: String,
}

impl Envelope {
    pub fn text(body: &str) -> Self {
        Self {
            kind: EnvelopeKind::Text,
            text: primitives::to_base64(body.as_bytes()),
        }
    }

    /// Random body of `length` bytes.
    pub fn decoy(length: usize) -> Self {
        Self {
            kind: EnvelopeKind::Decoy,
            text: primitives::to_base64(&primitives::random_bytes(length)),
        }
    }

    pub fn is_decoy(&self) -> bool {
        self.kind == EnvelopeKind::Decoy
    }

    pub fn body(&self) -> Result<Vec<u8>, CryptoError> {
        primitives::from_base64(&self.text)
    }

    /// Body as UTF-8, for text envelopes.
    pub fn body_text(&self) -> Option<String> {
        self.body().ok().and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Everything the client reports to front-ends and the decoy generator.
#[derive(Debug, Clone)]
pub enum Event {
    Connecting {
        url: String,
    },
    /// Registration acknowledged; `id` is the address to share with peers.
    Connect {
        id: PeerId,
        motd: String,
    },
    KeySent,
    GetKeySent {
        id: PeerId,
    },
    GetKey {
        id: PeerId,
        pubkey: PublicKey,
        nonce: HandshakeNonce,
    },
    GetKeyFailed {
        id: PeerId,
    },
    OfferSent {
        id: PeerId,
    },
    Offer {
        id: PeerId,
    },
    AcceptSent {
        id: PeerId,
    },
    Accept {
        id: PeerId,
    },
    /// A session key is in place. `fingerprint` is identical on both sides
    /// of an honest exchange.
    Established {
        id: PeerId,
        fingerprint: String,
    },
    SendMsg {
        id: PeerId,
        msg: Envelope,
        retransmit: bool,
    },
    Msg {
        id: PeerId,
        msg: Envelope,
        retransmit: bool,
    },
    SendCryptoFail {
        id: PeerId,
        hash: String,
    },
    /// The peer could not decipher a message. `reconnecting` is set when a
    /// fresh handshake was started in response.
    CryptoFail {
        id: PeerId,
        hash: Option<String>,
        reconnecting: bool,
    },
    Disconnect {
        id: PeerId,
    },
    HeartbeatSent,
    Heartbeat,
    Close {
        reconnectable: bool,
    },
    /// `error` frame from the relay, or a local transport failure.
    Error {
        message: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connecting { .. } => "connecting",
            Event::Connect { .. } => "connect",
            Event::KeySent => "keySent",
            Event::GetKeySent { .. } => "getKeySent",
            Event::GetKey { .. } => "getkey",
            Event::GetKeyFailed { .. } => "getkeyFailed",
            Event::OfferSent { .. } => "offerSent",
            Event::Offer { .. } => "offer",
            Event::AcceptSent { .. } => "acceptSent",
            Event::Accept { .. } => "accept",
            Event::Established { .. } => "established",
            Event::SendMsg { .. } => "sendMsg",
            Event::Msg { .. } => "msg",
            Event::SendCryptoFail { .. } => "sendCryptoFail",
            Event::CryptoFail { .. } => "cryptofail",
            Event::Disconnect { .. } => "disconnect",
            Event::HeartbeatSent => "heartbeatSent",
            Event::Heartbeat => "heartbeat",
            Event::Close { .. } => "close",
            Event::Error { .. } => "error",
        }
    }

    /// Name with the envelope kind appended for message events, e.g.
    /// `msg.text` or `sendMsg.decoy`.
    pub fn qualified_name(&self) -> String {
        match self {
            Event::SendMsg { msg, .. } | Event::Msg { msg, .. } => {
                format!("{}.{}", self.name(), msg.kind.as_str())
            }
            _ => self.name().to_string(),
        }
    }

    /// Peer the event concerns, if any.
    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Event::GetKeySent { id }
            | Event::GetKey { id, .. }
            | Event::GetKeyFailed { id }
            | Event::OfferSent { id }
            | Event::Offer { id }
            | Event::AcceptSent { id }
            | Event::Accept { id }
            | Event::Established { id, .. }
            | Event::SendMsg { id, .. }
            | Event::Msg { id, .. }
            | Event::SendCryptoFail { id, .. }
            | Event::CryptoFail { id, .. }
            | Event::Disconnect { id } => Some(id),
            Event::Connecting { .. }
            | Event::Connect { .. }
            | Event::KeySent
            | Event::HeartbeatSent
            | Event::Heartbeat
            | Event::Close { .. }
            | Event::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::text("hi");
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "aGk="}));
        assert_eq!(envelope.body_text().as_deref(), Some("hi"));
    }

    #[test]
    fn test_decoy_envelope() {
        let decoy = Envelope::decoy(40);
        assert!(decoy.is_decoy());
        assert_eq!(decoy.body().unwrap().len(), 40);

        let parsed = Envelope::from_bytes(&decoy.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, decoy);
    }

    #[test]
    fn test_envelope_rejects_unknown_kind() {
        assert!(Envelope::from_bytes(br#"{"type":"shout","text":""}"#).is_err());
        assert!(Envelope::from_bytes(b"not json").is_err());
    }

    #[test]
    fn test_qualified_names() {
        let id = PeerId::parse("a1b2c3d4").unwrap();
        let event = Event::Msg {
            id: id.clone(),
            msg: Envelope::decoy(1),
            retransmit: false,
        };
        assert_eq!(event.name(), "msg");
        assert_eq!(event.qualified_name(), "msg.decoy");
        assert_eq!(event.peer(), Some(&id));

        let event = Event::SendMsg {
            id,
            msg: Envelope::text("x"),
            retransmit: true,
        };
        assert_eq!(event.qualified_name(), "sendMsg.text");
        assert_eq!(Event::Heartbeat.qualified_name(), "heartbeat");
        assert!(Event::Close { reconnectable: true }.peer().is_none());
    }
}
