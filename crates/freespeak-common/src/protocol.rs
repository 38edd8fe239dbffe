//! Wire frames exchanged between clients and the relay.
//!
//! Every frame is one JSON array sent as a single text message. The first
//! element is always a string opcode; the remaining elements depend on the
//! opcode and on the direction of travel:
//!
//! ```text
//! ["key", pubkey, nonce]                                   client -> relay
//! ["key", id, motd]                                        relay -> client
//! ["getkey", id]                                           client -> relay
//! ["getkey", id, pubkey|null, nonce|null]                  relay -> client
//! ["offer", peer_id, encrypted_nonce, nonce_hash]          client -> relay
//! ["offer", sender_id, pubkey, nonce, encrypted_nonce, nonce_hash]
//!                                                          relay -> client
//! ["accept", peer_id, encrypted_response_hash]             both directions
//! ["msg", peer_id, ciphertext, retransmit]                 both directions
//! ["cryptofail", peer_id, truncated_hash|null]             both directions
//! ["disconnect", peer_id]                                  relay -> client
//! ["heartbeat"]                                            both directions
//! ["error", message]                                       relay -> client
//! ```
//!
//! The relay never interprets the opaque base64 payloads beyond checking
//! that they are strings.

use serde_json::{json, Value};
use thiserror::Error;

/// Largest raw frame either side will accept.
pub const MAX_FRAME_BYTES: usize = 16 * 1024;

/// Closed set of opcodes understood by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Key,
    GetKey,
    Offer,
    Accept,
    Msg,
    CryptoFail,
    Disconnect,
    Heartbeat,
    Error,
}

impl Opcode {
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Key => "key",
            Opcode::GetKey => "getkey",
            Opcode::Offer => "offer",
            Opcode::Accept => "accept",
            Opcode::Msg => "msg",
            Opcode::CryptoFail => "cryptofail",
            Opcode::Disconnect => "disconnect",
            Opcode::Heartbeat => "heartbeat",
            Opcode::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "key" => Opcode::Key,
            "getkey" => Opcode::GetKey,
            "offer" => Opcode::Offer,
            "accept" => Opcode::Accept,
            "msg" => Opcode::Msg,
            "cryptofail" => Opcode::CryptoFail,
            "disconnect" => Opcode::Disconnect,
            "heartbeat" => Opcode::Heartbeat,
            "error" => Opcode::Error,
            _ => return None,
        })
    }
}

/// Frame-level rejection. The relay reports these back as `error` frames
/// and keeps the connection open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Request is too long ({len} bytes, limit {max})")]
    TooLong { len: usize, max: usize },

    #[error("Request is not valid JSON")]
    InvalidJson,

    #[error("Request must be an array")]
    NotArray,

    #[error("Request must contain message type")]
    MissingOpcode,

    #[error("First argument must be method")]
    OpcodeNotString,

    #[error("Unsupported method: {0}")]
    UnsupportedOpcode(String),

    #[error("Missing {0}")]
    MissingField(&'static str),

    #[error("Field {0} has the wrong type")]
    InvalidField(&'static str),
}

/// Reject frames whose raw encoded length exceeds `max` bytes.
pub fn check_frame_len(text: &str, max: usize) -> Result<(), ProtocolError> {
    if text.len() > max {
        return Err(ProtocolError::TooLong {
            len: text.len(),
            max,
        });
    }
    Ok(())
}

/// Frames a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Key {
        pubkey: String,
        nonce: String,
    },
    GetKey {
        id: String,
    },
    Offer {
        peer_id: String,
        encrypted_nonce: String,
        nonce_hash: String,
    },
    Accept {
        peer_id: String,
        encrypted_response_hash: String,
    },
    Msg {
        peer_id: String,
        ciphertext: String,
        retransmit: bool,
    },
    CryptoFail {
        peer_id: String,
        hash: Option<String>,
    },
    Heartbeat,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (opcode, fields) = split(text)?;
        let fields = Fields(&fields);

        Ok(match opcode {
            Opcode::Key => ClientFrame::Key {
                pubkey: fields.string(0, "public key")?,
                nonce: fields.string(1, "handshake nonce")?,
            },
            Opcode::GetKey => ClientFrame::GetKey {
                id: fields.string(0, "key ID")?,
            },
            Opcode::Offer => ClientFrame::Offer {
                peer_id: fields.string(0, "peer ID")?,
                encrypted_nonce: fields.string(1, "encrypted nonce")?,
                nonce_hash: fields.string(2, "nonce hash")?,
            },
            Opcode::Accept => ClientFrame::Accept {
                peer_id: fields.string(0, "peer ID")?,
                encrypted_response_hash: fields.string(1, "encrypted response hash")?,
            },
            Opcode::Msg => ClientFrame::Msg {
                peer_id: fields.string(0, "peer ID")?,
                ciphertext: fields.string(1, "ciphertext")?,
                retransmit: fields.boolean(2, "retransmit flag")?,
            },
            Opcode::CryptoFail => ClientFrame::CryptoFail {
                peer_id: fields.string(0, "peer ID")?,
                hash: fields.optional_string(1, "ciphertext hash")?,
            },
            Opcode::Heartbeat => ClientFrame::Heartbeat,
            Opcode::Disconnect | Opcode::Error => {
                return Err(ProtocolError::UnsupportedOpcode(opcode.as_str().to_string()))
            }
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            ClientFrame::Key { .. } => Opcode::Key,
            ClientFrame::GetKey { .. } => Opcode::GetKey,
            ClientFrame::Offer { .. } => Opcode::Offer,
            ClientFrame::Accept { .. } => Opcode::Accept,
            ClientFrame::Msg { .. } => Opcode::Msg,
            ClientFrame::CryptoFail { .. } => Opcode::CryptoFail,
            ClientFrame::Heartbeat => Opcode::Heartbeat,
        }
    }

    pub fn to_value(&self) -> Value {
        let op = self.opcode().as_str();
        match self {
            ClientFrame::Key { pubkey, nonce } => json!([op, pubkey, nonce]),
            ClientFrame::GetKey { id } => json!([op, id]),
            ClientFrame::Offer {
                peer_id,
                encrypted_nonce,
                nonce_hash,
            } => json!([op, peer_id, encrypted_nonce, nonce_hash]),
            ClientFrame::Accept {
                peer_id,
                encrypted_response_hash,
            } => json!([op, peer_id, encrypted_response_hash]),
            ClientFrame::Msg {
                peer_id,
                ciphertext,
                retransmit,
            } => json!([op, peer_id, ciphertext, retransmit]),
            ClientFrame::CryptoFail { peer_id, hash } => json!([op, peer_id, hash]),
            ClientFrame::Heartbeat => json!([op]),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Frames the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    Key {
        id: String,
        motd: String,
    },
    GetKey {
        id: String,
        pubkey: Option<String>,
        nonce: Option<String>,
    },
    Offer {
        peer_id: String,
        pubkey: String,
        nonce: String,
        encrypted_nonce: String,
        nonce_hash: String,
    },
    Accept {
        peer_id: String,
        encrypted_response_hash: String,
    },
    Msg {
        peer_id: String,
        ciphertext: String,
        retransmit: bool,
    },
    CryptoFail {
        peer_id: String,
        hash: Option<String>,
    },
    Disconnect {
        peer_id: String,
    },
    Heartbeat,
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl std::fmt::Display) -> Self {
        ServerFrame::Error {
            message: message.to_string(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let (opcode, fields) = split(text)?;
        let fields = Fields(&fields);

        Ok(match opcode {
            Opcode::Key => ServerFrame::Key {
                id: fields.string(0, "key ID")?,
                motd: fields.optional_string(1, "motd")?.unwrap_or_default(),
            },
            Opcode::GetKey => ServerFrame::GetKey {
                id: fields.string(0, "key ID")?,
                pubkey: fields.optional_string(1, "public key")?,
                nonce: fields.optional_string(2, "handshake nonce")?,
            },
            Opcode::Offer => ServerFrame::Offer {
                peer_id: fields.string(0, "peer ID")?,
                pubkey: fields.string(1, "public key")?,
                nonce: fields.string(2, "handshake nonce")?,
                encrypted_nonce: fields.string(3, "encrypted nonce")?,
                nonce_hash: fields.string(4, "nonce hash")?,
            },
            Opcode::Accept => ServerFrame::Accept {
                peer_id: fields.string(0, "peer ID")?,
                encrypted_response_hash: fields.string(1, "encrypted response hash")?,
            },
            Opcode::Msg => ServerFrame::Msg {
                peer_id: fields.string(0, "peer ID")?,
                ciphertext: fields.string(1, "ciphertext")?,
                retransmit: fields.boolean(2, "retransmit flag")?,
            },
            Opcode::CryptoFail => ServerFrame::CryptoFail {
                peer_id: fields.string(0, "peer ID")?,
                hash: fields.optional_string(1, "ciphertext hash")?,
            },
            Opcode::Disconnect => ServerFrame::Disconnect {
                peer_id: fields.string(0, "peer ID")?,
            },
            Opcode::Heartbeat => ServerFrame::Heartbeat,
            Opcode::Error => ServerFrame::Error {
                message: fields.string(0, "message")?,
            },
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            ServerFrame::Key { .. } => Opcode::Key,
            ServerFrame::GetKey { .. } => Opcode::GetKey,
            ServerFrame::Offer { .. } => Opcode::Offer,
            ServerFrame::Accept { .. } => Opcode::Accept,
            ServerFrame::Msg { .. } => Opcode::Msg,
            ServerFrame::CryptoFail { .. } => Opcode::CryptoFail,
            ServerFrame::Disconnect { .. } => Opcode::Disconnect,
            ServerFrame::Heartbeat => Opcode::Heartbeat,
            ServerFrame::Error { .. } => Opcode::Error,
        }
    }

    pub fn to_value(&self) -> Value {
        let op = self.opcode().as_str();
        match self {
            ServerFrame::Key { id, motd } => json!([op, id, motd]),
            ServerFrame::GetKey { id, pubkey, nonce } => json!([op, id, pubkey, nonce]),
            ServerFrame::Offer {
                peer_id,
                pubkey,
                nonce,
                encrypted_nonce,
                nonce_hash,
            } => json!([op, peer_id, pubkey, nonce, encrypted_nonce, nonce_hash]),
            ServerFrame::Accept {
                peer_id,
                encrypted_response_hash,
            } => json!([op, peer_id, encrypted_response_hash]),
            ServerFrame::Msg {
                peer_id,
                ciphertext,
                retransmit,
            } => json!([op, peer_id, ciphertext, retransmit]),
            ServerFrame::CryptoFail { peer_id, hash } => json!([op, peer_id, hash]),
            ServerFrame::Disconnect { peer_id } => json!([op, peer_id]),
            ServerFrame::Heartbeat => json!([op]),
            ServerFrame::Error { message } => json!([op, message]),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

fn split(text: &str) -> Result<(Opcode, Vec<Value>), ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    let Value::Array(mut items) = value else {
        return Err(ProtocolError::NotArray);
    };
    if items.is_empty() {
        return Err(ProtocolError::MissingOpcode);
    }

    let Value::String(name) = items.remove(0) else {
        return Err(ProtocolError::OpcodeNotString);
    };
    let opcode = Opcode::parse(&name).ok_or(ProtocolError::UnsupportedOpcode(name))?;

    Ok((opcode, items))
}

/// Positional accessors over the fields that follow the opcode.
struct Fields<'a>(&'a [Value]);

impl Fields<'_> {
    fn string(&self, index: usize, name: &'static str) -> Result<String, ProtocolError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Err(ProtocolError::MissingField(name)),
            Some(Value::String(value)) => Ok(value.clone()),
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    fn optional_string(
        &self,
        index: usize,
        name: &'static str,
    ) -> Result<Option<String>, ProtocolError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }

    fn boolean(&self, index: usize, name: &'static str) -> Result<bool, ProtocolError> {
        match self.0.get(index) {
            Some(Value::Bool(value)) => Ok(*value),
            None => Err(ProtocolError::MissingField(name)),
            Some(_) => Err(ProtocolError::InvalidField(name)),
        }
    }
}
