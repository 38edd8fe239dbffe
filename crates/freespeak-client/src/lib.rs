//! Freespeak client core.
//!
//! Registers with a relay, runs the offer/accept handshake with peers,
//! encrypts messages through the padded codec, recovers from `cryptofail`
//! by re-handshaking and retransmitting, and generates decoy traffic.
//! Front-ends drive it through [`ClientHandle`] and render [`Event`]s.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod connection;
mod decoy;
pub mod events;
pub mod transport;

pub use client::{ClientError, ClientHandle};
pub use config::{ClientConfig, DecoyConfig, Uniform};
pub use connection::{ClientStatus, PeerSnapshot, PeerState};
pub use events::{Envelope, EnvelopeKind, Event};
pub use transport::{Connector, Transport, WsConnector};
