//! Cryptographic primitives for Freespeak.
//!
//! This crate provides:
//! - X25519 identities and the short routing ids derived from them
//! - The padded, double-layer message codec used for every ciphertext on the wire
//! - The offer/accept handshake computations with nonce commitments
//!
//! # Design
//!
//! All protocol code goes through [`primitives`], so the hash, cipher and key
//! agreement can be swapped without touching the codec or the handshake.
//! Nothing in this crate performs I/O; the relay only ever needs
//! [`identity::PeerId`] and [`primitives::PublicKey`] to validate registrations.

#![forbid(unsafe_code)]

pub mod codec;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod primitives;

pub use error::CryptoError;
pub use handshake::{AcceptState, HandshakeNonce, OfferState, SealedOffer};
pub use identity::{Identity, PeerId};
pub use primitives::{PrivateKey, PublicKey, SymmetricKey};
