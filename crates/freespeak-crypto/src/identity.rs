//! X25519 identities and peer ids.
//!
//! A **peer id** is the last eight hex characters of the SHA-256 of the
//! base64-serialized public key. It is a routing address, not a secret, and
//! two keys may collide on it.
//!
//! # Example
//!
//! ```
//! use freespeak_crypto::identity::{Identity, PeerId};
//!
//! let identity = Identity::generate();
//! let id = identity.id();
//! assert_eq!(id, &PeerId::from_serialized_key(identity.serialized_public_key()));
//! assert_eq!(id.as_str().len(), 8);
//! ```

use freespeak_common::helpers::is_truncated_hex;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::CryptoError;
use crate::primitives::{self, PrivateKey, PublicKey, TRUNCATED_HASH_LEN};

/// Short routing id derived from a public key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the id the relay will assign to this serialized public key.
    pub fn from_serialized_key(serialized: &str) -> Self {
        Self(primitives::truncated_hash(serialized.as_bytes()))
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self::from_serialized_key(&key.to_base64())
    }

    /// Parse an id received from the wire or typed by a user.
    pub fn parse(value: &str) -> Result<Self, CryptoError> {
        if !is_truncated_hex(value, TRUNCATED_HASH_LEN) {
            return Err(CryptoError::Malformed(format!("invalid peer id: {value:?}")));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Locally generated keypair. Only the public half ever leaves the process.
pub struct Identity {
    private: PrivateKey,
    public: PublicKey,
    serialized: String,
    id: PeerId,
}

impl Identity {
    /// Generate a new random identity using the OS CSPRNG.
    pub fn generate() -> Self {
        Self::from_private_key(PrivateKey::from_bytes(primitives::random_array()))
    }

    /// Recreate an identity from raw private key bytes.
    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        Self::from_private_key(PrivateKey::from_bytes(bytes))
    }

    fn from_private_key(private: PrivateKey) -> Self {
        let public = private.public_key();
        let serialized = public.to_base64();
        let id = PeerId::from_serialized_key(&serialized);
        Self {
            private,
            public,
            serialized,
            id,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn serialized_public_key(&self) -> &str {
        &self.serialized
    }

    pub(crate) fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    /// Raw private key bytes, for callers that export identities.
    ///
    /// # Security
    /// Handle with care! These bytes recreate the identity.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private.to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}
