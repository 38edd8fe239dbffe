use thiserror::Error;

/// Errors raised by the primitives, the codec and the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Peer public key was malformed or produced a non-contributory secret.
    #[error("key agreement failed: {0}")]
    KeyAgreement(String),

    /// Decryption or digest verification failed; the payload must be discarded.
    #[error("Unable to decipher message")]
    Integrity,

    /// Input could not be decoded into the expected shape.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A handshake commitment did not match the locally computed value.
    #[error("handshake verification failed: {0}")]
    HandshakeMismatch(&'static str),

    #[error("unsupported key size: {0} bits")]
    UnsupportedKeySize(usize),
}
