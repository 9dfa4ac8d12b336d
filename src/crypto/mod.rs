//! The sealed envelope: hybrid encryption (X25519 + AES-256-GCM) with an Ed25519 signature over
//!  the encrypted parts, so relaying nodes can store and forward messages they cannot read.

pub mod identity;
pub mod envelope;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("failed to decrypt content key")]
    DecryptKey,
    #[error("failed to decrypt message ciphertext")]
    DecryptCiphertext,
    #[error("envelope was not sealed by the expected sender")]
    SenderMismatch,
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("failed to seal message")]
    Seal,
}
