use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use ed25519_dalek::Signature;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::crypto::identity::{Identity, PublicKey};
use crate::crypto::EnvelopeError;


const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KDF_CONTEXT: &[u8] = b"peerpost-envelope-v1";

/// An encrypted and signed message.
///
/// ```ascii
/// encrypted_key: ephemeral X25519 public key (32) | nonce (12) | AES-GCM(content key) (32 + 16)
/// ciphertext:    nonce (12) | AES-GCM(message)
/// signature:     Ed25519 over SHA-256(encrypted_key | ciphertext)
/// ```
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SecureEnvelope {
    #[serde(with = "crate::util::base64_bytes")]
    pub encrypted_key: Vec<u8>,
    #[serde(with = "crate::util::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::util::base64_bytes")]
    pub signature: Vec<u8>,
    pub sender_key: PublicKey,
}

pub fn seal(message: &[u8], sender: &Identity, recipient: &PublicKey) -> Result<SecureEnvelope, EnvelopeError> {
    let mut content_key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut content_key);

    let ciphertext = aes_encrypt(&content_key, message)?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let recipient_agreement = recipient.agreement_key();
    let shared = ephemeral.diffie_hellman(&recipient_agreement);
    let kek = derive_key_encryption_key(shared.as_bytes(), &ephemeral_public, &recipient_agreement);

    let mut encrypted_key = ephemeral_public.to_bytes().to_vec();
    encrypted_key.extend_from_slice(&aes_encrypt(&kek, &content_key)?);

    let signature = sender.sign(&signed_digest(&encrypted_key, &ciphertext));

    trace!(len = message.len(), "sealed message");
    Ok(SecureEnvelope {
        encrypted_key,
        ciphertext,
        signature: signature.to_bytes().to_vec(),
        sender_key: sender.public_key(),
    })
}

/// Verifies the envelope's signature against the sender key it carries, and decrypts it. The
///  sender key is returned so the caller can check it against the sender it expects.
pub fn open(envelope: &SecureEnvelope, recipient: &Identity) -> Result<(Vec<u8>, PublicKey), EnvelopeError> {
    let signature = Signature::from_slice(&envelope.signature)
        .map_err(|_| EnvelopeError::InvalidSignature)?;
    envelope.sender_key.verifying_key()?
        .verify_strict(&signed_digest(&envelope.encrypted_key, &envelope.ciphertext), &signature)
        .map_err(|_| EnvelopeError::InvalidSignature)?;

    if envelope.encrypted_key.len() != 32 + NONCE_LEN + KEY_LEN + TAG_LEN {
        return Err(EnvelopeError::DecryptKey);
    }
    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&envelope.encrypted_key[..32]);
    let ephemeral_public = X25519PublicKey::from(ephemeral_public);

    let own_agreement = recipient.public_key().agreement_key();
    let shared = recipient.agree(&ephemeral_public);
    let kek = derive_key_encryption_key(&shared, &ephemeral_public, &own_agreement);

    let content_key = aes_decrypt(&kek, &envelope.encrypted_key[32..])
        .ok_or(EnvelopeError::DecryptKey)?;
    let plaintext = aes_decrypt(&content_key, &envelope.ciphertext)
        .ok_or(EnvelopeError::DecryptCiphertext)?;

    Ok((plaintext, envelope.sender_key))
}

pub fn open_from(envelope: &SecureEnvelope, recipient: &Identity, expected_sender: &PublicKey) -> Result<Vec<u8>, EnvelopeError> {
    if &envelope.sender_key != expected_sender {
        return Err(EnvelopeError::SenderMismatch);
    }
    let (plaintext, _) = open(envelope, recipient)?;
    Ok(plaintext)
}

fn signed_digest(encrypted_key: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(encrypted_key);
    hasher.update(ciphertext);
    hasher.finalize().into()
}

fn derive_key_encryption_key(shared: &[u8; 32], ephemeral_public: &X25519PublicKey, recipient: &X25519PublicKey) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(KDF_CONTEXT);
    hasher.update(shared);
    hasher.update(ephemeral_public.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

/// returns nonce followed by ciphertext (including the tag)
fn aes_encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| EnvelopeError::Seal)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let encrypted = cipher.encrypt(Nonce::<Aes256Gcm>::from_slice(&nonce), plaintext)
        .map_err(|_| EnvelopeError::Seal)?;

    let mut result = Vec::with_capacity(NONCE_LEN + encrypted.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&encrypted);
    Ok(result)
}

fn aes_decrypt(key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return None;
    }
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher.decrypt(Nonce::<Aes256Gcm>::from_slice(&data[..NONCE_LEN]), &data[NONCE_LEN..]).ok()
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::test_util::keys::test_identity;

    #[test]
    fn test_seal_open() {
        let alice = test_identity(1);
        let bob = test_identity(2);

        let envelope = seal(b"hello bob", &alice, &bob.public_key()).unwrap();
        let plaintext = open_from(&envelope, &bob, &alice.public_key()).unwrap();
        assert_eq!(plaintext, b"hello bob");

        let (plaintext, sender) = open(&envelope, &bob).unwrap();
        assert_eq!(plaintext, b"hello bob");
        assert_eq!(sender, alice.public_key());
    }

    #[test]
    fn test_seal_open_empty_and_large() {
        let alice = test_identity(1);
        let bob = test_identity(2);

        for msg in [Vec::new(), vec![0xab; 200_000]] {
            let envelope = seal(&msg, &alice, &bob.public_key()).unwrap();
            assert_eq!(open_from(&envelope, &bob, &alice.public_key()).unwrap(), msg);
        }
    }

    #[test]
    fn test_wrong_recipient() {
        let alice = test_identity(1);
        let bob = test_identity(2);
        let eve = test_identity(3);

        let envelope = seal(b"secret", &alice, &bob.public_key()).unwrap();
        assert!(matches!(open(&envelope, &eve), Err(EnvelopeError::DecryptKey)));
    }

    #[test]
    fn test_unexpected_sender() {
        let alice = test_identity(1);
        let bob = test_identity(2);
        let eve = test_identity(3);

        let envelope = seal(b"hi", &eve, &bob.public_key()).unwrap();
        assert!(matches!(open_from(&envelope, &bob, &alice.public_key()), Err(EnvelopeError::SenderMismatch)));
    }

    #[test]
    fn test_forged_sender_key() {
        let alice = test_identity(1);
        let bob = test_identity(2);
        let eve = test_identity(3);

        // eve re-labels her envelope as coming from alice, but cannot produce alice's signature
        let mut envelope = seal(b"hi", &eve, &bob.public_key()).unwrap();
        envelope.sender_key = alice.public_key();
        assert!(matches!(open(&envelope, &bob), Err(EnvelopeError::InvalidSignature)));
    }

    #[rstest]
    #[case::signature_first(0, 0)]
    #[case::signature_last(0, 63)]
    #[case::encrypted_key_first(1, 0)]
    #[case::encrypted_key_wrapped(1, 40)]
    #[case::encrypted_key_last(1, 91)]
    #[case::ciphertext_nonce(2, 0)]
    #[case::ciphertext_body(2, 15)]
    #[case::ciphertext_last(2, 35)]
    fn test_tampering_never_succeeds(#[case] part: usize, #[case] offset: usize) {
        let alice = test_identity(1);
        let bob = test_identity(2);

        let mut envelope = seal(b"twenty bytes of text", &alice, &bob.public_key()).unwrap();
        let buf = match part {
            0 => &mut envelope.signature,
            1 => &mut envelope.encrypted_key,
            _ => &mut envelope.ciphertext,
        };
        buf[offset] ^= 0x01;

        match open_from(&envelope, &bob, &alice.public_key()) {
            Err(EnvelopeError::InvalidSignature) | Err(EnvelopeError::DecryptKey) | Err(EnvelopeError::DecryptCiphertext) => {}
            other => panic!("tampered envelope was not rejected: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_signature() {
        let alice = test_identity(1);
        let bob = test_identity(2);

        let mut envelope = seal(b"x", &alice, &bob.public_key()).unwrap();
        envelope.signature.truncate(10);
        assert!(matches!(open(&envelope, &bob), Err(EnvelopeError::InvalidSignature)));
    }

    #[test]
    fn test_envelope_json() {
        let alice = test_identity(1);
        let bob = test_identity(2);

        let envelope = seal(b"json", &alice, &bob.public_key()).unwrap();
        let json = serde_json::to_vec(&envelope).unwrap();
        let parsed: SecureEnvelope = serde_json::from_slice(&json).unwrap();
        assert_eq!(open_from(&parsed, &bob, &alice.public_key()).unwrap(), b"json");
    }
}
