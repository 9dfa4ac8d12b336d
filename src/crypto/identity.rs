use std::fmt::{Debug, Formatter};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::crypto::EnvelopeError;


/// A user's public key: Ed25519 verifying key followed by X25519 agreement key, 64 bytes total.
///  Serialized as base64 in JSON.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey {
    verifying: [u8; 32],
    agreement: [u8; 32],
}

impl PublicKey {
    pub const SERIALIZED_LEN: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_LEN] {
        let mut result = [0u8; Self::SERIALIZED_LEN];
        result[..32].copy_from_slice(&self.verifying);
        result[32..].copy_from_slice(&self.agreement);
        result
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<PublicKey, EnvelopeError> {
        if bytes.len() != Self::SERIALIZED_LEN {
            return Err(EnvelopeError::InvalidKey(format!("expected {} bytes, was {}", Self::SERIALIZED_LEN, bytes.len())));
        }

        let mut verifying = [0u8; 32];
        verifying.copy_from_slice(&bytes[..32]);
        let mut agreement = [0u8; 32];
        agreement.copy_from_slice(&bytes[32..]);

        // reject keys that are not valid curve points right away rather than on first use
        VerifyingKey::from_bytes(&verifying)
            .map_err(|e| EnvelopeError::InvalidKey(e.to_string()))?;

        Ok(PublicKey { verifying, agreement })
    }

    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey, EnvelopeError> {
        VerifyingKey::from_bytes(&self.verifying)
            .map_err(|e| EnvelopeError::InvalidKey(e.to_string()))
    }

    pub(crate) fn agreement_key(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.agreement)
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // the verifying key's prefix is enough to tell keys apart in logs
        write!(f, "PublicKey({:02x}{:02x}{:02x}{:02x}..)", self.verifying[0], self.verifying[1], self.verifying[2], self.verifying[3])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        PublicKey::from_bytes(&bytes)
            .map_err(serde::de::Error::custom)
    }
}


/// A user's private key material. Never leaves the local node.
pub struct Identity {
    signing: SigningKey,
    agreement: StaticSecret,
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity{{{:?}}}", self.public_key())
    }
}

impl Identity {
    pub fn generate() -> Identity {
        Identity {
            signing: SigningKey::generate(&mut OsRng),
            agreement: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(signing: [u8; 32], agreement: [u8; 32]) -> Identity {
        Identity {
            signing: SigningKey::from_bytes(&signing),
            agreement: StaticSecret::from(agreement),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key().to_bytes(),
            agreement: X25519PublicKey::from(&self.agreement).to_bytes(),
        }
    }

    pub(crate) fn sign(&self, msg: &[u8]) -> Signature {
        self.signing.sign(msg)
    }

    pub(crate) fn agree(&self, other: &X25519PublicKey) -> [u8; 32] {
        self.agreement.diffie_hellman(other).to_bytes()
    }
}
