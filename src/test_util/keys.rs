use crate::crypto::identity::Identity;
use crate::model::{User, UserId};


/// A deterministic identity: the same `n` always yields the same key pair
pub fn test_identity(n: u8) -> Identity {
    Identity::from_secret_bytes([n; 32], [n.wrapping_add(100); 32])
}

/// A user named `name` whose keys are `test_identity(n)`
pub fn test_user(name: &str, n: u8) -> (User, Identity) {
    let identity = test_identity(n);
    let user = User {
        id: UserId::from(name),
        name: name.to_string(),
        public_key: identity.public_key(),
    };
    (user, identity)
}
