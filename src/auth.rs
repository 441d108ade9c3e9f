//! Password hashing for rooms and users

use sha2::{Digest, Sha256};

/// Salted digest stored in place of a password
///
/// The owning entity's id is the salt, so equal passwords on different rooms
/// or users hash differently.
pub fn hash_password(owner_id: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a password against a stored digest; no digest means no password
pub fn verify_password(owner_id: &str, hashed: Option<&str>, password: &str) -> bool {
    match hashed {
        None => true,
        Some(hashed) => hash_password(owner_id, password) == hashed,
    }
}
