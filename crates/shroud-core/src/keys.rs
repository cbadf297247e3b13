//! Client key material for provisioning template servers.
//!
//! Keys only ever leave this module as base64 text: the private half goes
//! into the server descriptor, the public half to the provisioner.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Length of a base64-encoded 32-byte key, padding included.
pub const KEY_TEXT_LEN: usize = 44;

/// Check that `s` has the shape of a base64 WireGuard key.
///
/// Exactly 43 characters from `[A-Za-z0-9+/]` followed by a single `=`.
/// This is a syntax check only; it does not decode the key.
pub fn is_key_text(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != KEY_TEXT_LEN || bytes[KEY_TEXT_LEN - 1] != b'=' {
        return false;
    }
    bytes[..KEY_TEXT_LEN - 1]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

/// Client private key. Never printed.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([redacted])")
    }
}

/// Client public key, as handed to a [`KeyProvisioner`](crate::KeyProvisioner)
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(X25519Public);

impl PublicKey {
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base64();
        write!(f, "PublicKey({}..)", &text[..8])
    }
}

/// Fresh client identity for one provisioning exchange
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519Public::from(&secret));
        Self {
            private: PrivateKey(secret),
            public,
        }
    }
}
