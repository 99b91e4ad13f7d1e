//! Encrypted-at-rest storage for connection secrets. The key is derived
//! from stable local machine identifiers, so a profile store copied to
//! another machine cannot decrypt its secrets. That is an intentional,
//! documented constraint for operators, not an implementation detail.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const MAGIC: &[u8] = b"OSNP1";
const NONCE_LEN: usize = 12;
const SALT: &str = "odoosnap_secret_salt_v1";

/// AES-256-GCM cipher over a derived 32-byte key.
pub struct SecretBox {
    key: [u8; 32],
}

impl SecretBox {
    /// The production cipher, keyed to this machine (uid + home directory).
    pub fn machine_bound() -> Self {
        Self::from_material(&machine_identity())
    }

    /// Cipher over caller-supplied key material; tests use this to get
    /// deterministic, machine-independent instances.
    pub fn from_material(material: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        hasher.update(SALT.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Encrypt to a base64 string of `MAGIC || nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Execution(format!("cipher init failed: {e}")))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Execution(format!("secret encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt a stored value. Returns `None` for anything that does not
    /// decrypt under this machine's key (including stores copied from
    /// another machine) rather than an error, so callers degrade to
    /// "secret unavailable".
    pub fn decrypt(&self, stored: &str) -> Option<String> {
        let data = BASE64.decode(stored).ok()?;
        if data.len() < MAGIC.len() + NONCE_LEN || &data[..MAGIC.len()] != MAGIC {
            return None;
        }
        let nonce = Nonce::from_slice(&data[MAGIC.len()..MAGIC.len() + NONCE_LEN]);
        let ciphertext = &data[MAGIC.len() + NONCE_LEN..];

        let cipher = Aes256Gcm::new_from_slice(&self.key).ok()?;
        let plaintext = cipher.decrypt(nonce, ciphertext).ok()?;
        String::from_utf8(plaintext).ok()
    }
}

fn machine_identity() -> String {
    // getuid never fails; the home directory pins the identity to the
    // account even when uids are reused across machines.
    let uid = unsafe { libc::getuid() };
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
    format!("{uid}:{home}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let secrets = SecretBox::from_material("test-machine");
        let stored = secrets.encrypt("hunter2").unwrap();
        assert_ne!(stored, "hunter2");
        assert_eq!(secrets.decrypt(&stored).as_deref(), Some("hunter2"));
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let secrets = SecretBox::from_material("test-machine");
        let a = secrets.encrypt("same").unwrap();
        let b = secrets.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(secrets.decrypt(&a), secrets.decrypt(&b));
    }

    #[test]
    fn wrong_machine_key_yields_none() {
        let here = SecretBox::from_material("machine-a");
        let there = SecretBox::from_material("machine-b");
        let stored = here.encrypt("secret").unwrap();
        assert_eq!(there.decrypt(&stored), None);
    }

    #[test]
    fn garbage_input_yields_none() {
        let secrets = SecretBox::from_material("test-machine");
        assert_eq!(secrets.decrypt("not base64 at all!!"), None);
        assert_eq!(secrets.decrypt(&BASE64.encode(b"tooshort")), None);
    }
}
