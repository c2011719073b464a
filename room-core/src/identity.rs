//! Per-process identity (spec §3): a long-lived ECC key pair plus a mutable
//! display name, created on first run and never destroyed.
//!
//! Persisted as a `dirs::data_local_dir()` subdirectory with two files: the
//! secret key itself is never serialized to JSON plaintext mixed with the
//! display name, so it lives in its own file and a backup of `profile.json`
//! can't leak key material.

use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// The local node's long-lived key pair plus mutable profile fields.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    pub username: String,
}

#[derive(Serialize, Deserialize)]
struct ProfileFile {
    username: String,
}

impl Identity {
    /// Creates a fresh identity with a random key pair.
    pub fn generate(username: impl Into<String>) -> Self {
        let mut rng = rand::rngs::OsRng;
        Self {
            signing_key: SigningKey::generate(&mut rng),
            username: username.into(),
        }
    }

    /// Loads the identity from `dir`, creating one on first run.
    pub fn load_or_create(dir: &Path, default_username: &str) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let key_path = dir.join("identity.key");
        let profile_path = dir.join("profile.json");

        let signing_key = if key_path.exists() {
            let bytes = fs::read(&key_path)?;
            let arr: [u8; 32] = bytes
                .try_into()
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt identity key"))?;
            SigningKey::from_bytes(&arr)
        } else {
            let mut rng = rand::rngs::OsRng;
            let key = SigningKey::generate(&mut rng);
            fs::write(&key_path, key.to_bytes())?;
            key
        };

        let username = if profile_path.exists() {
            let bytes = fs::read(&profile_path)?;
            let profile: ProfileFile = serde_json::from_slice(&bytes)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            profile.username
        } else {
            let profile = ProfileFile {
                username: default_username.to_string(),
            };
            fs::write(&profile_path, serde_json::to_vec_pretty(&profile)?)?;
            default_username.to_string()
        };

        Ok(Self { signing_key, username })
    }

    pub fn save_profile(&self, dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let profile = ProfileFile {
            username: self.username.clone(),
        };
        fs::write(dir.join("profile.json"), serde_json::to_vec_pretty(&profile)?)
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }
}

/// Default location for engine-local identity/corestore state: the OS data
/// directory, falling back to a temp directory if none is reported.
pub fn default_state_dir(app_name: &str) -> PathBuf {
    let mut path = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    path.push(app_name);
    path
}

/// Verifies a detached signature against a known 32-byte public key.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let sig = Signature::from_bytes(signature);
    verifying_key.verify(message, &sig).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = Identity::load_or_create(dir.path(), "alice").unwrap();
        let pk = id.public_key();
        let username = id.username.clone();
        drop(id);

        let reloaded = Identity::load_or_create(dir.path(), "someone-else").unwrap();
        assert_eq!(reloaded.public_key(), pk);
        assert_eq!(reloaded.username, username);
    }

    #[test]
    fn signature_round_trips() {
        let id = Identity::generate("bob");
        let msg = b"invite-capability";
        let sig = id.sign(msg);
        assert!(verify(&id.public_key(), msg, &sig));
        assert!(!verify(&id.public_key(), b"tampered", &sig));
    }
}
