//! Machine shared secret and key derivation.
//!
//! The shared secret is a machine-specific byte string provisioned out of
//! band. It is used three ways:
//!
//! - as the HMAC key for packet tags,
//! - as the mix-in for the authentication digest
//!   (`SHA-256("AuthChallenge" ‖ secret)`),
//! - as the input keying material for the payload cipher key
//!   (HKDF-SHA256).
//!
//! The raw bytes are held in a [`secrecy`] wrapper so they never show up in
//! `Debug` output or log fields.

use std::path::Path;

use hkdf::Hkdf;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};

/// Fixed prefix mixed into the authentication digest. Must match clients.
const AUTH_CHALLENGE_PREFIX: &[u8] = b"AuthChallenge";

/// HKDF info string for the payload cipher key.
const PAYLOAD_KEY_INFO: &[u8] = b"patrol payload cipher v1";

/// Errors loading the shared secret.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The secret file could not be read.
    #[error("failed to read secret file {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The secret is too short to key HMAC-SHA256 sensibly.
    #[error("shared secret too short: {len} bytes (minimum {min})")]
    TooShort {
        /// Observed length.
        len: usize,
        /// Required minimum.
        min: usize,
    },
}

/// Minimum accepted secret length in bytes.
pub const MIN_SECRET_LEN: usize = 16;

/// The machine shared secret.
///
/// Cloning is cheap in spirit but deliberately not provided; components
/// receive derived keys or a shared reference instead.
pub struct SharedSecret {
    bytes: Secret<Vec<u8>>,
}

impl SharedSecret {
    /// Wraps raw secret bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::TooShort`] for secrets under
    /// [`MIN_SECRET_LEN`] bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, SecretError> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(SecretError::TooShort {
                len: bytes.len(),
                min: MIN_SECRET_LEN,
            });
        }
        Ok(Self {
            bytes: Secret::new(bytes),
        })
    }

    /// Loads the secret from a provisioned file.
    ///
    /// Trailing newlines are stripped so secrets written with `echo` load
    /// the same as raw binary blobs.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SecretError> {
        let path = path.as_ref();
        let mut bytes = std::fs::read(path).map_err(|source| SecretError::Io {
            path: path.display().to_string(),
            source,
        })?;
        while bytes.last() == Some(&b'\n') || bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        Self::from_bytes(bytes)
    }

    /// The digest a client must present to authenticate:
    /// `SHA-256("AuthChallenge" ‖ secret)`.
    #[must_use]
    pub fn auth_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(AUTH_CHALLENGE_PREFIX);
        hasher.update(self.bytes.expose_secret());
        hasher.finalize().into()
    }

    /// Runs `f` over the raw secret bytes (HMAC keying).
    pub(crate) fn with_key_material<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(self.bytes.expose_secret())
    }

    /// Derives the 256-bit payload cipher key via HKDF-SHA256.
    #[must_use]
    pub fn payload_key(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, self.bytes.expose_secret());
        let mut okm = [0u8; 32];
        hk.expand(PAYLOAD_KEY_INFO, &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SharedSecret {
        SharedSecret::from_bytes(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap()
    }

    #[test]
    fn rejects_short_secret() {
        let err = SharedSecret::from_bytes(b"short".to_vec()).unwrap_err();
        assert!(matches!(err, SecretError::TooShort { len: 5, .. }));
    }

    #[test]
    fn auth_digest_is_stable() {
        // Same construction a client performs on its side.
        let mut hasher = Sha256::new();
        hasher.update(b"AuthChallenge");
        hasher.update(b"0123456789abcdef0123456789abcdef");
        let expected: [u8; 32] = hasher.finalize().into();

        assert_eq!(secret().auth_digest(), expected);
    }

    #[test]
    fn payload_key_differs_from_secret_and_digest() {
        let s = secret();
        let key = s.payload_key();
        assert_ne!(&key[..], &s.auth_digest()[..]);
        s.with_key_material(|raw| assert_ne!(&key[..], raw));
    }

    #[test]
    fn file_loader_strips_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, b"0123456789abcdef0123456789abcdef\n").unwrap();

        let loaded = SharedSecret::from_file(&path).unwrap();
        assert_eq!(loaded.auth_digest(), secret().auth_digest());
    }

    #[test]
    fn debug_output_is_redacted() {
        assert!(!format!("{:?}", secret()).contains("0123"));
    }
}
