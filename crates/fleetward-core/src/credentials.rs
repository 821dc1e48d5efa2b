// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Console credentials at rest.
//!
//! Router passwords are written by the administrative layer encrypted with
//! AES-256-GCM under a key shared through `CREDENTIAL_KEY`. The engine only
//! ever decrypts them right before talking to a router.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential encryption/decryption failed")]
    Cipher,

    #[error("decrypted credential is not valid UTF-8")]
    Encoding,
}

/// Ciphertext plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, CredentialError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CredentialError::Cipher)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Cipher)?;
        Ok(SealedSecret {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<String, CredentialError> {
        let cipher =
            Aes256Gcm::new_from_slice(&self.key).map_err(|_| CredentialError::Cipher)?;
        let nonce = Nonce::from_exact_iter(sealed.nonce.iter().copied())
            .ok_or(CredentialError::Cipher)?;
        let plaintext = cipher
            .decrypt(&nonce, sealed.ciphertext.as_slice())
            .map_err(|_| CredentialError::Cipher)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::Encoding)
    }
}

/// Fresh bearer token for the device callback endpoints.
pub fn generate_callback_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let cipher = CredentialCipher::new([7u8; 32]);
        let sealed = cipher.seal("hunter2").unwrap();
        assert_ne!(sealed.ciphertext, b"hunter2");
        assert_eq!(cipher.open(&sealed).unwrap(), "hunter2");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = CredentialCipher::new([7u8; 32]).seal("hunter2").unwrap();
        let other = CredentialCipher::new([8u8; 32]);
        assert!(matches!(other.open(&sealed), Err(CredentialError::Cipher)));
    }

    #[test]
    fn truncated_nonce_fails() {
        let cipher = CredentialCipher::new([7u8; 32]);
        let mut sealed = cipher.seal("hunter2").unwrap();
        sealed.nonce.pop();
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn callback_tokens_are_unique() {
        let a = generate_callback_token();
        let b = generate_callback_token();
        assert_eq!(a.len(), 43);
        assert_ne!(a, b);
    }
}
