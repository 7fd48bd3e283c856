//! Post-handshake traffic encryption.
//!
//! A [`SecureSession`] owns the two traffic keys produced by the handshake
//! split and one nonce per direction. Messages are AES-256-GCM with empty
//! associated data; each side's encrypt nonce runs in lock-step with the
//! peer's decrypt nonce.

use crate::error::{KeyAgreementError, Result, VaultError};
use crate::nonce::Nonce;
use crate::vault::{OwnedSecret, SecretType, AES_GCM_TAG_LEN};

pub struct SecureSession<'v> {
    encrypt_key: OwnedSecret<'v>,
    decrypt_key: OwnedSecret<'v>,
    encrypt_nonce: Option<Nonce>,
    decrypt_nonce: Option<Nonce>,
}

impl<'v> SecureSession<'v> {
    pub(crate) fn new(encrypt_key: OwnedSecret<'v>, decrypt_key: OwnedSecret<'v>) -> Self {
        assert!(
            encrypt_key.attributes().stype == SecretType::Aes256
                && decrypt_key.attributes().stype == SecretType::Aes256,
            "invariant broken: session keys must be AES-256"
        );
        Self {
            encrypt_key,
            decrypt_key,
            encrypt_nonce: Some(Nonce::new()),
            decrypt_nonce: Some(Nonce::new()),
        }
    }

    /// Encrypts `plaintext` into `out`, returning the number of bytes written
    /// (plaintext length plus the 16-byte tag).
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize> {
        if plaintext.is_empty() {
            return Err(KeyAgreementError::InvalidParameter("empty plaintext"));
        }
        let needed = plaintext.len() + AES_GCM_TAG_LEN;
        if out.len() < needed {
            return Err(KeyAgreementError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let nonce = self
            .encrypt_nonce
            .as_ref()
            .ok_or(KeyAgreementError::NonceExhausted)?;
        let (iv, next) = nonce.harvest();
        let vault = self.encrypt_key.vault();
        let ct = vault.aead_aes_gcm_encrypt(self.encrypt_key.handle(), &iv, &[], plaintext)?;
        if ct.len() != needed {
            return Err(VaultError::AeadFailure.into());
        }
        out[..needed].copy_from_slice(&ct);
        self.encrypt_nonce = next;
        Ok(needed)
    }

    /// Verifies and decrypts `ciphertext` into `out`, returning the plaintext
    /// length. A ciphertext that fails authentication leaves the decrypt
    /// nonce where it was.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut [u8]) -> Result<usize> {
        if ciphertext.len() < AES_GCM_TAG_LEN {
            return Err(KeyAgreementError::InvalidParameter(
                "ciphertext shorter than the authentication tag",
            ));
        }
        let needed = ciphertext.len() - AES_GCM_TAG_LEN;
        if out.len() < needed {
            return Err(KeyAgreementError::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        let nonce = self
            .decrypt_nonce
            .as_ref()
            .ok_or(KeyAgreementError::NonceExhausted)?;
        let (iv, next) = nonce.harvest();
        let vault = self.decrypt_key.vault();
        let pt = vault.aead_aes_gcm_decrypt(self.decrypt_key.handle(), &iv, &[], ciphertext)?;
        out[..pt.len()].copy_from_slice(&pt);
        self.decrypt_nonce = next;
        Ok(pt.len())
    }

    /// `None` once the direction is exhausted
    pub fn encrypt_nonce(&self) -> Option<u64> {
        self.encrypt_nonce.as_ref().map(Nonce::value)
    }

    pub fn decrypt_nonce(&self) -> Option<u64> {
        self.decrypt_nonce.as_ref().map(Nonce::value)
    }

    /// Destroys both traffic keys, reporting the first vault error. Both are
    /// attempted regardless.
    pub fn release(self) -> std::result::Result<(), VaultError> {
        let enc = self.encrypt_key.destroy();
        let dec = self.decrypt_key.destroy();
        enc.and(dec)
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> (&OwnedSecret<'v>, &OwnedSecret<'v>) {
        (&self.encrypt_key, &self.decrypt_key)
    }
}

impl std::fmt::Debug for SecureSession<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("encrypt_nonce", &self.encrypt_nonce())
            .field("decrypt_nonce", &self.decrypt_nonce())
            .finish_non_exhaustive()
    }
}
