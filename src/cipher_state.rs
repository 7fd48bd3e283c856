//! The transient cipher `k`/`n` used to encrypt handshake payloads.
//!
//! Post-handshake traffic keys live in [`crate::session::SecureSession`]
//! instead; a `CipherState` never outlives its handshake.

use crate::error::{KeyAgreementError, Result};
use crate::nonce::Nonce;
use crate::vault::{OwnedSecret, SecretType};

pub(crate) struct CipherState<'v> {
    key: OwnedSecret<'v>,
    nonce: Option<Nonce>,
}

impl<'v> CipherState<'v> {
    pub(crate) fn init(key: OwnedSecret<'v>) -> Self {
        assert_eq!(
            key.attributes().stype,
            SecretType::Aes256,
            "invariant breakage: cipher state initialised with a non-AES key"
        );
        Self {
            key,
            nonce: Some(Nonce::new()),
        }
    }

    /// Refreshes the cipher state with a new key, setting nonce to 0. The old
    /// key is destroyed.
    pub(crate) fn reset_key(self, new_key: OwnedSecret<'v>) -> Self {
        Self::init(new_key)
    }

    #[cfg(test)]
    pub(crate) fn nonce(&self) -> Option<u64> {
        self.nonce.as_ref().map(Nonce::value)
    }

    /// Encrypt `plaintext` under `k` with the current nonce, then advance it.
    pub(crate) fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let (iv, next) = self.current()?.harvest();
        let vault = self.vault();
        let ct = vault.aead_aes_gcm_encrypt(self.key.handle(), &iv, ad, plaintext)?;
        self.nonce = next;
        Ok(ct)
    }

    /// Decrypt and verify. On failure the nonce is left where it was.
    pub(crate) fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (iv, next) = self.current()?.harvest();
        let vault = self.vault();
        let pt = vault.aead_aes_gcm_decrypt(self.key.handle(), &iv, ad, ciphertext)?;
        self.nonce = next;
        Ok(pt)
    }

    fn current(&self) -> Result<&Nonce> {
        self.nonce.as_ref().ok_or(KeyAgreementError::NonceExhausted)
    }

    fn vault(&self) -> &'v dyn crate::vault::Vault {
        self.key.vault()
    }
}
