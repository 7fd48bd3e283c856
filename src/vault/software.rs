//! In-process vault backed by x25519-dalek, sha2, hkdf and aes-gcm.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{
    SecretAttributes, SecretHandle, SecretType, Vault, AES256_KEY_LEN, AES_GCM_IV_LEN,
    CURVE25519_KEY_LEN, SHA256_LEN,
};
use crate::error::VaultError;

struct Entry {
    attributes: SecretAttributes,
    bytes: Zeroizing<Vec<u8>>,
}

/// Software crypto engine. Secret bytes live in a locked table and are zeroed
/// when destroyed.
#[derive(Default)]
pub struct SoftwareVault {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl SoftwareVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live secrets
    pub fn secret_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Copy out a symmetric or buffer secret. Private keys are refused.
    pub fn secret_export(&self, secret: &SecretHandle) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let entries = self.entries.lock();
        let entry = entries.get(&secret.id()).ok_or(VaultError::UnknownSecret)?;
        if entry.attributes.stype == SecretType::Curve25519Private {
            return Err(VaultError::ExportForbidden);
        }
        Ok(entry.bytes.clone())
    }

    fn store(&self, attributes: SecretAttributes, bytes: Zeroizing<Vec<u8>>) -> SecretHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, Entry { attributes, bytes });
        SecretHandle::new(id, attributes)
    }

    /// Copy the bytes of `secret` after checking its type.
    fn load(
        &self,
        secret: &SecretHandle,
        allowed: &[SecretType],
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let entries = self.entries.lock();
        let entry = entries.get(&secret.id()).ok_or(VaultError::UnknownSecret)?;
        if !allowed.contains(&entry.attributes.stype) {
            return Err(VaultError::InvalidSecretType);
        }
        Ok(entry.bytes.clone())
    }

    fn load_private(&self, secret: &SecretHandle) -> Result<StaticSecret, VaultError> {
        let bytes = self.load(secret, &[SecretType::Curve25519Private])?;
        let mut raw = Zeroizing::new([0u8; CURVE25519_KEY_LEN]);
        raw.copy_from_slice(&bytes);
        Ok(StaticSecret::from(*raw))
    }

    fn cipher(&self, key: &SecretHandle) -> Result<Aes256Gcm, VaultError> {
        let bytes = self.load(key, &[SecretType::Aes256])?;
        Aes256Gcm::new_from_slice(&bytes).map_err(|_| VaultError::InvalidKeyLength {
            expected: AES256_KEY_LEN,
            actual: bytes.len(),
        })
    }
}

fn check_length(attributes: &SecretAttributes, actual: usize) -> Result<(), VaultError> {
    let expected = match attributes.stype {
        SecretType::Aes256 => AES256_KEY_LEN,
        SecretType::Curve25519Private => CURVE25519_KEY_LEN,
        SecretType::Buffer => attributes.length,
    };
    if actual != expected || actual == 0 {
        return Err(VaultError::InvalidKeyLength { expected, actual });
    }
    Ok(())
}

impl Vault for SoftwareVault {
    fn secret_generate(&self, attributes: SecretAttributes) -> Result<SecretHandle, VaultError> {
        let bytes = match attributes.stype {
            SecretType::Curve25519Private => {
                let secret = StaticSecret::random_from_rng(OsRng);
                Zeroizing::new(secret.to_bytes().to_vec())
            }
            SecretType::Aes256 | SecretType::Buffer => {
                let mut bytes = Zeroizing::new(vec![0u8; attributes.length]);
                OsRng.fill_bytes(&mut bytes[..]);
                bytes
            }
        };
        check_length(&attributes, bytes.len())?;
        Ok(self.store(attributes, bytes))
    }

    fn secret_import(
        &self,
        attributes: SecretAttributes,
        bytes: &[u8],
    ) -> Result<SecretHandle, VaultError> {
        check_length(&attributes, bytes.len())?;
        Ok(self.store(attributes, Zeroizing::new(bytes.to_vec())))
    }

    fn secret_destroy(&self, secret: SecretHandle) -> Result<(), VaultError> {
        // Entry bytes are Zeroizing and wiped as the entry drops
        self.entries
            .lock()
            .remove(&secret.id())
            .map(drop)
            .ok_or(VaultError::UnknownSecret)
    }

    fn public_key_get(
        &self,
        secret: &SecretHandle,
    ) -> Result<[u8; CURVE25519_KEY_LEN], VaultError> {
        let private = self.load_private(secret)?;
        Ok(PublicKey::from(&private).to_bytes())
    }

    fn ecdh(
        &self,
        private: &SecretHandle,
        peer_public: &[u8],
    ) -> Result<SecretHandle, VaultError> {
        let peer: [u8; CURVE25519_KEY_LEN] = peer_public
            .try_into()
            .map_err(|_| VaultError::InvalidPublicKey)?;
        let private = self.load_private(private)?;
        let shared = private.diffie_hellman(&PublicKey::from(peer));
        // low-order peer points give an all-zero output
        if !shared.was_contributory() {
            return Err(VaultError::InvalidPublicKey);
        }
        let attributes = SecretAttributes {
            length: CURVE25519_KEY_LEN,
            ..SecretAttributes::chain_key()
        };
        Ok(self.store(attributes, Zeroizing::new(shared.as_bytes().to_vec())))
    }

    fn hkdf_sha256(
        &self,
        salt: &SecretHandle,
        input: Option<&SecretHandle>,
        outputs: &[SecretAttributes],
    ) -> Result<Vec<SecretHandle>, VaultError> {
        let salt = self.load(salt, &[SecretType::Buffer, SecretType::Aes256])?;
        let ikm = match input {
            Some(input) => self.load(input, &[SecretType::Buffer])?,
            None => Zeroizing::new(Vec::new()),
        };

        for attributes in outputs {
            check_length(attributes, attributes.length)?;
        }

        let total: usize = outputs.iter().map(|a| a.length).sum();
        let mut okm = Zeroizing::new(vec![0u8; total]);
        Hkdf::<Sha256>::new(Some(&salt[..]), &ikm[..])
            .expand(&[], &mut okm[..])
            .map_err(|_| VaultError::HkdfFailure)?;

        let mut handles = Vec::with_capacity(outputs.len());
        let mut offset = 0;
        for attributes in outputs {
            let chunk = &okm[offset..offset + attributes.length];
            handles.push(self.store(*attributes, Zeroizing::new(chunk.to_vec())));
            offset += attributes.length;
        }
        Ok(handles)
    }

    fn sha256(&self, data: &[u8]) -> Result<[u8; SHA256_LEN], VaultError> {
        Ok(Sha256::digest(data).into())
    }

    fn aead_aes_gcm_encrypt(
        &self,
        key: &SecretHandle,
        nonce: &[u8; AES_GCM_IV_LEN],
        ad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        let payload = Payload {
            msg: plaintext,
            aad: ad,
        };
        self.cipher(key)?
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| VaultError::AeadFailure)
    }

    fn aead_aes_gcm_decrypt(
        &self,
        key: &SecretHandle,
        nonce: &[u8; AES_GCM_IV_LEN],
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, VaultError> {
        let payload = Payload {
            msg: ciphertext,
            aad: ad,
        };
        self.cipher(key)?
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| VaultError::AuthenticationFailed)
    }
}
