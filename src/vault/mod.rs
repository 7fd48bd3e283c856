//! The crypto engine contract consumed by the handshake.
//!
//! Private key material never leaves a [`Vault`]; callers only ever hold a
//! [`SecretHandle`]. [`OwnedSecret`] ties a handle to the vault that issued it
//! and destroys it exactly once, either explicitly or on drop.

use std::fmt;

use crate::error::VaultError;

pub mod software;

pub use software::SoftwareVault;

pub const CURVE25519_KEY_LEN: usize = 32;
pub const SHA256_LEN: usize = 32;
pub const AES256_KEY_LEN: usize = 32;
pub const AES_GCM_TAG_LEN: usize = 16;
pub const AES_GCM_IV_LEN: usize = 12;

/// The kinds of secret a vault stores
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SecretType {
    /// Raw bytes, e.g. a chaining key or a DH output
    Buffer,
    Aes256,
    Curve25519Private,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SecretPersistence {
    Ephemeral,
    Persistent,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SecretPurpose {
    KeyAgreement,
    /// Traffic keys produced by the final split
    Epilogue,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SecretAttributes {
    pub length: usize,
    pub stype: SecretType,
    pub purpose: SecretPurpose,
    pub persistence: SecretPersistence,
}

impl SecretAttributes {
    /// An ephemeral X25519 private key
    pub const fn curve25519() -> Self {
        Self {
            length: CURVE25519_KEY_LEN,
            stype: SecretType::Curve25519Private,
            purpose: SecretPurpose::KeyAgreement,
            persistence: SecretPersistence::Ephemeral,
        }
    }

    pub const fn chain_key() -> Self {
        Self {
            length: SHA256_LEN,
            stype: SecretType::Buffer,
            purpose: SecretPurpose::KeyAgreement,
            persistence: SecretPersistence::Ephemeral,
        }
    }

    pub const fn aes256(purpose: SecretPurpose) -> Self {
        Self {
            length: AES256_KEY_LEN,
            stype: SecretType::Aes256,
            purpose,
            persistence: SecretPersistence::Ephemeral,
        }
    }
}

/// Opaque reference to key material held by a [`Vault`].
///
/// Neither `Clone` nor `Copy`: a handle is destroyed by moving it
/// into [`Vault::secret_destroy`].
#[derive(PartialEq, Eq, Hash)]
pub struct SecretHandle {
    id: u64,
    attributes: SecretAttributes,
}

impl SecretHandle {
    /// Mint a handle. Only vault implementations should call this.
    pub fn new(id: u64, attributes: SecretAttributes) -> Self {
        Self { id, attributes }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn attributes(&self) -> SecretAttributes {
        self.attributes
    }
}

impl fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretHandle({}, {:?})", self.id, self.attributes.stype)
    }
}

/// Primitive operations the handshake needs from a crypto engine.
///
/// Implementations must be safe for concurrent use by independent handles.
pub trait Vault: Send + Sync {
    fn secret_generate(&self, attributes: SecretAttributes) -> Result<SecretHandle, VaultError>;

    fn secret_import(
        &self,
        attributes: SecretAttributes,
        bytes: &[u8],
    ) -> Result<SecretHandle, VaultError>;

    /// Erase the secret behind `secret`.
    fn secret_destroy(&self, secret: SecretHandle) -> Result<(), VaultError>;

    fn public_key_get(&self, secret: &SecretHandle)
        -> Result<[u8; CURVE25519_KEY_LEN], VaultError>;

    /// X25519 between a private key handle and a peer public key. The output is
    /// stored as a [`SecretType::Buffer`] secret.
    fn ecdh(&self, private: &SecretHandle, peer_public: &[u8])
        -> Result<SecretHandle, VaultError>;

    /// HKDF-SHA256 with `salt` as the salt and `input` as the input keying
    /// material (zero-length when `None`), with an empty info string. One
    /// secret is produced per entry of `outputs`, in order.
    fn hkdf_sha256(
        &self,
        salt: &SecretHandle,
        input: Option<&SecretHandle>,
        outputs: &[SecretAttributes],
    ) -> Result<Vec<SecretHandle>, VaultError>;

    fn sha256(&self, data: &[u8]) -> Result<[u8; SHA256_LEN], VaultError>;

    /// Returns ciphertext with the 16-byte tag appended.
    fn aead_aes_gcm_encrypt(
        &self,
        key: &SecretHandle,
        nonce: &[u8; AES_GCM_IV_LEN],
        ad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, VaultError>;

    /// Fails with [`VaultError::AuthenticationFailed`] if the tag does not verify.
    fn aead_aes_gcm_decrypt(
        &self,
        key: &SecretHandle,
        nonce: &[u8; AES_GCM_IV_LEN],
        ad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, VaultError>;
}

/// A secret handle bound to its vault, destroyed exactly once.
pub struct OwnedSecret<'v> {
    vault: &'v dyn Vault,
    handle: Option<SecretHandle>,
}

impl<'v> OwnedSecret<'v> {
    pub fn new(vault: &'v dyn Vault, handle: SecretHandle) -> Self {
        Self {
            vault,
            handle: Some(handle),
        }
    }

    pub fn generate(vault: &'v dyn Vault, attributes: SecretAttributes) -> Result<Self, VaultError> {
        let handle = vault.secret_generate(attributes)?;
        Ok(Self::new(vault, handle))
    }

    pub fn import(
        vault: &'v dyn Vault,
        attributes: SecretAttributes,
        bytes: &[u8],
    ) -> Result<Self, VaultError> {
        let handle = vault.secret_import(attributes, bytes)?;
        Ok(Self::new(vault, handle))
    }

    pub fn handle(&self) -> &SecretHandle {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("invariant broken: secret used after destroy"),
        }
    }

    pub fn attributes(&self) -> SecretAttributes {
        self.handle().attributes()
    }

    pub fn vault(&self) -> &'v dyn Vault {
        self.vault
    }

    /// Destroy the secret now, reporting any vault error.
    pub fn destroy(mut self) -> Result<(), VaultError> {
        match self.handle.take() {
            Some(handle) => self.vault.secret_destroy(handle),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for OwnedSecret<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedSecret").field(&self.handle).finish()
    }
}

impl Drop for OwnedSecret<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.vault.secret_destroy(handle) {
                tracing::warn!(error = %e, "failed to destroy secret on drop");
            }
        }
    }
}
