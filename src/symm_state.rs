use crate::cipher_state::CipherState;
use crate::error::{Result, VaultError};
use crate::vault::{OwnedSecret, SecretAttributes, SecretPurpose, Vault, SHA256_LEN};

/// `Noise_XX_25519_AESGCM_SHA256`, zero-padded to the hash width when it
/// initialises `h` and `ck`.
pub const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256";

pub(crate) struct SymmState<'v> {
    vault: &'v dyn Vault,
    cipher_state: Option<CipherState<'v>>,
    chaining_key: OwnedSecret<'v>,
    output_hash: [u8; SHA256_LEN],
}

impl<'v> SymmState<'v> {
    pub(crate) fn init(vault: &'v dyn Vault, proto_name: &[u8]) -> Result<Self> {
        let init_state = if proto_name.len() > SHA256_LEN {
            vault.sha256(proto_name)?
        } else {
            let mut init_state = [0; SHA256_LEN];
            init_state[..proto_name.len()].copy_from_slice(proto_name);
            init_state
        };
        let chaining_key = OwnedSecret::import(vault, SecretAttributes::chain_key(), &init_state)?;

        Ok(Self {
            vault,
            cipher_state: None,
            chaining_key,
            output_hash: init_state,
        })
    }

    /// h = SHA256(h || data)
    pub(crate) fn mix_hash(&mut self, data: &[u8]) -> Result<()> {
        let mut input = Vec::with_capacity(SHA256_LEN + data.len());
        input.extend_from_slice(&self.output_hash);
        input.extend_from_slice(data);
        self.output_hash = self.vault.sha256(&input)?;
        Ok(())
    }

    /// ck, k = HKDF(ck, input). The previous `ck` and `k` are destroyed and the
    /// nonce restarts at 0.
    pub(crate) fn mix_key(&mut self, input: &OwnedSecret<'v>) -> Result<()> {
        let vault = self.vault;
        let mut outputs = vault
            .hkdf_sha256(
                self.chaining_key.handle(),
                Some(input.handle()),
                &[
                    SecretAttributes::chain_key(),
                    SecretAttributes::aes256(SecretPurpose::KeyAgreement),
                ],
            )?
            .into_iter()
            .map(|handle| OwnedSecret::new(vault, handle));
        let (Some(new_ck), Some(new_k)) = (outputs.next(), outputs.next()) else {
            return Err(VaultError::HkdfFailure.into());
        };

        self.chaining_key = new_ck;
        self.cipher_state = Some(match self.cipher_state.take() {
            Some(state) => state.reset_key(new_k),
            None => CipherState::init(new_k),
        });
        Ok(())
    }

    /// Encrypts under `k` with `h` as associated data, then mixes the
    /// ciphertext into `h`. Before any key exists the plaintext is sent as is.
    pub(crate) fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ct = match &mut self.cipher_state {
            Some(state) => state.encrypt_with_ad(&self.output_hash, plaintext)?,
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ct)?;
        Ok(ct)
    }

    /// Mirror of [`Self::encrypt_and_hash`]. The received bytes, not the
    /// plaintext, go into `h`; nothing changes if the tag does not verify.
    pub(crate) fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let pt = match &mut self.cipher_state {
            Some(state) => state.decrypt_with_ad(&self.output_hash, ciphertext)?,
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext)?;
        Ok(pt)
    }

    /// k1, k2 = HKDF(ck, zerolen). Consumes the symmetric state; `ck` and `k`
    /// are destroyed on return.
    pub(crate) fn split(self) -> Result<(OwnedSecret<'v>, OwnedSecret<'v>)> {
        let vault = self.vault;
        let traffic = SecretAttributes::aes256(SecretPurpose::Epilogue);
        let mut outputs = vault
            .hkdf_sha256(self.chaining_key.handle(), None, &[traffic, traffic])?
            .into_iter()
            .map(|handle| OwnedSecret::new(vault, handle));
        match (outputs.next(), outputs.next()) {
            (Some(k1), Some(k2)) => Ok((k1, k2)),
            _ => Err(VaultError::HkdfFailure.into()),
        }
    }

    pub(crate) fn handshake_hash(&self) -> [u8; SHA256_LEN] {
        self.output_hash
    }

    pub(crate) fn has_key(&self) -> bool {
        self.cipher_state.is_some()
    }
}
