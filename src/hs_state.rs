//! The Noise XX handshake engine.
//!
//! ```text
//! XX:
//!   -> e
//!   <- e, ee, s, es
//!   -> s, se
//! ```
//!
//! Each side walks `Start -> AfterM1 -> AfterM2 -> Complete`. Building or
//! processing a message out of that order is a programming error and panics;
//! the [`crate::key_agreement`] layer is responsible for never doing so.

use bytes::BytesMut;

use crate::error::{FailureSource, Result, VaultError};
use crate::session::SecureSession;
use crate::symm_state::{SymmState, PROTOCOL_NAME};
use crate::vault::{
    OwnedSecret, SecretAttributes, SecretType, Vault, AES_GCM_TAG_LEN, CURVE25519_KEY_LEN,
    SHA256_LEN,
};

const DH_LEN: usize = CURVE25519_KEY_LEN;
const M1_MIN_LEN: usize = DH_LEN;
const M2_MIN_LEN: usize = DH_LEN + DH_LEN + AES_GCM_TAG_LEN + AES_GCM_TAG_LEN;
const M3_MIN_LEN: usize = DH_LEN + AES_GCM_TAG_LEN + AES_GCM_TAG_LEN;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Phase {
    Start,
    AfterM1,
    AfterM2,
    Complete,
}

/// A private key handle with its public half cached.
struct KeyPair<'v> {
    secret: OwnedSecret<'v>,
    public: [u8; DH_LEN],
}

impl<'v> KeyPair<'v> {
    fn from_secret(secret: OwnedSecret<'v>) -> Result<Self> {
        if secret.attributes().stype != SecretType::Curve25519Private {
            return Err(VaultError::InvalidSecretType.into());
        }
        let public = secret.vault().public_key_get(secret.handle())?;
        Ok(Self { secret, public })
    }
}

/// What a finished handshake leaves behind. Everything else is destroyed.
pub(crate) struct Completed<'v> {
    pub(crate) session: SecureSession<'v>,
    pub(crate) handshake_hash: [u8; SHA256_LEN],
    pub(crate) remote_static: [u8; DH_LEN],
}

pub(crate) struct HsState<'v> {
    role: Role,
    phase: Phase,
    symm_state: SymmState<'v>,
    s: KeyPair<'v>,
    e: KeyPair<'v>,
    rs: Option<[u8; DH_LEN]>,
    re: Option<[u8; DH_LEN]>,
}

impl<'v> HsState<'v> {
    /// Initialise `h` and `ck` from the protocol name and mix in `prologue`.
    /// A fresh ephemeral key is generated unless one is supplied.
    pub(crate) fn start(
        vault: &'v dyn Vault,
        role: Role,
        prologue: &[u8],
        s: OwnedSecret<'v>,
        e: Option<OwnedSecret<'v>>,
    ) -> Result<Self> {
        let mut symm_state = SymmState::init(vault, PROTOCOL_NAME)?;
        symm_state.mix_hash(prologue)?;

        let e = match e {
            Some(e) => e,
            None => OwnedSecret::generate(vault, SecretAttributes::curve25519())?,
        };

        Ok(Self {
            role,
            phase: Phase::Start,
            symm_state,
            s: KeyPair::from_secret(s)?,
            e: KeyPair::from_secret(e)?,
            rs: None,
            re: None,
        })
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// `-> e`, with `payload` appended in the clear.
    pub(crate) fn write_message_1(&mut self, payload: &[u8], buff: &mut BytesMut) -> Result<()> {
        self.check_turn(Role::Initiator, Phase::Start);
        self.write_e(buff)?;
        self.write_payload(payload, buff)?;
        self.phase = Phase::AfterM1;
        Ok(())
    }

    /// Returns the clear payload that followed `e`.
    pub(crate) fn read_message_1(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
        self.check_turn(Role::Responder, Phase::Start);
        check_len(1, msg, M1_MIN_LEN)?;
        let (e, payload) = msg.split_at(DH_LEN);
        self.read_e(e)?;
        let payload = self.symm_state.decrypt_and_hash(payload)?;
        self.phase = Phase::AfterM1;
        Ok(payload)
    }

    /// `<- e, ee, s, es`
    pub(crate) fn write_message_2(&mut self, payload: &[u8], buff: &mut BytesMut) -> Result<()> {
        self.check_turn(Role::Responder, Phase::AfterM1);
        let re = self.remote_ephemeral();
        self.write_e(buff)?;
        mix_dh(&mut self.symm_state, &self.e.secret, &re)?;
        self.write_s(buff)?;
        mix_dh(&mut self.symm_state, &self.s.secret, &re)?;
        self.write_payload(payload, buff)?;
        self.phase = Phase::AfterM2;
        Ok(())
    }

    pub(crate) fn read_message_2(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
        self.check_turn(Role::Initiator, Phase::AfterM1);
        check_len(2, msg, M2_MIN_LEN)?;
        let (e, rest) = msg.split_at(DH_LEN);
        let (s, payload) = rest.split_at(DH_LEN + AES_GCM_TAG_LEN);

        self.read_e(e)?;
        let re = self.remote_ephemeral();
        mix_dh(&mut self.symm_state, &self.e.secret, &re)?;
        let rs = self.read_s(s)?;
        mix_dh(&mut self.symm_state, &self.e.secret, &rs)?;
        let payload = self.symm_state.decrypt_and_hash(payload)?;
        self.phase = Phase::AfterM2;
        Ok(payload)
    }

    /// `-> s, se`
    pub(crate) fn write_message_3(&mut self, payload: &[u8], buff: &mut BytesMut) -> Result<()> {
        self.check_turn(Role::Initiator, Phase::AfterM2);
        let re = self.remote_ephemeral();
        self.write_s(buff)?;
        mix_dh(&mut self.symm_state, &self.s.secret, &re)?;
        self.write_payload(payload, buff)?;
        self.phase = Phase::Complete;
        Ok(())
    }

    pub(crate) fn read_message_3(&mut self, msg: &[u8]) -> Result<Vec<u8>> {
        self.check_turn(Role::Responder, Phase::AfterM2);
        check_len(3, msg, M3_MIN_LEN)?;
        let (s, payload) = msg.split_at(DH_LEN + AES_GCM_TAG_LEN);

        let rs = self.read_s(s)?;
        mix_dh(&mut self.symm_state, &self.e.secret, &rs)?;
        let payload = self.symm_state.decrypt_and_hash(payload)?;
        self.phase = Phase::Complete;
        Ok(payload)
    }

    /// Derive the traffic keys. The initiator encrypts with the first split
    /// output and the responder with the second. All handshake secrets are
    /// destroyed.
    pub(crate) fn split(self) -> Result<Completed<'v>> {
        assert_eq!(
            self.phase,
            Phase::Complete,
            "invariant broken: split before the handshake completed"
        );
        let Some(remote_static) = self.rs else {
            panic!("invariant broken: handshake completed without a remote static key");
        };
        let handshake_hash = self.symm_state.handshake_hash();
        let (k1, k2) = self.symm_state.split()?;
        let session = match self.role {
            Role::Initiator => SecureSession::new(k1, k2),
            Role::Responder => SecureSession::new(k2, k1),
        };

        Ok(Completed {
            session,
            handshake_hash,
            remote_static,
        })
    }

    fn write_e(&mut self, buff: &mut BytesMut) -> Result<()> {
        self.symm_state.mix_hash(&self.e.public)?;
        buff.extend_from_slice(&self.e.public);
        Ok(())
    }

    fn read_e(&mut self, re: &[u8]) -> Result<()> {
        assert!(
            self.re.is_none(),
            "invariant broken: reading remote `e` when it is already set"
        );
        let re: [u8; DH_LEN] = re.try_into().map_err(|_| VaultError::InvalidPublicKey)?;
        self.symm_state.mix_hash(&re)?;
        self.re = Some(re);
        Ok(())
    }

    fn write_s(&mut self, buff: &mut BytesMut) -> Result<()> {
        let ct = self.symm_state.encrypt_and_hash(&self.s.public)?;
        buff.extend_from_slice(&ct);
        Ok(())
    }

    fn read_s(&mut self, ct: &[u8]) -> Result<[u8; DH_LEN]> {
        assert!(
            self.rs.is_none(),
            "invariant broken: reading remote `s` when it is already set"
        );
        let rs: [u8; DH_LEN] = self
            .symm_state
            .decrypt_and_hash(ct)?
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidPublicKey)?;
        self.rs = Some(rs);
        Ok(rs)
    }

    fn write_payload(&mut self, payload: &[u8], buff: &mut BytesMut) -> Result<()> {
        let ct = self.symm_state.encrypt_and_hash(payload)?;
        buff.extend_from_slice(&ct);
        Ok(())
    }

    fn remote_ephemeral(&self) -> [u8; DH_LEN] {
        match self.re {
            Some(re) => re,
            None => panic!("invariant broken: remote `e` used before it was read"),
        }
    }

    fn check_turn(&self, role: Role, phase: Phase) {
        assert!(
            self.role == role && self.phase == phase,
            "invariant broken: {:?} in {:?} cannot act as {:?} in {:?}",
            self.role,
            self.phase,
            role,
            phase
        );
    }
}

/// ECDH between a local private key and a remote public key, fed to MixKey.
/// The shared secret is destroyed straight after.
fn mix_dh<'v>(
    symm_state: &mut SymmState<'v>,
    local: &OwnedSecret<'v>,
    remote: &[u8; DH_LEN],
) -> Result<()> {
    let vault = local.vault();
    let shared = OwnedSecret::new(vault, vault.ecdh(local.handle(), remote)?);
    symm_state.mix_key(&shared)
}

fn check_len(message: u8, msg: &[u8], min: usize) -> Result<()> {
    if msg.len() < min {
        return Err(FailureSource::MalformedMessage {
            message,
            len: msg.len(),
            min,
        }
        .into());
    }
    Ok(())
}

impl std::fmt::Debug for HsState<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsState")
            .field("role", &self.role)
            .field("phase", &self.phase)
            .field("has_key", &self.symm_state.has_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::error::KeyAgreementError;
    use crate::vault::SoftwareVault;

    pub(crate) const INITIATOR_STATIC: &str =
        "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    pub(crate) const INITIATOR_EPH: &str =
        "202122232425262728292a2b2c2d2e2f303132333435363738393a3b3c3d3e3f";
    pub(crate) const RESPONDER_STATIC: &str =
        "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20";
    pub(crate) const RESPONDER_EPH: &str =
        "4142434445464748494a4b4c4d4e4f505152535455565758595a5b5c5d5e5f60";

    const MSG_1: &str = "358072d6365880d1aeea329adf9121383851ed21a28e3b75e965d0d2cd166254";
    const MSG_2: &str = "64b101b1d0be5a8704bd078f9895001fc03e8e9f9522f188dd128d9846d484665393019dbd6f438795da206db0886610b26108e424142c2e9b5fd1f7ea70cde8767ce62d7e3c0e9bcefe4ab872c0505b9e824df091b74ffe10a2b32809cab21f";
    const MSG_3: &str = "e610eadc4b00c17708bf223f29a66f02342fbedf6c0044736544b9271821ae40e70144cecd9d265dffdc5bb8e051c3f83db32a425e04d8f510c58a43325fbc56";

    const MSG_1_PAYLOAD: &str =
        "358072d6365880d1aeea329adf9121383851ed21a28e3b75e965d0d2cd166254746573745f6d73675f30";
    const MSG_2_PAYLOAD: &str = "64b101b1d0be5a8704bd078f9895001fc03e8e9f9522f188dd128d9846d484665393019dbd6f438795da206db0886610b26108e424142c2e9b5fd1f7ea70cde8c9f29dcec8d3ab554f4a5330657867fe4917917195c8cf360e08d6dc5f71baf875ec6e3bfc7afda4c9c2";
    const MSG_3_PAYLOAD: &str = "e610eadc4b00c17708bf223f29a66f02342fbedf6c0044736544b9271821ae40232c55cd96d1350af861f6a04978f7d5e070c07602c6b84d25a331242a71c50ae31dd4c164267fd48bd2";

    pub(crate) fn import<'v>(vault: &'v SoftwareVault, key: &str) -> OwnedSecret<'v> {
        OwnedSecret::import(vault, SecretAttributes::curve25519(), &hex::decode(key).unwrap())
            .unwrap()
    }

    fn fixed_pair(vault: &SoftwareVault) -> (HsState<'_>, HsState<'_>) {
        let initiator = HsState::start(
            vault,
            Role::Initiator,
            &[],
            import(vault, INITIATOR_STATIC),
            Some(import(vault, INITIATOR_EPH)),
        )
        .unwrap();
        let responder = HsState::start(
            vault,
            Role::Responder,
            &[],
            import(vault, RESPONDER_STATIC),
            Some(import(vault, RESPONDER_EPH)),
        )
        .unwrap();
        (initiator, responder)
    }

    fn write<'v>(
        state: &mut HsState<'v>,
        f: fn(&mut HsState<'v>, &[u8], &mut BytesMut) -> Result<()>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buff = BytesMut::new();
        f(state, payload, &mut buff).unwrap();
        buff.to_vec()
    }

    #[test]
    fn known_answer_empty_payloads() {
        let vault = SoftwareVault::new();
        let (mut initiator, mut responder) = fixed_pair(&vault);

        let m1 = write(&mut initiator, HsState::write_message_1, &[]);
        assert_eq!(hex::encode(&m1), MSG_1);
        assert!(responder.read_message_1(&m1).unwrap().is_empty());

        let m2 = write(&mut responder, HsState::write_message_2, &[]);
        assert_eq!(hex::encode(&m2), MSG_2);
        assert!(initiator.read_message_2(&m2).unwrap().is_empty());

        let m3 = write(&mut initiator, HsState::write_message_3, &[]);
        assert_eq!(hex::encode(&m3), MSG_3);
        assert!(responder.read_message_3(&m3).unwrap().is_empty());

        let initiator = initiator.split().unwrap();
        let responder = responder.split().unwrap();
        assert_eq!(
            hex::encode(initiator.handshake_hash),
            "4b71f7deb470328565d99b15162eb0c4c14d6b1c85aad6fab54354d5afc72469"
        );
        assert_eq!(initiator.handshake_hash, responder.handshake_hash);
    }

    #[test]
    fn known_answer_with_payloads() {
        let vault = SoftwareVault::new();
        let (mut initiator, mut responder) = fixed_pair(&vault);

        let m1 = write(&mut initiator, HsState::write_message_1, b"test_msg_0");
        assert_eq!(hex::encode(&m1), MSG_1_PAYLOAD);
        assert_eq!(responder.read_message_1(&m1).unwrap(), b"test_msg_0");

        let m2 = write(&mut responder, HsState::write_message_2, b"test_msg_1");
        assert_eq!(hex::encode(&m2), MSG_2_PAYLOAD);
        assert_eq!(initiator.read_message_2(&m2).unwrap(), b"test_msg_1");

        let m3 = write(&mut initiator, HsState::write_message_3, b"test_msg_2");
        assert_eq!(hex::encode(&m3), MSG_3_PAYLOAD);
        assert_eq!(responder.read_message_3(&m3).unwrap(), b"test_msg_2");

        let initiator = initiator.split().unwrap();
        let responder = responder.split().unwrap();
        assert_eq!(
            hex::encode(responder.handshake_hash),
            "5b971fb32340e0b5208bc57354c2545c27eaa1ccb54b8bdfd174eda0de94d62d"
        );
        assert_eq!(initiator.handshake_hash, responder.handshake_hash);
    }

    #[test]
    fn split_exchanges_static_keys_and_opposite_halves() {
        let vault = SoftwareVault::new();
        let (mut initiator, mut responder) = fixed_pair(&vault);
        let initiator_public = initiator.s.public;
        let responder_public = responder.s.public;

        let m1 = write(&mut initiator, HsState::write_message_1, &[]);
        responder.read_message_1(&m1).unwrap();
        let m2 = write(&mut responder, HsState::write_message_2, &[]);
        initiator.read_message_2(&m2).unwrap();
        let m3 = write(&mut initiator, HsState::write_message_3, &[]);
        responder.read_message_3(&m3).unwrap();

        let initiator = initiator.split().unwrap();
        let responder = responder.split().unwrap();
        assert_eq!(initiator.remote_static, responder_public);
        assert_eq!(responder.remote_static, initiator_public);
        // static, ephemeral and handshake secrets are gone; 2 traffic keys each
        assert_eq!(vault.secret_count(), 4);

        let export = |s: &OwnedSecret<'_>| vault.secret_export(s.handle()).unwrap();
        let (i_enc, i_dec) = initiator.session.keys();
        let (r_enc, r_dec) = responder.session.keys();
        assert_eq!(export(i_enc), export(r_dec));
        assert_eq!(export(i_dec), export(r_enc));
        assert_ne!(export(i_enc), export(i_dec));
        assert_eq!(
            hex::encode(&*export(i_enc)),
            "b1c674b6535fb1d208772a972cac2cbf04d6aa087cbbd3eb8558a1a3abcaa7fb"
        );
        assert_eq!(
            hex::encode(&*export(r_enc)),
            "109c4b99ea3a4784ff55af5eed86c99e853f5a76d83ce437a9e3e27ede242a6a"
        );
    }

    #[test]
    fn prologue_mismatch_fails_authentication() {
        let vault = SoftwareVault::new();
        let mut initiator = HsState::start(
            &vault,
            Role::Initiator,
            b"prologue-a",
            import(&vault, INITIATOR_STATIC),
            None,
        )
        .unwrap();
        let mut responder = HsState::start(
            &vault,
            Role::Responder,
            b"prologue-b",
            import(&vault, RESPONDER_STATIC),
            None,
        )
        .unwrap();

        let m1 = write(&mut initiator, HsState::write_message_1, &[]);
        responder.read_message_1(&m1).unwrap();
        let m2 = write(&mut responder, HsState::write_message_2, &[]);
        assert!(matches!(
            initiator.read_message_2(&m2),
            Err(KeyAgreementError::AuthenticationFailed)
        ));
    }

    #[test]
    fn tampered_message_1_is_caught_by_message_2() {
        let m1 = hex::decode(MSG_1_PAYLOAD).unwrap();
        for i in 0..m1.len() {
            let vault = SoftwareVault::new();
            let (mut initiator, mut responder) = fixed_pair(&vault);
            write(&mut initiator, HsState::write_message_1, b"test_msg_0");

            let mut tampered = m1.clone();
            tampered[i] ^= 0x01;
            responder.read_message_1(&tampered).unwrap();
            let m2 = write(&mut responder, HsState::write_message_2, &[]);
            assert!(
                matches!(
                    initiator.read_message_2(&m2),
                    Err(KeyAgreementError::AuthenticationFailed)
                ),
                "byte {i} of message 1"
            );
        }
    }

    #[test]
    fn tampered_message_2_fails_authentication() {
        let m2 = hex::decode(MSG_2).unwrap();
        for i in 0..m2.len() {
            let vault = SoftwareVault::new();
            let (mut initiator, _) = fixed_pair(&vault);
            write(&mut initiator, HsState::write_message_1, &[]);

            let mut tampered = m2.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(
                    initiator.read_message_2(&tampered),
                    Err(KeyAgreementError::AuthenticationFailed)
                ),
                "byte {i} of message 2"
            );
        }
    }

    #[test]
    fn tampered_message_3_fails_authentication() {
        let m3 = hex::decode(MSG_3).unwrap();
        for i in 0..m3.len() {
            let vault = SoftwareVault::new();
            let (mut initiator, mut responder) = fixed_pair(&vault);
            let m1 = write(&mut initiator, HsState::write_message_1, &[]);
            responder.read_message_1(&m1).unwrap();
            write(&mut responder, HsState::write_message_2, &[]);

            let mut tampered = m3.clone();
            tampered[i] ^= 0x01;
            assert!(
                matches!(
                    responder.read_message_3(&tampered),
                    Err(KeyAgreementError::AuthenticationFailed)
                ),
                "byte {i} of message 3"
            );
        }
    }

    #[test]
    fn short_messages_are_malformed() {
        let vault = SoftwareVault::new();
        let (mut initiator, mut responder) = fixed_pair(&vault);
        assert!(matches!(
            responder.read_message_1(&[0; 31]),
            Err(KeyAgreementError::KeyAgreementFailed(
                FailureSource::MalformedMessage { message: 1, len: 31, min: 32 }
            ))
        ));
        assert_eq!(responder.phase(), Phase::Start);

        write(&mut initiator, HsState::write_message_1, &[]);
        assert!(matches!(
            initiator.read_message_2(&[0; 95]),
            Err(KeyAgreementError::KeyAgreementFailed(
                FailureSource::MalformedMessage { message: 2, len: 95, min: 96 }
            ))
        ));
    }

    #[test]
    #[should_panic(expected = "invariant broken")]
    fn out_of_order_write() {
        let vault = SoftwareVault::new();
        let (mut initiator, _) = fixed_pair(&vault);
        let mut buff = BytesMut::new();
        let _ = initiator.write_message_3(&[], &mut buff);
    }

    #[test]
    #[should_panic(expected = "invariant broken")]
    fn wrong_role() {
        let vault = SoftwareVault::new();
        let (_, mut responder) = fixed_pair(&vault);
        let mut buff = BytesMut::new();
        let _ = responder.write_message_1(&[], &mut buff);
    }

    #[test]
    fn static_key_must_be_curve25519() {
        let vault = SoftwareVault::new();
        let not_a_key = OwnedSecret::import(&vault, SecretAttributes::chain_key(), &[1; 32]).unwrap();
        assert!(HsState::start(&vault, Role::Initiator, &[], not_a_key, None).is_err());
    }
}
