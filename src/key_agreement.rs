//! The key agreement interface and its Noise XX implementation.
//!
//! A [`KeyAgreement`] is bound to a vault and a reader/writer pair at
//! construction. `initiate` or `respond` runs the handshake once over that
//! stream; afterwards `encrypt`/`decrypt` go through the resulting
//! [`SecureSession`]. A failed handshake leaves the instance unusable.

use std::mem;

use bytes::BytesMut;
use tracing::{debug, error, info, warn};

use crate::config::HandshakeConfig;
use crate::error::{KeyAgreementError, Result};
use crate::hs_state::{Completed, HsState, Role};
use crate::session::SecureSession;
use crate::transport::{Reader, Writer};
use crate::vault::{OwnedSecret, SecretAttributes, Vault, CURVE25519_KEY_LEN, SHA256_LEN};

pub trait KeyAgreement {
    /// Run the initiator side of the handshake over the bound stream.
    fn initiate(&mut self) -> Result<()>;

    /// Run the responder side of the handshake over the bound stream.
    fn respond(&mut self) -> Result<()>;

    /// Encrypt `plaintext` into `out`, returning the ciphertext length.
    fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Decrypt `ciphertext` into `out`, returning the plaintext length.
    fn decrypt(&mut self, ciphertext: &[u8], out: &mut [u8]) -> Result<usize>;

    /// Destroy every secret the instance holds.
    fn release(self) -> Result<()>
    where
        Self: Sized;

    fn is_established(&self) -> bool;
}

/// Access to the stream a key agreement is bound to, for carrying traffic
/// once the handshake is done.
pub trait BoundStream {
    type Reader: Reader;
    type Writer: Writer;

    fn reader(&mut self) -> &mut Self::Reader;
    fn writer(&mut self) -> &mut Self::Writer;
}

/// Payloads the peer sent during the handshake
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RemotePayloads {
    /// The clear payload of message 1. Only a responder receives one.
    pub early: Vec<u8>,
    /// The encrypted payload of the peer's authenticated message
    pub handshake: Vec<u8>,
}

struct Established<'v> {
    session: SecureSession<'v>,
    handshake_hash: [u8; SHA256_LEN],
    remote_static: [u8; CURVE25519_KEY_LEN],
    remote_payloads: RemotePayloads,
}

impl<'v> Established<'v> {
    fn new(completed: Completed<'v>, remote_payloads: RemotePayloads) -> Self {
        Self {
            session: completed.session,
            handshake_hash: completed.handshake_hash,
            remote_static: completed.remote_static,
            remote_payloads,
        }
    }
}

enum State<'v> {
    Pending,
    Established(Established<'v>),
    /// Handshake attempted and not completed
    Failed,
}

impl State<'_> {
    fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Established(_) => "established",
            State::Failed => "failed",
        }
    }
}

pub struct XxKeyAgreement<'v, R, W> {
    vault: &'v dyn Vault,
    reader: R,
    writer: W,
    config: HandshakeConfig,
    static_key: Option<OwnedSecret<'v>>,
    ephemeral_key: Option<OwnedSecret<'v>>,
    state: State<'v>,
}

impl<'v, R: Reader, W: Writer> XxKeyAgreement<'v, R, W> {
    pub fn new(vault: &'v dyn Vault, reader: R, writer: W, config: HandshakeConfig) -> Self {
        Self {
            vault,
            reader,
            writer,
            config,
            static_key: None,
            ephemeral_key: None,
            state: State::Pending,
        }
    }

    /// Use `key` as the static identity instead of generating one.
    pub fn with_static_key(mut self, key: OwnedSecret<'v>) -> Self {
        self.static_key = Some(key);
        self
    }

    /// Use `key` as the ephemeral key. Only for reproducing fixed vectors; a
    /// reused ephemeral key forfeits forward secrecy.
    pub fn with_ephemeral_key(mut self, key: OwnedSecret<'v>) -> Self {
        self.ephemeral_key = Some(key);
        self
    }

    /// The peer's static public key, once established
    pub fn remote_static(&self) -> Option<[u8; CURVE25519_KEY_LEN]> {
        self.established().map(|est| est.remote_static)
    }

    /// The final handshake hash, identical on both sides
    pub fn handshake_hash(&self) -> Option<[u8; SHA256_LEN]> {
        self.established().map(|est| est.handshake_hash)
    }

    pub fn remote_payloads(&self) -> Option<&RemotePayloads> {
        self.established().map(|est| &est.remote_payloads)
    }

    pub fn session(&self) -> Option<&SecureSession<'v>> {
        self.established().map(|est| &est.session)
    }

    fn established(&self) -> Option<&Established<'v>> {
        match &self.state {
            State::Established(est) => Some(est),
            _ => None,
        }
    }

    fn session_mut(&mut self) -> Result<&mut SecureSession<'v>> {
        match &mut self.state {
            State::Established(est) => Ok(&mut est.session),
            other => Err(KeyAgreementError::InvalidState {
                expected: "established",
                actual: other.name(),
            }),
        }
    }

    /// Leaves the instance `Failed` until the handshake completes, so it can
    /// run only once.
    fn start(&mut self, role: Role) -> Result<HsState<'v>> {
        match mem::replace(&mut self.state, State::Failed) {
            State::Pending => {}
            other => {
                let actual = other.name();
                self.state = other;
                return Err(KeyAgreementError::InvalidState {
                    expected: "pending",
                    actual,
                });
            }
        }

        let s = match self.static_key.take() {
            Some(s) => s,
            None => OwnedSecret::generate(self.vault, SecretAttributes::curve25519())?,
        };
        HsState::start(
            self.vault,
            role,
            &self.config.prologue,
            s,
            self.ephemeral_key.take(),
        )
    }

    fn finish(&mut self, role: Role, result: Result<Established<'v>>) -> Result<()> {
        match result {
            Ok(est) => {
                info!(
                    ?role,
                    handshake_hash = %hex::encode(&est.handshake_hash[..8]),
                    "handshake complete"
                );
                self.state = State::Established(est);
                Ok(())
            }
            Err(e) => {
                if matches!(e, KeyAgreementError::AuthenticationFailed) {
                    warn!(?role, "handshake message failed authentication");
                }
                error!(?role, error = %e, "handshake aborted");
                Err(e)
            }
        }
    }

    fn run_initiator(&mut self, mut hs: HsState<'v>) -> Result<Established<'v>> {
        let mut buff = BytesMut::with_capacity(self.config.max_message_len);
        hs.write_message_1(&self.config.early_payload, &mut buff)?;
        self.send(1, &buff)?;

        let msg = self.receive(2)?;
        let handshake = hs.read_message_2(&msg)?;

        buff.clear();
        hs.write_message_3(&self.config.payload, &mut buff)?;
        self.send(3, &buff)?;

        let payloads = RemotePayloads {
            early: Vec::new(),
            handshake,
        };
        Ok(Established::new(hs.split()?, payloads))
    }

    fn run_responder(&mut self, mut hs: HsState<'v>) -> Result<Established<'v>> {
        let msg = self.receive(1)?;
        let early = hs.read_message_1(&msg)?;

        let mut buff = BytesMut::with_capacity(self.config.max_message_len);
        hs.write_message_2(&self.config.payload, &mut buff)?;
        self.send(2, &buff)?;

        let msg = self.receive(3)?;
        let handshake = hs.read_message_3(&msg)?;

        Ok(Established::new(
            hs.split()?,
            RemotePayloads { early, handshake },
        ))
    }

    fn send(&mut self, message: u8, msg: &[u8]) -> Result<()> {
        if msg.len() > self.config.max_message_len {
            return Err(KeyAgreementError::InvalidParameter(
                "handshake message exceeds max_message_len",
            ));
        }
        self.writer.write(msg)?;
        debug!(message, len = msg.len(), "sent handshake message");
        Ok(())
    }

    fn receive(&mut self, message: u8) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.config.max_message_len];
        let len = self.reader.read(&mut buf)?;
        buf.truncate(len);
        debug!(message, len, "received handshake message");
        Ok(buf)
    }
}

impl<'v, R: Reader, W: Writer> KeyAgreement for XxKeyAgreement<'v, R, W> {
    fn initiate(&mut self) -> Result<()> {
        let hs = self.start(Role::Initiator)?;
        let result = self.run_initiator(hs);
        self.finish(Role::Initiator, result)
    }

    fn respond(&mut self) -> Result<()> {
        let hs = self.start(Role::Responder)?;
        let result = self.run_responder(hs);
        self.finish(Role::Responder, result)
    }

    fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize> {
        self.session_mut()?.encrypt(plaintext, out)
    }

    fn decrypt(&mut self, ciphertext: &[u8], out: &mut [u8]) -> Result<usize> {
        self.session_mut()?.decrypt(ciphertext, out)
    }

    fn release(self) -> Result<()> {
        // pending static/ephemeral keys are destroyed as they drop
        match self.state {
            State::Established(est) => Ok(est.session.release()?),
            State::Pending | State::Failed => Ok(()),
        }
    }

    fn is_established(&self) -> bool {
        matches!(self.state, State::Established(_))
    }
}

impl<R: Reader, W: Writer> BoundStream for XxKeyAgreement<'_, R, W> {
    type Reader = R;
    type Writer = W;

    fn reader(&mut self) -> &mut R {
        &mut self.reader
    }

    fn writer(&mut self) -> &mut W {
        &mut self.writer
    }
}

/// A key agreement of any supported protocol.
#[non_exhaustive]
pub enum KeyAgreementInstance<'v, R, W> {
    Xx(XxKeyAgreement<'v, R, W>),
}

impl<'v, R, W> From<XxKeyAgreement<'v, R, W>> for KeyAgreementInstance<'v, R, W> {
    fn from(xx: XxKeyAgreement<'v, R, W>) -> Self {
        Self::Xx(xx)
    }
}

impl<'v, R: Reader, W: Writer> KeyAgreementInstance<'v, R, W> {
    pub fn remote_static(&self) -> Option<[u8; CURVE25519_KEY_LEN]> {
        match self {
            Self::Xx(xx) => xx.remote_static(),
        }
    }

    pub fn handshake_hash(&self) -> Option<[u8; SHA256_LEN]> {
        match self {
            Self::Xx(xx) => xx.handshake_hash(),
        }
    }
}

impl<'v, R: Reader, W: Writer> KeyAgreement for KeyAgreementInstance<'v, R, W> {
    fn initiate(&mut self) -> Result<()> {
        match self {
            Self::Xx(xx) => xx.initiate(),
        }
    }

    fn respond(&mut self) -> Result<()> {
        match self {
            Self::Xx(xx) => xx.respond(),
        }
    }

    fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize> {
        match self {
            Self::Xx(xx) => xx.encrypt(plaintext, out),
        }
    }

    fn decrypt(&mut self, ciphertext: &[u8], out: &mut [u8]) -> Result<usize> {
        match self {
            Self::Xx(xx) => xx.decrypt(ciphertext, out),
        }
    }

    fn release(self) -> Result<()> {
        match self {
            Self::Xx(xx) => xx.release(),
        }
    }

    fn is_established(&self) -> bool {
        match self {
            Self::Xx(xx) => xx.is_established(),
        }
    }
}

impl<R: Reader, W: Writer> BoundStream for KeyAgreementInstance<'_, R, W> {
    type Reader = R;
    type Writer = W;

    fn reader(&mut self) -> &mut R {
        match self {
            Self::Xx(xx) => xx.reader(),
        }
    }

    fn writer(&mut self) -> &mut W {
        match self {
            Self::Xx(xx) => xx.writer(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;
    use crate::error::{FailureSource, TransportError};
    use crate::hs_state::test::{
        import, INITIATOR_EPH, INITIATOR_STATIC, RESPONDER_EPH, RESPONDER_STATIC,
    };
    use crate::transport::{duplex, MemoryReader, MemoryWriter};
    use crate::vault::{SoftwareVault, AES_GCM_TAG_LEN};

    /// Records every message written through it.
    struct Tap<W> {
        inner: W,
        sent: Vec<Vec<u8>>,
    }

    impl<W: Writer> Writer for Tap<W> {
        fn write(&mut self, buf: &[u8]) -> std::result::Result<(), TransportError> {
            self.sent.push(buf.to_vec());
            self.inner.write(buf)
        }
    }

    fn seal<K: KeyAgreement>(ka: &mut K, plaintext: &[u8]) -> Vec<u8> {
        let mut out = vec![0; plaintext.len() + AES_GCM_TAG_LEN];
        let n = ka.encrypt(plaintext, &mut out).unwrap();
        out.truncate(n);
        out
    }

    fn open<K: KeyAgreement>(ka: &mut K, ciphertext: &[u8]) -> Vec<u8> {
        let mut out = vec![0; ciphertext.len()];
        let n = ka.decrypt(ciphertext, &mut out).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn handshake_over_pipe() {
        let vault = SoftwareVault::new();
        let ((i_r, i_w), (r_r, r_w)) = duplex();

        thread::scope(|s| {
            let responder = s.spawn(|| {
                let config = HandshakeConfig::new().with_payload("from responder");
                let mut ka = XxKeyAgreement::new(&vault, r_r, r_w, config);
                ka.respond().unwrap();
                let ct = seal(&mut ka, b"pong");
                ka.writer().write(&ct).unwrap();
                ka
            });

            let config = HandshakeConfig::new()
                .with_early_payload("hello")
                .with_payload("from initiator");
            let mut initiator = XxKeyAgreement::new(&vault, i_r, i_w, config);
            initiator.initiate().unwrap();
            let responder = responder.join().unwrap();

            assert!(initiator.is_established() && responder.is_established());
            assert_eq!(initiator.handshake_hash(), responder.handshake_hash());
            assert_eq!(
                initiator.remote_payloads().unwrap(),
                &RemotePayloads {
                    early: Vec::new(),
                    handshake: b"from responder".to_vec(),
                }
            );
            assert_eq!(
                responder.remote_payloads().unwrap(),
                &RemotePayloads {
                    early: b"hello".to_vec(),
                    handshake: b"from initiator".to_vec(),
                }
            );

            let mut buf = [0u8; 64];
            let n = initiator.reader().read(&mut buf).unwrap();
            assert_eq!(open(&mut initiator, &buf[..n]), b"pong");
        });
    }

    #[test]
    fn known_answer_through_interface() {
        let vault = SoftwareVault::new();
        let ((i_r, i_w), (r_r, r_w)) = duplex();
        let mut tap = Tap {
            inner: i_w,
            sent: Vec::new(),
        };

        thread::scope(|s| {
            let responder = s.spawn(|| {
                let mut ka = XxKeyAgreement::new(&vault, r_r, r_w, HandshakeConfig::default())
                    .with_static_key(import(&vault, RESPONDER_STATIC))
                    .with_ephemeral_key(import(&vault, RESPONDER_EPH));
                ka.respond().unwrap();
                ka
            });

            let mut initiator =
                XxKeyAgreement::new(&vault, i_r, &mut tap, HandshakeConfig::default())
                    .with_static_key(import(&vault, INITIATOR_STATIC))
                    .with_ephemeral_key(import(&vault, INITIATOR_EPH));
            initiator.initiate().unwrap();
            let mut responder = KeyAgreementInstance::from(responder.join().unwrap());

            let m4 = seal(&mut responder, b"hello world");
            assert_eq!(
                hex::encode(&m4),
                "3a6c5f10f485b1df24a829030798d944e8e513e86b504239b12f1b"
            );
            assert_eq!(open(&mut initiator, &m4), b"hello world");

            let m5 = seal(&mut initiator, b"hello world");
            assert_eq!(
                hex::encode(&m5),
                "8fa1da1ec3e8e8e5eab3161281e66590b14a917fef84ab0a311982"
            );
            assert_eq!(open(&mut responder, &m5), b"hello world");
            assert_eq!(initiator.session().unwrap().encrypt_nonce(), Some(1));
            assert_eq!(initiator.session().unwrap().decrypt_nonce(), Some(1));
        });

        assert_eq!(tap.sent.len(), 2);
        assert_eq!(
            hex::encode(&tap.sent[0]),
            "358072d6365880d1aeea329adf9121383851ed21a28e3b75e965d0d2cd166254"
        );
        assert_eq!(
            hex::encode(&tap.sent[1]),
            "e610eadc4b00c17708bf223f29a66f02342fbedf6c0044736544b9271821ae40e70144cecd9d265dffdc5bb8e051c3f83db32a425e04d8f510c58a43325fbc56"
        );
    }

    #[test]
    fn traffic_before_handshake_is_invalid_state() {
        let vault = SoftwareVault::new();
        let ((r, w), _peer) = duplex();
        let mut ka = KeyAgreementInstance::from(XxKeyAgreement::new(
            &vault,
            r,
            w,
            HandshakeConfig::default(),
        ));
        let mut out = [0u8; 64];

        assert!(!ka.is_established());
        assert!(matches!(
            ka.encrypt(b"early", &mut out),
            Err(KeyAgreementError::InvalidState {
                expected: "established",
                actual: "pending"
            })
        ));
        assert!(matches!(
            ka.decrypt(&[0; 32], &mut out),
            Err(KeyAgreementError::InvalidState { .. })
        ));
        ka.release().unwrap();
    }

    #[test]
    fn failed_handshake_is_final() {
        let vault = SoftwareVault::new();
        let ((r, w), peer) = duplex();
        drop(peer);
        let mut ka = XxKeyAgreement::new(&vault, r, w, HandshakeConfig::default());

        assert!(matches!(
            ka.initiate(),
            Err(KeyAgreementError::KeyAgreementFailed(FailureSource::Transport(
                TransportError::ConnectionClosed
            )))
        ));
        assert!(matches!(
            ka.respond(),
            Err(KeyAgreementError::InvalidState {
                expected: "pending",
                actual: "failed"
            })
        ));
        // the aborted handshake took its secrets with it
        assert_eq!(vault.secret_count(), 0);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let vault = SoftwareVault::new();
        let ((r, w), _peer) = duplex();
        let config = HandshakeConfig::new()
            .with_early_payload(vec![0; 100])
            .with_max_message_len(64);
        let mut ka = XxKeyAgreement::new(&vault, r, w, config);
        assert!(matches!(
            ka.initiate(),
            Err(KeyAgreementError::InvalidParameter(_))
        ));
    }

    #[test]
    fn mismatched_prologue_fails_authentication() {
        let vault = SoftwareVault::new();
        let ((i_r, i_w), (r_r, r_w)) = duplex();

        thread::scope(|s| {
            let responder = s.spawn(|| {
                let config = HandshakeConfig::new().with_prologue("v2");
                let mut ka = XxKeyAgreement::new(&vault, r_r, r_w, config);
                // the initiator hangs up after failing on message 2
                assert!(ka.respond().is_err());
            });

            let config = HandshakeConfig::new().with_prologue("v1");
            let mut initiator = XxKeyAgreement::new(&vault, i_r, i_w, config);
            assert!(matches!(
                initiator.initiate(),
                Err(KeyAgreementError::AuthenticationFailed)
            ));
            drop(initiator);
            responder.join().unwrap();
        });
    }

    #[test]
    fn secrets_are_released_exactly_once() {
        let vault = SoftwareVault::new();
        let ((i_r, i_w), (r_r, r_w)) = duplex();

        thread::scope(|s| {
            let responder = s.spawn(|| {
                let mut ka = XxKeyAgreement::new(&vault, r_r, r_w, HandshakeConfig::default());
                ka.respond().unwrap();
                ka
            });
            let mut initiator: XxKeyAgreement<'_, MemoryReader, MemoryWriter> =
                XxKeyAgreement::new(&vault, i_r, i_w, HandshakeConfig::default());
            initiator.initiate().unwrap();
            let responder = responder.join().unwrap();

            // two traffic keys per side; handshake secrets are gone
            assert_eq!(vault.secret_count(), 4);
            initiator.release().unwrap();
            assert_eq!(vault.secret_count(), 2);
            drop(responder);
            assert_eq!(vault.secret_count(), 0);
        });
    }
}
