//! A secure channel: a key agreement run over a transport, then used to carry
//! encrypted messages over the same stream.

use tracing::{debug, warn};

use crate::config::{HandshakeConfig, TransportConfig, DEFAULT_MAX_FRAME_LEN};
use crate::error::{KeyAgreementError, Result};
use crate::key_agreement::{BoundStream, KeyAgreement, KeyAgreementInstance, XxKeyAgreement};
use crate::transport::{Reader, Transport, Writer};
use crate::vault::{Vault, AES_GCM_TAG_LEN, CURVE25519_KEY_LEN, SHA256_LEN};

pub struct SecureChannel<'v, R, W> {
    key_agreement: KeyAgreementInstance<'v, R, W>,
    max_frame_len: usize,
    /// Set once a send has consumed a nonce without delivering the frame.
    failed: bool,
}

impl<'v, R: Reader, W: Writer> SecureChannel<'v, R, W> {
    /// Connect to `address` and run the handshake as initiator.
    pub fn connect<T>(
        vault: &'v dyn Vault,
        transport: &mut T,
        address: &str,
        config: &TransportConfig,
        handshake: HandshakeConfig,
    ) -> Result<Self>
    where
        T: Transport<Reader = R, Writer = W>,
    {
        let (reader, writer) = transport.connect(address, config.retry, config.retry_interval)?;
        let key_agreement = XxKeyAgreement::new(vault, reader, writer, handshake).into();
        Self::initiate(key_agreement, config.max_frame_len)
    }

    /// Accept one connection on `bind_address` and run the handshake as
    /// responder.
    pub fn accept<T>(
        vault: &'v dyn Vault,
        transport: &mut T,
        bind_address: &str,
        config: &TransportConfig,
        handshake: HandshakeConfig,
    ) -> Result<Self>
    where
        T: Transport<Reader = R, Writer = W>,
    {
        let (reader, writer, peer) = transport.accept(bind_address)?;
        debug!(%peer, "running handshake with inbound peer");
        let key_agreement = XxKeyAgreement::new(vault, reader, writer, handshake).into();
        Self::respond(key_agreement, config.max_frame_len)
    }

    /// Run the initiator side of an already bound key agreement.
    pub fn initiate(
        mut key_agreement: KeyAgreementInstance<'v, R, W>,
        max_frame_len: usize,
    ) -> Result<Self> {
        key_agreement.initiate()?;
        Ok(Self::established(key_agreement, max_frame_len))
    }

    /// Run the responder side of an already bound key agreement.
    pub fn respond(
        mut key_agreement: KeyAgreementInstance<'v, R, W>,
        max_frame_len: usize,
    ) -> Result<Self> {
        key_agreement.respond()?;
        Ok(Self::established(key_agreement, max_frame_len))
    }

    fn established(key_agreement: KeyAgreementInstance<'v, R, W>, max_frame_len: usize) -> Self {
        Self {
            key_agreement,
            max_frame_len: max_frame_len.min(DEFAULT_MAX_FRAME_LEN),
            failed: false,
        }
    }

    fn check_usable(&self) -> Result<()> {
        if self.failed {
            return Err(KeyAgreementError::InvalidState {
                expected: "established",
                actual: "failed",
            });
        }
        Ok(())
    }

    /// Encrypt `plaintext` and send it as one message.
    ///
    /// The nonce is spent before the write. If the write fails the peer can
    /// no longer follow, so the channel is marked failed and every later
    /// `send` or `recv` returns `InvalidState`.
    pub fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        self.check_usable()?;
        let needed = plaintext.len() + AES_GCM_TAG_LEN;
        if needed > self.max_frame_len {
            return Err(KeyAgreementError::BufferTooSmall {
                needed,
                available: self.max_frame_len,
            });
        }
        let mut ct = vec![0; needed];
        let len = self.key_agreement.encrypt(plaintext, &mut ct)?;
        if let Err(e) = self.key_agreement.writer().write(&ct[..len]) {
            warn!(error = %e, "send failed, channel is no longer usable");
            self.failed = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Receive one message and decrypt it.
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        self.check_usable()?;
        let mut ct = vec![0; self.max_frame_len];
        let len = self.key_agreement.reader().read(&mut ct)?;
        let mut pt = vec![0; len.saturating_sub(AES_GCM_TAG_LEN)];
        let len = self.key_agreement.decrypt(&ct[..len], &mut pt)?;
        pt.truncate(len);
        Ok(pt)
    }

    pub fn remote_static(&self) -> Option<[u8; CURVE25519_KEY_LEN]> {
        self.key_agreement.remote_static()
    }

    pub fn handshake_hash(&self) -> Option<[u8; SHA256_LEN]> {
        self.key_agreement.handshake_hash()
    }

    /// Release the key agreement. The bound stream is dropped with it, which
    /// closes the connection.
    pub fn deinit(self) -> Result<()> {
        self.key_agreement.release()
    }
}
