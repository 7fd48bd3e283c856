//! Noise `XX` key agreement (`Noise_XX_25519_AESGCM_SHA256`) and the secure
//! channel built on it.
//!
//! A [`KeyAgreement`] is bound to a [`Vault`] and a transport
//! [`Reader`]/[`Writer`] pair. Running `initiate` or `respond` performs the
//! three-message handshake; afterwards the same object encrypts and decrypts
//! traffic with the split keys.
//!
//! ```no_run
//! use xx_channel::{HandshakeConfig, SecureChannel, SoftwareVault, TcpTransport, TransportConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vault = SoftwareVault::new();
//! let config = TransportConfig::default();
//! let mut transport = TcpTransport::new(&config);
//! let mut channel = SecureChannel::connect(
//!     &vault,
//!     &mut transport,
//!     "127.0.0.1:4000",
//!     &config,
//!     HandshakeConfig::default(),
//! )?;
//! channel.send(b"hello")?;
//! let _reply = channel.recv()?;
//! channel.deinit()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
/// The transient handshake cipher. Replaced on every MixKey, gone after split.
mod cipher_state;
pub mod config;
pub mod error;
/// Role, message patterns and the phase machine of one handshake.
/// Deleted once handshake is complete.
mod hs_state;
pub mod key_agreement;
mod nonce;
pub mod session;
/// Contains cipher_state + ck and h variables. Each party's sole symm_state
/// encapsulates the "symmetric cryptography" used by Noise.
/// Deleted once handshake is complete.
mod symm_state;
pub mod transport;
pub mod vault;

pub use channel::SecureChannel;
pub use config::{HandshakeConfig, RetryPolicy, TransportConfig};
pub use error::{FailureSource, KeyAgreementError, Result, TransportError, VaultError};
pub use hs_state::Role;
pub use key_agreement::{
    BoundStream, KeyAgreement, KeyAgreementInstance, RemotePayloads, XxKeyAgreement,
};
pub use session::SecureSession;
pub use symm_state::PROTOCOL_NAME;
pub use transport::{Reader, TcpTransport, Transport, Writer};
pub use vault::{OwnedSecret, SecretAttributes, SecretHandle, SoftwareVault, Vault};
