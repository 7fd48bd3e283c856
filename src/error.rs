//! Error types for key agreement, the crypto engine, and the transport.

use std::io;

use thiserror::Error;

/// Errors surfaced by the key agreement interface and the secure channel.
#[derive(Debug, Error)]
pub enum KeyAgreementError {
    /// A null or zero-sized argument was supplied
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Operation attempted out of lifecycle order
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// An underlying crypto engine or transport step failed
    #[error("key agreement failed: {0}")]
    KeyAgreementFailed(#[from] FailureSource),

    /// AEAD tag verification failed
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Destination buffer cannot hold the result
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The traffic nonce for one direction has been used up
    #[error("nonce exhausted; a new handshake is required")]
    NonceExhausted,
}

/// The domain a [`KeyAgreementError::KeyAgreementFailed`] originated in.
#[derive(Debug, Error)]
pub enum FailureSource {
    #[error("vault: {0}")]
    Vault(#[source] VaultError),

    #[error("transport: {0}")]
    Transport(#[source] TransportError),

    /// A received handshake message is too short for its pattern
    #[error("malformed handshake message {message}: {len} bytes, expected at least {min}")]
    MalformedMessage { message: u8, len: usize, min: usize },
}

impl From<VaultError> for KeyAgreementError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::AuthenticationFailed => KeyAgreementError::AuthenticationFailed,
            other => KeyAgreementError::KeyAgreementFailed(FailureSource::Vault(other)),
        }
    }
}

impl From<TransportError> for KeyAgreementError {
    fn from(e: TransportError) -> Self {
        KeyAgreementError::KeyAgreementFailed(FailureSource::Transport(e))
    }
}

/// Errors reported by a [`crate::vault::Vault`].
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("unknown secret handle")]
    UnknownSecret,

    #[error("secret type not valid for this operation")]
    InvalidSecretType,

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid peer public key")]
    InvalidPublicKey,

    #[error("aead operation failed")]
    AeadFailure,

    /// The AEAD tag did not verify
    #[error("aead authentication failed")]
    AuthenticationFailed,

    #[error("hkdf expansion failed")]
    HkdfFailure,

    #[error("private key material cannot be exported")]
    ExportForbidden,
}

/// Errors reported by a [`crate::transport::Reader`], [`crate::transport::Writer`]
/// or [`crate::transport::Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("connect failed after {attempts} attempts: {last}")]
    ConnectRetriesExhausted {
        attempts: u32,
        #[source]
        last: io::Error,
    },

    #[error("transport is not connected")]
    NotConnected,
}

/// Result type for key agreement operations
pub type Result<T> = std::result::Result<T, KeyAgreementError>;
