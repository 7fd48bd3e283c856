//! Configuration for handshakes and transports

use std::time::Duration;

/// Handshake messages above this size are refused in either direction.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2048;

/// Transport frames above this size are refused.
pub const DEFAULT_MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Configuration for one side of an XX handshake
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandshakeConfig {
    /// Mixed into the handshake hash before the first message. Both sides
    /// must agree on it.
    pub prologue: Vec<u8>,

    /// Encrypted payload carried in this side's authenticated message
    /// (message 2 for the responder, message 3 for the initiator)
    pub payload: Vec<u8>,

    /// Sent in the clear after `e` in message 1. Initiator only.
    pub early_payload: Vec<u8>,

    /// Maximum size of any handshake message
    pub max_message_len: usize,
}

impl HandshakeConfig {
    pub fn new() -> Self {
        Self {
            prologue: Vec::new(),
            payload: Vec::new(),
            early_payload: Vec::new(),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    pub fn with_prologue(mut self, prologue: impl Into<Vec<u8>>) -> Self {
        self.prologue = prologue.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_early_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.early_payload = payload.into();
        self
    }

    pub fn with_max_message_len(mut self, len: usize) -> Self {
        self.max_message_len = len;
        self
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How often a failed connect is retried
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RetryPolicy {
    /// Give up after the first failure
    None,
    /// Retry up to `n` more times
    Times(u32),
    Forever,
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` failed ones.
    pub fn allows(&self, failures: u32) -> bool {
        match self {
            RetryPolicy::None => false,
            RetryPolicy::Times(n) => failures <= *n,
            RetryPolicy::Forever => true,
        }
    }
}

/// Configuration for a byte-stream transport
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportConfig {
    pub retry: RetryPolicy,
    pub retry_interval: Duration,
    pub max_frame_len: usize,
}

impl TransportConfig {
    pub fn new() -> Self {
        Self {
            retry: RetryPolicy::None,
            retry_interval: Duration::from_secs(1),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy, interval: Duration) -> Self {
        self.retry = retry;
        self.retry_interval = interval;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.min(DEFAULT_MAX_FRAME_LEN);
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}
