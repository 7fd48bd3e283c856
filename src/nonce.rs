//! Noise nonces: a 64-bit counter that must never repeat under one key.
//! The max value is reserved.
//!
//! We use rusts type system to encapsulate these rules: a [`Nonce`] can only be
//! advanced by harvesting it, and the successor of the last usable value does
//! not exist.

use zeroize::Zeroize;

use crate::vault::AES_GCM_IV_LEN;

#[derive(Zeroize, Eq, PartialEq)]
#[cfg_attr(test, derive(Debug))]
pub struct Nonce(u64);

impl Nonce {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the AES-GCM IV for the current value together with the nonce to
    /// use next. When the counter is exhausted the next nonce is `None`.
    ///
    /// The IV is four zero bytes followed by the counter, most significant byte
    /// first.
    ///
    /// #Panics: panics if the reserved max-value for u64 is used
    pub fn harvest(&self) -> ([u8; AES_GCM_IV_LEN], Option<Self>) {
        if self.0 == u64::MAX {
            panic!("invariant broken: use of u64::MAX for nonce");
        }
        let mut iv = [0; AES_GCM_IV_LEN];
        iv[4..].copy_from_slice(&self.0.to_be_bytes());
        let next = if self.0 == u64::MAX - 1 {
            None
        } else {
            Some(Self(self.0 + 1))
        };

        (iv, next)
    }
}

impl Default for Nonce {
    fn default() -> Self {
        Self::new()
    }
}
