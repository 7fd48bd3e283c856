//! The byte-stream transport contract.
//!
//! A [`Reader`]/[`Writer`] pair moves whole messages: one `write` on one side
//! is seen as one `read` on the other. Stream transports keep message
//! boundaries with a 2-byte big-endian length prefix.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::RetryPolicy;
use crate::error::TransportError;

pub mod memory;
pub mod tcp;

pub use memory::{duplex, MemoryReader, MemoryWriter};
pub use tcp::{TcpReader, TcpTransport, TcpWriter};

/// Bytes taken by the frame length prefix
pub const FRAME_HEADER_LEN: usize = 2;

pub trait Reader {
    /// Blocks until one message arrives and copies it into `buf`, returning
    /// its length.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

pub trait Writer {
    /// Sends `buf` as one message.
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError>;
}

impl<R: Reader + ?Sized> Reader for &mut R {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        (**self).read(buf)
    }
}

impl<W: Writer + ?Sized> Writer for &mut W {
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        (**self).write(buf)
    }
}

/// Produces connected reader/writer pairs.
pub trait Transport {
    type Reader: Reader;
    type Writer: Writer;

    /// Connect to `address`, retrying failed attempts per `retry` with
    /// `retry_interval` between them.
    fn connect(
        &mut self,
        address: &str,
        retry: RetryPolicy,
        retry_interval: Duration,
    ) -> Result<(Self::Reader, Self::Writer), TransportError>;

    /// Wait for one inbound connection on `bind_address`, returning the
    /// peer's address alongside the stream.
    fn accept(
        &mut self,
        bind_address: &str,
    ) -> Result<(Self::Reader, Self::Writer, SocketAddr), TransportError>;

    /// Stop accepting and refuse further connects. Streams already handed
    /// out stay open until dropped.
    fn deinit(&mut self) -> Result<(), TransportError>;
}
