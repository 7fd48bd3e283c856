//! Blocking TCP transport with length-prefixed frames.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info};

use super::{Reader, Transport, Writer, FRAME_HEADER_LEN};
use crate::config::{RetryPolicy, TransportConfig};
use crate::error::TransportError;

#[derive(Debug)]
pub struct TcpReader {
    stream: TcpStream,
    max_frame_len: usize,
}

#[derive(Debug)]
pub struct TcpWriter {
    stream: TcpStream,
    max_frame_len: usize,
}

impl Reader for TcpReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }

        let len = u16::from_be_bytes(header) as usize;
        if len > self.max_frame_len {
            // the peer broke the framing contract; nothing after this is trusted
            let _ = self.stream.shutdown(Shutdown::Both);
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if len > buf.len() {
            // skip the body so the next read starts on a frame header
            self.read_body(&mut io::sink(), len)?;
            return Err(TransportError::FrameTooLarge {
                len,
                max: buf.len(),
            });
        }
        self.read_body(&mut &mut buf[..len], len)?;
        Ok(len)
    }
}

impl TcpReader {
    fn read_body(&mut self, out: &mut impl Write, len: usize) -> Result<(), TransportError> {
        let copied = io::copy(&mut (&self.stream).take(len as u64), out)?;
        if copied < len as u64 {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }
}

impl Writer for TcpWriter {
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        if buf.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: buf.len(),
                max: self.max_frame_len,
            });
        }
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + buf.len());
        frame.put_u16(buf.len() as u16);
        frame.put_slice(buf);
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl Drop for TcpWriter {
    fn drop(&mut self) {
        // lets the peer's pending read see EOF even while the reader half lives on
        let _ = self.stream.shutdown(Shutdown::Write);
    }
}

pub struct TcpTransport {
    listener: Option<TcpListener>,
    max_frame_len: usize,
    closed: bool,
}

impl TcpTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            listener: None,
            max_frame_len: config.max_frame_len,
            closed: false,
        }
    }

    /// Bind the listening socket ahead of [`Transport::accept`], which then
    /// reuses it. Returns the bound address, so port 0 can be used.
    pub fn listen(&mut self, bind_address: &str) -> Result<SocketAddr, TransportError> {
        self.check_open()?;
        let listener = TcpListener::bind(bind_address)?;
        let local = listener.local_addr()?;
        info!(%local, "listening");
        self.listener = Some(listener);
        Ok(local)
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn split(&self, stream: TcpStream) -> Result<(TcpReader, TcpWriter), TransportError> {
        let reader = TcpReader {
            stream: stream.try_clone()?,
            max_frame_len: self.max_frame_len,
        };
        let writer = TcpWriter {
            stream,
            max_frame_len: self.max_frame_len,
        };
        Ok((reader, writer))
    }
}

impl Transport for TcpTransport {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    fn connect(
        &mut self,
        address: &str,
        retry: RetryPolicy,
        retry_interval: Duration,
    ) -> Result<(TcpReader, TcpWriter), TransportError> {
        self.check_open()?;
        let mut failures = 0u32;
        let stream = loop {
            match TcpStream::connect(address) {
                Ok(stream) => break stream,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if !retry.allows(failures) {
                        return Err(TransportError::ConnectRetriesExhausted {
                            attempts: failures,
                            last: e,
                        });
                    }
                    debug!(address, attempt = failures, error = %e, "connect failed, retrying");
                    thread::sleep(retry_interval);
                }
            }
        };
        debug!(address, peer = ?stream.peer_addr().ok(), "connected");
        self.split(stream)
    }

    fn accept(
        &mut self,
        bind_address: &str,
    ) -> Result<(TcpReader, TcpWriter, SocketAddr), TransportError> {
        self.check_open()?;
        if self.listener.is_none() {
            self.listen(bind_address)?;
        }
        let Some(listener) = &self.listener else {
            return Err(TransportError::NotConnected);
        };
        let (stream, peer) = listener.accept()?;
        debug!(%peer, "accepted connection");
        let (reader, writer) = self.split(stream)?;
        Ok((reader, writer, peer))
    }

    fn deinit(&mut self) -> Result<(), TransportError> {
        self.listener = None;
        self.closed = true;
        Ok(())
    }
}
