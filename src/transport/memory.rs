//! In-process message pipe, one message per channel send.

use std::sync::mpsc::{channel, Receiver, Sender};

use super::{Reader, Writer};
use crate::error::TransportError;

pub struct MemoryReader {
    rx: Receiver<Vec<u8>>,
}

pub struct MemoryWriter {
    tx: Sender<Vec<u8>>,
}

/// Two connected endpoints. What one endpoint's writer sends, the other's
/// reader receives.
pub fn duplex() -> ((MemoryReader, MemoryWriter), (MemoryReader, MemoryWriter)) {
    let (a_tx, a_rx) = channel();
    let (b_tx, b_rx) = channel();
    (
        (MemoryReader { rx: b_rx }, MemoryWriter { tx: a_tx }),
        (MemoryReader { rx: a_rx }, MemoryWriter { tx: b_tx }),
    )
}

impl Reader for MemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let msg = self.rx.recv().map_err(|_| TransportError::ConnectionClosed)?;
        if msg.len() > buf.len() {
            return Err(TransportError::FrameTooLarge {
                len: msg.len(),
                max: buf.len(),
            });
        }
        buf[..msg.len()].copy_from_slice(&msg);
        Ok(msg.len())
    }
}

impl Writer for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)
    }
}
