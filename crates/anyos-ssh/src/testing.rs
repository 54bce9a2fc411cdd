//! In-memory transport for unit tests

use std::collections::VecDeque;
use std::vec::Vec;

use embedded_io_async::{ErrorKind, ErrorType, Read, ReadReady, Write};

use crate::transport::Transport;

/// Reads drain `input`; writes append to `output`. An empty input reads as
/// end of stream.
#[derive(Default)]
pub(crate) struct MockTransport {
    pub input: VecDeque<u8>,
    pub output: Vec<u8>,
    pub shutdowns: usize,
}

impl ErrorType for MockTransport {
    type Error = ErrorKind;
}

impl Read for MockTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = buf.len().min(self.input.len());
        for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }
}

impl ReadReady for MockTransport {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.input.is_empty())
    }
}

impl Transport for MockTransport {
    async fn shutdown(&mut self) {
        self.shutdowns += 1;
    }
}
