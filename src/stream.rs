//! TCP stream wrapper for the protocol engine

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use anyos_ssh::Transport;
use embedded_io_async::{ErrorKind, ErrorType, Read, ReadReady, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Read deadline until the client has logged in
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Read deadline once a session is established
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

const PEEK_CHUNK: usize = 4096;

pub struct SshStream {
    inner: TcpStream,
    /// Bytes pulled off the socket by `read_ready`
    pending: VecDeque<u8>,
    read_timeout: Duration,
    write_timeout: Duration,
    /// Last time bytes moved either way
    last_activity: Instant,
}

impl SshStream {
    pub fn new(inner: TcpStream) -> Self {
        Self {
            inner,
            pending: VecDeque::new(),
            read_timeout: HANDSHAKE_TIMEOUT,
            write_timeout: SEND_TIMEOUT,
            last_activity: Instant::now(),
        }
    }

    /// Also the idle limit reported to the forwarding loop
    pub fn set_read_timeout(&mut self, deadline: Duration) {
        self.read_timeout = deadline;
    }
}

fn error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
        io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
        io::ErrorKind::ConnectionAborted => ErrorKind::ConnectionAborted,
        io::ErrorKind::NotConnected => ErrorKind::NotConnected,
        io::ErrorKind::TimedOut => ErrorKind::TimedOut,
        io::ErrorKind::Interrupted => ErrorKind::Interrupted,
        io::ErrorKind::WriteZero => ErrorKind::WriteZero,
        _ => ErrorKind::Other,
    }
}

impl ErrorType for SshStream {
    type Error = ErrorKind;
}

impl Read for SshStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        match timeout(self.read_timeout, self.inner.read(buf)).await {
            Ok(Ok(n)) => {
                if n > 0 {
                    self.last_activity = Instant::now();
                }
                Ok(n)
            }
            Ok(Err(e)) => Err(error_kind(&e)),
            Err(_) => {
                debug!(timeout = ?self.read_timeout, "read deadline expired");
                Err(ErrorKind::TimedOut)
            }
        }
    }
}

impl ReadReady for SshStream {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let mut chunk = [0u8; PEEK_CHUNK];
        match self.inner.try_read(&mut chunk) {
            Ok(n) => {
                if n > 0 {
                    self.last_activity = Instant::now();
                }
                self.pending.extend(&chunk[..n]);
                // n == 0 is EOF; the next read reports it
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(_) => Ok(true),
        }
    }
}

impl Write for SshStream {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        match timeout(self.write_timeout, self.inner.write(buf)).await {
            Ok(Ok(n)) => {
                self.last_activity = Instant::now();
                Ok(n)
            }
            Ok(Err(e)) => Err(error_kind(&e)),
            Err(_) => {
                debug!(timeout = ?self.write_timeout, "send deadline expired");
                Err(ErrorKind::TimedOut)
            }
        }
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        match timeout(self.write_timeout, self.inner.flush()).await {
            Ok(result) => result.map_err(|e| error_kind(&e)),
            Err(_) => Err(ErrorKind::TimedOut),
        }
    }
}

impl Transport for SshStream {
    async fn shutdown(&mut self) {
        if let Err(e) = self.inner.shutdown().await {
            debug!(error = %e, "socket shutdown failed");
        }
    }

    fn idle_expired(&self) -> bool {
        let expired = self.last_activity.elapsed() >= self.read_timeout;
        if expired {
            debug!(timeout = ?self.read_timeout, "idle deadline expired");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (SshStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (SshStream::new(accepted.unwrap().0), client.unwrap())
    }

    #[tokio::test]
    async fn test_read_ready_keeps_bytes() {
        let (mut stream, mut peer) = pair().await;
        assert!(!stream.read_ready().unwrap());

        peer.write_all(b"SSH-2.0-x\r\n").await.unwrap();
        while !stream.read_ready().unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut line = [0u8; 11];
        let mut got = 0;
        while got < line.len() {
            got += stream.read(&mut line[got..]).await.unwrap();
        }
        assert_eq!(&line, b"SSH-2.0-x\r\n");
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (mut stream, _peer) = pair().await;
        stream.set_read_timeout(Duration::from_millis(20));
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).await, Err(ErrorKind::TimedOut));
    }

    #[tokio::test]
    async fn test_idle_deadline() {
        let (mut stream, mut peer) = pair().await;
        stream.set_read_timeout(Duration::from_millis(40));
        assert!(!stream.idle_expired());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(stream.idle_expired());

        peer.write_all(b"x").await.unwrap();
        while !stream.read_ready().unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!stream.idle_expired());

        tokio::time::sleep(Duration::from_millis(60)).await;
        stream.write(b"y").await.unwrap();
        assert!(!stream.idle_expired());
    }

    #[tokio::test]
    async fn test_shutdown_gives_peer_eof() {
        let (mut stream, mut peer) = pair().await;
        stream.write(b"bye").await.unwrap();
        stream.shutdown().await;

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }
}
