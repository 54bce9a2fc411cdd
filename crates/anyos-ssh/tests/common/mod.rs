#![allow(dead_code)]

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use anyos_ssh::{AuthDecision, HostKey, PasswordAuthenticator, Session, ShellIo, Transport};
use embedded_io_async::{ErrorKind, ErrorType, Read, ReadReady, Write};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};

pub type TestSession = Session<DuplexTransport, StdRng>;

/// One end of an in-memory pipe as an engine transport
pub struct DuplexTransport {
    stream: DuplexStream,
    pending: VecDeque<u8>,
    /// Reported through `idle_expired` once no bytes moved for this long
    pub idle_limit: Option<Duration>,
    last_activity: Instant,
}

impl DuplexTransport {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            pending: VecDeque::new(),
            idle_limit: None,
            last_activity: Instant::now(),
        }
    }
}

impl ErrorType for DuplexTransport {
    type Error = ErrorKind;
}

impl Read for DuplexTransport {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            return Ok(n);
        }
        let n = self.stream.read(buf).await.map_err(|_| ErrorKind::Other)?;
        if n > 0 {
            self.last_activity = Instant::now();
        }
        Ok(n)
    }
}

impl Write for DuplexTransport {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream
            .write_all(buf)
            .await
            .map_err(|_| ErrorKind::BrokenPipe)?;
        self.last_activity = Instant::now();
        Ok(buf.len())
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush().await.map_err(|_| ErrorKind::BrokenPipe)
    }
}

impl ReadReady for DuplexTransport {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let mut tmp = [0u8; 4096];
        let mut buf = ReadBuf::new(&mut tmp);
        let mut cx = Context::from_waker(Waker::noop());
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                if !buf.filled().is_empty() {
                    self.last_activity = Instant::now();
                }
                self.pending.extend(buf.filled().iter().copied());
                Ok(true)
            }
            Poll::Ready(Err(_)) => Ok(true),
            Poll::Pending => Ok(false),
        }
    }
}

impl Transport for DuplexTransport {
    async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    fn idle_expired(&self) -> bool {
        self.idle_limit
            .is_some_and(|limit| self.last_activity.elapsed() >= limit)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn host_key() -> Arc<HostKey> {
    let scalar: Vec<u8> = (1..=32).collect();
    Arc::new(HostKey::from_scalar(&scalar).unwrap())
}

pub fn session_pair() -> (TestSession, TestSession) {
    let (server_end, client_end) = tokio::io::duplex(1 << 20);
    let server = Session::server(
        DuplexTransport::new(server_end),
        StdRng::seed_from_u64(1),
        host_key(),
    )
    .unwrap();
    let client = Session::client(DuplexTransport::new(client_end), StdRng::seed_from_u64(2)).unwrap();
    (server, client)
}

pub async fn handshake(server: &mut TestSession, client: &mut TestSession) {
    let (s, c) = tokio::join!(server.handshake(), client.handshake());
    s.unwrap();
    c.unwrap();
}

pub async fn login(server: &mut TestSession, client: &mut TestSession) {
    let mut alice = Alice;
    let (s, c) = tokio::join!(
        server.server_auth(&mut alice, &anyos_ssh::AllowAll),
        client.client_auth_password("alice", "s3cret")
    );
    assert_eq!(s.unwrap(), "alice");
    c.unwrap();
}

/// Knows a single account: alice / s3cret
pub struct Alice;

impl PasswordAuthenticator for Alice {
    fn authenticate(&mut self, user: &str, password: &[u8]) -> AuthDecision {
        if user == "alice" && password == b"s3cret" {
            AuthDecision::Allow
        } else {
            AuthDecision::Deny
        }
    }
}

/// Echoes input back as output. Exits once input is closed and the echo has
/// been read, or right away after `output` if `exit_after_output` is set.
#[derive(Default)]
pub struct TestShell {
    pub output: VecDeque<u8>,
    pub echo: bool,
    pub exit_after_output: bool,
    pub input_closed: bool,
    pub resized: Option<(u32, u32)>,
    /// Ask for one rekey on the first poll
    pub rekey_once: bool,
}

impl TestShell {
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn with_output(output: &[u8]) -> Self {
        Self {
            output: output.iter().copied().collect(),
            exit_after_output: true,
            ..Self::default()
        }
    }
}

impl ShellIo for TestShell {
    type Error = ErrorKind;

    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = buf.len().min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn write_input(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        if self.echo {
            self.output.extend(data.iter().copied());
        }
        Ok(())
    }

    async fn close_input(&mut self) {
        self.input_closed = true;
    }

    fn exit_status(&mut self) -> Option<i32> {
        let done = self.input_closed || self.exit_after_output;
        (done && self.output.is_empty()).then_some(0)
    }

    fn resize(&mut self, cols: u32, rows: u32) {
        self.resized = Some((cols, rows));
    }

    async fn idle(&mut self) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn rekey_due(&mut self) -> bool {
        core::mem::take(&mut self.rekey_once)
    }
}

/// Read channel data until EOF or CLOSE
pub async fn read_to_end(client: &mut TestSession) -> Vec<u8> {
    let mut received = Vec::new();
    while let Some(chunk) = client.channel_read().await.unwrap() {
        received.extend_from_slice(&chunk);
    }
    received
}
