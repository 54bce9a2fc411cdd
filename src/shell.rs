//! Shell processes behind session channels

use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyos_ssh::{ShellCommand, ShellIo, ShellRequest};
use embedded_io_async::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info};

const PUMP_CHUNK: usize = 4096;
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Keys are replaced at least this often on long sessions
pub const REKEY_INTERVAL: Duration = Duration::from_secs(3600);

/// Client-supplied variables that are never passed to the shell
fn env_blocked(name: &str) -> bool {
    name.starts_with("LD_") || matches!(name, "PATH" | "SHELL" | "USER" | "LOGNAME" | "HOME")
}

pub struct ProcessShell {
    child: Child,
    stdin: Option<ChildStdin>,
    /// stdout and stderr chunks, in arrival order
    output: mpsc::Receiver<Vec<u8>>,
    carry: Vec<u8>,
    output_done: bool,
    exit: Option<i32>,
    rekey_at: Instant,
}

impl ProcessShell {
    /// Start `shell` for `request` on behalf of `user`. An exec request runs
    /// `shell -c command`.
    pub fn spawn(shell: &str, request: &ShellRequest, user: &str) -> io::Result<Self> {
        let mut command = Command::new(shell);
        if let ShellCommand::Exec(line) = &request.command {
            command.arg("-c").arg(line);
        }
        for (name, value) in &request.env {
            if env_blocked(name) {
                debug!(name = %name, "client environment variable dropped");
            } else {
                command.env(name, value);
            }
        }
        if let Some(pty) = &request.pty {
            command
                .env("TERM", &pty.term)
                .env("COLUMNS", pty.cols.to_string())
                .env("LINES", pty.rows.to_string());
        }
        command
            .env("USER", user)
            .env("LOGNAME", user)
            .env("SHELL", shell)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        info!(shell, pid = ?child.id(), "shell started");

        let (tx, rx) = mpsc::channel(16);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx));
        }

        Ok(Self {
            stdin: child.stdin.take(),
            child,
            output: rx,
            carry: Vec::new(),
            output_done: false,
            exit: None,
            rekey_at: Instant::now() + REKEY_INTERVAL,
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; PUMP_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

impl ShellIo for ProcessShell {
    type Error = ErrorKind;

    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.carry.is_empty() {
            match self.output.try_recv() {
                Ok(chunk) => self.carry = chunk,
                Err(TryRecvError::Empty) => return Ok(0),
                Err(TryRecvError::Disconnected) => {
                    self.output_done = true;
                    return Ok(0);
                }
            }
        }
        let n = buf.len().min(self.carry.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry.drain(..n);
        Ok(n)
    }

    async fn write_input(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        let written = match stdin.write_all(data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            // The shell stopped reading; its exit is picked up separately
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                self.stdin = None;
                Ok(())
            }
            Err(_) => Err(ErrorKind::Other),
        }
    }

    async fn close_input(&mut self) {
        self.stdin = None;
    }

    fn exit_status(&mut self) -> Option<i32> {
        if self.exit.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit = Some(status.code().unwrap_or(255));
            }
        }
        if self.output_done && self.carry.is_empty() {
            self.exit
        } else {
            None
        }
    }

    fn resize(&mut self, cols: u32, rows: u32) {
        debug!(cols, rows, "terminal resized");
    }

    async fn idle(&mut self) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    fn rekey_due(&mut self) -> bool {
        let now = Instant::now();
        if now < self.rekey_at {
            return false;
        }
        self.rekey_at = now + REKEY_INTERVAL;
        true
    }
}

/// Stands in for a shell that could not be started: prints why, then exits 127
pub struct SpawnFailure {
    message: Vec<u8>,
}

impl SpawnFailure {
    pub fn new(shell: &str, err: &io::Error) -> Self {
        Self {
            message: format!("sshd: cannot run {}: {}\r\n", shell, err).into_bytes(),
        }
    }
}

impl ShellIo for SpawnFailure {
    type Error = ErrorKind;

    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = buf.len().min(self.message.len());
        buf[..n].copy_from_slice(&self.message[..n]);
        self.message.drain(..n);
        Ok(n)
    }

    async fn write_input(&mut self, _data: &[u8]) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn close_input(&mut self) {}

    fn exit_status(&mut self) -> Option<i32> {
        self.message.is_empty().then_some(127)
    }

    async fn idle(&mut self) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
