//! Forwarding between the session channel and a shell process

use alloc::vec;
use alloc::vec::Vec;

use embedded_io_async::ErrorKind;
use rand_core::{CryptoRng, RngCore};

use crate::error::{Result, SshError};
use crate::session::Session;
use crate::transport::Transport;

/// Bytes pulled from the shell per read
pub const OUTPUT_CHUNK: usize = 8192;
/// Packets drained from the peer per loop iteration
const MAX_INBOUND_PER_ROUND: usize = 16;

/// The process behind a session channel
#[allow(async_fn_in_trait)]
pub trait ShellIo {
    type Error: embedded_io_async::Error;

    /// Copy output that is available now into `buf`. Returns 0 when there is
    /// none; must not wait for more.
    async fn read_output(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error>;

    async fn write_input(&mut self, data: &[u8]) -> core::result::Result<(), Self::Error>;

    /// The peer sent EOF
    async fn close_input(&mut self);

    /// Exit code once the process has exited and its output is drained
    fn exit_status(&mut self) -> Option<i32>;

    fn resize(&mut self, _cols: u32, _rows: u32) {}

    /// Called when a loop iteration moved no data
    async fn idle(&mut self);

    /// Polled once per loop iteration; `true` starts a key exchange
    fn rekey_due(&mut self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardEnd {
    /// The shell exited with this code; exit-status, EOF and CLOSE were sent
    ShellExited(i32),
    /// The peer closed the channel
    ChannelClosed,
}

fn shell_error<E: embedded_io_async::Error>(err: E) -> SshError {
    SshError::Io(err.kind())
}

impl<T: Transport, R: RngCore + CryptoRng> Session<T, R> {
    /// Pump data both ways until the shell exits or the peer closes
    pub async fn forward<S: ShellIo + ?Sized>(&mut self, shell: &mut S) -> Result<ForwardEnd> {
        let mut output: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; OUTPUT_CHUNK];
        let mut input_closed = false;

        loop {
            let mut progressed = false;

            if !self.kex_pending() && shell.rekey_due() {
                self.start_rekey().await?;
            }

            // Peer -> shell
            for _ in 0..MAX_INBOUND_PER_ROUND {
                if !self.packets.read_ready()? {
                    break;
                }
                self.process_next().await?;
                progressed = true;
            }

            let input = self.take_channel_input().await?;
            if !input.is_empty() {
                shell.write_input(&input).await.map_err(shell_error)?;
                progressed = true;
            }

            let channel = self.channel.as_mut().ok_or(SshError::Protocol)?;
            if let Some((cols, rows)) = channel.take_resize() {
                shell.resize(cols, rows);
            }
            if channel.close_received {
                log::info!("[SSH] Channel closed by peer, ending session");
                return Ok(ForwardEnd::ChannelClosed);
            }
            if channel.eof_received && !input_closed {
                input_closed = true;
                shell.close_input().await;
            }

            // Shell -> peer
            if output.is_empty() {
                let n = shell.read_output(&mut buf).await.map_err(shell_error)?;
                output.extend_from_slice(&buf[..n]);
            }
            if !output.is_empty() {
                let sent = self.send_channel_data_some(&output).await?;
                if sent > 0 {
                    output.drain(..sent);
                    progressed = true;
                }
            }

            if output.is_empty() {
                if let Some(code) = shell.exit_status() {
                    log::info!("[SSH] Shell exited with status {}", code);
                    self.finish_channel(code).await?;
                    return Ok(ForwardEnd::ShellExited(code));
                }
            }

            if !progressed {
                if self.packets.transport().idle_expired() {
                    log::info!("[SSH] Session idle too long, closing");
                    return Err(SshError::Io(ErrorKind::TimedOut));
                }
                shell.idle().await;
            }
        }
    }
}
