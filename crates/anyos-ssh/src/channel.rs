//! Session channel (RFC 4254): open, requests, data and window accounting
//!
//! A session carries at most one channel. Inbound messages update the
//! `Channel` state in `dispatch`; the operations below wait on that state.

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use anyos_ssh_crypto::packet::MAX_PAYLOAD;
use anyos_ssh_crypto::wire::{read_bool, read_str, read_string, read_u32, write_bool, write_string, write_u32};
use embedded_io_async::ErrorKind;
use rand_core::{CryptoRng, RngCore};

use crate::error::{Result, SshError};
use crate::msg::*;
use crate::session::{Role, Session};
use crate::transport::Transport;

// ============================================================================
// Constants
// ============================================================================

pub const LOCAL_CHANNEL_ID: u32 = 0;
pub const DEFAULT_LOCAL_WINDOW: u32 = 0x200000;
/// Message byte, recipient and data length in front of channel data
pub const CHANNEL_DATA_OVERHEAD: usize = 9;
/// Requests accepted on a channel before it asks for a shell
pub const MAX_CHANNEL_REQUESTS: usize = 16;
const MAX_ENV_VARS: usize = 64;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Shell,
    Exec(String),
}

/// What the client asked the server to run, and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRequest {
    pub command: ShellCommand,
    pub pty: Option<PtyRequest>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Refused(u32),
}

pub struct Channel {
    pub(crate) local_id: u32,
    pub(crate) remote_id: u32,
    pub(crate) state: ChannelState,
    pub(crate) remote_window: u32,
    pub(crate) remote_max_packet: u32,
    pub(crate) local_window: u32,
    pub(crate) local_window_initial: u32,
    pub(crate) inbound: Vec<u8>,
    pub(crate) eof_received: bool,
    pub(crate) eof_sent: bool,
    pub(crate) close_received: bool,
    pub(crate) close_sent: bool,
    pub(crate) pty: Option<PtyRequest>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) command: Option<ShellCommand>,
    pub(crate) command_taken: bool,
    pub(crate) requests_seen: usize,
    pub(crate) resized: bool,
    pub(crate) replies: VecDeque<bool>,
    pub(crate) exit_status: Option<u32>,
}

impl Channel {
    fn new(local_window: u32) -> Self {
        Self {
            local_id: LOCAL_CHANNEL_ID,
            remote_id: 0,
            state: ChannelState::Opening,
            remote_window: 0,
            remote_max_packet: 0,
            local_window,
            local_window_initial: local_window,
            inbound: Vec::new(),
            eof_received: false,
            eof_sent: false,
            close_received: false,
            close_sent: false,
            pty: None,
            env: Vec::new(),
            command: None,
            command_taken: false,
            requests_seen: 0,
            resized: false,
            replies: VecDeque::new(),
            exit_status: None,
        }
    }

    fn set_remote(&mut self, remote_id: u32, window: u32, max_packet: u32) {
        self.remote_id = remote_id;
        self.remote_window = window;
        self.remote_max_packet = if max_packet == 0 {
            (MAX_PAYLOAD - CHANNEL_DATA_OVERHEAD) as u32
        } else {
            max_packet
        };
        self.state = ChannelState::Open;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn remote_window(&self) -> u32 {
        self.remote_window
    }

    pub fn remote_max_packet(&self) -> u32 {
        self.remote_max_packet
    }

    pub fn local_window(&self) -> u32 {
        self.local_window
    }

    pub fn pty(&self) -> Option<&PtyRequest> {
        self.pty.as_ref()
    }

    /// Exit status reported by the server (client side)
    pub fn exit_status(&self) -> Option<u32> {
        self.exit_status
    }

    pub fn is_eof(&self) -> bool {
        self.eof_received
    }

    pub fn is_closed(&self) -> bool {
        self.close_received
    }

    /// Largest data chunk that may be sent right now
    pub fn max_chunk(&self) -> usize {
        (self.remote_window as usize)
            .min(self.remote_max_packet as usize)
            .min(MAX_PAYLOAD - CHANNEL_DATA_OVERHEAD)
    }

    /// New terminal size, if a window-change arrived since the last call
    pub(crate) fn take_resize(&mut self) -> Option<(u32, u32)> {
        if !self.resized {
            return None;
        }
        self.resized = false;
        self.pty.as_ref().map(|pty| (pty.cols, pty.rows))
    }
}

fn channel_payload(msg_type: u8, recipient: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.push(msg_type);
    write_u32(&mut payload, recipient);
    payload
}

fn open_failure(recipient: u32, reason: u32, description: &str) -> Vec<u8> {
    let mut payload = channel_payload(SSH_MSG_CHANNEL_OPEN_FAILURE, recipient);
    write_u32(&mut payload, reason);
    write_string(&mut payload, description.as_bytes());
    write_string(&mut payload, b"");
    payload
}

impl<T: Transport, R: RngCore + CryptoRng> Session<T, R> {
    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Receive and apply one message. Transport-layer messages are handled
    /// underneath.
    pub(crate) async fn process_next(&mut self) -> Result<()> {
        if let Some(payload) = self.recv_step().await? {
            self.dispatch(payload).await?;
        }
        Ok(())
    }

    /// Apply a connection-layer message to the channel state
    pub(crate) async fn dispatch(&mut self, payload: Vec<u8>) -> Result<()> {
        let msg_type = payload[0];
        if !self.authenticated {
            log::warn!("[SSH] {} before authentication", name(msg_type));
            return Err(SshError::Protocol);
        }

        match msg_type {
            SSH_MSG_CHANNEL_OPEN => self.on_channel_open(&payload).await,
            SSH_MSG_CHANNEL_OPEN_CONFIRMATION => self.on_open_confirmation(&payload),
            SSH_MSG_CHANNEL_OPEN_FAILURE => self.on_open_failure(&payload),
            SSH_MSG_CHANNEL_WINDOW_ADJUST => {
                let mut offset = 1;
                let (_, adjust) = self.read_recipient(&payload, &mut offset, |o, p| read_u32(p, o))?;
                let channel = self.channel_mut()?;
                channel.remote_window = channel.remote_window.saturating_add(adjust);
                Ok(())
            }
            SSH_MSG_CHANNEL_DATA => {
                let mut offset = 1;
                let (_, data) = self.read_recipient(&payload, &mut offset, |o, p| read_string(p, o))?;
                self.on_channel_data(data)
            }
            SSH_MSG_CHANNEL_EXTENDED_DATA => {
                let mut offset = 1;
                let (_, data) = self.read_recipient(&payload, &mut offset, |o, p| {
                    read_u32(p, o)?;
                    read_string(p, o)
                })?;
                self.on_channel_data(data)
            }
            SSH_MSG_CHANNEL_EOF => {
                self.read_recipient(&payload, &mut 1, |_, _| Some(()))?;
                self.channel_mut()?.eof_received = true;
                log::debug!("[SSH] Channel EOF from peer");
                Ok(())
            }
            SSH_MSG_CHANNEL_CLOSE => {
                self.read_recipient(&payload, &mut 1, |_, _| Some(()))?;
                self.channel_mut()?.close_received = true;
                log::info!("[SSH] Channel closed by peer");
                self.send_close().await
            }
            SSH_MSG_CHANNEL_REQUEST => self.on_channel_request(&payload).await,
            SSH_MSG_CHANNEL_SUCCESS | SSH_MSG_CHANNEL_FAILURE => {
                self.read_recipient(&payload, &mut 1, |_, _| Some(()))?;
                self.channel_mut()?
                    .replies
                    .push_back(msg_type == SSH_MSG_CHANNEL_SUCCESS);
                Ok(())
            }
            SSH_MSG_USERAUTH_REQUEST => {
                log::debug!("[SSH] Ignoring auth request after success");
                Ok(())
            }
            _ => {
                log::warn!("[SSH] Unexpected {} on connection layer", name(msg_type));
                Err(SshError::Protocol)
            }
        }
    }

    /// Check the recipient field of a channel message, then parse the rest
    fn read_recipient<'p, V>(
        &self,
        payload: &'p [u8],
        offset: &mut usize,
        rest: impl FnOnce(&mut usize, &'p [u8]) -> Option<V>,
    ) -> Result<(u32, V)> {
        let recipient = read_u32(payload, offset).ok_or(SshError::Protocol)?;
        match self.channel.as_ref() {
            Some(channel) if channel.local_id == recipient && channel.state == ChannelState::Open => {}
            _ => {
                log::warn!("[SSH] Message for unknown channel {}", recipient);
                return Err(SshError::Protocol);
            }
        }
        let value = rest(offset, payload).ok_or(SshError::Protocol)?;
        Ok((recipient, value))
    }

    fn channel_mut(&mut self) -> Result<&mut Channel> {
        self.channel.as_mut().ok_or(SshError::Protocol)
    }

    fn open_channel(&self) -> Result<&Channel> {
        match self.channel.as_ref() {
            Some(channel) if channel.state == ChannelState::Open => Ok(channel),
            _ => Err(SshError::Protocol),
        }
    }

    async fn on_channel_open(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 1;
        let channel_type = read_string(payload, &mut offset).ok_or(SshError::Protocol)?;
        let sender = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
        let window = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
        let max_packet = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;

        if channel_type != b"session" {
            log::info!("[SSH] Refusing channel type '{}'", String::from_utf8_lossy(channel_type));
            let reply = open_failure(sender, SSH_OPEN_UNKNOWN_CHANNEL_TYPE, "unsupported channel type");
            return self.send_connection(&reply).await;
        }
        if self.role != Role::Server || self.channel.is_some() {
            let reply = open_failure(sender, SSH_OPEN_ADMINISTRATIVELY_PROHIBITED, "only one session channel");
            return self.send_connection(&reply).await;
        }

        let mut channel = Channel::new(self.local_window);
        channel.set_remote(sender, window, max_packet);
        let mut reply = channel_payload(SSH_MSG_CHANNEL_OPEN_CONFIRMATION, sender);
        write_u32(&mut reply, channel.local_id);
        write_u32(&mut reply, channel.local_window);
        write_u32(&mut reply, MAX_PAYLOAD as u32);
        self.channel = Some(channel);
        log::info!(
            "[SSH] Session channel open (peer id={}, window={}, max_packet={})",
            sender,
            window,
            max_packet
        );
        self.send_connection(&reply).await
    }

    fn on_open_confirmation(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 1;
        let fields = (|| {
            Some((
                read_u32(payload, &mut offset)?,
                read_u32(payload, &mut offset)?,
                read_u32(payload, &mut offset)?,
                read_u32(payload, &mut offset)?,
            ))
        })();
        let (recipient, sender, window, max_packet) = fields.ok_or(SshError::Protocol)?;
        match self.channel.as_mut() {
            Some(channel) if channel.state == ChannelState::Opening && channel.local_id == recipient => {
                channel.set_remote(sender, window, max_packet);
                Ok(())
            }
            _ => Err(SshError::Protocol),
        }
    }

    fn on_open_failure(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 1;
        let recipient = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
        let reason = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
        match self.channel.as_mut() {
            Some(channel) if channel.state == ChannelState::Opening && channel.local_id == recipient => {
                log::info!("[SSH] Channel open refused (reason {})", reason);
                channel.state = ChannelState::Refused(reason);
                Ok(())
            }
            _ => Err(SshError::Protocol),
        }
    }

    fn on_channel_data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let channel = self.channel_mut()?;
        if channel.eof_received || channel.close_received {
            log::warn!("[SSH] Channel data after EOF");
            return Err(SshError::Protocol);
        }
        if data.len() > channel.local_window as usize {
            log::warn!(
                "[SSH] Peer overran window ({} bytes, {} left)",
                data.len(),
                channel.local_window
            );
            return Err(SshError::Protocol);
        }
        channel.local_window -= data.len() as u32;
        channel
            .inbound
            .try_reserve(data.len())
            .map_err(|_| SshError::Alloc)?;
        channel.inbound.extend_from_slice(data);
        Ok(())
    }

    async fn on_channel_request(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 1;
        let (_, (request, want_reply)) = self.read_recipient(payload, &mut offset, |o, p| {
            Some((read_str(p, o)?, read_bool(p, o)?))
        })?;
        let role = self.role;
        let channel = self.channel_mut()?;
        if role == Role::Server && !channel.command_taken {
            channel.requests_seen += 1;
        }

        let accepted = match (role, request) {
            (Role::Server, "pty-req") => {
                let term = read_str(payload, &mut offset).ok_or(SshError::Protocol)?;
                let cols = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
                let rows = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
                log::debug!("[SSH] pty-req term={} {}x{}", term, cols, rows);
                channel.pty = Some(PtyRequest {
                    term: term.to_string(),
                    cols,
                    rows,
                });
                true
            }
            (Role::Server, "env") => {
                let var = read_str(payload, &mut offset).ok_or(SshError::Protocol)?;
                let value = read_str(payload, &mut offset).ok_or(SshError::Protocol)?;
                if channel.env.len() < MAX_ENV_VARS {
                    channel.env.push((var.to_string(), value.to_string()));
                }
                true
            }
            (Role::Server, "shell") if channel.command.is_none() => {
                channel.command = Some(ShellCommand::Shell);
                true
            }
            (Role::Server, "exec") if channel.command.is_none() => {
                let command = read_str(payload, &mut offset).ok_or(SshError::Protocol)?;
                channel.command = Some(ShellCommand::Exec(command.to_string()));
                true
            }
            (Role::Server, "window-change") => {
                let cols = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
                let rows = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
                if let Some(pty) = channel.pty.as_mut() {
                    pty.cols = cols;
                    pty.rows = rows;
                    channel.resized = true;
                }
                true
            }
            (Role::Client, "exit-status") => {
                let status = read_u32(payload, &mut offset).ok_or(SshError::Protocol)?;
                log::debug!("[SSH] Remote command exited with {}", status);
                channel.exit_status = Some(status);
                true
            }
            (_, other) => {
                log::debug!("[SSH] Refusing channel request '{}'", other);
                false
            }
        };

        if want_reply {
            let msg_type = if accepted {
                SSH_MSG_CHANNEL_SUCCESS
            } else {
                SSH_MSG_CHANNEL_FAILURE
            };
            let reply = channel_payload(msg_type, channel.remote_id);
            self.send_connection(&reply).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Data
    // ========================================================================

    /// Send as much of `data` as the peer's window allows right now
    pub(crate) async fn send_channel_data_some(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() || self.kex_pending() {
            return Ok(0);
        }
        let channel = self.open_channel()?;
        if channel.close_sent || channel.eof_sent {
            return Err(SshError::Io(ErrorKind::BrokenPipe));
        }
        let chunk = channel.max_chunk().min(data.len());
        if chunk == 0 {
            return Ok(0);
        }

        let mut payload = channel_payload(SSH_MSG_CHANNEL_DATA, channel.remote_id);
        write_string(&mut payload, &data[..chunk]);
        self.send_packet(&payload).await?;
        self.channel_mut()?.remote_window -= chunk as u32;

        self.rekey_if_due().await?;
        Ok(chunk)
    }

    /// Take everything received so far and reopen the window if it has run low
    pub(crate) async fn take_channel_input(&mut self) -> Result<Vec<u8>> {
        let channel = self.channel_mut()?;
        let data = core::mem::take(&mut channel.inbound);
        if channel.close_received || channel.local_window >= channel.local_window_initial / 2 {
            return Ok(data);
        }

        let consumed = channel.local_window_initial - channel.local_window;
        channel.local_window = channel.local_window_initial;
        let mut adjust = channel_payload(SSH_MSG_CHANNEL_WINDOW_ADJUST, channel.remote_id);
        write_u32(&mut adjust, consumed);
        log::debug!("[SSH] Window adjust +{}", consumed);
        self.send_connection(&adjust).await?;
        Ok(data)
    }

    /// Write all of `data` to the channel, waiting for window space
    pub async fn channel_write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let sent = self.send_channel_data_some(data).await?;
            if sent == 0 {
                if self.open_channel()?.close_received {
                    return Err(SshError::Io(ErrorKind::BrokenPipe));
                }
                self.process_next().await?;
            }
            data = &data[sent..];
        }
        Ok(())
    }

    /// Next chunk of data from the peer, `None` once it sent EOF or CLOSE
    pub async fn channel_read(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let channel = self.open_channel()?;
            if !channel.inbound.is_empty() {
                return self.take_channel_input().await.map(Some);
            }
            if channel.eof_received || channel.close_received {
                return Ok(None);
            }
            self.process_next().await?;
        }
    }

    /// Half-close our side
    pub async fn channel_eof(&mut self) -> Result<()> {
        let channel = self.open_channel()?;
        if channel.eof_sent || channel.close_sent {
            return Ok(());
        }
        let payload = channel_payload(SSH_MSG_CHANNEL_EOF, channel.remote_id);
        self.channel_mut()?.eof_sent = true;
        self.send_connection(&payload).await
    }

    pub async fn channel_close(&mut self) -> Result<()> {
        self.send_close().await
    }

    async fn send_close(&mut self) -> Result<()> {
        let channel = self.channel_mut()?;
        if channel.close_sent {
            return Ok(());
        }
        channel.close_sent = true;
        let payload = channel_payload(SSH_MSG_CHANNEL_CLOSE, channel.remote_id);
        self.send_connection(&payload).await
    }

    /// Report the exit code, then EOF and CLOSE
    pub(crate) async fn finish_channel(&mut self, exit_code: i32) -> Result<()> {
        let channel = self.open_channel()?;
        if channel.close_sent {
            return Ok(());
        }
        let remote_id = channel.remote_id;

        let mut status = channel_payload(SSH_MSG_CHANNEL_REQUEST, remote_id);
        write_string(&mut status, b"exit-status");
        write_bool(&mut status, false);
        write_u32(&mut status, exit_code as u32);
        self.send_connection(&status).await?;

        if !self.open_channel()?.eof_sent {
            self.channel_mut()?.eof_sent = true;
            self.send_connection(&channel_payload(SSH_MSG_CHANNEL_EOF, remote_id))
                .await?;
        }
        self.send_close().await
    }

    // ========================================================================
    // Server operations
    // ========================================================================

    /// Wait for the client to open the session channel
    pub async fn accept_channel(&mut self) -> Result<()> {
        loop {
            if self.open_channel().is_ok() {
                return Ok(());
            }
            self.process_next().await?;
        }
    }

    /// Collect pty/env requests until the client asks for a shell or a command
    pub async fn accept_shell(&mut self) -> Result<ShellRequest> {
        loop {
            let channel = self.channel_mut()?;
            if !channel.command_taken {
                if let Some(command) = channel.command.clone() {
                    channel.command_taken = true;
                    let request = ShellRequest {
                        command,
                        pty: channel.pty.clone(),
                        env: channel.env.clone(),
                    };
                    log::info!("[SSH] Shell requested ({:?})", request.command);
                    return Ok(request);
                }
            }
            if channel.requests_seen > MAX_CHANNEL_REQUESTS {
                log::warn!("[SSH] Too many channel requests before shell");
                return Err(SshError::Protocol);
            }
            if channel.close_received {
                return Err(SshError::Io(ErrorKind::ConnectionAborted));
            }
            self.process_next().await?;
        }
    }

    // ========================================================================
    // Client operations
    // ========================================================================

    /// Open a session channel. `false` if the server refused.
    pub async fn open_session(&mut self) -> Result<bool> {
        if self.role != Role::Client || self.channel.is_some() {
            return Err(SshError::Protocol);
        }
        let channel = Channel::new(self.local_window);
        let mut payload = vec![SSH_MSG_CHANNEL_OPEN];
        write_string(&mut payload, b"session");
        write_u32(&mut payload, channel.local_id);
        write_u32(&mut payload, channel.local_window);
        write_u32(&mut payload, MAX_PAYLOAD as u32);
        self.channel = Some(channel);
        self.send_connection(&payload).await?;

        loop {
            let state = self.channel_mut()?.state;
            match state {
                ChannelState::Open => return Ok(true),
                ChannelState::Refused(_) => {
                    self.channel = None;
                    return Ok(false);
                }
                ChannelState::Opening => self.process_next().await?,
            }
        }
    }

    pub async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<bool> {
        let mut extra = Vec::new();
        write_string(&mut extra, term.as_bytes());
        write_u32(&mut extra, cols);
        write_u32(&mut extra, rows);
        write_u32(&mut extra, 0);
        write_u32(&mut extra, 0);
        write_string(&mut extra, &[0]);
        self.channel_request("pty-req", &extra).await
    }

    pub async fn request_shell(&mut self) -> Result<bool> {
        self.channel_request("shell", &[]).await
    }

    pub async fn request_exec(&mut self, command: &str) -> Result<bool> {
        let mut extra = Vec::new();
        write_string(&mut extra, command.as_bytes());
        self.channel_request("exec", &extra).await
    }

    /// Send a request with want_reply set and wait for the answer
    async fn channel_request(&mut self, request: &str, extra: &[u8]) -> Result<bool> {
        let mut payload = channel_payload(SSH_MSG_CHANNEL_REQUEST, self.open_channel()?.remote_id);
        write_string(&mut payload, request.as_bytes());
        write_bool(&mut payload, true);
        payload.extend_from_slice(extra);
        self.send_connection(&payload).await?;

        loop {
            let channel = self.channel_mut()?;
            if let Some(reply) = channel.replies.pop_front() {
                return Ok(reply);
            }
            if channel.close_received {
                return Ok(false);
            }
            self.process_next().await?;
        }
    }
}
