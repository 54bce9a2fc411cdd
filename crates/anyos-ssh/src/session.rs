//! Session context: owns the packet stream and drives the transport layer
//!
//! The connection layer (auth, channels, forwarding) lives in sibling
//! modules as further `impl Session` blocks.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use anyos_ssh_crypto::kex::EXCHANGE_HASH_SIZE;
use anyos_ssh_crypto::wire::{read_str, read_u32, write_u32, write_string};
use anyos_ssh_crypto::{EphemeralSecret, HostKey, KeyMaterial};
use embedded_io_async::ErrorKind;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

use crate::channel::{Channel, DEFAULT_LOCAL_WINDOW};
use crate::error::{Result, SshError};
use crate::kex::{
    COOKIE_SIZE, KexInit, KexOutput, KexTranscript, build_ecdh_init, build_kexinit,
    client_verify_reply, negotiate, parse_ecdh_init, server_ecdh_reply,
};
use crate::msg::{self, *};
use crate::packet::PacketStream;
use crate::transport::Transport;
use crate::version::{CLIENT_VERSION, SERVER_VERSION, recv_version, send_version};

/// Rekey once this many bytes have moved in either direction under one key set
pub const DEFAULT_REKEY_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

pub struct Session<T: Transport, R: RngCore + CryptoRng> {
    pub(crate) role: Role,
    pub(crate) packets: PacketStream<T>,
    pub(crate) rng: R,
    host_key: Option<Arc<HostKey>>,
    local_version: String,
    peer_version: String,
    session_id: Option<[u8; EXCHANGE_HASH_SIZE]>,
    kex_hash: [u8; EXCHANGE_HASH_SIZE],
    /// Our KEXINIT for a rekey we started, until the peer answers
    pending_kexinit: Option<Vec<u8>>,
    kex_in_progress: bool,
    kex_count: u32,
    rekey_after_bytes: u64,
    /// Connection-layer messages held back while keys are being replaced
    deferred: Vec<Vec<u8>>,
    peer_host_key: Option<Vec<u8>>,
    pub(crate) banner: Option<String>,
    pub(crate) peer_banner: Option<String>,
    pub(crate) userauth_accepted: bool,
    pub(crate) authenticated: bool,
    pub(crate) local_window: u32,
    pub(crate) channel: Option<Channel>,
    closed: bool,
    wiped: bool,
}

impl<T: Transport, R: RngCore + CryptoRng> Session<T, R> {
    // ========================================================================
    // Construction
    // ========================================================================

    pub fn server(transport: T, rng: R, host_key: Arc<HostKey>) -> Result<Self> {
        let mut session = Self::new(Role::Server, transport, rng)?;
        session.host_key = Some(host_key);
        session.local_version = SERVER_VERSION.to_string();
        Ok(session)
    }

    pub fn client(transport: T, rng: R) -> Result<Self> {
        let mut session = Self::new(Role::Client, transport, rng)?;
        session.local_version = CLIENT_VERSION.to_string();
        Ok(session)
    }

    fn new(role: Role, transport: T, rng: R) -> Result<Self> {
        Ok(Self {
            role,
            packets: PacketStream::new(transport)?,
            rng,
            host_key: None,
            local_version: String::new(),
            peer_version: String::new(),
            session_id: None,
            kex_hash: [0; EXCHANGE_HASH_SIZE],
            pending_kexinit: None,
            kex_in_progress: false,
            kex_count: 0,
            rekey_after_bytes: DEFAULT_REKEY_BYTES,
            deferred: Vec::new(),
            peer_host_key: None,
            banner: None,
            peer_banner: None,
            userauth_accepted: false,
            authenticated: false,
            local_window: DEFAULT_LOCAL_WINDOW,
            channel: None,
            closed: false,
            wiped: false,
        })
    }

    /// Text sent as USERAUTH_BANNER before the first auth reply
    pub fn with_banner(mut self, banner: Option<String>) -> Self {
        self.banner = banner.filter(|b| !b.is_empty());
        self
    }

    /// Override our identification string (without CR LF)
    pub fn with_version(mut self, version: &str) -> Self {
        self.local_version = version.to_string();
        self
    }

    /// Initial receive window offered on the session channel
    pub fn with_local_window(mut self, window: u32) -> Self {
        self.local_window = window;
        self
    }

    pub fn with_rekey_limit(mut self, bytes: u64) -> Self {
        self.rekey_after_bytes = bytes;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Option<&[u8; EXCHANGE_HASH_SIZE]> {
        self.session_id.as_ref()
    }

    pub fn kex_hash(&self) -> &[u8; EXCHANGE_HASH_SIZE] {
        &self.kex_hash
    }

    /// Number of completed key exchanges
    pub fn kex_count(&self) -> u32 {
        self.kex_count
    }

    pub fn local_version(&self) -> &str {
        &self.local_version
    }

    pub fn peer_version(&self) -> &str {
        &self.peer_version
    }

    /// The server's K_S blob, once a client-side exchange has verified it
    pub fn peer_host_key(&self) -> Option<&[u8]> {
        self.peer_host_key.as_deref()
    }

    /// Banner the server sent during authentication
    pub fn peer_banner(&self) -> Option<&str> {
        self.peer_banner.as_deref()
    }

    pub fn channel(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_wiped(&self) -> bool {
        self.wiped
    }

    pub fn packets(&self) -> &PacketStream<T> {
        &self.packets
    }

    pub fn transport(&self) -> &T {
        self.packets.transport()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        self.packets.transport_mut()
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    /// Version exchange followed by the first key exchange
    pub async fn handshake(&mut self) -> Result<()> {
        self.exchange_versions().await?;
        self.key_exchange().await
    }

    pub async fn exchange_versions(&mut self) -> Result<()> {
        self.ensure_open()?;
        send_version(&mut self.packets, &self.local_version).await?;
        self.peer_version = recv_version(&mut self.packets).await?;
        log::info!("[SSH] Peer version: {}", self.peer_version);
        Ok(())
    }

    /// Run the initial key exchange. Both sides send KEXINIT immediately.
    pub async fn key_exchange(&mut self) -> Result<()> {
        if self.peer_version.is_empty() || self.session_id.is_some() {
            return Err(SshError::Protocol);
        }
        self.run_kex(None).await
    }

    /// Replace the session keys now. Messages that arrive meanwhile are
    /// processed normally.
    pub async fn rekey(&mut self) -> Result<()> {
        if self.session_id.is_none() {
            return Err(SshError::Protocol);
        }
        if !self.kex_pending() {
            self.start_rekey().await?;
        }
        while self.kex_pending() {
            if let Some(payload) = self.recv_step().await? {
                self.dispatch(payload).await?;
            }
        }
        Ok(())
    }

    pub(crate) fn kex_pending(&self) -> bool {
        self.pending_kexinit.is_some() || self.kex_in_progress
    }

    fn needs_rekey(&self) -> bool {
        self.session_id.is_some()
            && !self.kex_pending()
            && self.packets.bytes_under_current_keys() >= self.rekey_after_bytes
    }

    pub(crate) async fn start_rekey(&mut self) -> Result<()> {
        log::info!("[SSH] Starting rekey");
        let kexinit = self.send_kexinit().await?;
        self.pending_kexinit = Some(kexinit);
        Ok(())
    }

    pub(crate) async fn rekey_if_due(&mut self) -> Result<()> {
        if self.needs_rekey() {
            self.start_rekey().await?;
        }
        Ok(())
    }

    async fn send_kexinit(&mut self) -> Result<Vec<u8>> {
        let mut cookie = [0u8; COOKIE_SIZE];
        self.rng.fill_bytes(&mut cookie);
        let kexinit = build_kexinit(&cookie);
        self.send_packet(&kexinit).await?;
        Ok(kexinit)
    }

    async fn run_kex(&mut self, peer_kexinit: Option<Vec<u8>>) -> Result<()> {
        self.kex_in_progress = true;
        let local = match self.pending_kexinit.take() {
            Some(kexinit) => kexinit,
            None => self.send_kexinit().await?,
        };
        let peer = match peer_kexinit {
            Some(kexinit) => kexinit,
            None => self.recv_kex_message(SSH_MSG_KEXINIT).await?,
        };
        let (client_kexinit, server_kexinit) = match self.role {
            Role::Server => (&peer, &local),
            Role::Client => (&local, &peer),
        };

        let discard_guess = {
            let client = KexInit::parse(client_kexinit)?;
            let server = KexInit::parse(server_kexinit)?;
            let negotiated = negotiate(&client, &server)?;
            log::debug!(
                "[SSH] Negotiated kex={} hostkey={} cipher={} mac={}",
                negotiated.kex,
                negotiated.host_key,
                negotiated.cipher_c2s,
                negotiated.mac_c2s
            );
            let peer_init = match self.role {
                Role::Server => &client,
                Role::Client => &server,
            };
            peer_init.first_kex_packet_follows && !peer_init.guess_matches(&negotiated)
        };
        if discard_guess {
            let skipped = self.packets.recv().await?;
            log::debug!("[SSH] Discarded wrong kex guess ({})", msg::name(skipped[0]));
        }

        let output = match self.role {
            Role::Server => self.server_ecdh(client_kexinit, server_kexinit).await?,
            Role::Client => self.client_ecdh(client_kexinit, server_kexinit).await?,
        };

        let exchange_hash = output.exchange_hash;
        let session_id = *self.session_id.get_or_insert(exchange_hash);
        self.kex_hash = exchange_hash;

        let keys = KeyMaterial::derive(output.shared_secret.as_bytes(), &exchange_hash, &session_id);
        let (outbound, inbound) = match self.role {
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
        };

        self.send_packet(&[SSH_MSG_NEWKEYS]).await?;
        self.packets.arm_outbound(outbound.cipher_state());
        self.recv_kex_message(SSH_MSG_NEWKEYS).await?;
        self.packets.arm_inbound(inbound.cipher_state());

        self.kex_in_progress = false;
        self.kex_count += 1;
        log::info!(
            "[SSH] Key exchange #{} complete, keys switched (seq out={}, in={})",
            self.kex_count,
            self.packets.seq_out(),
            self.packets.seq_in()
        );

        for payload in core::mem::take(&mut self.deferred) {
            self.send_packet(&payload).await?;
        }
        Ok(())
    }

    async fn server_ecdh(&mut self, client_kexinit: &[u8], server_kexinit: &[u8]) -> Result<KexOutput> {
        let host_key = self.host_key.clone().ok_or(SshError::Kex)?;
        let init = self.recv_kex_message(SSH_MSG_KEX_ECDH_INIT).await?;
        let client_public = parse_ecdh_init(&init)?;

        let ephemeral = EphemeralSecret::generate(&mut self.rng);
        let transcript = KexTranscript {
            client_version: self.peer_version.as_bytes(),
            server_version: self.local_version.as_bytes(),
            client_kexinit,
            server_kexinit,
        };
        let (reply, output) = server_ecdh_reply(&host_key, &ephemeral, &transcript, client_public)?;

        self.send_packet(&reply).await?;
        Ok(output)
    }

    async fn client_ecdh(&mut self, client_kexinit: &[u8], server_kexinit: &[u8]) -> Result<KexOutput> {
        let ephemeral = EphemeralSecret::generate(&mut self.rng);
        self.send_packet(&build_ecdh_init(&ephemeral)).await?;

        let reply = self.recv_kex_message(SSH_MSG_KEX_ECDH_REPLY).await?;
        let transcript = KexTranscript {
            client_version: self.local_version.as_bytes(),
            server_version: self.peer_version.as_bytes(),
            client_kexinit,
            server_kexinit,
        };
        let (output, host_key_blob) = client_verify_reply(&ephemeral, &transcript, &reply)?;

        if let Some(known) = &self.peer_host_key {
            if *known != host_key_blob {
                log::warn!("[SSH] Server host key changed during rekey");
                return Err(SshError::Kex);
            }
        }
        self.peer_host_key = Some(host_key_blob);
        Ok(output)
    }

    /// Next packet of an exchange in progress. Only transport-layer noise may
    /// come in between.
    async fn recv_kex_message(&mut self, expected: u8) -> Result<Vec<u8>> {
        loop {
            let payload = self.packets.recv().await?;
            match payload[0] {
                SSH_MSG_IGNORE | SSH_MSG_DEBUG | SSH_MSG_UNIMPLEMENTED => continue,
                SSH_MSG_DISCONNECT => return Err(peer_disconnect(&payload)),
                t if t == expected => return Ok(payload),
                t => {
                    log::warn!(
                        "[SSH] Expected {} during key exchange, got {}",
                        msg::name(expected),
                        msg::name(t)
                    );
                    return Err(SshError::Protocol);
                }
            }
        }
    }

    // ========================================================================
    // Message I/O
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SshError::Io(ErrorKind::NotConnected));
        }
        Ok(())
    }

    pub(crate) async fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.packets.send(payload, &mut self.rng).await
    }

    /// Send a connection-layer message, or hold it until a running key
    /// exchange has finished
    pub(crate) async fn send_connection(&mut self, payload: &[u8]) -> Result<()> {
        if self.kex_pending() {
            self.deferred.push(payload.to_vec());
            return Ok(());
        }
        self.send_packet(payload).await
    }

    /// Receive one packet and handle it if it belongs to the transport layer.
    /// Returns the payload of anything else.
    pub(crate) async fn recv_step(&mut self) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        let payload = self.packets.recv().await?;
        let msg_type = payload[0];
        match msg_type {
            SSH_MSG_IGNORE | SSH_MSG_DEBUG | SSH_MSG_UNIMPLEMENTED => {
                log::debug!("[SSH] Skipping {}", msg::name(msg_type));
                Ok(None)
            }
            SSH_MSG_DISCONNECT => Err(peer_disconnect(&payload)),
            SSH_MSG_KEXINIT if self.session_id.is_some() => {
                self.run_kex(Some(payload)).await?;
                Ok(None)
            }
            SSH_MSG_GLOBAL_REQUEST => {
                self.reject_global_request(&payload).await?;
                Ok(None)
            }
            t if !msg::is_known(t) => {
                log::debug!("[SSH] Unimplemented message type {}", t);
                let mut reply = vec![SSH_MSG_UNIMPLEMENTED];
                write_u32(&mut reply, self.packets.last_seq_in());
                self.send_packet(&reply).await?;
                Ok(None)
            }
            _ => {
                self.rekey_if_due().await?;
                Ok(Some(payload))
            }
        }
    }

    /// Next message that is not transport-layer housekeeping
    pub(crate) async fn recv_message(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.recv_step().await? {
                return Ok(payload);
            }
        }
    }

    async fn reject_global_request(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 1;
        let name = read_str(payload, &mut offset).ok_or(SshError::Protocol)?;
        let want_reply = payload.get(offset).copied().ok_or(SshError::Protocol)? != 0;
        log::debug!("[SSH] Refusing global request '{}'", name);
        if want_reply {
            self.send_packet(&[SSH_MSG_REQUEST_FAILURE]).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Send DISCONNECT (if the peer can still read it) and close. Later calls
    /// do nothing.
    pub async fn disconnect(&mut self, reason: u32, description: &str) {
        if self.closed {
            return;
        }
        if !self.peer_version.is_empty() {
            let mut payload = vec![SSH_MSG_DISCONNECT];
            write_u32(&mut payload, reason);
            write_string(&mut payload, description.as_bytes());
            write_string(&mut payload, b"");
            match self.packets.send(&payload, &mut self.rng).await {
                Ok(()) => log::info!("[SSH] Sent disconnect (reason {})", reason),
                Err(e) => log::debug!("[SSH] Could not send disconnect: {}", e),
            }
        }
        self.close().await;
    }

    /// Tear down after a failure, telling the peer why when that is possible
    pub async fn abort(&mut self, err: &SshError) {
        match err.disconnect_reason() {
            Some(reason) => self.disconnect(reason, &err.to_string()).await,
            None => self.close().await,
        }
    }

    /// Close the transport and wipe keys. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.packets.shutdown().await;
        self.wipe();
    }

    fn wipe(&mut self) {
        if self.wiped {
            return;
        }
        self.wiped = true;
        self.packets.wipe();
        self.kex_hash.zeroize();
        self.deferred.clear();
        if let Some(channel) = self.channel.as_mut() {
            channel.inbound.zeroize();
        }
        log::debug!("[SSH] Session keys wiped");
    }

    #[cfg(test)]
    pub(crate) fn force_session_id(&mut self, id: [u8; EXCHANGE_HASH_SIZE]) {
        self.session_id = Some(id);
    }

    #[cfg(test)]
    pub(crate) fn force_peer_version(&mut self, version: &str) {
        self.peer_version = version.to_string();
    }
}

impl<T: Transport, R: RngCore + CryptoRng> Drop for Session<T, R> {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Turn a received DISCONNECT into the error that ends the session
fn peer_disconnect(payload: &[u8]) -> SshError {
    let mut offset = 1;
    let reason = read_u32(payload, &mut offset).unwrap_or(0);
    let description = read_str(payload, &mut offset).unwrap_or("");
    log::info!("[SSH] Peer disconnected (reason {}): {}", reason, description);
    SshError::PeerDisconnected { reason }
}
