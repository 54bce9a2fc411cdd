//! Binary packet protocol over a transport
//!
//! One scratch buffer holds a single in-flight inbound packet; it is
//! decrypted in place and wiped once the payload has been copied out.

use alloc::vec::Vec;

use anyos_ssh_crypto::CipherState;
use anyos_ssh_crypto::cipher::{CIPHER_BLOCK_SIZE, MAC_SIZE};
use anyos_ssh_crypto::packet::{MAX_PACKET, MAX_PAYLOAD, MIN_PADDING, block_size, frame_payload, seal_packet};
use rand_core::RngCore;
use zeroize::Zeroize;

use crate::error::{Result, SshError, io_error};
use crate::transport::Transport;

/// Smallest packet_length that can carry a one-byte payload
pub const MIN_PACKET_LENGTH: usize = 1 + 1 + MIN_PADDING;

/// Bounds check on a received packet_length field
pub fn check_packet_length(packet_len: u32) -> Result<()> {
    let len = packet_len as usize;
    if !(MIN_PACKET_LENGTH..=MAX_PACKET - 4).contains(&len) {
        return Err(SshError::Protocol);
    }
    Ok(())
}

#[derive(Default)]
struct Direction {
    cipher: Option<CipherState>,
    seq: u32,
    /// Bytes moved under the current keys
    bytes: u64,
}

pub struct PacketStream<T: Transport> {
    transport: T,
    inbound: Direction,
    outbound: Direction,
    rx: Vec<u8>,
    tx: Vec<u8>,
    last_seq_in: u32,
}

impl<T: Transport> PacketStream<T> {
    pub fn new(transport: T) -> Result<Self> {
        let mut rx = Vec::new();
        rx.try_reserve_exact(MAX_PACKET)
            .map_err(|_| SshError::Alloc)?;
        rx.resize(MAX_PACKET, 0);

        let mut tx = Vec::new();
        tx.try_reserve_exact(MAX_PACKET + MAC_SIZE)
            .map_err(|_| SshError::Alloc)?;

        Ok(Self {
            transport,
            inbound: Direction::default(),
            outbound: Direction::default(),
            rx,
            tx,
            last_seq_in: 0,
        })
    }

    // ========================================================================
    // Send path
    // ========================================================================

    pub async fn send<R: RngCore + ?Sized>(&mut self, payload: &[u8], rng: &mut R) -> Result<()> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(SshError::Protocol);
        }

        let seq = self.outbound.seq;
        seal_packet(&mut self.tx, payload, rng, self.outbound.cipher.as_mut(), seq)?;
        let len = self.tx.len();

        let written = self.transport.write_all(&self.tx).await;
        self.tx.as_mut_slice().zeroize();
        self.tx.clear();
        written.map_err(io_error)?;
        self.transport.flush().await.map_err(io_error)?;

        self.outbound.seq = seq.wrapping_add(1);
        self.outbound.bytes += len as u64;
        Ok(())
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Receive one packet and return its payload (message type first)
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        let encrypted = self.inbound.cipher.is_some();
        let block = block_size(encrypted);
        let first = if encrypted { CIPHER_BLOCK_SIZE } else { 4 };

        self.transport.read_exact(&mut self.rx[..first]).await?;
        if let Some(cipher) = self.inbound.cipher.as_mut() {
            cipher.apply_keystream(&mut self.rx[..first]);
        }

        let packet_len = u32::from_be_bytes([self.rx[0], self.rx[1], self.rx[2], self.rx[3]]);
        check_packet_length(packet_len)?;
        let total = 4 + packet_len as usize;
        if total % block != 0 || total < first {
            log::warn!("[SSH] Misaligned packet length {}", packet_len);
            return Err(SshError::Protocol);
        }

        self.transport.read_exact(&mut self.rx[first..total]).await?;

        let seq = self.inbound.seq;
        let mut mac_len = 0;
        if let Some(cipher) = self.inbound.cipher.as_mut() {
            cipher.apply_keystream(&mut self.rx[first..total]);

            let mut tag = [0u8; MAC_SIZE];
            self.transport.read_exact(&mut tag).await?;
            if !cipher.verify_mac(seq, &self.rx[..total], &tag) {
                log::warn!("[SSH] MAC verification failed (seq={}, len={})", seq, packet_len);
                self.rx[..total].zeroize();
                return Err(SshError::Mac);
            }
            mac_len = MAC_SIZE;
        }

        let payload = match frame_payload(&self.rx[..total]) {
            Some(p) if p.len() <= MAX_PAYLOAD => copy_payload(p),
            _ => Err(SshError::Protocol),
        };
        self.rx[..total].zeroize();
        let payload = payload?;

        self.last_seq_in = seq;
        self.inbound.seq = seq.wrapping_add(1);
        self.inbound.bytes += (total + mac_len) as u64;
        Ok(payload)
    }

    // ========================================================================
    // Key switchover
    // ========================================================================

    /// Install fresh keys for packets we send. Sequence numbers continue.
    pub fn arm_outbound(&mut self, cipher: CipherState) {
        self.outbound.cipher = Some(cipher);
        self.outbound.bytes = 0;
    }

    /// Install fresh keys for packets we receive. Sequence numbers continue.
    pub fn arm_inbound(&mut self, cipher: CipherState) {
        self.inbound.cipher = Some(cipher);
        self.inbound.bytes = 0;
    }

    pub fn is_outbound_encrypted(&self) -> bool {
        self.outbound.cipher.is_some()
    }

    pub fn is_inbound_encrypted(&self) -> bool {
        self.inbound.cipher.is_some()
    }

    pub fn seq_out(&self) -> u32 {
        self.outbound.seq
    }

    pub fn seq_in(&self) -> u32 {
        self.inbound.seq
    }

    /// Sequence number of the most recently received packet
    pub fn last_seq_in(&self) -> u32 {
        self.last_seq_in
    }

    /// Larger of the two directions' byte counts under the current keys
    pub fn bytes_under_current_keys(&self) -> u64 {
        self.inbound.bytes.max(self.outbound.bytes)
    }

    // ========================================================================
    // Raw transport access
    // ========================================================================

    pub(crate) async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write_all(data).await.map_err(io_error)?;
        self.transport.flush().await.map_err(io_error)
    }

    pub(crate) async fn read_raw_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.transport.read_exact(&mut byte).await?;
        Ok(byte[0])
    }

    pub(crate) fn read_ready(&mut self) -> Result<bool> {
        self.transport.read_ready().map_err(io_error)
    }

    pub(crate) async fn shutdown(&mut self) {
        self.transport.shutdown().await;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drop both directions' keys and scrub the scratch buffers
    pub(crate) fn wipe(&mut self) {
        self.inbound.cipher = None;
        self.outbound.cipher = None;
        self.rx.zeroize();
        self.tx.zeroize();
    }

    #[cfg(test)]
    pub(crate) fn force_sequence_numbers(&mut self, seq_in: u32, seq_out: u32) {
        self.inbound.seq = seq_in;
        self.outbound.seq = seq_out;
    }
}

fn copy_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(payload.len())
        .map_err(|_| SshError::Alloc)?;
    out.extend_from_slice(payload);
    Ok(out)
}
