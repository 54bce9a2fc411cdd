//! Binary packet framing (RFC 4253 §6)
//!
//! ```text
//! uint32   packet_length
//! byte     padding_length
//! byte[n]  payload
//! byte[p]  random padding
//! byte[m]  mac (encrypted transports only)
//! ```

use alloc::vec::Vec;
use rand_core::RngCore;

use crate::CryptoError;
use crate::cipher::{CIPHER_BLOCK_SIZE, CipherState};
use crate::wire::write_u32;

// ============================================================================
// Constants
// ============================================================================

/// Largest packet accepted on the wire, length field included
pub const MAX_PACKET: usize = 35000;
/// Largest payload accepted in either direction
pub const MAX_PAYLOAD: usize = 32768;
pub const MIN_PADDING: usize = 4;
/// Block size used for padding before any cipher is active
pub const CLEARTEXT_BLOCK_SIZE: usize = 8;
/// packet_length + padding_length
pub const FRAME_HEADER_SIZE: usize = 5;

// ============================================================================
// Padding
// ============================================================================

/// Smallest padding >= 4 that makes `4 + 1 + payload_len + padding` a
/// multiple of `block_size`
pub fn padding_len(payload_len: usize, block_size: usize) -> usize {
    let unpadded = FRAME_HEADER_SIZE + payload_len;
    let mut padding = block_size - unpadded % block_size;
    if padding < MIN_PADDING {
        padding += block_size;
    }
    padding
}

/// Block size for a direction
pub fn block_size(encrypted: bool) -> usize {
    if encrypted {
        CIPHER_BLOCK_SIZE
    } else {
        CLEARTEXT_BLOCK_SIZE
    }
}

// ============================================================================
// Sealing
// ============================================================================

/// Build a complete wire packet for `payload` into `out`.
///
/// With a cipher the frame is MACed over its cleartext and then encrypted in
/// place, and the tag is appended (encrypt-and-MAC).
pub fn seal_packet<R: RngCore + ?Sized>(
    out: &mut Vec<u8>,
    payload: &[u8],
    rng: &mut R,
    cipher: Option<&mut CipherState>,
    seq: u32,
) -> Result<(), CryptoError> {
    let padding = padding_len(payload.len(), block_size(cipher.is_some()));
    let packet_len = 1 + payload.len() + padding;

    out.clear();
    write_u32(out, packet_len as u32);
    out.push(padding as u8);
    out.extend_from_slice(payload);

    let pad_start = out.len();
    out.resize(pad_start + padding, 0);
    rng.fill_bytes(&mut out[pad_start..]);

    if let Some(cipher) = cipher {
        let tag = cipher.compute_mac(seq, out)?;
        cipher.apply_keystream(out);
        out.extend_from_slice(&tag);
    }

    Ok(())
}

/// Extract the payload from a cleartext frame (length field included, MAC
/// excluded). Returns `None` if the padding length is out of range.
pub fn frame_payload(frame: &[u8]) -> Option<&[u8]> {
    let padding = *frame.get(4)? as usize;
    let payload_len = frame
        .len()
        .checked_sub(FRAME_HEADER_SIZE)?
        .checked_sub(padding)?;
    if padding < MIN_PADDING || payload_len == 0 {
        return None;
    }
    frame.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len)
}
