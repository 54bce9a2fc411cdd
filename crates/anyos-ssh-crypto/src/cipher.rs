//! aes128-ctr / hmac-sha2-256 direction state

use aes::Aes128;
use ctr::Ctr128BE;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::CryptoError;

// ============================================================================
// Constants
// ============================================================================

pub const AES_KEY_SIZE: usize = 16;
pub const AES_IV_SIZE: usize = 16;
pub const MAC_KEY_SIZE: usize = 32;
pub const MAC_SIZE: usize = 32;
pub const CIPHER_BLOCK_SIZE: usize = 16;

// ============================================================================
// Type Aliases
// ============================================================================

pub type Aes128Ctr = Ctr128BE<Aes128>;
pub type HmacSha256 = Hmac<Sha256>;

// ============================================================================
// Cipher State
// ============================================================================

/// Keys for one direction of an encrypted transport.
///
/// The CTR keystream position carries across packets. The MAC key is wiped
/// on drop; the AES key schedule is wiped by the `zeroize` features of
/// `aes`/`ctr`.
pub struct CipherState {
    cipher: Aes128Ctr,
    mac_key: Zeroizing<[u8; MAC_KEY_SIZE]>,
}

impl CipherState {
    pub fn new(
        key: &[u8; AES_KEY_SIZE],
        iv: &[u8; AES_IV_SIZE],
        mac_key: &[u8; MAC_KEY_SIZE],
    ) -> Self {
        Self {
            cipher: Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv)),
            mac_key: Zeroizing::new(*mac_key),
        }
    }

    /// Encrypt or decrypt in place
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }

    /// Number of keystream bytes consumed since the keys were installed
    pub fn keystream_position(&self) -> u64 {
        self.cipher.current_pos()
    }

    /// MAC(key, u32be(seq) || frame)
    pub fn compute_mac(&self, seq: u32, frame: &[u8]) -> Result<[u8; MAC_SIZE], CryptoError> {
        let mac = self.keyed_mac(seq, frame)?;
        Ok(mac.finalize().into_bytes().into())
    }

    /// Constant-time check of a received tag
    pub fn verify_mac(&self, seq: u32, frame: &[u8], tag: &[u8]) -> bool {
        match self.keyed_mac(seq, frame) {
            Ok(mac) => mac.verify_slice(tag).is_ok(),
            Err(_) => false,
        }
    }

    fn keyed_mac(&self, seq: u32, frame: &[u8]) -> Result<HmacSha256, CryptoError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.mac_key.as_slice())
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        mac.update(&seq.to_be_bytes());
        mac.update(frame);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CipherState {
        CipherState::new(&[0x2b; 16], &[0xf0; 16], &[0x0b; 32])
    }

    #[test]
    fn test_ctr_roundtrip_and_counter_advance() {
        let plain: Vec<u8> = (0..100u8).collect();
        let mut enc = state();
        let mut dec = state();

        let mut buf = plain.clone();
        enc.apply_keystream(&mut buf);
        assert_ne!(buf, plain);
        dec.apply_keystream(&mut buf);
        assert_eq!(buf, plain);

        // 100 bytes span seven blocks; the next call starts in block seven
        assert_eq!(enc.keystream_position(), 100);
        assert_eq!(enc.keystream_position().div_ceil(16), 7);
    }

    #[test]
    fn test_ctr_independent_of_message_boundaries() {
        let data = [0x5au8; 80];

        let mut whole = data;
        state().apply_keystream(&mut whole);

        let mut split = data;
        let mut s = state();
        let (a, rest) = split.split_at_mut(16);
        let (b, c) = rest.split_at_mut(48);
        s.apply_keystream(a);
        s.apply_keystream(b);
        s.apply_keystream(c);

        assert_eq!(whole, split);
        assert_eq!(s.keystream_position(), 80);
    }

    #[test]
    fn test_aes128_ctr_known_answer() {
        // NIST SP 800-38A F.5.1, first block
        let key = hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap();
        let iv = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").unwrap();
        let mut s = CipherState::new(
            key.as_slice().try_into().unwrap(),
            iv.as_slice().try_into().unwrap(),
            &[0; 32],
        );
        let mut block = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        s.apply_keystream(&mut block);
        assert_eq!(hex::encode(block), "874d6191b620e3261bef6864990db6ce");
    }

    #[test]
    fn test_mac_binds_sequence_number() {
        let s = state();
        let frame = b"\x00\x00\x00\x0c\x0a\x05 padding!";
        let tag = s.compute_mac(7, frame).unwrap();
        assert!(s.verify_mac(7, frame, &tag));
        assert!(!s.verify_mac(8, frame, &tag));

        let mut tampered = frame.to_vec();
        tampered[5] ^= 1;
        assert!(!s.verify_mac(7, &tampered, &tag));
        assert!(!s.verify_mac(7, frame, &tag[..31]));
    }

    #[test]
    fn test_hmac_sha256_known_answer() {
        // RFC 4231 test case 2, with the sequence number as the first four bytes
        let s = CipherState::new(&[0; 16], &[0; 16], &{
            let mut k = [0u8; 32];
            k[..4].copy_from_slice(b"Jefe");
            k
        });
        // A 32-byte zero-padded key is equivalent to the 4-byte key for HMAC
        let seq = u32::from_be_bytes(*b"what");
        let tag = s.compute_mac(seq, b" do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
