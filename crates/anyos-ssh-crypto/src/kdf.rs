//! Key derivation (RFC 4253 §7.2)

use alloc::vec::Vec;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::cipher::{AES_IV_SIZE, AES_KEY_SIZE, CipherState, MAC_KEY_SIZE};
use crate::wire::write_mpint;

/// Derive a key using SSH key derivation function
/// K1 = HASH(K || H || letter || session_id)
/// Kn = HASH(K || H || K1 || ... || Kn-1)
///
/// `k` is the shared secret as a big-endian magnitude; it is hashed in its
/// mpint encoding.
pub fn derive_key(
    k: &[u8],
    h: &[u8],
    letter: u8,
    session_id: &[u8],
    size: usize,
) -> Zeroizing<Vec<u8>> {
    let mut k_mpint = Zeroizing::new(Vec::with_capacity(k.len() + 5));
    write_mpint(&mut k_mpint, k);

    let mut hasher = Sha256::new();
    hasher.update(k_mpint.as_slice());
    hasher.update(h);
    hasher.update([letter]);
    hasher.update(session_id);

    let mut result = Zeroizing::new(hasher.finalize().to_vec());

    while result.len() < size {
        let mut hasher = Sha256::new();
        hasher.update(k_mpint.as_slice());
        hasher.update(h);
        hasher.update(result.as_slice());
        result.extend_from_slice(&hasher.finalize());
    }

    result.truncate(size);
    result
}

/// IV, cipher key and MAC key for one direction
pub struct DirectionKeys {
    pub iv: Zeroizing<[u8; AES_IV_SIZE]>,
    pub key: Zeroizing<[u8; AES_KEY_SIZE]>,
    pub mac_key: Zeroizing<[u8; MAC_KEY_SIZE]>,
}

impl DirectionKeys {
    fn derive(k: &[u8], h: &[u8], session_id: &[u8], labels: [u8; 3]) -> Self {
        let [iv_label, key_label, mac_label] = labels;
        let mut keys = Self {
            iv: Zeroizing::new([0; AES_IV_SIZE]),
            key: Zeroizing::new([0; AES_KEY_SIZE]),
            mac_key: Zeroizing::new([0; MAC_KEY_SIZE]),
        };
        keys.iv
            .copy_from_slice(&derive_key(k, h, iv_label, session_id, AES_IV_SIZE));
        keys.key
            .copy_from_slice(&derive_key(k, h, key_label, session_id, AES_KEY_SIZE));
        keys.mac_key
            .copy_from_slice(&derive_key(k, h, mac_label, session_id, MAC_KEY_SIZE));
        keys
    }

    pub fn cipher_state(&self) -> CipherState {
        CipherState::new(&self.key, &self.iv, &self.mac_key)
    }
}

/// Both directions' keys, labels A-F
pub struct KeyMaterial {
    pub client_to_server: DirectionKeys,
    pub server_to_client: DirectionKeys,
}

impl KeyMaterial {
    pub fn derive(k: &[u8], h: &[u8], session_id: &[u8]) -> Self {
        Self {
            client_to_server: DirectionKeys::derive(k, h, session_id, [b'A', b'C', b'E']),
            server_to_client: DirectionKeys::derive(k, h, session_id, [b'B', b'D', b'F']),
        }
    }
}
