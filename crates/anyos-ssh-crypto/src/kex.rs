//! curve25519-sha256 (RFC 8731)

use alloc::vec::Vec;
use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use crate::CryptoError;
use crate::wire::{write_mpint, write_string};

pub const X25519_KEY_SIZE: usize = 32;
pub const EXCHANGE_HASH_SIZE: usize = 32;

/// RFC 7748 scalar clamping
pub fn clamp_scalar(scalar: &mut [u8; X25519_KEY_SIZE]) {
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
}

// ============================================================================
// Ephemeral Key
// ============================================================================

/// Per-exchange X25519 key pair. The scalar is wiped on drop.
pub struct EphemeralSecret {
    secret: StaticSecret,
    public: [u8; X25519_KEY_SIZE],
}

impl EphemeralSecret {
    pub fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; X25519_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Build from raw scalar bytes (clamped here)
    pub fn from_bytes(mut bytes: [u8; X25519_KEY_SIZE]) -> Self {
        clamp_scalar(&mut bytes);
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Q = X25519(s, 9)
    pub fn public_bytes(&self) -> &[u8; X25519_KEY_SIZE] {
        &self.public
    }

    /// K = X25519(s, peer). The peer value must be 32 bytes and the result
    /// must not be the all-zero point.
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let peer: [u8; X25519_KEY_SIZE] =
            peer_public.try_into().map_err(|_| CryptoError::InvalidPoint)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::ZeroSharedSecret);
        }
        Ok(SharedSecret(Zeroizing::new(shared.to_bytes())))
    }
}

/// Raw X25519 output, used as a big-endian magnitude in mpint form
pub struct SharedSecret(Zeroizing<[u8; X25519_KEY_SIZE]>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

// ============================================================================
// Exchange Hash
// ============================================================================

/// Inputs to H, in hashing order
pub struct ExchangeHash<'a> {
    pub client_version: &'a [u8],
    pub server_version: &'a [u8],
    pub client_kexinit: &'a [u8],
    pub server_kexinit: &'a [u8],
    pub host_key_blob: &'a [u8],
    pub client_public: &'a [u8],
    pub server_public: &'a [u8],
}

impl ExchangeHash<'_> {
    pub fn compute(&self, k: &SharedSecret) -> [u8; EXCHANGE_HASH_SIZE] {
        let mut hash_data = Zeroizing::new(Vec::new());
        write_string(&mut hash_data, self.client_version);
        write_string(&mut hash_data, self.server_version);
        write_string(&mut hash_data, self.client_kexinit);
        write_string(&mut hash_data, self.server_kexinit);
        write_string(&mut hash_data, self.host_key_blob);
        write_string(&mut hash_data, self.client_public);
        write_string(&mut hash_data, self.server_public);
        write_mpint(&mut hash_data, k.as_bytes());

        let mut hasher = Sha256::new();
        hasher.update(hash_data.as_slice());
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7748_vector() {
        // RFC 7748 §6.1
        let alice = hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
            .unwrap();
        let bob = hex::decode("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb")
            .unwrap();
        let alice = EphemeralSecret::from_bytes(alice.try_into().unwrap());
        let bob = EphemeralSecret::from_bytes(bob.try_into().unwrap());

        assert_eq!(
            hex::encode(alice.public_bytes()),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        let k1 = alice.shared_secret(bob.public_bytes()).unwrap();
        let k2 = bob.shared_secret(alice.public_bytes()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_eq!(
            hex::encode(k1.as_bytes()),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }

    #[test]
    fn test_clamp() {
        let mut s = [0xff; 32];
        clamp_scalar(&mut s);
        assert_eq!(s[0], 0xf8);
        assert_eq!(s[31], 0x7f);

        let mut s = [0x00; 32];
        clamp_scalar(&mut s);
        assert_eq!(s[0], 0x00);
        assert_eq!(s[31], 0x40);
    }

    #[test]
    fn test_low_order_peer_rejected() {
        let ours = EphemeralSecret::from_bytes([0x42; 32]);
        assert_eq!(
            ours.shared_secret(&[0u8; 32]).err(),
            Some(CryptoError::ZeroSharedSecret)
        );
        assert_eq!(
            ours.shared_secret(&[9u8; 31]).err(),
            Some(CryptoError::InvalidPoint)
        );
    }

    #[test]
    fn test_exchange_hash_field_order() {
        let k = EphemeralSecret::from_bytes([1; 32])
            .shared_secret(EphemeralSecret::from_bytes([2; 32]).public_bytes())
            .unwrap();
        let inputs = ExchangeHash {
            client_version: b"SSH-2.0-c",
            server_version: b"SSH-2.0-s",
            client_kexinit: b"\x14ic",
            server_kexinit: b"\x14is",
            host_key_blob: b"blob",
            client_public: &[3; 32],
            server_public: &[4; 32],
        };

        let fields: [&[u8]; 7] = [
            b"SSH-2.0-c",
            b"SSH-2.0-s",
            b"\x14ic",
            b"\x14is",
            b"blob",
            &[3; 32],
            &[4; 32],
        ];
        let mut manual = Vec::new();
        for field in fields {
            write_string(&mut manual, field);
        }
        write_mpint(&mut manual, k.as_bytes());
        let expected: [u8; 32] = Sha256::digest(&manual).into();

        assert_eq!(inputs.compute(&k), expected);

        let swapped = ExchangeHash {
            client_version: b"SSH-2.0-s",
            server_version: b"SSH-2.0-c",
            ..inputs
        };
        assert_ne!(swapped.compute(&k), expected);
    }
}
