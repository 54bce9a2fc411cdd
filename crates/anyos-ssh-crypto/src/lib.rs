//! SSH-2 cryptographic primitives
//!
//! Building blocks shared by the protocol engine:
//! - Wire encoding (uint32, string, name-list, mpint)
//! - Binary packet framing and padding
//! - AES-128-CTR / HMAC-SHA-256 direction state
//! - RFC 4253 key derivation
//! - curve25519-sha256 ephemeral exchange and exchange hash
//! - ecdsa-sha2-nistp256 host keys

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cipher;
pub mod hostkey;
pub mod kdf;
pub mod kex;
pub mod packet;
pub mod wire;

use core::fmt;

pub use cipher::CipherState;
pub use hostkey::HostKey;
pub use kdf::{DirectionKeys, KeyMaterial};
pub use kex::{EphemeralSecret, ExchangeHash, SharedSecret};

/// Errors raised by the primitives in this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// A key or IV had the wrong length
    InvalidKeyLength,
    /// A public point could not be decoded
    InvalidPoint,
    /// X25519 produced the all-zero shared secret
    ZeroSharedSecret,
    /// A signature blob was malformed or did not verify
    InvalidSignature,
    /// A host-key blob named an unsupported algorithm or curve
    UnsupportedAlgorithm,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::InvalidKeyLength => write!(f, "invalid key length"),
            CryptoError::InvalidPoint => write!(f, "invalid public point"),
            CryptoError::ZeroSharedSecret => write!(f, "shared secret is zero"),
            CryptoError::InvalidSignature => write!(f, "invalid signature"),
            CryptoError::UnsupportedAlgorithm => write!(f, "unsupported algorithm"),
        }
    }
}
