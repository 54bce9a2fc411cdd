//! ecdsa-sha2-nistp256 host keys (RFC 5656)

use alloc::vec::Vec;
use p256::FieldBytes;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::CryptoRngCore;
use zeroize::Zeroizing;

use crate::CryptoError;
use crate::wire::{read_mpint, read_string, write_mpint, write_string};

// ============================================================================
// Constants
// ============================================================================

pub const HOST_KEY_ALGORITHM: &str = "ecdsa-sha2-nistp256";
pub const CURVE_NAME: &str = "nistp256";
pub const PRIVATE_SCALAR_SIZE: usize = 32;
/// SEC1 uncompressed point: 0x04 || X || Y
pub const PUBLIC_POINT_SIZE: usize = 65;

// ============================================================================
// Host Key
// ============================================================================

/// Server host key. Read-only after startup and shared between sessions.
pub struct HostKey {
    signing_key: SigningKey,
    public_point: [u8; PUBLIC_POINT_SIZE],
}

impl HostKey {
    pub fn generate(rng: &mut impl CryptoRngCore) -> Self {
        Self::from_signing_key(SigningKey::random(rng))
    }

    /// Load from a 32-byte big-endian private scalar
    pub fn from_scalar(scalar: &[u8]) -> Result<Self, CryptoError> {
        if scalar.len() != PRIVATE_SCALAR_SIZE {
            return Err(CryptoError::InvalidKeyLength);
        }
        let signing_key = SigningKey::from_slice(scalar).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let mut public_point = [0u8; PUBLIC_POINT_SIZE];
        public_point.copy_from_slice(signing_key.verifying_key().to_encoded_point(false).as_bytes());
        Self {
            signing_key,
            public_point,
        }
    }

    pub fn to_scalar(&self) -> Zeroizing<[u8; PRIVATE_SCALAR_SIZE]> {
        Zeroizing::new(self.signing_key.to_bytes().into())
    }

    pub fn public_point(&self) -> &[u8; PUBLIC_POINT_SIZE] {
        &self.public_point
    }

    /// K_S: string algorithm, string curve, string Q
    pub fn public_blob(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(4 + 19 + 4 + 8 + 4 + PUBLIC_POINT_SIZE);
        write_string(&mut blob, HOST_KEY_ALGORITHM.as_bytes());
        write_string(&mut blob, CURVE_NAME.as_bytes());
        write_string(&mut blob, &self.public_point);
        blob
    }

    /// Sign `data` with ECDSA-SHA-256 and wrap it as an SSH signature blob:
    /// string algorithm, string (mpint r || mpint s)
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let signature: Signature = self
            .signing_key
            .try_sign(data)
            .map_err(|_| CryptoError::InvalidSignature)?;
        let (r, s) = signature.split_bytes();

        let mut inner = Vec::with_capacity(2 * (4 + 33));
        write_mpint(&mut inner, &r);
        write_mpint(&mut inner, &s);

        let mut blob = Vec::with_capacity(4 + 19 + 4 + inner.len());
        write_string(&mut blob, HOST_KEY_ALGORITHM.as_bytes());
        write_string(&mut blob, &inner);
        Ok(blob)
    }
}

// ============================================================================
// Verification
// ============================================================================

/// Parse a K_S blob into a verifying key
pub fn parse_public_blob(blob: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let mut offset = 0;
    let algorithm = read_string(blob, &mut offset).ok_or(CryptoError::InvalidPoint)?;
    let curve = read_string(blob, &mut offset).ok_or(CryptoError::InvalidPoint)?;
    if algorithm != HOST_KEY_ALGORITHM.as_bytes() || curve != CURVE_NAME.as_bytes() {
        return Err(CryptoError::UnsupportedAlgorithm);
    }
    let point = read_string(blob, &mut offset).ok_or(CryptoError::InvalidPoint)?;
    if point.len() != PUBLIC_POINT_SIZE || offset != blob.len() {
        return Err(CryptoError::InvalidPoint);
    }
    VerifyingKey::from_sec1_bytes(point).map_err(|_| CryptoError::InvalidPoint)
}

/// Verify an SSH signature blob over `data` against a K_S blob
pub fn verify_signature(
    host_key_blob: &[u8],
    data: &[u8],
    signature_blob: &[u8],
) -> Result<(), CryptoError> {
    let key = parse_public_blob(host_key_blob)?;

    let mut offset = 0;
    let algorithm = read_string(signature_blob, &mut offset).ok_or(CryptoError::InvalidSignature)?;
    if algorithm != HOST_KEY_ALGORITHM.as_bytes() {
        return Err(CryptoError::UnsupportedAlgorithm);
    }
    let inner = read_string(signature_blob, &mut offset).ok_or(CryptoError::InvalidSignature)?;

    let mut inner_offset = 0;
    let r = read_mpint(inner, &mut inner_offset).ok_or(CryptoError::InvalidSignature)?;
    let s = read_mpint(inner, &mut inner_offset).ok_or(CryptoError::InvalidSignature)?;
    if inner_offset != inner.len() {
        return Err(CryptoError::InvalidSignature);
    }

    let signature = Signature::from_scalars(scalar_bytes(r)?, scalar_bytes(s)?)
        .map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(data, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Left-pad an mpint magnitude to a field element
fn scalar_bytes(magnitude: &[u8]) -> Result<FieldBytes, CryptoError> {
    if magnitude.len() > PRIVATE_SCALAR_SIZE {
        return Err(CryptoError::InvalidSignature);
    }
    let mut bytes = [0u8; PRIVATE_SCALAR_SIZE];
    bytes[PRIVATE_SCALAR_SIZE - magnitude.len()..].copy_from_slice(magnitude);
    Ok(FieldBytes::clone_from_slice(&bytes))
}
