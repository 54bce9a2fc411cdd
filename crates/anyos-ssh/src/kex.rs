//! KEXINIT negotiation and the curve25519-sha256 exchange
//!
//! The message-level pieces here are pure functions over byte buffers; the
//! session drives them and owns the packet stream.

use alloc::vec::Vec;

use anyos_ssh_crypto::hostkey::{HOST_KEY_ALGORITHM, verify_signature};
use anyos_ssh_crypto::kex::{EXCHANGE_HASH_SIZE, X25519_KEY_SIZE};
use anyos_ssh_crypto::wire::{read_bool, read_byte, read_namelist, read_string, read_u32, write_bool, write_namelist, write_string, write_u32};
use anyos_ssh_crypto::{EphemeralSecret, ExchangeHash, HostKey, SharedSecret};

use crate::error::{Result, SshError};
use crate::msg::{SSH_MSG_KEX_ECDH_INIT, SSH_MSG_KEX_ECDH_REPLY, SSH_MSG_KEXINIT};

// ============================================================================
// Algorithms
// ============================================================================

pub const KEX_ALGORITHMS: &[&str] = &["curve25519-sha256", "curve25519-sha256@libssh.org"];
pub const HOST_KEY_ALGORITHMS: &[&str] = &[HOST_KEY_ALGORITHM];
pub const CIPHER_ALGORITHMS: &[&str] = &["aes128-ctr"];
pub const MAC_ALGORITHMS: &[&str] = &["hmac-sha2-256"];
pub const COMPRESSION_ALGORITHMS: &[&str] = &["none"];

pub const COOKIE_SIZE: usize = 16;

/// Algorithms agreed for one key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub kex: &'static str,
    pub host_key: &'static str,
    pub cipher_c2s: &'static str,
    pub cipher_s2c: &'static str,
    pub mac_c2s: &'static str,
    pub mac_s2c: &'static str,
    pub compression_c2s: &'static str,
    pub compression_s2c: &'static str,
}

// ============================================================================
// KEXINIT
// ============================================================================

/// Build our KEXINIT payload. Kept verbatim for the exchange hash.
pub fn build_kexinit(cookie: &[u8; COOKIE_SIZE]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(192);
    payload.push(SSH_MSG_KEXINIT);
    payload.extend_from_slice(cookie);
    write_namelist(&mut payload, KEX_ALGORITHMS);
    write_namelist(&mut payload, HOST_KEY_ALGORITHMS);
    write_namelist(&mut payload, CIPHER_ALGORITHMS);
    write_namelist(&mut payload, CIPHER_ALGORITHMS);
    write_namelist(&mut payload, MAC_ALGORITHMS);
    write_namelist(&mut payload, MAC_ALGORITHMS);
    write_namelist(&mut payload, COMPRESSION_ALGORITHMS);
    write_namelist(&mut payload, COMPRESSION_ALGORITHMS);
    write_namelist(&mut payload, &[]);
    write_namelist(&mut payload, &[]);
    write_bool(&mut payload, false);
    write_u32(&mut payload, 0);
    payload
}

/// A parsed KEXINIT, borrowing names from the payload
#[derive(Debug)]
pub struct KexInit<'a> {
    pub kex: Vec<&'a str>,
    pub host_key: Vec<&'a str>,
    pub cipher_c2s: Vec<&'a str>,
    pub cipher_s2c: Vec<&'a str>,
    pub mac_c2s: Vec<&'a str>,
    pub mac_s2c: Vec<&'a str>,
    pub compression_c2s: Vec<&'a str>,
    pub compression_s2c: Vec<&'a str>,
    pub first_kex_packet_follows: bool,
}

impl<'a> KexInit<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        Self::parse_fields(payload).ok_or(SshError::Protocol)
    }

    fn parse_fields(payload: &'a [u8]) -> Option<Self> {
        let mut offset = 0;
        if read_byte(payload, &mut offset)? != SSH_MSG_KEXINIT {
            return None;
        }
        payload.get(offset..offset + COOKIE_SIZE)?;
        offset += COOKIE_SIZE;

        let kex = read_namelist(payload, &mut offset)?;
        let host_key = read_namelist(payload, &mut offset)?;
        let cipher_c2s = read_namelist(payload, &mut offset)?;
        let cipher_s2c = read_namelist(payload, &mut offset)?;
        let mac_c2s = read_namelist(payload, &mut offset)?;
        let mac_s2c = read_namelist(payload, &mut offset)?;
        let compression_c2s = read_namelist(payload, &mut offset)?;
        let compression_s2c = read_namelist(payload, &mut offset)?;
        read_namelist(payload, &mut offset)?;
        read_namelist(payload, &mut offset)?;
        let first_kex_packet_follows = read_bool(payload, &mut offset)?;
        read_u32(payload, &mut offset)?;

        Some(Self {
            kex,
            host_key,
            cipher_c2s,
            cipher_s2c,
            mac_c2s,
            mac_s2c,
            compression_c2s,
            compression_s2c,
            first_kex_packet_follows,
        })
    }

    /// Whether this side's guessed kex and host key algorithms were right
    pub fn guess_matches(&self, negotiated: &Negotiated) -> bool {
        self.kex.first() == Some(&negotiated.kex)
            && self.host_key.first() == Some(&negotiated.host_key)
    }
}

/// First client algorithm the server also lists, mapped onto our own table
fn choose(client: &[&str], server: &[&str], ours: &'static [&'static str]) -> Result<&'static str> {
    let chosen = client
        .iter()
        .find(|name| server.contains(*name))
        .ok_or(SshError::Kex)?;
    ours.iter()
        .find(|name| *name == chosen)
        .copied()
        .ok_or(SshError::Kex)
}

pub fn negotiate(client: &KexInit<'_>, server: &KexInit<'_>) -> Result<Negotiated> {
    let negotiated = Negotiated {
        kex: choose(&client.kex, &server.kex, KEX_ALGORITHMS)?,
        host_key: choose(&client.host_key, &server.host_key, HOST_KEY_ALGORITHMS)?,
        cipher_c2s: choose(&client.cipher_c2s, &server.cipher_c2s, CIPHER_ALGORITHMS)?,
        cipher_s2c: choose(&client.cipher_s2c, &server.cipher_s2c, CIPHER_ALGORITHMS)?,
        mac_c2s: choose(&client.mac_c2s, &server.mac_c2s, MAC_ALGORITHMS)?,
        mac_s2c: choose(&client.mac_s2c, &server.mac_s2c, MAC_ALGORITHMS)?,
        compression_c2s: choose(
            &client.compression_c2s,
            &server.compression_c2s,
            COMPRESSION_ALGORITHMS,
        )?,
        compression_s2c: choose(
            &client.compression_s2c,
            &server.compression_s2c,
            COMPRESSION_ALGORITHMS,
        )?,
    };
    Ok(negotiated)
}

// ============================================================================
// ECDH
// ============================================================================

/// Identification strings and KEXINIT payloads hashed into H
pub struct KexTranscript<'a> {
    pub client_version: &'a [u8],
    pub server_version: &'a [u8],
    pub client_kexinit: &'a [u8],
    pub server_kexinit: &'a [u8],
}

pub struct KexOutput {
    pub shared_secret: SharedSecret,
    pub exchange_hash: [u8; EXCHANGE_HASH_SIZE],
}

pub fn build_ecdh_init(ephemeral: &EphemeralSecret) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 4 + X25519_KEY_SIZE);
    payload.push(SSH_MSG_KEX_ECDH_INIT);
    write_string(&mut payload, ephemeral.public_bytes());
    payload
}

/// Q_C from a KEX_ECDH_INIT payload
pub fn parse_ecdh_init(payload: &[u8]) -> Result<&[u8]> {
    let mut offset = 0;
    if read_byte(payload, &mut offset) != Some(SSH_MSG_KEX_ECDH_INIT) {
        return Err(SshError::Protocol);
    }
    let q_c = read_string(payload, &mut offset).ok_or(SshError::Protocol)?;
    if q_c.len() != X25519_KEY_SIZE {
        log::warn!("[SSH] Client ephemeral key has {} bytes", q_c.len());
        return Err(SshError::Kex);
    }
    Ok(q_c)
}

/// Server half: compute K and H, sign H, and build KEX_ECDH_REPLY
pub fn server_ecdh_reply(
    host_key: &HostKey,
    ephemeral: &EphemeralSecret,
    transcript: &KexTranscript<'_>,
    client_public: &[u8],
) -> Result<(Vec<u8>, KexOutput)> {
    if client_public.len() != X25519_KEY_SIZE {
        return Err(SshError::Kex);
    }
    let shared_secret = ephemeral.shared_secret(client_public)?;
    let host_key_blob = host_key.public_blob();

    let exchange_hash = ExchangeHash {
        client_version: transcript.client_version,
        server_version: transcript.server_version,
        client_kexinit: transcript.client_kexinit,
        server_kexinit: transcript.server_kexinit,
        host_key_blob: &host_key_blob,
        client_public,
        server_public: ephemeral.public_bytes(),
    }
    .compute(&shared_secret);
    let signature = host_key.sign(&exchange_hash)?;

    let mut reply = Vec::with_capacity(1 + 4 + host_key_blob.len() + 4 + X25519_KEY_SIZE + 4 + signature.len());
    reply.push(SSH_MSG_KEX_ECDH_REPLY);
    write_string(&mut reply, &host_key_blob);
    write_string(&mut reply, ephemeral.public_bytes());
    write_string(&mut reply, &signature);

    Ok((
        reply,
        KexOutput {
            shared_secret,
            exchange_hash,
        },
    ))
}

/// Client half: check the server's signature over H. Returns the output and
/// the server's host key blob.
pub fn client_verify_reply(
    ephemeral: &EphemeralSecret,
    transcript: &KexTranscript<'_>,
    reply: &[u8],
) -> Result<(KexOutput, Vec<u8>)> {
    let mut offset = 0;
    if read_byte(reply, &mut offset) != Some(SSH_MSG_KEX_ECDH_REPLY) {
        return Err(SshError::Protocol);
    }
    let host_key_blob = read_string(reply, &mut offset).ok_or(SshError::Protocol)?;
    let server_public = read_string(reply, &mut offset).ok_or(SshError::Protocol)?;
    let signature = read_string(reply, &mut offset).ok_or(SshError::Protocol)?;
    if server_public.len() != X25519_KEY_SIZE {
        log::warn!("[SSH] Server ephemeral key has {} bytes", server_public.len());
        return Err(SshError::Kex);
    }

    let shared_secret = ephemeral.shared_secret(server_public)?;
    let exchange_hash = ExchangeHash {
        client_version: transcript.client_version,
        server_version: transcript.server_version,
        client_kexinit: transcript.client_kexinit,
        server_kexinit: transcript.server_kexinit,
        host_key_blob,
        client_public: ephemeral.public_bytes(),
        server_public,
    }
    .compute(&shared_secret);

    if verify_signature(host_key_blob, &exchange_hash, signature).is_err() {
        log::warn!("[SSH] Host key signature did not verify");
        return Err(SshError::Kex);
    }

    Ok((
        KexOutput {
            shared_secret,
            exchange_hash,
        },
        host_key_blob.to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyos_ssh_crypto::KeyMaterial;

    const V_C: &[u8] = b"SSH-2.0-anyOS_1.0";
    const V_S: &[u8] = b"SSH-2.0-anyOS_sshd_1.0";

    fn fixed_host_key() -> HostKey {
        let scalar: Vec<u8> = (1..=32).collect();
        HostKey::from_scalar(&scalar).unwrap()
    }

    fn kexinit_with(kex: &[&str], cipher: &[&str], follows: bool) -> Vec<u8> {
        let mut payload = alloc::vec![SSH_MSG_KEXINIT];
        payload.extend_from_slice(&[0x33; COOKIE_SIZE]);
        write_namelist(&mut payload, kex);
        write_namelist(&mut payload, HOST_KEY_ALGORITHMS);
        write_namelist(&mut payload, cipher);
        write_namelist(&mut payload, cipher);
        write_namelist(&mut payload, MAC_ALGORITHMS);
        write_namelist(&mut payload, MAC_ALGORITHMS);
        write_namelist(&mut payload, COMPRESSION_ALGORITHMS);
        write_namelist(&mut payload, COMPRESSION_ALGORITHMS);
        write_namelist(&mut payload, &[]);
        write_namelist(&mut payload, &[]);
        write_bool(&mut payload, follows);
        write_u32(&mut payload, 0);
        payload
    }

    #[test]
    fn test_kexinit_layout() {
        let payload = build_kexinit(&[0x11; COOKIE_SIZE]);
        assert_eq!(payload.len(), 181);
        assert_eq!(payload[0], SSH_MSG_KEXINIT);
        assert_eq!(&payload[1..17], &[0x11; 16]);
        assert_eq!(&payload[payload.len() - 5..], &[0, 0, 0, 0, 0]);

        let parsed = KexInit::parse(&payload).unwrap();
        assert_eq!(parsed.kex, KEX_ALGORITHMS);
        assert_eq!(parsed.host_key, ["ecdsa-sha2-nistp256"]);
        assert!(!parsed.first_kex_packet_follows);
    }

    #[test]
    fn test_truncated_kexinit_rejected() {
        let payload = build_kexinit(&[0; COOKIE_SIZE]);
        assert!(KexInit::parse(&payload[..payload.len() - 1]).is_err());
        assert!(KexInit::parse(&payload[..10]).is_err());
    }

    #[test]
    fn test_negotiation_prefers_client_order() {
        let client_bytes = kexinit_with(
            &["sntrup761x25519-sha512", "curve25519-sha256@libssh.org", "curve25519-sha256"],
            &["chacha20-poly1305@openssh.com", "aes128-ctr"],
            false,
        );
        let server_bytes = build_kexinit(&[0x22; COOKIE_SIZE]);
        let client = KexInit::parse(&client_bytes).unwrap();
        let server = KexInit::parse(&server_bytes).unwrap();

        let negotiated = negotiate(&client, &server).unwrap();
        assert_eq!(negotiated.kex, "curve25519-sha256@libssh.org");
        assert_eq!(negotiated.cipher_c2s, "aes128-ctr");
        assert_eq!(negotiated.mac_s2c, "hmac-sha2-256");
        assert!(!client.guess_matches(&negotiated));
    }

    #[test]
    fn test_negotiation_fails_without_common_cipher() {
        let client_bytes = kexinit_with(KEX_ALGORITHMS, &["aes256-gcm@openssh.com"], true);
        let server_bytes = build_kexinit(&[0x22; COOKIE_SIZE]);
        let client = KexInit::parse(&client_bytes).unwrap();
        assert!(client.first_kex_packet_follows);
        let server = KexInit::parse(&server_bytes).unwrap();
        assert_eq!(negotiate(&client, &server), Err(SshError::Kex));
    }

    #[test]
    fn test_short_client_point_rejected() {
        let mut payload = alloc::vec![SSH_MSG_KEX_ECDH_INIT];
        write_string(&mut payload, &[9; 31]);
        assert_eq!(parse_ecdh_init(&payload), Err(SshError::Kex));
    }

    fn scalar(hex_str: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut out).unwrap();
        out
    }

    /// Both halves with the RFC 7748 §6.1 scalars. The exchange hash and keys
    /// against OpenSSH are checked in tests/openssh_kex.rs.
    #[test]
    fn test_exchange_with_rfc7748_scalars() {
        let client = EphemeralSecret::from_bytes(scalar(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let server = EphemeralSecret::from_bytes(scalar(
            "5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb",
        ));
        assert_eq!(
            hex::encode(client.public_bytes()),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );
        assert_eq!(
            hex::encode(server.public_bytes()),
            "de9edb7d7b7dc1b4d35b61c2ece435373f8343c85b78674dadfc7e146f882b4f"
        );

        let i_c = build_kexinit(&[0x11; COOKIE_SIZE]);
        let i_s = build_kexinit(&[0x22; COOKIE_SIZE]);
        let transcript = KexTranscript {
            client_version: V_C,
            server_version: V_S,
            client_kexinit: &i_c,
            server_kexinit: &i_s,
        };
        let init = build_ecdh_init(&client);
        let q_c = parse_ecdh_init(&init).unwrap();
        let host_key = fixed_host_key();
        let (reply, server_out) = server_ecdh_reply(&host_key, &server, &transcript, q_c).unwrap();
        assert_eq!(
            hex::encode(server_out.shared_secret.as_bytes()),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );

        let (client_out, blob) = client_verify_reply(&client, &transcript, &reply).unwrap();
        assert_eq!(client_out.shared_secret.as_bytes(), server_out.shared_secret.as_bytes());
        assert_eq!(client_out.exchange_hash, server_out.exchange_hash);
        assert_eq!(blob, host_key.public_blob());

        let h = server_out.exchange_hash;
        let server_keys = KeyMaterial::derive(server_out.shared_secret.as_bytes(), &h, &h);
        let client_keys = KeyMaterial::derive(client_out.shared_secret.as_bytes(), &h, &h);
        assert_eq!(*server_keys.client_to_server.key, *client_keys.client_to_server.key);
        assert_eq!(*server_keys.server_to_client.mac_key, *client_keys.server_to_client.mac_key);
        assert_ne!(*server_keys.client_to_server.key, *server_keys.server_to_client.key);
    }

    #[test]
    fn test_client_rejects_tampered_signature() {
        let i_c = build_kexinit(&[0x11; COOKIE_SIZE]);
        let i_s = build_kexinit(&[0x22; COOKIE_SIZE]);
        let client = EphemeralSecret::from_bytes([0x41; 32]);
        let server = EphemeralSecret::from_bytes([0x52; 32]);
        let transcript = KexTranscript {
            client_version: V_C,
            server_version: V_S,
            client_kexinit: &i_c,
            server_kexinit: &i_s,
        };
        let (mut reply, _) =
            server_ecdh_reply(&fixed_host_key(), &server, &transcript, client.public_bytes()).unwrap();
        let last = reply.len() - 1;
        reply[last] ^= 0x01;
        assert!(matches!(
            client_verify_reply(&client, &transcript, &reply),
            Err(SshError::Kex)
        ));
    }
}
