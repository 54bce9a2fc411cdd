//! Protocol version exchange (RFC 4253 section 4.2)

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Result, SshError};
use crate::packet::PacketStream;
use crate::transport::Transport;

pub const SERVER_VERSION: &str = "SSH-2.0-anyOS_sshd_1.0";
pub const CLIENT_VERSION: &str = "SSH-2.0-anyOS_1.0";

/// Longest identification line, CR LF excluded
pub const MAX_VERSION_LENGTH: usize = 255;

/// Accept SSH-2.0 and the SSH-1.99 compatibility form, printable ASCII only
pub fn validate_version(line: &[u8]) -> Result<()> {
    if line.len() > MAX_VERSION_LENGTH {
        return Err(SshError::Protocol);
    }
    if !(line.starts_with(b"SSH-2.0-") || line.starts_with(b"SSH-1.99-")) {
        return Err(SshError::Protocol);
    }
    if !line.iter().all(|&b| (0x20..=0x7e).contains(&b)) {
        return Err(SshError::Protocol);
    }
    Ok(())
}

pub(crate) async fn send_version<T: Transport>(
    stream: &mut PacketStream<T>,
    version: &str,
) -> Result<()> {
    let mut line = Vec::with_capacity(version.len() + 2);
    line.extend_from_slice(version.as_bytes());
    line.extend_from_slice(b"\r\n");
    stream.write_raw(&line).await
}

/// Read the peer's identification line, without its line terminator
pub(crate) async fn recv_version<T: Transport>(stream: &mut PacketStream<T>) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_raw_byte().await?;
        if byte == b'\n' {
            break;
        }
        // Room for a trailing CR
        if line.len() > MAX_VERSION_LENGTH {
            log::warn!("[SSH] Peer identification line too long");
            return Err(SshError::Protocol);
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    validate_version(&line)?;
    String::from_utf8(line).map_err(|_| SshError::Protocol)
}
