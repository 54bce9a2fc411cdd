//! SSH-2 protocol engine
//!
//! A [`Session`] owns one transport and speaks either side of the protocol:
//! version exchange, curve25519-sha256 key exchange with an
//! ecdsa-sha2-nistp256 host key, aes128-ctr + hmac-sha2-256 packets, password
//! authentication and a single session channel.
//!
//! Server flow:
//!
//! ```text
//! handshake -> server_auth -> accept_channel -> accept_shell -> forward -> disconnect
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod auth;
pub mod channel;
pub mod error;
pub mod kex;
pub mod msg;
pub mod packet;
pub mod session;
pub mod shell;
pub mod transport;
pub mod version;

#[cfg(test)]
mod testing;

pub use anyos_ssh_crypto::HostKey;
pub use auth::{AccessPolicy, AllowAll, AuthDecision, PasswordAuthenticator};
pub use channel::{Channel, ChannelState, PtyRequest, ShellCommand, ShellRequest};
pub use error::{Result, SshError};
pub use session::{Role, Session};
pub use shell::{ForwardEnd, ShellIo};
pub use transport::Transport;
