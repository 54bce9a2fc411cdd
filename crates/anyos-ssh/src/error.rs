//! Engine error kinds

use core::fmt;

use anyos_ssh_crypto::CryptoError;
use embedded_io_async::ErrorKind;

use crate::msg::{
    SSH_DISCONNECT_KEY_EXCHANGE_FAILED, SSH_DISCONNECT_MAC_ERROR,
    SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE, SSH_DISCONNECT_PROTOCOL_ERROR,
};

pub type Result<T> = core::result::Result<T, SshError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshError {
    /// Transport read/write failed, the peer closed, or a deadline expired
    Io(ErrorKind),
    /// Malformed framing, wrong message for the current state, bad length
    Protocol,
    /// HMAC verification failed
    Mac,
    /// Algorithm negotiation, shared secret or host signature failed
    Kex,
    /// Authentication attempts exhausted, or the server refused us
    Auth,
    /// A packet buffer could not be allocated
    Alloc,
    /// The peer sent SSH_MSG_DISCONNECT
    PeerDisconnected { reason: u32 },
}

impl SshError {
    /// Reason code to send in SSH_MSG_DISCONNECT, if one should be sent
    pub fn disconnect_reason(&self) -> Option<u32> {
        match self {
            SshError::Io(_) | SshError::PeerDisconnected { .. } => None,
            SshError::Protocol | SshError::Alloc => Some(SSH_DISCONNECT_PROTOCOL_ERROR),
            SshError::Mac => Some(SSH_DISCONNECT_MAC_ERROR),
            SshError::Kex => Some(SSH_DISCONNECT_KEY_EXCHANGE_FAILED),
            SshError::Auth => Some(SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE),
        }
    }

    /// Whether the session can continue after this error
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SshError::Auth)
    }
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshError::Io(kind) => write!(f, "transport error ({:?})", kind),
            SshError::Protocol => write!(f, "protocol error"),
            SshError::Mac => write!(f, "MAC verification failed"),
            SshError::Kex => write!(f, "key exchange failed"),
            SshError::Auth => write!(f, "authentication failed"),
            SshError::Alloc => write!(f, "packet allocation failed"),
            SshError::PeerDisconnected { reason } => {
                write!(f, "peer disconnected (reason {})", reason)
            }
        }
    }
}

impl From<CryptoError> for SshError {
    fn from(_: CryptoError) -> Self {
        SshError::Kex
    }
}

impl<E: embedded_io_async::Error> From<embedded_io_async::ReadExactError<E>> for SshError {
    fn from(err: embedded_io_async::ReadExactError<E>) -> Self {
        match err {
            embedded_io_async::ReadExactError::UnexpectedEof => {
                SshError::Io(ErrorKind::ConnectionAborted)
            }
            embedded_io_async::ReadExactError::Other(e) => SshError::Io(e.kind()),
        }
    }
}

/// Map a transport error into `SshError::Io`
pub(crate) fn io_error<E: embedded_io_async::Error>(err: E) -> SshError {
    SshError::Io(err.kind())
}
