//! SSH message numbers and reason codes

// ============================================================================
// SSH Message Types
// ============================================================================

// Transport layer (RFC 4253)
pub const SSH_MSG_DISCONNECT: u8 = 1;
pub const SSH_MSG_IGNORE: u8 = 2;
pub const SSH_MSG_UNIMPLEMENTED: u8 = 3;
pub const SSH_MSG_DEBUG: u8 = 4;
pub const SSH_MSG_SERVICE_REQUEST: u8 = 5;
pub const SSH_MSG_SERVICE_ACCEPT: u8 = 6;
pub const SSH_MSG_KEXINIT: u8 = 20;
pub const SSH_MSG_NEWKEYS: u8 = 21;
pub const SSH_MSG_KEX_ECDH_INIT: u8 = 30;
pub const SSH_MSG_KEX_ECDH_REPLY: u8 = 31;

// User authentication (RFC 4252)
pub const SSH_MSG_USERAUTH_REQUEST: u8 = 50;
pub const SSH_MSG_USERAUTH_FAILURE: u8 = 51;
pub const SSH_MSG_USERAUTH_SUCCESS: u8 = 52;
pub const SSH_MSG_USERAUTH_BANNER: u8 = 53;
pub const SSH_MSG_USERAUTH_PASSWD_CHANGEREQ: u8 = 60;

// Connection protocol (RFC 4254)
pub const SSH_MSG_GLOBAL_REQUEST: u8 = 80;
pub const SSH_MSG_REQUEST_SUCCESS: u8 = 81;
pub const SSH_MSG_REQUEST_FAILURE: u8 = 82;
pub const SSH_MSG_CHANNEL_OPEN: u8 = 90;
pub const SSH_MSG_CHANNEL_OPEN_CONFIRMATION: u8 = 91;
pub const SSH_MSG_CHANNEL_OPEN_FAILURE: u8 = 92;
pub const SSH_MSG_CHANNEL_WINDOW_ADJUST: u8 = 93;
pub const SSH_MSG_CHANNEL_DATA: u8 = 94;
pub const SSH_MSG_CHANNEL_EXTENDED_DATA: u8 = 95;
pub const SSH_MSG_CHANNEL_EOF: u8 = 96;
pub const SSH_MSG_CHANNEL_CLOSE: u8 = 97;
pub const SSH_MSG_CHANNEL_REQUEST: u8 = 98;
pub const SSH_MSG_CHANNEL_SUCCESS: u8 = 99;
pub const SSH_MSG_CHANNEL_FAILURE: u8 = 100;

// ============================================================================
// Disconnect Reasons
// ============================================================================

pub const SSH_DISCONNECT_PROTOCOL_ERROR: u32 = 2;
pub const SSH_DISCONNECT_KEY_EXCHANGE_FAILED: u32 = 3;
pub const SSH_DISCONNECT_MAC_ERROR: u32 = 5;
pub const SSH_DISCONNECT_SERVICE_NOT_AVAILABLE: u32 = 7;
pub const SSH_DISCONNECT_BY_APPLICATION: u32 = 11;
pub const SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;

// ============================================================================
// Channel Open Failure Reasons
// ============================================================================

pub const SSH_OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;
pub const SSH_OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;

/// Message numbers this engine understands in some state.
/// Anything else is answered with SSH_MSG_UNIMPLEMENTED.
pub fn is_known(msg_type: u8) -> bool {
    matches!(
        msg_type,
        SSH_MSG_DISCONNECT..=SSH_MSG_SERVICE_ACCEPT
            | SSH_MSG_KEXINIT
            | SSH_MSG_NEWKEYS
            | SSH_MSG_KEX_ECDH_INIT
            | SSH_MSG_KEX_ECDH_REPLY
            | SSH_MSG_USERAUTH_REQUEST..=SSH_MSG_USERAUTH_BANNER
            | SSH_MSG_USERAUTH_PASSWD_CHANGEREQ
            | SSH_MSG_GLOBAL_REQUEST..=SSH_MSG_REQUEST_FAILURE
            | SSH_MSG_CHANNEL_OPEN..=SSH_MSG_CHANNEL_FAILURE
    )
}

/// Short name for log lines
pub fn name(msg_type: u8) -> &'static str {
    match msg_type {
        SSH_MSG_DISCONNECT => "DISCONNECT",
        SSH_MSG_IGNORE => "IGNORE",
        SSH_MSG_UNIMPLEMENTED => "UNIMPLEMENTED",
        SSH_MSG_DEBUG => "DEBUG",
        SSH_MSG_SERVICE_REQUEST => "SERVICE_REQUEST",
        SSH_MSG_SERVICE_ACCEPT => "SERVICE_ACCEPT",
        SSH_MSG_KEXINIT => "KEXINIT",
        SSH_MSG_NEWKEYS => "NEWKEYS",
        SSH_MSG_KEX_ECDH_INIT => "KEX_ECDH_INIT",
        SSH_MSG_KEX_ECDH_REPLY => "KEX_ECDH_REPLY",
        SSH_MSG_USERAUTH_REQUEST => "USERAUTH_REQUEST",
        SSH_MSG_USERAUTH_FAILURE => "USERAUTH_FAILURE",
        SSH_MSG_USERAUTH_SUCCESS => "USERAUTH_SUCCESS",
        SSH_MSG_USERAUTH_BANNER => "USERAUTH_BANNER",
        SSH_MSG_GLOBAL_REQUEST => "GLOBAL_REQUEST",
        SSH_MSG_CHANNEL_OPEN => "CHANNEL_OPEN",
        SSH_MSG_CHANNEL_OPEN_CONFIRMATION => "CHANNEL_OPEN_CONFIRMATION",
        SSH_MSG_CHANNEL_OPEN_FAILURE => "CHANNEL_OPEN_FAILURE",
        SSH_MSG_CHANNEL_WINDOW_ADJUST => "CHANNEL_WINDOW_ADJUST",
        SSH_MSG_CHANNEL_DATA => "CHANNEL_DATA",
        SSH_MSG_CHANNEL_EXTENDED_DATA => "CHANNEL_EXTENDED_DATA",
        SSH_MSG_CHANNEL_EOF => "CHANNEL_EOF",
        SSH_MSG_CHANNEL_CLOSE => "CHANNEL_CLOSE",
        SSH_MSG_CHANNEL_REQUEST => "CHANNEL_REQUEST",
        SSH_MSG_CHANNEL_SUCCESS => "CHANNEL_SUCCESS",
        SSH_MSG_CHANNEL_FAILURE => "CHANNEL_FAILURE",
        _ => "?",
    }
}
