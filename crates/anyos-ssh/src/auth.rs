//! User authentication (RFC 4252), password method only

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use anyos_ssh_crypto::wire::{read_bool, read_str, read_string, write_bool, write_namelist, write_string};
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::error::{Result, SshError};
use crate::msg::*;
use crate::session::{Role, Session};
use crate::transport::Transport;

pub const SERVICE_USERAUTH: &str = "ssh-userauth";
pub const SERVICE_CONNECTION: &str = "ssh-connection";

/// Password attempts before the server gives up on a client
pub const MAX_PASSWORD_ATTEMPTS: u32 = 5;
/// Requests of any method before the server gives up
pub const MAX_AUTH_REQUESTS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
}

/// Checks a username/password pair
pub trait PasswordAuthenticator {
    fn authenticate(&mut self, user: &str, password: &[u8]) -> AuthDecision;
}

/// Decides whether an authenticated user may log in at all
pub trait AccessPolicy {
    fn user_allowed(&self, user: &str) -> bool;
}

/// Lets every authenticated user in
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn user_allowed(&self, _user: &str) -> bool {
        true
    }
}

fn failure_reply() -> Vec<u8> {
    let mut payload = vec![SSH_MSG_USERAUTH_FAILURE];
    write_namelist(&mut payload, &["password"]);
    write_bool(&mut payload, false);
    payload
}

impl<T: Transport, R: RngCore + CryptoRng> Session<T, R> {
    // ========================================================================
    // Server
    // ========================================================================

    /// Run the ssh-userauth service until a user logs in. Returns the
    /// username.
    pub async fn server_auth<A, P>(&mut self, authenticator: &mut A, policy: &P) -> Result<String>
    where
        A: PasswordAuthenticator + ?Sized,
        P: AccessPolicy + ?Sized,
    {
        if self.role != Role::Server || self.authenticated {
            return Err(SshError::Protocol);
        }
        self.accept_service().await?;

        let mut attempts = 0;
        let mut requests = 0;
        let mut banner_pending = self.banner.is_some();

        loop {
            // Carries the password; wiped on drop
            let payload = Zeroizing::new(self.recv_message().await?);
            if payload[0] != SSH_MSG_USERAUTH_REQUEST {
                log::warn!("[SSH Auth] Expected USERAUTH_REQUEST, got {}", name(payload[0]));
                return Err(SshError::Protocol);
            }
            requests += 1;

            let mut offset = 1;
            let user = read_str(&payload, &mut offset).ok_or(SshError::Protocol)?;
            let service = read_string(&payload, &mut offset).ok_or(SshError::Protocol)?;
            let method = read_string(&payload, &mut offset).ok_or(SshError::Protocol)?;

            if banner_pending {
                banner_pending = false;
                self.send_banner().await?;
            }

            let allowed = if service != SERVICE_CONNECTION.as_bytes() {
                log::info!("[SSH Auth] Unsupported service for user '{}'", user);
                false
            } else if method != b"password" {
                log::debug!(
                    "[SSH Auth] Method '{}' not available",
                    String::from_utf8_lossy(method)
                );
                false
            } else {
                let change = read_bool(&payload, &mut offset).ok_or(SshError::Protocol)?;
                let password = read_string(&payload, &mut offset).ok_or(SshError::Protocol)?;
                attempts += 1;
                if change {
                    log::info!("[SSH Auth] Password change refused for user '{}'", user);
                    false
                } else {
                    let decision = authenticator.authenticate(user, password);
                    decision == AuthDecision::Allow && policy.user_allowed(user)
                }
            };

            if allowed {
                let user = user.to_string();
                self.send_packet(&[SSH_MSG_USERAUTH_SUCCESS]).await?;
                self.authenticated = true;
                log::info!("[SSH Auth] User '{}' authenticated", user);
                return Ok(user);
            }

            if method == b"password" {
                log::info!(
                    "[SSH Auth] Password rejected for user '{}' ({}/{})",
                    user,
                    attempts,
                    MAX_PASSWORD_ATTEMPTS
                );
            }
            self.send_packet(&failure_reply()).await?;
            if attempts >= MAX_PASSWORD_ATTEMPTS || requests >= MAX_AUTH_REQUESTS {
                log::warn!("[SSH Auth] Too many failures for user '{}'", user);
                self.disconnect(
                    SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE,
                    "too many authentication failures",
                )
                .await;
                return Err(SshError::Auth);
            }
        }
    }

    async fn accept_service(&mut self) -> Result<()> {
        let payload = self.recv_message().await?;
        if payload[0] != SSH_MSG_SERVICE_REQUEST {
            log::warn!("[SSH Auth] Expected SERVICE_REQUEST, got {}", name(payload[0]));
            return Err(SshError::Protocol);
        }
        let mut offset = 1;
        let service = read_string(&payload, &mut offset).ok_or(SshError::Protocol)?;
        if service != SERVICE_USERAUTH.as_bytes() {
            log::warn!(
                "[SSH Auth] Service '{}' not available",
                String::from_utf8_lossy(service)
            );
            self.disconnect(SSH_DISCONNECT_SERVICE_NOT_AVAILABLE, "service not available")
                .await;
            return Err(SshError::Protocol);
        }

        let mut reply = vec![SSH_MSG_SERVICE_ACCEPT];
        write_string(&mut reply, service);
        self.send_packet(&reply).await
    }

    async fn send_banner(&mut self) -> Result<()> {
        let Some(banner) = self.banner.as_ref() else {
            return Ok(());
        };
        let mut payload = vec![SSH_MSG_USERAUTH_BANNER];
        write_string(&mut payload, banner.as_bytes());
        write_string(&mut payload, b"");
        self.send_packet(&payload).await
    }

    // ========================================================================
    // Client
    // ========================================================================

    /// Log in with a password. `Err(SshError::Auth)` if the server refuses;
    /// the session stays usable for another try.
    pub async fn client_auth_password(&mut self, user: &str, password: &str) -> Result<()> {
        if self.role != Role::Client || self.authenticated {
            return Err(SshError::Protocol);
        }
        if !self.userauth_accepted {
            let mut request = vec![SSH_MSG_SERVICE_REQUEST];
            write_string(&mut request, SERVICE_USERAUTH.as_bytes());
            self.send_packet(&request).await?;

            let reply = self.recv_message().await?;
            if reply[0] != SSH_MSG_SERVICE_ACCEPT {
                log::warn!("[SSH Auth] Service request refused ({})", name(reply[0]));
                return Err(SshError::Protocol);
            }
            self.userauth_accepted = true;
        }

        let mut request = Zeroizing::new(vec![SSH_MSG_USERAUTH_REQUEST]);
        write_string(&mut request, user.as_bytes());
        write_string(&mut request, SERVICE_CONNECTION.as_bytes());
        write_string(&mut request, b"password");
        write_bool(&mut request, false);
        write_string(&mut request, password.as_bytes());
        self.send_packet(&request).await?;

        loop {
            let reply = self.recv_message().await?;
            match reply[0] {
                SSH_MSG_USERAUTH_BANNER => {
                    let mut offset = 1;
                    let message = read_string(&reply, &mut offset).ok_or(SshError::Protocol)?;
                    self.peer_banner = Some(String::from_utf8_lossy(message).into_owned());
                }
                SSH_MSG_USERAUTH_SUCCESS => {
                    self.authenticated = true;
                    log::info!("[SSH Auth] Logged in as '{}'", user);
                    return Ok(());
                }
                SSH_MSG_USERAUTH_FAILURE | SSH_MSG_USERAUTH_PASSWD_CHANGEREQ => {
                    log::info!("[SSH Auth] Server refused password for '{}'", user);
                    return Err(SshError::Auth);
                }
                other => {
                    log::warn!("[SSH Auth] Unexpected {} during auth", name(other));
                    return Err(SshError::Protocol);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl PasswordAuthenticator for Fixed {
        fn authenticate(&mut self, user: &str, password: &[u8]) -> AuthDecision {
            if user == "alice" && password == b"s3cret" {
                AuthDecision::Allow
            } else {
                AuthDecision::Deny
            }
        }
    }

    #[test]
    fn test_failure_reply_lists_password_only() {
        let reply = failure_reply();
        let mut offset = 1;
        assert_eq!(reply[0], SSH_MSG_USERAUTH_FAILURE);
        assert_eq!(read_string(&reply, &mut offset), Some(&b"password"[..]));
        assert_eq!(read_bool(&reply, &mut offset), Some(false));
        assert_eq!(offset, reply.len());
    }

    #[test]
    fn test_fixed_authenticator() {
        let mut auth = Fixed;
        assert_eq!(auth.authenticate("alice", b"s3cret"), AuthDecision::Allow);
        assert_eq!(auth.authenticate("alice", b"wrong"), AuthDecision::Deny);
        assert!(AllowAll.user_allowed("anyone"));
    }
}
