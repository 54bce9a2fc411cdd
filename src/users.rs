//! Password table
//!
//! One `username:hash` entry per line, `#` starts a comment. The hash is an
//! argon2 PHC string, for example
//! `$argon2id$v=19$m=19456,t=2,p=1$<salt>$<hash>`, as written by the
//! `argon2` command line tool and most password libraries.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use anyos_ssh::{AuthDecision, PasswordAuthenticator};
use argon2::password_hash::{PasswordHash, Salt};
use argon2::{Algorithm, Argon2, Params, Version};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub const DEFAULT_USERS_PATH: &str = "/System/etc/ssh/ssh_passwd";

/// Salt for the decoy check run for unknown users
const DECOY_SALT: &[u8] = b"anyos-sshd-decoy";

/// A parsed PHC string: the hasher configured with its parameters, the raw
/// salt and the expected output
struct Credential {
    hasher: Argon2<'static>,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl Credential {
    fn parse(phc: &str) -> Option<Self> {
        let phc = PasswordHash::new(phc).ok()?;
        let algorithm = Algorithm::try_from(phc.algorithm).ok()?;
        let version = match phc.version {
            Some(version) => Version::try_from(version).ok()?,
            None => Version::default(),
        };
        let params = Params::try_from(&phc).ok()?;

        let mut salt = [0u8; Salt::MAX_LENGTH];
        let salt = phc.salt?.decode_b64(&mut salt).ok()?.to_vec();
        let hash = phc.hash?.as_bytes().to_vec();
        Some(Self {
            hasher: Argon2::new(algorithm, version, params),
            salt,
            hash,
        })
    }

    /// Same cost as `self` but matches nothing. Checked for unknown users.
    fn decoy(&self) -> Self {
        Self {
            hasher: self.hasher.clone(),
            salt: DECOY_SALT.to_vec(),
            hash: vec![0; self.hash.len()],
        }
    }

    fn matches(&self, password: &[u8]) -> bool {
        let mut computed = Zeroizing::new(vec![0u8; self.hash.len()]);
        if self
            .hasher
            .hash_password_into(password, &self.salt, &mut computed)
            .is_err()
        {
            return false;
        }
        bool::from(computed[..].ct_eq(&self.hash[..]))
    }
}

#[derive(Default)]
pub struct UserTable {
    entries: HashMap<String, Credential>,
    decoy: Option<Credential>,
}

impl UserTable {
    pub fn parse(content: &str) -> Self {
        let mut table = Self::default();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, hash)) = line.split_once(':') else {
                warn!(line = number + 1, "user table entry without ':' ignored");
                continue;
            };
            let Some(credential) = Credential::parse(hash.trim()) else {
                warn!(line = number + 1, "user table entry without a valid argon2 hash ignored");
                continue;
            };
            table.entries.insert(user.trim().to_string(), credential);
        }
        table.decoy = table.entries.values().next().map(Credential::decoy);
        table
    }

    /// Read `path`. Without a readable table nobody can log in.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let table = Self::parse(&content);
                if table.is_empty() {
                    warn!(path = %path.display(), "user table has no entries, all logins will be refused");
                } else {
                    info!(path = %path.display(), users = table.len(), "loaded user table");
                }
                table
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "no user table, all logins will be refused");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable user table, all logins will be refused");
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn verify(&self, user: &str, password: &[u8]) -> bool {
        match self.entries.get(user) {
            Some(credential) => credential.matches(password),
            None => {
                if let Some(decoy) = &self.decoy {
                    let _ = decoy.matches(password);
                }
                false
            }
        }
    }
}

impl PasswordAuthenticator for &UserTable {
    fn authenticate(&mut self, user: &str, password: &[u8]) -> AuthDecision {
        if self.verify(user, password) {
            AuthDecision::Allow
        } else {
            AuthDecision::Deny
        }
    }
}
