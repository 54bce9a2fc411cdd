//! sshd configuration file
//!
//! ```text
//! [welcome]
//! Welcome to anyOS
//!
//! [shell]
//! /bin/sh
//!
//! [users]
//! alice
//! !guest
//! ```

use std::collections::HashMap;
use std::io;
use std::path::Path;

use anyos_ssh::AccessPolicy;
use tracing::{info, warn};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_CONFIG_PATH: &str = "/System/etc/ssh/ssh_users.conf";
pub const DEFAULT_SHELL: &str = "/bin/sh";

// ============================================================================
// Configuration Structure
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Welcome,
    Shell,
    Users,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshdConfig {
    /// Sent as USERAUTH_BANNER when set
    pub banner: Option<String>,
    pub shell: String,
    /// Explicit `[users]` entries; `false` for names listed with `!`
    pub users: HashMap<String, bool>,
}

impl Default for SshdConfig {
    fn default() -> Self {
        Self {
            banner: None,
            shell: DEFAULT_SHELL.to_string(),
            users: HashMap::new(),
        }
    }
}

impl SshdConfig {
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();
        let mut parser = Parser {
            section: Section::None,
            welcome: Vec::new(),
            shell_set: false,
        };
        for line in content.lines() {
            parser.parse_line(&mut config, line);
        }
        if !parser.welcome.is_empty() {
            config.banner = Some(parser.welcome.join("\n"));
        }
        config
    }

    /// Read `path`; a missing or unreadable file gives the defaults
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                info!(path = %path.display(), "loaded configuration");
                Self::parse(&content)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no configuration file, using defaults");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable configuration, using defaults");
                Self::default()
            }
        }
    }
}

impl AccessPolicy for SshdConfig {
    fn user_allowed(&self, user: &str) -> bool {
        self.users.get(user).copied().unwrap_or(true)
    }
}

struct Parser {
    section: Section,
    welcome: Vec<String>,
    shell_set: bool,
}

impl Parser {
    fn parse_line(&mut self, config: &mut SshdConfig, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return;
        }

        if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            self.section = match name.trim().to_lowercase().as_str() {
                "welcome" => Section::Welcome,
                "shell" => Section::Shell,
                "users" => Section::Users,
                other => {
                    warn!(section = other, "unknown configuration section");
                    Section::Unknown
                }
            };
            return;
        }

        match self.section {
            // Leading whitespace is kept so banners can be laid out
            Section::Welcome => self.welcome.push(line.trim_end().to_string()),
            Section::Shell => {
                if self.shell_set {
                    warn!(line = trimmed, "extra [shell] line ignored");
                } else {
                    config.shell = trimmed.to_string();
                    self.shell_set = true;
                }
            }
            Section::Users => match trimmed.strip_prefix('!') {
                Some(name) => {
                    config.users.insert(name.trim().to_string(), false);
                }
                None => {
                    config.users.insert(trimmed.to_string(), true);
                }
            },
            Section::None => warn!(line = trimmed, "configuration line outside a section ignored"),
            Section::Unknown => {}
        }
    }
}
