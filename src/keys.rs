//! Host key store
//!
//! The private scalar is kept raw (32 bytes, mode 0600) at the key path and
//! the OpenSSH public line next to it as `<path>.pub`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use anyos_ssh::HostKey;
use anyos_ssh_crypto::hostkey::HOST_KEY_ALGORITHM;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use tracing::info;
use zeroize::Zeroizing;

pub const DEFAULT_HOST_KEY_PATH: &str = "/System/etc/ssh/ssh_host_ecdsa_key";
const KEY_COMMENT: &str = "sshd@anyos";

/// Load the host key at `path`, generating and saving one if there is none
pub fn load_or_generate(path: &Path) -> Result<HostKey> {
    match fs::read(path) {
        Ok(bytes) => {
            let bytes = Zeroizing::new(bytes);
            let key = HostKey::from_scalar(&bytes)
                .map_err(|e| anyhow!("invalid host key {}: {}", path.display(), e))?;
            info!(path = %path.display(), "loaded host key");
            Ok(key)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "generating new host key");
            let key = HostKey::generate(&mut OsRng);
            save(path, &key)?;
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("reading host key {}", path.display())),
    }
}

fn save(path: &Path, key: &HostKey) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating host key {}", path.display()))?;
    file.write_all(key.to_scalar().as_slice())
        .with_context(|| format!("writing host key {}", path.display()))?;

    let pub_path = public_key_path(path);
    fs::write(&pub_path, public_key_line(key))
        .with_context(|| format!("writing {}", pub_path.display()))?;
    Ok(())
}

pub fn public_key_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// `ecdsa-sha2-nistp256 <base64 blob> sshd@anyos`
pub fn public_key_line(key: &HostKey) -> String {
    format!(
        "{} {} {}\n",
        HOST_KEY_ALGORITHM,
        STANDARD.encode(key.public_blob()),
        KEY_COMMENT
    )
}

/// `SHA256:<unpadded base64>`, as printed by ssh-keygen -l
pub fn fingerprint(key: &HostKey) -> String {
    format!(
        "SHA256:{}",
        STANDARD_NO_PAD.encode(Sha256::digest(key.public_blob()))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key() -> HostKey {
        let scalar: Vec<u8> = (1..=32).collect();
        HostKey::from_scalar(&scalar).unwrap()
    }

    #[test]
    fn test_generate_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("ssh_host_ecdsa_key");

        let generated = load_or_generate(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap().len(), 32);

        let loaded = load_or_generate(&path).unwrap();
        assert_eq!(loaded.public_blob(), generated.public_blob());

        let line = fs::read_to_string(public_key_path(&path)).unwrap();
        assert_eq!(line, public_key_line(&generated));
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_ecdsa_key");
        load_or_generate(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_bad_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh_host_ecdsa_key");
        fs::write(&path, b"short").unwrap();
        assert!(load_or_generate(&path).is_err());
        // Left alone for the operator to inspect
        assert_eq!(fs::read(&path).unwrap(), b"short");
    }

    #[test]
    fn test_public_key_line_format() {
        let key = fixed_key();
        let line = public_key_line(&key);
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ecdsa-sha2-nistp256");
        assert_eq!(STANDARD.decode(parts[1]).unwrap(), key.public_blob());
        assert_eq!(parts[2], "sshd@anyos");
    }

    #[test]
    fn test_fingerprint_matches_openssh() {
        // `ssh-keygen -lf` (OpenSSH 9.2p1) on this line, and the fingerprint
        // `ssh -v` logged for the same key
        let line = "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBFFcPW6545a5BNP+yn9U/c0MwemXvzddylFa0KbDtANfRTa+OlDzGPv5pUdZAqIhUCvvDVfgjFOyzApW8X2fk1Q= sshd@anyos\n";
        let key = fixed_key();
        assert_eq!(public_key_line(&key), line);
        assert_eq!(
            fingerprint(&key),
            "SHA256:msILd6H2c87t9h8T4kIVS2eavaEWiwZEc8Hmujou9cQ"
        );
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(&fixed_key());
        let encoded = fp.strip_prefix("SHA256:").unwrap();
        assert_eq!(encoded.len(), 43);
        assert!(!encoded.ends_with('='));
    }

    #[test]
    fn test_public_key_path() {
        assert_eq!(
            public_key_path(Path::new("/etc/ssh/key")),
            PathBuf::from("/etc/ssh/key.pub")
        );
    }
}
