//! anyOS SSH daemon
//!
//! ```text
//! sshd [-p PORT] [-f CONFIG] [-k HOST_KEY] [-u USERS]
//! ```

mod config;
mod keys;
mod server;
mod shell;
mod stream;
mod users;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::task::LocalSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{DEFAULT_CONFIG_PATH, SshdConfig};
use keys::DEFAULT_HOST_KEY_PATH;
use server::Shared;
use users::{DEFAULT_USERS_PATH, UserTable};

const DEFAULT_PORT: u16 = 22;
const USAGE: &str = "usage: sshd [-p PORT] [-f CONFIG] [-k HOST_KEY] [-u USERS]";

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    port: u16,
    config: PathBuf,
    host_key: PathBuf,
    users: PathBuf,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            host_key: PathBuf::from(DEFAULT_HOST_KEY_PATH),
            users: PathBuf::from(DEFAULT_USERS_PATH),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run(Args),
    Help,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command, String> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let mut value = |flag: &str| args.next().ok_or_else(|| format!("{} needs a value", flag));
        match arg.as_str() {
            "-p" | "--port" => {
                let port = value(&arg)?;
                parsed.port = port
                    .parse()
                    .map_err(|_| format!("invalid port: {}", port))?;
            }
            "-f" | "--config" => parsed.config = value(&arg)?.into(),
            "-k" | "--host-key" => parsed.host_key = value(&arg)?.into(),
            "-u" | "--users" => parsed.users = value(&arg)?.into(),
            "-h" | "--help" => return Ok(Command::Help),
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(Command::Run(parsed))
}

// ============================================================================
// Entry Point
// ============================================================================

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            println!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Err(message) => {
            eprintln!("sshd: {}\n{}", message, USAGE);
            return ExitCode::from(2);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start runtime");
            return ExitCode::FAILURE;
        }
    };

    // Sessions are not Send; every connection runs on this thread
    match LocalSet::new().block_on(&runtime, run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!("starting sshd");
    let config = SshdConfig::load(&args.config);
    let users = UserTable::load(&args.users);
    let host_key = keys::load_or_generate(&args.host_key)?;
    info!(fingerprint = %keys::fingerprint(&host_key), "host key ready");

    let shared = Arc::new(Shared {
        host_key: Arc::new(host_key),
        config,
        users,
    });
    server::listen(args.port, shared).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_defaults() {
        assert_eq!(parse(&[]), Ok(Command::Run(Args::default())));
        let args = Args::default();
        assert_eq!(args.port, 22);
        assert_eq!(args.config, PathBuf::from("/System/etc/ssh/ssh_users.conf"));
        assert_eq!(args.users, PathBuf::from("/System/etc/ssh/ssh_passwd"));
        assert_ne!(args.config, args.users);
    }

    #[test]
    fn test_all_flags() {
        let command = parse(&[
            "-p", "2222", "--config", "/tmp/sshd.conf", "-k", "/tmp/key", "--users", "/tmp/users",
        ]);
        assert_eq!(
            command,
            Ok(Command::Run(Args {
                port: 2222,
                config: PathBuf::from("/tmp/sshd.conf"),
                host_key: PathBuf::from("/tmp/key"),
                users: PathBuf::from("/tmp/users"),
            }))
        );
    }

    #[test]
    fn test_bad_port() {
        assert!(parse(&["-p", "70000"]).is_err());
        assert!(parse(&["--port", "ssh"]).is_err());
        assert!(parse(&["-p"]).is_err());
    }

    #[test]
    fn test_unknown_flag() {
        assert_eq!(
            parse(&["--shell", "/bin/sh"]),
            Err("unknown argument: --shell".to_string())
        );
    }

    #[test]
    fn test_help() {
        assert_eq!(parse(&["-p", "22", "-h"]), Ok(Command::Help));
    }
}
