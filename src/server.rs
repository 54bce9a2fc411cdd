//! Accept loop and per-connection session driver

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use anyos_ssh::msg::SSH_DISCONNECT_BY_APPLICATION;
use anyos_ssh::{ForwardEnd, HostKey, Session, SshError};
use rand_core::OsRng;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::SshdConfig;
use crate::shell::{ProcessShell, SpawnFailure};
use crate::stream::{IDLE_TIMEOUT, SshStream};
use crate::users::UserTable;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Read-only state every connection sees
pub struct Shared {
    pub host_key: Arc<HostKey>,
    pub config: SshdConfig,
    pub users: UserTable,
}

type TcpSession = Session<SshStream, OsRng>;

/// Bind `port` on all interfaces and serve until ctrl-c
pub async fn listen(port: u16, shared: Arc<Shared>) -> Result<()> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!(addr = %listener.local_addr()?, shell = %shared.config.shell, "listening");

    serve(listener, shared, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot watch for ctrl-c");
            std::future::pending::<()>().await;
        }
    })
    .await;
    Ok(())
}

/// Accept connections until `shutdown` resolves. Must run inside a `LocalSet`.
pub async fn serve(listener: TcpListener, shared: Arc<Shared>, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(%peer, "connection accepted");
                    tokio::task::spawn_local(handle_connection(stream, peer, Arc::clone(&shared)));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            () = &mut shutdown => {
                info!("shutting down");
                return;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "cannot set TCP_NODELAY");
    }
    let mut session = match Session::server(SshStream::new(stream), OsRng, Arc::clone(&shared.host_key)) {
        Ok(session) => session.with_banner(shared.config.banner.clone()),
        Err(e) => {
            warn!(%peer, error = %e, "session setup failed");
            return;
        }
    };

    match run_session(&mut session, &shared, peer).await {
        Ok(end) => {
            session.disconnect(SSH_DISCONNECT_BY_APPLICATION, "session closed").await;
            info!(%peer, ?end, "session finished");
        }
        Err(SshError::PeerDisconnected { reason }) => {
            info!(%peer, reason, "peer disconnected");
            session.close().await;
        }
        Err(SshError::Io(kind)) => {
            info!(%peer, ?kind, "connection lost");
            session.close().await;
        }
        Err(e) => {
            warn!(%peer, error = %e, "session failed");
            session.abort(&e).await;
        }
    }
}

async fn run_session(
    session: &mut TcpSession,
    shared: &Shared,
    peer: SocketAddr,
) -> Result<ForwardEnd, SshError> {
    session.handshake().await?;
    debug!(%peer, client = session.peer_version(), "keys established");

    let mut users = &shared.users;
    let user = match session.server_auth(&mut users, &shared.config).await {
        Ok(user) => user,
        Err(e) => {
            if matches!(e, SshError::Auth) {
                warn!(%peer, "authentication failed");
            }
            return Err(e);
        }
    };
    info!(%peer, %user, "login accepted");
    session.transport_mut().set_read_timeout(IDLE_TIMEOUT);

    session.accept_channel().await?;
    let request = session.accept_shell().await?;
    let shell_path = &shared.config.shell;
    match ProcessShell::spawn(shell_path, &request, &user) {
        Ok(mut shell) => session.forward(&mut shell).await,
        Err(e) => {
            warn!(%peer, shell = %shell_path, error = %e, "cannot start shell");
            session.forward(&mut SpawnFailure::new(shell_path, &e)).await
        }
    }
}
