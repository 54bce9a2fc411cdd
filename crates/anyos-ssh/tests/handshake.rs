mod common;

use anyos_ssh::{Session, SshError};
use common::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_version_exchange_with_raw_client() {
    let (server_end, mut raw) = tokio::io::duplex(4096);
    let mut server = Session::server(
        DuplexTransport::new(server_end),
        StdRng::seed_from_u64(1),
        host_key(),
    )
    .unwrap();

    raw.write_all(b"SSH-2.0-TestClient_1\r\n").await.unwrap();
    server.exchange_versions().await.unwrap();
    assert_eq!(server.peer_version(), "SSH-2.0-TestClient_1");

    let mut line = [0u8; 24];
    raw.read_exact(&mut line).await.unwrap();
    assert_eq!(&line, b"SSH-2.0-anyOS_sshd_1.0\r\n");
}

#[tokio::test]
async fn test_non_ssh_peer_rejected() {
    let (server_end, mut raw) = tokio::io::duplex(4096);
    let mut server = Session::server(
        DuplexTransport::new(server_end),
        StdRng::seed_from_u64(1),
        host_key(),
    )
    .unwrap();

    raw.write_all(b"hello\n").await.unwrap();
    let err = server.exchange_versions().await.unwrap_err();
    assert_eq!(err, SshError::Protocol);

    server.abort(&err).await;
    assert!(server.is_closed());
    assert!(server.is_wiped());
}

#[tokio::test]
async fn test_key_exchange_agrees() {
    let (mut server, mut client) = session_pair();
    handshake(&mut server, &mut client).await;

    assert_eq!(server.peer_version(), "SSH-2.0-anyOS_1.0");
    assert_eq!(client.peer_version(), "SSH-2.0-anyOS_sshd_1.0");

    let id = *server.session_id().unwrap();
    assert_eq!(client.session_id(), Some(&id));
    assert_eq!(server.kex_hash(), &id);
    assert_eq!(client.kex_hash(), &id);
    assert_eq!(client.peer_host_key(), Some(&host_key().public_blob()[..]));

    assert!(server.packets().is_inbound_encrypted());
    assert!(server.packets().is_outbound_encrypted());
    // KEXINIT, ECDH, NEWKEYS each way
    assert_eq!(server.packets().seq_out(), 3);
    assert_eq!(client.packets().seq_in(), 3);
}

#[tokio::test]
async fn test_rekey_keeps_session_id() {
    let (mut server, mut client) = session_pair();
    handshake(&mut server, &mut client).await;
    login(&mut server, &mut client).await;
    let id = *client.session_id().unwrap();
    let seq_before = client.packets().seq_out();

    let (s, c) = tokio::join!(server.accept_channel(), async {
        client.rekey().await?;
        client.open_session().await
    });
    s.unwrap();
    assert!(c.unwrap());

    assert_eq!(client.kex_count(), 2);
    assert_eq!(server.kex_count(), 2);
    assert_eq!(client.session_id(), Some(&id));
    assert_eq!(server.session_id(), Some(&id));
    assert_ne!(client.kex_hash(), &id);
    assert_eq!(client.kex_hash(), server.kex_hash());
    assert!(client.packets().seq_out() > seq_before);
}

#[tokio::test]
async fn test_volume_rekey_during_transfer() {
    let (mut server, client) = session_pair();
    let mut client = client.with_rekey_limit(4096);
    handshake(&mut server, &mut client).await;
    login(&mut server, &mut client).await;
    let id = *client.session_id().unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
    let (s, c) = tokio::join!(
        async {
            server.accept_channel().await?;
            server.accept_shell().await?;
            server.forward(&mut TestShell::echo()).await
        },
        async {
            assert!(client.open_session().await.unwrap());
            assert!(client.request_shell().await.unwrap());
            client.channel_write(&payload).await.unwrap();
            let mut echoed = Vec::new();
            while echoed.len() < payload.len() {
                echoed.extend(client.channel_read().await.unwrap().unwrap());
            }
            client.channel_close().await.unwrap();
            assert_eq!(client.channel_read().await.unwrap(), None);
            echoed
        }
    );

    assert_eq!(s.unwrap(), anyos_ssh::ForwardEnd::ChannelClosed);
    assert_eq!(c, payload);
    assert!(client.kex_count() >= 2);
    assert_eq!(client.session_id(), Some(&id));
}

#[tokio::test]
async fn test_server_rekey_while_forwarding() {
    let (mut server, mut client) = session_pair();
    handshake(&mut server, &mut client).await;
    login(&mut server, &mut client).await;
    let id = *server.session_id().unwrap();

    let mut shell = TestShell {
        rekey_once: true,
        ..TestShell::echo()
    };
    let (s, c) = tokio::join!(
        async {
            server.accept_channel().await?;
            server.accept_shell().await?;
            server.forward(&mut shell).await
        },
        async {
            assert!(client.open_session().await.unwrap());
            assert!(client.request_shell().await.unwrap());
            client.channel_write(b"ping").await.unwrap();
            let mut echoed = Vec::new();
            while echoed.len() < 4 {
                echoed.extend(client.channel_read().await.unwrap().unwrap());
            }
            client.channel_close().await.unwrap();
            assert_eq!(client.channel_read().await.unwrap(), None);
            echoed
        }
    );

    assert_eq!(s.unwrap(), anyos_ssh::ForwardEnd::ChannelClosed);
    assert_eq!(c, b"ping");
    assert_eq!(server.kex_count(), 2);
    assert_eq!(client.kex_count(), 2);
    assert_eq!(server.session_id(), Some(&id));
}
