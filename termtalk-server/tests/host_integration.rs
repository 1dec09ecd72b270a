//! Host scenarios over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;

use termtalk_core::frame::ENCODED_PUBLIC_KEY_LEN;
use termtalk_core::{Handshake, Role};
use termtalk_server::{
    ConnectionState, DisconnectReason, Host, HostConfig, HostEvent, MemoryRegistry,
    RegistryStore, RoomState,
};
use termtalk_transport::{SecureSession, SessionConfig, TcpDialer, TransportError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

// --- Helpers ---

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> HostConfig {
    HostConfig::default().with_port(0)
}

async fn start(config: HostConfig) -> (Host, mpsc::Receiver<HostEvent>, Arc<MemoryRegistry>) {
    let registry = Arc::new(MemoryRegistry::new());
    let (host, events) = Host::start(config, registry.clone()).await.unwrap();
    (host, events, registry)
}

async fn next_event(events: &mut mpsc::Receiver<HostEvent>) -> HostEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no event in time")
        .expect("event stream closed")
}

async fn join(host: &Host) -> SecureSession {
    SecureSession::connect(
        &TcpDialer::default(),
        &host.local_addr().to_string(),
        &SessionConfig::default(),
    )
    .await
    .unwrap()
}

/// Next line from a raw socket, `None` once the host has closed it.
async fn read_line<R>(lines: &mut tokio::io::Lines<R>) -> Option<String>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    timeout(WAIT, lines.next_line())
        .await
        .expect("socket neither answered nor closed")
        .ok()
        .flatten()
}

// --- Scenarios ---

#[tokio::test]
async fn test_happy_path() {
    let (host, mut events, registry) = start(test_config()).await;
    let entry = registry.get(&host.room_id()).unwrap().unwrap();
    assert_eq!(entry.host_port, host.local_addr().port());

    let mut joiner = join(&host).await;

    let peer = match next_event(&mut events).await {
        HostEvent::PeerJoined { peer, fingerprint } => {
            assert_eq!(fingerprint, joiner.fingerprint());
            peer
        }
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(host.room().members(), vec![peer]);

    joiner.send_text("hello host").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        HostEvent::Message {
            peer,
            text: "hello host".into()
        }
    );

    assert_eq!(host.broadcast("hello peers").unwrap(), 1);
    assert_eq!(joiner.recv().await.unwrap().as_str(), "hello peers");
    assert!(host.broadcast("").is_err());

    joiner.burn();
    assert_eq!(
        next_event(&mut events).await,
        HostEvent::PeerLeft {
            peer,
            reason: DisconnectReason::PeerClosed
        }
    );

    let room_id = host.room_id();
    host.shutdown().await;
    assert!(!registry.contains(&room_id));
}

#[tokio::test]
async fn test_per_ip_ceiling() {
    let config = test_config()
        .with_connection_limits(5, 64)
        .with_rate_limit(100, 60);
    let (host, _events, _registry) = start(config).await;

    let mut sockets = Vec::new();
    for _ in 0..6 {
        let stream = TcpStream::connect(host.local_addr()).await.unwrap();
        sockets.push(BufReader::new(stream).lines());
    }

    let mut greeted = 0;
    let mut dropped = 0;
    for lines in sockets.iter_mut() {
        match read_line(lines).await {
            Some(line) => {
                assert_eq!(line.len(), ENCODED_PUBLIC_KEY_LEN);
                greeted += 1;
            }
            None => dropped += 1,
        }
    }
    assert_eq!(greeted, 5);
    assert_eq!(dropped, 1);
    assert_eq!(host.open_connections(), 5);

    let rejected = host
        .connections()
        .iter()
        .filter(|r| r.state == ConnectionState::Rejected)
        .count();
    assert_eq!(rejected, 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_over_sockets() {
    let config = test_config()
        .with_connection_limits(64, 64)
        .with_rate_limit(3, 60);
    let (host, _events, _registry) = start(config).await;

    let mut greeted = 0;
    for _ in 0..5 {
        let stream = TcpStream::connect(host.local_addr()).await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        // Read the outcome before dialing again so arrival order is fixed.
        if read_line(&mut lines).await.is_some() {
            greeted += 1;
        }
    }
    assert_eq!(greeted, 3);

    host.shutdown().await;
}

#[tokio::test]
async fn test_ttl_closes_silent_connection() {
    let created = Instant::now();
    let (host, _events, registry) = start(test_config().with_ttl_secs(2)).await;
    let room_id = host.room_id();

    // Reads the host key, never answers.
    let stream = TcpStream::connect(host.local_addr()).await.unwrap();
    let mut lines = BufReader::new(stream).lines();
    assert!(read_line(&mut lines).await.is_some());
    assert_eq!(host.room().member_count(), 1);

    assert_eq!(read_line(&mut lines).await, None);
    assert!(created.elapsed() < Duration::from_secs(3));

    timeout(WAIT, host.closed()).await.unwrap();
    sleep(Duration::from_secs(3).saturating_sub(created.elapsed())).await;

    assert_eq!(host.room().state(), RoomState::Expired);
    assert_eq!(host.room().member_count(), 0);
    assert_eq!(host.open_connections(), 0);
    assert!(!registry.contains(&room_id));

    // The listener is gone too.
    let late = TcpStream::connect(host.local_addr()).await;
    if let Ok(stream) = late {
        let mut lines = BufReader::new(stream).lines();
        assert_eq!(read_line(&mut lines).await, None);
    }
}

#[tokio::test]
async fn test_wrong_length_key_is_dropped() {
    let (host, mut events, _registry) = start(test_config()).await;

    let stream = TcpStream::connect(host.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    assert!(read_line(&mut lines).await.is_some());
    write.write_all(b"c2hvcnQ=\n").await.unwrap();
    assert_eq!(read_line(&mut lines).await, None);

    // No join was announced for a failed handshake.
    assert!(events.try_recv().is_err());
    host.shutdown().await;
}

#[tokio::test]
async fn test_forged_frame_closes_connection() {
    let (host, mut events, _registry) = start(test_config()).await;

    let stream = TcpStream::connect(host.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // Complete an honest handshake by hand.
    let host_key = read_line(&mut lines).await.unwrap();
    let mut hs = Handshake::new(Role::Initiator);
    hs.generate_keys().unwrap();
    let ours = hs.public_key_line().unwrap();
    write.write_all(format!("{}\n", ours).as_bytes()).await.unwrap();
    hs.receive_peer_key(&host_key).unwrap();
    let _key = hs.derive_session_key().unwrap();

    let peer = match next_event(&mut events).await {
        HostEvent::PeerJoined { peer, .. } => peer,
        other => panic!("unexpected event {:?}", other),
    };

    // Well-formed, but not sealed under the session key.
    let forged = termtalk_core::SealedFrame::new([1u8; 12], vec![2u8; 40]).encode();
    write.write_all(format!("{}\n", forged).as_bytes()).await.unwrap();

    assert_eq!(read_line(&mut lines).await, None);
    match next_event(&mut events).await {
        HostEvent::PeerLeft { peer: left, reason } => {
            assert_eq!(left, peer);
            assert!(matches!(reason, DisconnectReason::Failed(_)));
        }
        other => panic!("unexpected event {:?}", other),
    }

    host.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_peers() {
    let (host, mut events, _registry) = start(test_config()).await;
    let mut joiner = join(&host).await;
    assert!(matches!(
        next_event(&mut events).await,
        HostEvent::PeerJoined { .. }
    ));

    host.shutdown().await;
    assert!(matches!(
        timeout(WAIT, joiner.recv()).await.unwrap(),
        Err(TransportError::PeerDisconnected | TransportError::Io(_))
    ));
}

#[tokio::test]
async fn test_peer_that_stops_reading_is_timed_out() {
    let config = test_config().with_session_timeouts(5, 1);
    let (host, mut events, _registry) = start(config).await;

    // Handshake by hand, then neither read nor write again.
    let stream = TcpStream::connect(host.local_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let host_key = read_line(&mut lines).await.unwrap();
    let mut hs = Handshake::new(Role::Initiator);
    hs.generate_keys().unwrap();
    let ours = hs.public_key_line().unwrap();
    write.write_all(format!("{}\n", ours).as_bytes()).await.unwrap();
    hs.receive_peer_key(&host_key).unwrap();

    let peer = match next_event(&mut events).await {
        HostEvent::PeerJoined { peer, .. } => peer,
        other => panic!("unexpected event {:?}", other),
    };

    // Keep the socket buffers full so the host's writes stall.
    let chunk = "x".repeat(60_000);
    let started = Instant::now();
    while host.open_connections() > 0 {
        assert!(
            started.elapsed() < Duration::from_secs(8),
            "silent peer kept its slot past the idle window"
        );
        for _ in 0..20 {
            let _ = host.broadcast(&chunk);
        }
        sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(
        next_event(&mut events).await,
        HostEvent::PeerLeft {
            peer,
            reason: DisconnectReason::TimedOut
        }
    );
    assert_eq!(host.room().member_count(), 0);

    drop(lines);
    host.shutdown().await;
}
