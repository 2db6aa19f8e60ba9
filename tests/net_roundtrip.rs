//! End-to-end scenarios over loopback TCP: connect, round trip,
//! broadcast fan-out, disconnect cleanup, and capacity limits.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use gamelink::protocol::MessageType;
use gamelink::{
    Client, ClientError, ClientEvent, Message, NetConfig, PeerState, Server, ServerEvent,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(max_peers: usize) -> (Server, mpsc::Receiver<ServerEvent>, SocketAddr) {
    let mut server = Server::new(NetConfig::new(0).with_max_peers(max_peers));
    let event_rx = server.take_event_receiver().unwrap();
    let addr = server.start().await.unwrap();
    (server, event_rx, addr)
}

async fn connect_client(addr: SocketAddr) -> (Client, mpsc::Receiver<ClientEvent>) {
    let mut client = Client::new(NetConfig::default());
    let event_rx = client.take_event_receiver().unwrap();
    client.connect(addr).await.unwrap();
    (client, event_rx)
}

/// Discard events until one matches the predicate, with a hard timeout
async fn wait_for<E, F>(rx: &mut mpsc::Receiver<E>, mut pred: F) -> E
where
    F: FnMut(&E) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn client_data_round_trip() {
    let (_server, mut server_rx, addr) = start_server(0).await;
    let (client, _client_rx) = connect_client(addr).await;
    assert!(client.is_connected().await);
    assert_eq!(client.local_peer_id(), 1);

    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;

    let sent = Message::data(client.local_peer_id(), 0, Bytes::from_static(b"ping"));
    client.send(sent).await.unwrap();

    let event = wait_for(&mut server_rx, |e| {
        matches!(e, ServerEvent::MessageReceived { .. })
    })
    .await;

    match event {
        ServerEvent::MessageReceived { peer_id, message } => {
            assert_eq!(peer_id, 1);
            assert_eq!(message.kind, MessageType::Data);
            assert_eq!(&message.payload[..], b"ping");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn server_reply_reaches_client() {
    let (server, mut server_rx, addr) = start_server(0).await;
    let (client, mut client_rx) = connect_client(addr).await;

    let event = wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;
    let peer_id = match event {
        ServerEvent::PeerConnected { peer } => peer.id(),
        _ => unreachable!(),
    };

    server
        .send_to(peer_id, Message::data(0, peer_id, Bytes::from_static(b"pong")))
        .await
        .unwrap();

    let event = wait_for(&mut client_rx, |e| {
        matches!(e, ClientEvent::MessageReceived { .. })
    })
    .await;

    match event {
        ClientEvent::MessageReceived { message } => {
            assert_eq!(&message.payload[..], b"pong");
            assert_eq!(message.receiver_id, peer_id);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (server, mut server_rx, addr) = start_server(0).await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        let (client, client_rx) = connect_client(addr).await;
        wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;
        clients.push((client, client_rx));
    }
    assert_eq!(server.peer_count().await, 3);

    let delivered = server
        .broadcast(Message::data(0, 0, Bytes::from_static(b"tick")))
        .await;
    assert_eq!(delivered, 3);

    for (_, client_rx) in clients.iter_mut() {
        let event = wait_for(client_rx, |e| {
            matches!(e, ClientEvent::MessageReceived { .. })
        })
        .await;
        match event {
            ClientEvent::MessageReceived { message } => {
                assert!(message.is_broadcast());
                assert_eq!(&message.payload[..], b"tick");
            }
            _ => unreachable!(),
        }

        // Exactly one delivery per client
        let extra = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match client_rx.recv().await {
                    Some(ClientEvent::MessageReceived { .. }) | None => return,
                    Some(_) => continue,
                }
            }
        })
        .await;
        assert!(extra.is_err(), "client observed a second broadcast delivery");
    }
}

#[tokio::test]
async fn disconnect_peer_cleans_up_registry() {
    let (server, mut server_rx, addr) = start_server(0).await;
    let (_client, mut client_rx) = connect_client(addr).await;

    let event = wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;
    let peer_id = match event {
        ServerEvent::PeerConnected { peer } => peer.id(),
        _ => unreachable!(),
    };
    assert_eq!(server.peer_count().await, 1);
    assert!(server.peer(peer_id).await.is_some());

    server.disconnect_peer(peer_id, "kicked").await;

    assert!(server.peer(peer_id).await.is_none());
    assert_eq!(server.peer_count().await, 0);

    let event = wait_for(&mut server_rx, |e| {
        matches!(e, ServerEvent::PeerDisconnected { .. })
    })
    .await;
    match event {
        ServerEvent::PeerDisconnected { peer_id: id, reason } => {
            assert_eq!(id, peer_id);
            assert_eq!(reason, "kicked");
        }
        _ => unreachable!(),
    }

    // The client observes the drop as well
    wait_for(&mut client_rx, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
}

#[tokio::test]
async fn capacity_limit_rejects_excess_connections() {
    let (server, mut server_rx, addr) = start_server(1).await;
    let (_c1, _c1_rx) = connect_client(addr).await;
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;

    let over = Client::new(NetConfig::default());
    assert!(over.connect(addr).await.is_err());
    assert!(!over.is_connected().await);

    assert_eq!(server.peer_count().await, 1);
    assert_eq!(server.peers().await.len(), 1);
}

#[tokio::test]
async fn peer_ids_increase_and_are_never_reused() {
    let (server, mut server_rx, addr) = start_server(0).await;

    let (c1, _c1_rx) = connect_client(addr).await;
    let first_id = c1.local_peer_id();
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;

    c1.disconnect().await;
    wait_for(&mut server_rx, |e| {
        matches!(e, ServerEvent::PeerDisconnected { .. })
    })
    .await;
    assert_eq!(server.peer_count().await, 0);

    let (c2, _c2_rx) = connect_client(addr).await;
    let second_id = c2.local_peer_id();

    assert!(second_id > first_id, "peer id {} was not above {}", second_id, first_id);
}

#[tokio::test]
async fn state_change_events_follow_the_machine() {
    let (_server, _server_rx, addr) = start_server(0).await;

    let mut client = Client::new(NetConfig::default());
    let mut client_rx = client.take_event_receiver().unwrap();
    client.connect(addr).await.unwrap();

    let event = wait_for(&mut client_rx, |e| matches!(e, ClientEvent::StateChanged { .. })).await;
    match event {
        ClientEvent::StateChanged { old, new } => {
            assert_eq!(old, gamelink::PeerState::Disconnected);
            assert_eq!(new, gamelink::PeerState::Connecting);
        }
        _ => unreachable!(),
    }

    let event = wait_for(&mut client_rx, |e| matches!(e, ClientEvent::StateChanged { .. })).await;
    match event {
        ClientEvent::StateChanged { old, new } => {
            assert_eq!(old, gamelink::PeerState::Connecting);
            assert_eq!(new, gamelink::PeerState::Connected);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn stop_disconnects_every_peer() {
    let (mut server, mut server_rx, addr) = start_server(0).await;

    let (_c1, mut c1_rx) = connect_client(addr).await;
    let (_c2, mut c2_rx) = connect_client(addr).await;
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;

    server.stop().await;

    wait_for(&mut c1_rx, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    wait_for(&mut c2_rx, |e| matches!(e, ClientEvent::Disconnected { .. })).await;
    assert_eq!(server.peer_count().await, 0);
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::Stopped)).await;
}

#[tokio::test]
async fn malformed_frame_drops_only_the_faulting_peer() {
    let (server, mut server_rx, addr) = start_server(0).await;

    let (good, _good_rx) = connect_client(addr).await;
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    let event = wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;
    let bad_id = match event {
        ServerEvent::PeerConnected { peer } => peer.id(),
        _ => unreachable!(),
    };
    assert_eq!(server.peer_count().await, 2);

    // Bytes that decode to no valid frame
    raw.write_all(&[0xFF; 64]).await.unwrap();

    let event = wait_for(&mut server_rx, |e| {
        matches!(e, ServerEvent::PeerDisconnected { .. })
    })
    .await;
    match event {
        ServerEvent::PeerDisconnected { peer_id, .. } => assert_eq!(peer_id, bad_id),
        _ => unreachable!(),
    }
    assert_eq!(server.peer_count().await, 1);

    // The other peer is unaffected
    good.send(Message::data(good.local_peer_id(), 0, Bytes::from_static(b"still here")))
        .await
        .unwrap();
    let event = wait_for(&mut server_rx, |e| {
        matches!(e, ServerEvent::MessageReceived { .. })
    })
    .await;
    match event {
        ServerEvent::MessageReceived { message, .. } => {
            assert_eq!(&message.payload[..], b"still here");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn server_tolerates_hostile_pong_timestamp() {
    let (_server, mut server_rx, addr) = start_server(0).await;

    let mut raw = TcpStream::connect(addr).await.unwrap();
    wait_for(&mut server_rx, |e| matches!(e, ServerEvent::PeerConnected { .. })).await;

    // A timestamp chosen to overflow a naive elapsed-time subtraction
    let mut pong = Message::new(MessageType::Pong, 0, 0, Bytes::new());
    pong.timestamp = i64::MIN;
    raw.write_all(&pong.to_bytes().unwrap()).await.unwrap();

    let data = Message::data(0, 0, Bytes::from_static(b"after"));
    raw.write_all(&data.to_bytes().unwrap()).await.unwrap();

    // The connection survives the bad pong and keeps delivering
    let event = wait_for(&mut server_rx, |e| {
        matches!(e, ServerEvent::MessageReceived { .. })
    })
    .await;
    match event {
        ServerEvent::MessageReceived { message, .. } => {
            assert_eq!(&message.payload[..], b"after");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn client_tolerates_hostile_pong_timestamp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let fake_server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        sock.write_all(&Message::handshake(7).to_bytes().unwrap())
            .await
            .unwrap();

        let mut pong = Message::new(MessageType::Pong, 0, 7, Bytes::new());
        pong.timestamp = i64::MIN;
        sock.write_all(&pong.to_bytes().unwrap()).await.unwrap();
        sock.write_all(
            &Message::data(0, 7, Bytes::from_static(b"after"))
                .to_bytes()
                .unwrap(),
        )
        .await
        .unwrap();

        // Hold the socket open, discarding whatever the client sends
        let mut buf = [0u8; 256];
        while sock.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let mut client = Client::new(NetConfig::default());
    let mut client_rx = client.take_event_receiver().unwrap();
    client.connect(addr).await.unwrap();
    assert_eq!(client.local_peer_id(), 7);

    let event = wait_for(&mut client_rx, |e| {
        matches!(e, ClientEvent::MessageReceived { .. })
    })
    .await;
    match event {
        ClientEvent::MessageReceived { message } => {
            assert_eq!(&message.payload[..], b"after");
        }
        _ => unreachable!(),
    }

    client.disconnect().await;
    fake_server.abort();
}

#[tokio::test]
async fn disconnect_resets_client_state_before_returning() {
    let (_server, _server_rx, addr) = start_server(0).await;
    let (client, _client_rx) = connect_client(addr).await;
    assert!(client.local_peer_id() > 0);

    client.disconnect().await;

    assert_eq!(client.local_peer_id(), 0);
    assert_eq!(client.state().await, PeerState::Disconnected);
    assert!(!client.is_connected().await);

    // And the client is immediately reusable
    client.connect(addr).await.unwrap();
    assert!(client.is_connected().await);
}

#[tokio::test]
async fn connect_times_out_without_server_handshake() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Accept the connection but never send the peer-id announcement
    let silent_server = tokio::spawn(async move {
        let (_sock, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut config = NetConfig::default();
    config.connect_timeout_ms = 200;
    let client = Client::new(config);

    match client.connect(addr).await {
        Err(ClientError::Timeout) => {}
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert_eq!(client.state().await, PeerState::Disconnected);

    silent_server.abort();
}
