mod common;

use common::*;
use lanshare_core::discovery::encode_packet;
use lanshare_core::{
    AppCommand, AppEvent, DISCOVERY_PROTOCOL_VERSION, DiscoveryPacket, EventBus, PacketKind,
    PeerStatus, TransferOutcome, run_backend,
};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

fn discovery_addr(node: &Node) -> SocketAddr {
    node.backend.discovery().local_addr().unwrap()
}

async fn wait_for_peer(node: &mut Node, peer_id: &str) -> lanshare_core::Peer {
    node.wait_for(|ev| match ev {
        AppEvent::PeerListChanged(peers) => peers.iter().find(|p| p.peer_id == peer_id).cloned(),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn test_announce_and_reply() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut alpha = start_node(test_config("Alpha", dir.path())).await;
    let mut beta = start_node(test_config("Beta", dir.path())).await;

    // Alpha announces; Beta learns Alpha and replies so Alpha learns Beta
    alpha
        .backend
        .discovery()
        .announce_to(discovery_addr(&beta))
        .await;

    let seen_by_beta = wait_for_peer(&mut beta, &alpha.id()).await;
    assert_eq!(seen_by_beta.display_name, "Alpha");
    assert_eq!(seen_by_beta.addr.port(), alpha.backend.transfer_addr().port());
    assert_eq!(seen_by_beta.status, PeerStatus::Online);

    let seen_by_alpha = wait_for_peer(&mut alpha, &beta.id()).await;
    assert_eq!(seen_by_alpha.display_name, "Beta");
    assert_eq!(seen_by_alpha.addr, beta.backend.transfer_addr());

    // Neither lists itself
    let own = alpha.id();
    assert!(
        alpha
            .backend
            .registry()
            .read()
            .await
            .snapshot()
            .iter()
            .all(|p| p.peer_id != own)
    );
}

#[tokio::test]
async fn test_discovered_peer_receives_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let mut alpha = start_node(test_config("Alpha", src.path())).await;
    let mut beta = start_node(test_config("Beta", dst.path())).await;

    beta.backend
        .discovery()
        .announce_to(discovery_addr(&alpha))
        .await;
    wait_for_peer(&mut alpha, &beta.id()).await;

    let path = write_test_file(src.path(), "hello.txt", 4321);
    let id = alpha
        .backend
        .manager()
        .initiate_send(&beta.id(), &path)
        .await
        .unwrap();
    assert_eq!(alpha.wait_finished(id).await, TransferOutcome::Completed);
    assert_eq!(beta.wait_finished(id).await, TransferOutcome::Completed);
    assert_eq!(
        std::fs::read(dst.path().join("hello.txt")).unwrap(),
        std::fs::read(&path).unwrap()
    );
}

#[tokio::test]
async fn test_foreign_and_malformed_datagrams_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = start_node(test_config("Node", dir.path())).await;
    let target = discovery_addr(&node);
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut future = encode_packet(&DiscoveryPacket {
        version: DISCOVERY_PROTOCOL_VERSION + 1,
        kind: PacketKind::Announce,
        instance_id: "future-00000001".to_string(),
        display_name: "Future".to_string(),
        transfer_port: 9000,
    });
    socket.send_to(&future, target).await.unwrap();
    future.truncate(10);
    socket.send_to(&future, target).await.unwrap();
    socket.send_to(b"P2PLT\0{}", target).await.unwrap();
    socket.send_to(&[0xFF; 300], target).await.unwrap();

    // A valid packet sent last; once it is in, the earlier ones were processed
    let valid = encode_packet(&DiscoveryPacket {
        version: DISCOVERY_PROTOCOL_VERSION,
        kind: PacketKind::Reply,
        instance_id: "real-00000002".to_string(),
        display_name: "Real".to_string(),
        transfer_port: 9001,
    });
    socket.send_to(&valid, target).await.unwrap();
    wait_for_peer(&mut node, "real-00000002").await;

    let peers = node.backend.registry().read().await.snapshot();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].addr.port(), 9001);
}

#[tokio::test]
async fn test_own_packets_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(test_config("Node", dir.path())).await;
    let discovery = node.backend.discovery();

    let own = encode_packet(&DiscoveryPacket {
        version: DISCOVERY_PROTOCOL_VERSION,
        kind: PacketKind::Announce,
        instance_id: node.id(),
        display_name: "Node".to_string(),
        transfer_port: node.backend.transfer_addr().port(),
    });
    let from: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    assert!(!discovery.handle_datagram(&own, from).await);
    assert!(node.backend.registry().read().await.is_empty());
}

#[tokio::test]
async fn test_restarted_instance_replaces_old_entry() {
    let dir = tempfile::tempdir().unwrap();
    let node = start_node(test_config("Node", dir.path())).await;
    let discovery = node.backend.discovery();
    let from: SocketAddr = "127.0.0.1:40001".parse().unwrap();

    let packet = |id: &str| {
        encode_packet(&DiscoveryPacket {
            version: DISCOVERY_PROTOCOL_VERSION,
            kind: PacketKind::Announce,
            instance_id: id.to_string(),
            display_name: "Laptop".to_string(),
            transfer_port: 9100,
        })
    };
    assert!(discovery.handle_datagram(&packet("laptop-aaaaaaaa"), from).await);
    // A repeat announcement changes nothing
    assert!(!discovery.handle_datagram(&packet("laptop-aaaaaaaa"), from).await);
    assert!(discovery.handle_datagram(&packet("laptop-bbbbbbbb"), from).await);

    let peers = node.backend.registry().read().await.snapshot();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id, "laptop-bbbbbbbb");
}

#[tokio::test]
async fn test_run_backend_stops_when_commands_close() {
    let dir = tempfile::tempdir().unwrap();
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let backend = tokio::spawn(run_backend(test_config("Node", dir.path()), cmd_rx, bus));

    cmd_tx.send(AppCommand::Rescan).await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(AppEvent::Status(msg)) = events.recv().await {
                if msg.starts_with("Scanning") {
                    break;
                }
            }
        }
    })
    .await
    .expect("rescan acknowledged");

    drop(cmd_tx);
    let result = tokio::time::timeout(WAIT, backend).await.unwrap().unwrap();
    assert!(result.is_ok());
}
