//! Drives a receiving node with a hand-written peer speaking the wire protocol.

mod common;

use common::*;
use lanshare_core::transfer::constants::{MAX_MSG_SIZE, TRANSFER_PROTOCOL_VERSION};
use lanshare_core::transfer::protocol::{TransferHeader, TransferMsg, recv_msg, send_chunk, send_msg};
use lanshare_core::transfer::{ChecksumAlgorithm, SessionState};
use lanshare_core::{AppEvent, FailureReason, RejectReason, TransferId, TransferOutcome};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

const CHUNK: usize = 16 * 1024;

fn header(sender_id: &str, file_size: u64) -> TransferHeader {
    TransferHeader {
        version: TRANSFER_PROTOCOL_VERSION,
        transfer_id: TransferId::new(),
        sender_id: sender_id.to_string(),
        sender_name: "Raw".to_string(),
        file_name: "raw.bin".to_string(),
        file_size,
        chunk_size: CHUNK,
        checksum: ChecksumAlgorithm::Blake3,
    }
}

async fn offer(addr: SocketAddr, header: &TransferHeader) -> (OwnedReadHalf, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    send_msg(&mut write, &TransferMsg::Offer(header.clone()))
        .await
        .unwrap();
    (read, write)
}

async fn next_msg(read: &mut OwnedReadHalf) -> TransferMsg {
    tokio::time::timeout(WAIT, recv_msg(read))
        .await
        .expect("message in time")
        .expect("well-formed message")
}

async fn receiver_node(dir: &std::path::Path, tweak: impl FnOnce(&mut lanshare_core::AppConfig)) -> Node {
    let mut config = test_config("Receiver", dir);
    tweak(&mut config);
    start_node(config).await
}

#[tokio::test]
async fn test_stalled_sender_times_out() {
    let dst = tempfile::tempdir().unwrap();
    let mut node = receiver_node(dst.path(), |c| c.transfer.idle_timeout_ms = 300).await;
    let addr = node.backend.transfer_addr();

    let h = header("raw-00000001", 64 * 1024);
    let (mut read, mut write) = offer(addr, &h).await;
    assert_eq!(next_msg(&mut read).await, TransferMsg::Accept { chunk_size: CHUNK });
    send_chunk(&mut write, 0, &[7u8; CHUNK]).await.unwrap();
    // ...and then nothing

    assert_eq!(
        node.wait_finished(h.transfer_id).await,
        TransferOutcome::Failed(FailureReason::Timeout)
    );
    assert!(dir_entries(dst.path()).is_empty(), "partial file was kept");
    assert!(node.backend.manager().list_active().is_empty());
    // The receiver hung up
    assert!(
        tokio::time::timeout(WAIT, recv_msg(&mut read))
            .await
            .unwrap()
            .is_err()
    );
}

#[tokio::test]
async fn test_cancel_active_receive_notifies_sender() {
    let dst = tempfile::tempdir().unwrap();
    let mut node = receiver_node(dst.path(), |_| {}).await;
    let addr = node.backend.transfer_addr();

    let h = header("raw-00000002", 64 * 1024);
    let (mut read, mut write) = offer(addr, &h).await;
    assert_eq!(next_msg(&mut read).await, TransferMsg::Accept { chunk_size: CHUNK });
    send_chunk(&mut write, 0, &[1u8; CHUNK]).await.unwrap();

    let id = h.transfer_id;
    node.wait_for(|ev| match ev {
        AppEvent::TransferStateChanged(p)
            if p.session_id == id && p.state == SessionState::Transferring =>
        {
            Some(())
        }
        _ => None,
    })
    .await;
    assert_eq!(node.backend.manager().list_active().len(), 1);

    node.backend.manager().cancel(id);
    assert_eq!(next_msg(&mut read).await, TransferMsg::Cancel);
    assert_eq!(node.wait_finished(id).await, TransferOutcome::Cancelled);
    assert!(dir_entries(dst.path()).is_empty(), "partial file was kept");

    // Cancelling a finished session does nothing
    node.backend.manager().cancel(id);
}

#[tokio::test]
async fn test_peer_cancel_ends_receive() {
    let dst = tempfile::tempdir().unwrap();
    let mut node = receiver_node(dst.path(), |_| {}).await;
    let addr = node.backend.transfer_addr();

    let h = header("raw-00000003", 64 * 1024);
    let (mut read, mut write) = offer(addr, &h).await;
    assert_eq!(next_msg(&mut read).await, TransferMsg::Accept { chunk_size: CHUNK });
    send_chunk(&mut write, 0, &[1u8; CHUNK]).await.unwrap();
    send_msg(&mut write, &TransferMsg::Cancel).await.unwrap();

    assert_eq!(
        node.wait_finished(h.transfer_id).await,
        TransferOutcome::Cancelled
    );
    assert!(dir_entries(dst.path()).is_empty());
}

#[tokio::test]
async fn test_out_of_order_chunk_is_a_protocol_violation() {
    let dst = tempfile::tempdir().unwrap();
    let mut node = receiver_node(dst.path(), |_| {}).await;
    let addr = node.backend.transfer_addr();

    let h = header("raw-00000004", 64 * 1024);
    let (mut read, mut write) = offer(addr, &h).await;
    assert_eq!(next_msg(&mut read).await, TransferMsg::Accept { chunk_size: CHUNK });
    send_chunk(&mut write, CHUNK as u64, &[1u8; CHUNK])
        .await
        .unwrap();

    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Abort {
            reason: FailureReason::ProtocolViolation
        }
    );
    assert_eq!(
        node.wait_finished(h.transfer_id).await,
        TransferOutcome::Failed(FailureReason::ProtocolViolation)
    );
    assert!(dir_entries(dst.path()).is_empty());
}

#[tokio::test]
async fn test_oversized_chunk_is_refused() {
    let dst = tempfile::tempdir().unwrap();
    let mut node = receiver_node(dst.path(), |_| {}).await;
    let addr = node.backend.transfer_addr();

    let h = header("raw-00000005", 1024 * 1024);
    let (mut read, mut write) = offer(addr, &h).await;
    assert_eq!(next_msg(&mut read).await, TransferMsg::Accept { chunk_size: CHUNK });
    let _ = send_chunk(&mut write, 0, &vec![1u8; CHUNK * 2]).await;

    assert_eq!(
        node.wait_finished(h.transfer_id).await,
        TransferOutcome::Failed(FailureReason::ProtocolViolation)
    );
}

#[tokio::test]
async fn test_first_message_must_be_an_offer() {
    let dst = tempfile::tempdir().unwrap();
    let node = receiver_node(dst.path(), |_| {}).await;

    let stream = TcpStream::connect(node.backend.transfer_addr())
        .await
        .unwrap();
    let (mut read, mut write) = stream.into_split();
    send_msg(&mut write, &TransferMsg::Ack { bytes: 0 })
        .await
        .unwrap();
    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Abort {
            reason: FailureReason::ProtocolViolation
        }
    );
}

#[tokio::test]
async fn test_oversized_control_frame_drops_connection() {
    let dst = tempfile::tempdir().unwrap();
    let node = receiver_node(dst.path(), |_| {}).await;

    let stream = TcpStream::connect(node.backend.transfer_addr())
        .await
        .unwrap();
    let (mut read, mut write) = stream.into_split();
    let mut head = vec![0x01];
    head.extend_from_slice(&((MAX_MSG_SIZE + 1) as u32).to_be_bytes());
    write.write_all(&head).await.unwrap();
    let _ = write.write_all(&[b'{'; 64]).await;

    let reply = tokio::time::timeout(WAIT, recv_msg(&mut read)).await.unwrap();
    assert!(reply.is_err(), "expected the connection to close, got {:?}", reply);
}

#[tokio::test]
async fn test_unsupported_version_is_rejected() {
    let dst = tempfile::tempdir().unwrap();
    let node = receiver_node(dst.path(), |_| {}).await;

    let mut h = header("raw-00000006", 10);
    h.version = TRANSFER_PROTOCOL_VERSION + 1;
    let (mut read, _write) = offer(node.backend.transfer_addr(), &h).await;
    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Reject {
            reason: RejectReason::UnsupportedVersion
        }
    );
}

#[tokio::test]
async fn test_duplicate_and_concurrency_limits() {
    let dst = tempfile::tempdir().unwrap();
    let mut node = receiver_node(dst.path(), |c| {
        c.transfer.auto_accept = false;
        c.transfer.max_concurrent_transfers = 2;
    })
    .await;
    let addr = node.backend.transfer_addr();

    // First offer waits for the user and holds a slot
    let first = header("raw-alpha", 100);
    let (mut first_read, _first_write) = offer(addr, &first).await;
    node.wait_for(|ev| matches!(ev, AppEvent::IncomingRequest { .. }).then_some(()))
        .await;

    // Same transfer id again
    let mut dup = header("raw-beta", 100);
    dup.transfer_id = first.transfer_id;
    let (mut read, _w1) = offer(addr, &dup).await;
    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Reject {
            reason: RejectReason::DuplicateTransfer
        }
    );

    // Second transfer from the same peer
    let (mut read, _w2) = offer(addr, &header("raw-alpha", 100)).await;
    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Reject {
            reason: RejectReason::TooManyTransfers
        }
    );

    // Another peer takes the second global slot...
    let (_r3, _w3) = offer(addr, &header("raw-gamma", 100)).await;
    node.wait_for(|ev| matches!(ev, AppEvent::IncomingRequest { .. }).then_some(()))
        .await;

    // ...so a third peer is turned away
    let (mut read, _w4) = offer(addr, &header("raw-delta", 100)).await;
    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Reject {
            reason: RejectReason::TooManyTransfers
        }
    );

    assert_eq!(node.backend.manager().pending_requests().len(), 2);
    assert!(
        node.backend
            .manager()
            .respond_incoming(first.transfer_id, false)
    );
    assert_eq!(
        next_msg(&mut first_read).await,
        TransferMsg::Reject {
            reason: RejectReason::Declined
        }
    );
}

#[tokio::test]
async fn test_unanswered_request_is_declined() {
    let dst = tempfile::tempdir().unwrap();
    let node = receiver_node(dst.path(), |c| {
        c.transfer.auto_accept = false;
        c.transfer.accept_timeout_ms = 200;
    })
    .await;

    let (mut read, _write) = offer(node.backend.transfer_addr(), &header("raw-00000008", 10)).await;
    let started = std::time::Instant::now();
    assert_eq!(
        next_msg(&mut read).await,
        TransferMsg::Reject {
            reason: RejectReason::Declined
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(node.backend.manager().pending_requests().is_empty());
}

#[tokio::test]
async fn test_cancel_while_receiver_stops_reading() {
    let src = tempfile::tempdir().unwrap();
    let mut config = test_config("Sender", src.path());
    config.transfer.idle_timeout_ms = 10_000;
    config.transfer.socket_buffer_size = 64 * 1024;
    let mut node = start_node(config).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    node.introduce_peer("raw-stalled", "Stalled", listener.local_addr().unwrap())
        .await;
    let path = write_test_file(src.path(), "big.bin", 32 * 1024 * 1024);
    let id = node
        .backend
        .manager()
        .initiate_send("raw-stalled", &path)
        .await
        .unwrap();

    let (stream, _) = listener.accept().await.unwrap();
    let (mut read, mut write) = stream.into_split();
    assert!(matches!(next_msg(&mut read).await, TransferMsg::Offer(_)));
    send_msg(&mut write, &TransferMsg::Accept { chunk_size: 4096 })
        .await
        .unwrap();
    // Nothing is read from here on, so the sender ends up blocked on a full socket
    tokio::time::sleep(Duration::from_millis(800)).await;

    let started = std::time::Instant::now();
    node.backend.manager().cancel(id);
    assert_eq!(
        node.wait_finished_within(id, Duration::from_secs(5)).await,
        TransferOutcome::Cancelled
    );
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    assert!(node.backend.manager().list_active().is_empty());
}
