use std::io;
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;

use super::constants::{CANCEL_FLUSH_TIMEOUT, MIN_CHUNK_SIZE, TRANSFER_PROTOCOL_VERSION};
use super::hash::Checksum;
use super::protocol::{FrameError, FrameReader, TransferMsg, notify_peer, send_chunk, send_msg};
use super::session::{SessionState, TransferSession};
use crate::config::TransferConfig;
use crate::error::TransferError;

/// Outgoing transfer socket with the configured send buffer.
/// A `buffer_size` of 0 keeps the system default.
pub fn outgoing_socket(target: SocketAddr, buffer_size: usize) -> io::Result<TcpSocket> {
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if buffer_size > 0 {
        let size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::debug!("Could not set SO_SNDBUF to {}: {}", size, e);
        }
    }
    Ok(socket)
}

/// Connect to `target`, honouring the connect timeout and cancellation
pub async fn connect(
    target: SocketAddr,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<TcpStream, TransferError> {
    let connect_timeout = config.connect_timeout();
    let socket =
        outgoing_socket(target, config.socket_buffer_size).map_err(TransferError::from_connect)?;
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        r = timeout(connect_timeout, socket.connect(target)) => match r {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransferError::from_connect(e)),
            Err(_) => {
                return Err(TransferError::Unreachable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer from {} within {:?}", target, connect_timeout),
                )));
            }
        },
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not set TCP_NODELAY: {}", e);
    }
    Ok(stream)
}

/// Send the file at `path` to the transfer listener at `target`.
///
/// Drives `session` through negotiation, streaming and verification. The
/// caller turns the result into the session outcome.
pub async fn send_file(
    session: &mut TransferSession,
    target: SocketAddr,
    path: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let mut file = File::open(path).await.map_err(TransferError::Disk)?;

    tracing::info!(
        "Sending {:?} ({} bytes) to {} at {}",
        session.request().file_name,
        session.total_size(),
        session.request().destination.display_name,
        target
    );
    let stream = connect(target, config, cancel).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = FrameReader::spawn(read_half, None);

    let result = drive(session, &mut file, &mut writer, &mut reader, config, cancel).await;
    match &result {
        Err(Interrupted::MidFrame) => {
            // The stream ends inside a chunk; nothing more can be framed after it
            tracing::debug!("Transfer {} cancelled mid-chunk, closing", session.id());
        }
        Err(Interrupted::Failed(e)) => {
            if let Some(msg) = TransferMsg::for_error(e) {
                notify_peer(&mut writer, &msg).await;
            }
        }
        Ok(()) => {}
    }
    let _ = writer.shutdown().await;
    result.map_err(TransferError::from)
}

/// How `drive` stopped
#[derive(Debug)]
enum Interrupted {
    Failed(TransferError),
    /// Cancelled while a chunk frame was half written
    MidFrame,
}

impl From<TransferError> for Interrupted {
    fn from(e: TransferError) -> Self {
        Interrupted::Failed(e)
    }
}

impl From<FrameError> for Interrupted {
    fn from(e: FrameError) -> Self {
        Interrupted::Failed(e.into())
    }
}

impl From<Interrupted> for TransferError {
    fn from(i: Interrupted) -> Self {
        match i {
            Interrupted::Failed(e) => e,
            Interrupted::MidFrame => TransferError::Cancelled,
        }
    }
}

async fn drive(
    session: &mut TransferSession,
    file: &mut File,
    writer: &mut OwnedWriteHalf,
    reader: &mut FrameReader,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(), Interrupted> {
    // 1. Offer and wait for the receiver (and possibly its user) to decide
    let header = session.request().to_header(TRANSFER_PROTOCOL_VERSION);
    send_msg(writer, &TransferMsg::Offer(header)).await?;

    let decision_timeout = config.accept_timeout() + config.handshake_timeout();
    let decision = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
        r = timeout(decision_timeout, reader.next_msg()) => {
            r.map_err(|_| TransferError::Timeout(decision_timeout))??
        }
    };

    let proposed = session.chunk_size();
    let chunk_size = match decision {
        TransferMsg::Accept { chunk_size } => chunk_size,
        TransferMsg::Reject { reason } => return Err(TransferError::Rejected(reason).into()),
        TransferMsg::Cancel => return Err(TransferError::Cancelled.into()),
        TransferMsg::Abort { reason } => return Err(TransferError::PeerAborted(reason).into()),
        other => {
            return Err(TransferError::Protocol(format!(
                "expected Accept or Reject, got {:?}",
                other
            ))
            .into());
        }
    };
    // The receiver may only shrink the proposal, or raise it to the minimum
    if chunk_size == 0 || chunk_size > proposed.max(MIN_CHUNK_SIZE) {
        return Err(TransferError::Protocol(format!(
            "receiver chose chunk size {} for proposal {}",
            chunk_size, proposed
        ))
        .into());
    }
    session.set_chunk_size(chunk_size);
    session.set_state(SessionState::Transferring);
    tracing::debug!("Transfer {} accepted, chunk size {}", session.id(), chunk_size);

    // 2. Stream the file in chunk-sized windows
    let idle = config.idle_timeout();
    let mut checksum = Checksum::new(session.request().checksum);
    let mut buffer = vec![0u8; chunk_size];
    let mut ticker = tokio::time::interval(config.progress_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while session.remaining() > 0 {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled.into());
        }
        while let Some(msg) = reader.try_next_msg()? {
            handle_control(session, msg)?;
        }

        let len = (session.remaining().min(chunk_size as u64)) as usize;
        let chunk = &mut buffer[..len];
        // A file that shrank since the offer fails here
        file.read_exact(chunk).await.map_err(TransferError::Disk)?;
        checksum.update(chunk);

        let offset = session.bytes_transferred();
        let send = send_chunk(writer, offset, chunk);
        tokio::pin!(send);
        let deadline = tokio::time::sleep(idle);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                r = &mut send => {
                    r?;
                    break;
                }
                _ = ticker.tick() => session.tick(),
                _ = cancel.cancelled() => {
                    // Let the chunk in flight land so the Cancel after it parses
                    return match timeout(CANCEL_FLUSH_TIMEOUT, &mut send).await {
                        Ok(Ok(())) => Err(TransferError::Cancelled.into()),
                        _ => Err(Interrupted::MidFrame),
                    };
                }
                _ = &mut deadline => return Err(TransferError::Timeout(idle).into()),
            }
        }
        session.add_bytes(len)?;
    }
    writer.flush().await.map_err(TransferError::ConnectionLost)?;

    // 3. Hand over the checksum and wait for the verdict
    session.set_state(SessionState::Verifying);
    let digest = checksum.finalize();
    send_msg(writer, &TransferMsg::Finish { checksum: digest }).await?;

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            r = timeout(idle, reader.next_msg()) => r.map_err(|_| TransferError::Timeout(idle))??,
        };
        match msg {
            TransferMsg::Verdict { ok: true } => return Ok(()),
            TransferMsg::Verdict { ok: false } => return Err(TransferError::IntegrityMismatch.into()),
            other => handle_control(session, other)?,
        }
    }
}

/// Messages the receiver may send while data is flowing
fn handle_control(session: &mut TransferSession, msg: TransferMsg) -> Result<(), TransferError> {
    match msg {
        TransferMsg::Ack { bytes } => {
            session.set_acknowledged(bytes);
            Ok(())
        }
        TransferMsg::Cancel => Err(TransferError::Cancelled),
        TransferMsg::Abort { reason } => Err(TransferError::PeerAborted(reason)),
        other => Err(TransferError::Protocol(format!(
            "unexpected {:?} during transfer",
            other
        ))),
    }
}
