use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::constants::MIN_CHUNK_SIZE;
use super::hash::Checksum;
use super::protocol::{Frame, FrameReader, TransferMsg, notify_peer, send_msg};
use super::session::{SessionState, TransferSession};
use super::utils::{PartialFile, create_unique_file, sanitize_file_name};
use crate::config::TransferConfig;
use crate::error::TransferError;

const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// Chunk size the receiver agrees to for a proposal
pub fn negotiate_chunk_size(proposed: usize, max_chunk_size: usize) -> usize {
    proposed.clamp(MIN_CHUNK_SIZE, max_chunk_size.max(MIN_CHUNK_SIZE))
}

/// Accept an offer that passed the accept policy and receive the file.
///
/// The destination is created under `download_dir` without overwriting
/// anything and removed again on every exit path except success.
pub async fn receive_file(
    session: &mut TransferSession,
    read_half: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    download_dir: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf, TransferError> {
    let result =
        accept_and_receive(session, read_half, &mut writer, download_dir, config, cancel).await;
    if let Err(e) = &result {
        if let Some(msg) = TransferMsg::for_error(e) {
            notify_peer(&mut writer, &msg).await;
        }
    }
    let _ = writer.shutdown().await;
    result
}

async fn accept_and_receive(
    session: &mut TransferSession,
    read_half: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    download_dir: &Path,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<PathBuf, TransferError> {
    let file_name = sanitize_file_name(&session.request().file_name);
    let (path, file) = create_unique_file(download_dir, &file_name)
        .await
        .map_err(TransferError::Disk)?;
    // `file` is rebound after the guard so the handle closes before removal
    let partial = PartialFile::new(path);
    let mut file = file;
    session.set_destination(partial.path().to_path_buf());
    tracing::info!(
        "Receiving {:?} ({} bytes) from {} into {:?}",
        session.request().file_name,
        session.total_size(),
        session.request().source.display_name,
        partial.path()
    );

    let chunk_size = negotiate_chunk_size(session.request().chunk_size, config.max_chunk_size);
    session.set_chunk_size(chunk_size);
    send_msg(writer, &TransferMsg::Accept { chunk_size }).await?;
    session.set_state(SessionState::Transferring);

    let mut reader = FrameReader::spawn(read_half, Some(chunk_size));
    let (ours, theirs) =
        receive_chunks(session, &mut file, writer, &mut reader, config, cancel).await?;

    file.flush().await.map_err(TransferError::Disk)?;
    // Syncing gigabytes can outlast the sender's idle timeout
    let written = session.bytes_transferred();
    let period = keepalive_period(config.idle_timeout());
    keep_alive_while(file.sync_all(), writer, written, period, cancel)
        .await?
        .map_err(TransferError::Disk)?;
    drop(file);

    if ours != theirs {
        tracing::warn!(
            "Checksum mismatch for {:?}: expected {}, computed {}",
            partial.path(),
            theirs,
            ours
        );
        notify_peer(writer, &TransferMsg::Verdict { ok: false }).await;
        return Err(TransferError::IntegrityMismatch);
    }

    if let Err(e) = send_msg(writer, &TransferMsg::Verdict { ok: true }).await {
        // The file is complete and verified; only the sender misses the verdict
        tracing::warn!("Could not confirm transfer {} to sender: {}", session.id(), e);
    }
    Ok(partial.persist())
}

/// Ack interval while the receiver is busy without reading frames
pub fn keepalive_period(idle: Duration) -> Duration {
    (idle / 3).max(MIN_KEEPALIVE)
}

/// Await `work`, repeating `Ack { bytes }` to the sender every `period` so
/// its idle timer keeps being reset. The work's own result is returned as is.
pub async fn keep_alive_while<F, T, W>(
    work: F,
    writer: &mut W,
    bytes: u64,
    period: Duration,
    cancel: &CancellationToken,
) -> Result<T, TransferError>
where
    F: Future<Output = T>,
    W: AsyncWrite + Unpin,
{
    tokio::pin!(work);
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            out = &mut work => return Ok(out),
            _ = keepalive.tick() => send_msg(writer, &TransferMsg::Ack { bytes }).await?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        }
    }
}

/// Write data frames until the sender's `Finish`.
/// Returns `(local digest, sender digest)`.
async fn receive_chunks(
    session: &mut TransferSession,
    file: &mut File,
    writer: &mut OwnedWriteHalf,
    reader: &mut FrameReader,
    config: &TransferConfig,
    cancel: &CancellationToken,
) -> Result<(String, String), TransferError> {
    let idle = config.idle_timeout();
    let ack_interval = config.ack_interval_bytes;
    let mut next_ack = ack_interval;
    let mut checksum = Checksum::new(session.request().checksum);
    let mut ticker = tokio::time::interval(config.progress_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    if session.remaining() == 0 {
        session.set_state(SessionState::Verifying);
    }

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            frame = reader.next() => frame,
            _ = ticker.tick() => {
                session.tick();
                if session.idle_for() >= idle {
                    return Err(TransferError::Timeout(idle));
                }
                continue;
            }
        };

        match frame {
            Some(Ok(Frame::Data { offset, payload })) => {
                let expected = session.bytes_transferred();
                if offset != expected {
                    return Err(TransferError::Protocol(format!(
                        "chunk at offset {}, expected {}",
                        offset, expected
                    )));
                }
                if payload.len() as u64 > session.remaining() {
                    return Err(TransferError::Protocol(format!(
                        "{} byte chunk with {} bytes left",
                        payload.len(),
                        session.remaining()
                    )));
                }

                file.write_all(&payload).await.map_err(TransferError::Disk)?;
                checksum.update(&payload);
                session.add_bytes(payload.len())?;

                let written = session.bytes_transferred();
                let done = session.remaining() == 0;
                if ack_interval > 0 && (written >= next_ack || done) {
                    send_msg(writer, &TransferMsg::Ack { bytes: written }).await?;
                    next_ack = written.saturating_add(ack_interval);
                }
                if done {
                    session.set_state(SessionState::Verifying);
                }
            }
            Some(Ok(Frame::Control(msg))) => match msg {
                TransferMsg::Finish { checksum: theirs } => {
                    if session.remaining() != 0 {
                        return Err(TransferError::Protocol(format!(
                            "Finish after {} of {} bytes",
                            session.bytes_transferred(),
                            session.total_size()
                        )));
                    }
                    return Ok((checksum.finalize(), theirs));
                }
                TransferMsg::Cancel => return Err(TransferError::Cancelled),
                TransferMsg::Abort { reason } => return Err(TransferError::PeerAborted(reason)),
                other => {
                    return Err(TransferError::Protocol(format!(
                        "unexpected {:?} from sender",
                        other
                    )));
                }
            },
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(TransferError::ConnectionLost(std::io::Error::from(
                    std::io::ErrorKind::UnexpectedEof,
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::constants::MAX_CHUNK_SIZE;

    #[test]
    fn test_negotiate_chunk_size() {
        assert_eq!(negotiate_chunk_size(1024 * 1024, MAX_CHUNK_SIZE), 1024 * 1024);
        assert_eq!(negotiate_chunk_size(64 * 1024 * 1024, MAX_CHUNK_SIZE), MAX_CHUNK_SIZE);
        assert_eq!(negotiate_chunk_size(1, MAX_CHUNK_SIZE), MIN_CHUNK_SIZE);
        // A misconfigured maximum never drops below the minimum
        assert_eq!(negotiate_chunk_size(8192, 16), MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_keepalive_period_fits_idle_timeout() {
        assert_eq!(keepalive_period(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(keepalive_period(Duration::ZERO), MIN_KEEPALIVE);
    }

    #[tokio::test]
    async fn test_slow_sync_keeps_sender_alive() {
        let (mut ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut sender_side = FrameReader::spawn(theirs, None);
        let cancel = CancellationToken::new();

        let slow = async {
            tokio::time::sleep(Duration::from_millis(450)).await;
            "synced"
        };
        let out = keep_alive_while(slow, &mut ours, 4096, Duration::from_millis(100), &cancel)
            .await
            .unwrap();
        assert_eq!(out, "synced");

        // Roughly one Ack per period while the work ran
        drop(ours);
        let mut acks = 0;
        while let Ok(msg) = sender_side.next_msg().await {
            assert_eq!(msg, TransferMsg::Ack { bytes: 4096 });
            acks += 1;
        }
        assert!((3..=5).contains(&acks), "{} acks", acks);
    }

    #[tokio::test]
    async fn test_keep_alive_while_honours_cancel() {
        let (mut ours, _theirs) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let never = std::future::pending::<()>();
        assert!(matches!(
            keep_alive_while(never, &mut ours, 0, Duration::from_secs(1), &cancel).await,
            Err(TransferError::Cancelled)
        ));
    }
}
