use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::constants::{FRAME_QUEUE_DEPTH, MAX_MSG_SIZE, NOTIFY_TIMEOUT};
use super::hash::ChecksumAlgorithm;
use super::session::TransferId;
use crate::error::{FailureReason, RejectReason, TransferError};

const TAG_CONTROL: u8 = 0x01;
const TAG_DATA: u8 = 0x02;

/// Header sent by the sender when the connection opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub version: u32,
    pub transfer_id: TransferId,
    pub sender_id: String,
    pub sender_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: usize,
    pub checksum: ChecksumAlgorithm,
}

/// Control messages exchanged on a transfer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMsg {
    Offer(TransferHeader),
    Accept { chunk_size: usize },
    Reject { reason: RejectReason },
    /// Cumulative bytes written by the receiver
    Ack { bytes: u64 },
    Finish { checksum: String },
    Verdict { ok: bool },
    Cancel,
    Abort { reason: FailureReason },
}

impl TransferMsg {
    /// What to tell the peer when a session ends with `err`, if anything.
    /// Nothing is sent when the peer caused the error or the link is gone.
    pub fn for_error(err: &TransferError) -> Option<TransferMsg> {
        match err {
            TransferError::Cancelled => Some(TransferMsg::Cancel),
            TransferError::Disk(_) => Some(TransferMsg::Abort {
                reason: FailureReason::DiskError,
            }),
            TransferError::Protocol(_) => Some(TransferMsg::Abort {
                reason: FailureReason::ProtocolViolation,
            }),
            _ => None,
        }
    }
}

/// A decoded frame: either a control message or a chunk of file data.
#[derive(Debug)]
pub enum Frame {
    Control(TransferMsg),
    Data { offset: u64, payload: Bytes },
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("malformed control message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected data frame")]
    UnexpectedData,
}

/// Send a control message as a length-prefixed JSON frame
pub async fn send_msg<W>(send: &mut W, msg: &TransferMsg) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_MSG_SIZE {
        return Err(FrameError::TooLarge(json.len()));
    }
    let mut head = [0u8; 5];
    head[0] = TAG_CONTROL;
    head[1..].copy_from_slice(&(json.len() as u32).to_be_bytes());
    send.write_all(&head).await?;
    send.write_all(&json).await?;
    send.flush().await?;
    Ok(())
}

/// Send one chunk of file data starting at `offset`
pub async fn send_chunk<W>(send: &mut W, offset: u64, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut head = [0u8; 13];
    head[0] = TAG_DATA;
    head[1..5].copy_from_slice(&((data.len() + 8) as u32).to_be_bytes());
    head[5..].copy_from_slice(&offset.to_be_bytes());
    send.write_all(&head).await?;
    send.write_all(data).await?;
    Ok(())
}

/// Receive the next frame. Data frames are refused when `max_data` is `None`.
pub async fn recv_frame<R>(recv: &mut R, max_data: Option<usize>) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 5];
    recv.read_exact(&mut head).await?;
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;

    match head[0] {
        TAG_CONTROL => {
            if len > MAX_MSG_SIZE {
                return Err(FrameError::TooLarge(len));
            }
            let mut buf = vec![0u8; len];
            recv.read_exact(&mut buf).await?;
            Ok(Frame::Control(serde_json::from_slice(&buf)?))
        }
        TAG_DATA => {
            let max_data = max_data.ok_or(FrameError::UnexpectedData)?;
            if len < 8 || len - 8 > max_data {
                return Err(FrameError::TooLarge(len));
            }
            let mut buf = BytesMut::zeroed(len);
            recv.read_exact(&mut buf).await?;
            let offset = buf.get_u64();
            Ok(Frame::Data {
                offset,
                payload: buf.freeze(),
            })
        }
        tag => Err(FrameError::UnknownTag(tag)),
    }
}

/// Receive a control message; a data frame is an error here
pub async fn recv_msg<R>(recv: &mut R) -> Result<TransferMsg, FrameError>
where
    R: AsyncRead + Unpin,
{
    match recv_frame(recv, None).await? {
        Frame::Control(msg) => Ok(msg),
        Frame::Data { .. } => Err(FrameError::UnexpectedData),
    }
}

/// Background task reading frames off a socket into a bounded queue.
///
/// The queue holds at most `FRAME_QUEUE_DEPTH` frames, so a slow disk pushes
/// back on the socket instead of growing memory. The task is aborted on drop.
pub struct FrameReader {
    rx: mpsc::Receiver<Result<Frame, FrameError>>,
    task: JoinHandle<()>,
}

impl FrameReader {
    pub fn spawn<R>(mut recv: R, max_data: Option<usize>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let task = tokio::spawn(async move {
            loop {
                let frame = recv_frame(&mut recv, max_data).await;
                let stop = frame.is_err();
                if tx.send(frame).await.is_err() || stop {
                    break;
                }
            }
        });
        Self { rx, task }
    }

    /// Next frame, or `None` once the reader stopped after reporting an error
    pub async fn next(&mut self) -> Option<Result<Frame, FrameError>> {
        self.rx.recv().await
    }

    /// Next control message; data frames and a closed stream are errors
    pub async fn next_msg(&mut self) -> Result<TransferMsg, TransferError> {
        control_only(self.rx.recv().await)
    }

    /// A control message if one is already queued
    pub fn try_next_msg(&mut self) -> Result<Option<TransferMsg>, TransferError> {
        match self.rx.try_recv() {
            Ok(frame) => control_only(Some(frame)).map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => control_only(None).map(Some),
        }
    }
}

fn control_only(frame: Option<Result<Frame, FrameError>>) -> Result<TransferMsg, TransferError> {
    match frame {
        Some(Ok(Frame::Control(msg))) => Ok(msg),
        Some(Ok(Frame::Data { .. })) => Err(FrameError::UnexpectedData.into()),
        Some(Err(e)) => Err(e.into()),
        None => Err(TransferError::ConnectionLost(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        ))),
    }
}

/// Best-effort message to the peer on the way out; errors are only logged
pub async fn notify_peer<W>(send: &mut W, msg: &TransferMsg)
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(NOTIFY_TIMEOUT, send_msg(send, msg)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Could not send {:?} to peer: {}", msg, e),
        Err(_) => tracing::debug!("Timed out sending {:?} to peer", msg),
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}
