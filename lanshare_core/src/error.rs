//! Error types shared across discovery, sessions and the transfer manager.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::transfer::protocol::FrameError;

/// Why a receiver declined an offered transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RejectReason {
    #[error("declined by user")]
    Declined,
    #[error("not enough free disk space")]
    InsufficientDiskSpace,
    #[error("too many concurrent transfers")]
    TooManyTransfers,
    #[error("file exceeds the allowed size")]
    FileTooLarge,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("transfer id already in use")]
    DuplicateTransfer,
}

/// Terminal failure reason of a session. Cancellation is not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FailureReason {
    #[error("network unavailable")]
    NetworkUnavailable,
    #[error("peer unreachable")]
    PeerUnreachable,
    #[error("peer rejected the transfer: {0}")]
    PeerRejected(RejectReason),
    #[error("checksum mismatch")]
    IntegrityMismatch,
    #[error("disk read/write failure")]
    DiskError,
    #[error("no progress within the timeout")]
    Timeout,
    #[error("protocol violation")]
    ProtocolViolation,
}

impl FailureReason {
    /// Short message shown in place of the progress bar.
    pub fn user_message(&self) -> String {
        match self {
            FailureReason::NetworkUnavailable => "Network unavailable".to_string(),
            FailureReason::PeerUnreachable => "Peer unreachable".to_string(),
            FailureReason::PeerRejected(RejectReason::Declined) => {
                "Transfer declined by peer".to_string()
            }
            FailureReason::PeerRejected(reason) => format!("Peer rejected: {}", reason),
            FailureReason::IntegrityMismatch => "File corrupted in transit".to_string(),
            FailureReason::DiskError => "Disk error".to_string(),
            FailureReason::Timeout => "Transfer stalled".to_string(),
            FailureReason::ProtocolViolation => "Incompatible peer".to_string(),
        }
    }
}

/// Internal error raised while driving a session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("cannot connect to peer: {0}")]
    Unreachable(#[source] io::Error),
    #[error("network unavailable: {0}")]
    NetworkUnavailable(#[source] io::Error),
    #[error("connection lost: {0}")]
    ConnectionLost(#[source] io::Error),
    #[error("disk error: {0}")]
    Disk(#[source] io::Error),
    #[error("no progress for {0:?}")]
    Timeout(std::time::Duration),
    #[error("rejected by peer: {0}")]
    Rejected(RejectReason),
    #[error("checksum mismatch")]
    IntegrityMismatch,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("peer aborted: {0}")]
    PeerAborted(FailureReason),
    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Failure reason for this error, `None` when the session was cancelled.
    pub fn reason(&self) -> Option<FailureReason> {
        match self {
            TransferError::Unreachable(_) => Some(FailureReason::PeerUnreachable),
            TransferError::NetworkUnavailable(_) => Some(FailureReason::NetworkUnavailable),
            TransferError::ConnectionLost(_) => Some(FailureReason::PeerUnreachable),
            TransferError::Disk(_) => Some(FailureReason::DiskError),
            TransferError::Timeout(_) => Some(FailureReason::Timeout),
            TransferError::Rejected(r) => Some(FailureReason::PeerRejected(*r)),
            TransferError::IntegrityMismatch => Some(FailureReason::IntegrityMismatch),
            TransferError::Protocol(_) => Some(FailureReason::ProtocolViolation),
            TransferError::PeerAborted(r) => Some(*r),
            TransferError::Cancelled => None,
        }
    }

    /// Classify a failed connect attempt.
    pub fn from_connect(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::AddrNotAvailable => TransferError::NetworkUnavailable(e),
            _ => TransferError::Unreachable(e),
        }
    }
}

impl From<FrameError> for TransferError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => TransferError::ConnectionLost(io),
            other => TransferError::Protocol(other.to_string()),
        }
    }
}

/// Errors returned synchronously by `TransferManager` commands.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("peer {0} is not online")]
    PeerOffline(String),
    #[error("cannot read {path}: {source}")]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("too many concurrent transfers")]
    TooManyTransfers,
}

/// Discovery socket errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot bind discovery socket on {addr}: {source}")]
    NetworkUnavailable {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Fatal errors while starting the backend.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("cannot bind transfer listener on {addr}: {source}")]
    TransferListener {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
}
