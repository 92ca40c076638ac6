//! Transfer session bookkeeping: identifiers, the state machine and the
//! progress snapshots a session publishes while it runs.
//!
//! A `TransferSession` is owned by the task driving the transfer. Everyone
//! else observes it through a `watch` receiver of `TransferProgress` or
//! through the events it publishes, so the counters have a single writer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use super::hash::ChecksumAlgorithm;
use super::protocol::TransferHeader;
use crate::error::{FailureReason, TransferError};
use crate::events::{AppEvent, EventBus};
use crate::throughput::{SharedTracker, SpeedReport, TrackerHandle};

/// Unique id of one transfer, shared by both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("send"),
            Role::Receiver => f.write_str("receive"),
        }
    }
}

/// One end of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRef {
    pub peer_id: String,
    pub display_name: String,
}

/// What is being transferred, from whom, to whom. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub transfer_id: TransferId,
    pub source: PeerRef,
    pub destination: PeerRef,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub checksum: ChecksumAlgorithm,
}

impl TransferRequest {
    /// Request described by an incoming offer, addressed to `local`
    pub fn from_header(header: &TransferHeader, local: PeerRef) -> Self {
        Self {
            transfer_id: header.transfer_id,
            source: PeerRef {
                peer_id: header.sender_id.clone(),
                display_name: header.sender_name.clone(),
            },
            destination: local,
            file_name: header.file_name.clone(),
            total_size: header.file_size,
            chunk_size: header.chunk_size,
            checksum: header.checksum,
        }
    }

    /// Offer header announcing this request
    pub fn to_header(&self, version: u32) -> TransferHeader {
        TransferHeader {
            version,
            transfer_id: self.transfer_id,
            sender_id: self.source.peer_id.clone(),
            sender_name: self.source.display_name.clone(),
            file_name: self.file_name.clone(),
            file_size: self.total_size,
            chunk_size: self.chunk_size,
            checksum: self.checksum,
        }
    }

    /// The other end, seen from `role`
    pub fn remote(&self, role: Role) -> &PeerRef {
        match role {
            Role::Sender => &self.destination,
            Role::Receiver => &self.source,
        }
    }
}

/// Lifecycle of a session. `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Negotiating,
    Transferring,
    Verifying,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed(_) | SessionState::Cancelled
        )
    }

    /// Move to `next` unless already terminal. Returns whether the state changed.
    pub fn transition(&mut self, next: SessionState) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        *self = next;
        true
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating => f.write_str("negotiating"),
            SessionState::Transferring => f.write_str("transferring"),
            SessionState::Verifying => f.write_str("verifying"),
            SessionState::Completed => f.write_str("completed"),
            SessionState::Failed(reason) => write!(f, "failed: {}", reason),
            SessionState::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Final result of a session, as reported to the UI and notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl TransferOutcome {
    pub fn user_message(&self) -> String {
        match self {
            TransferOutcome::Completed => "Transfer complete".to_string(),
            TransferOutcome::Failed(reason) => reason.user_message(),
            TransferOutcome::Cancelled => "Transfer cancelled".to_string(),
        }
    }

    pub fn from_result(result: &Result<(), TransferError>) -> Self {
        match result {
            Ok(()) => TransferOutcome::Completed,
            Err(e) => match e.reason() {
                Some(reason) => TransferOutcome::Failed(reason),
                None => TransferOutcome::Cancelled,
            },
        }
    }

    fn as_state(self) -> SessionState {
        match self {
            TransferOutcome::Completed => SessionState::Completed,
            TransferOutcome::Failed(reason) => SessionState::Failed(reason),
            TransferOutcome::Cancelled => SessionState::Cancelled,
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub session_id: TransferId,
    pub role: Role,
    pub peer_id: String,
    pub peer_name: String,
    pub file_name: String,
    pub state: SessionState,
    pub bytes_transferred: u64,
    /// Bytes the receiver confirmed; only meaningful for senders
    pub acknowledged_bytes: u64,
    pub total_size: u64,
    pub chunk_size: usize,
    pub smoothed_speed: Option<f64>,
    pub instantaneous_speed: Option<f64>,
    pub eta: Option<Duration>,
    pub destination: Option<PathBuf>,
}

impl TransferProgress {
    /// Completion in `0.0..=1.0`; an empty file counts as done once completed
    pub fn fraction(&self) -> f64 {
        if self.total_size == 0 {
            return if self.state == SessionState::Completed { 1.0 } else { 0.0 };
        }
        self.bytes_transferred as f64 / self.total_size as f64
    }
}

/// State and counters of one running transfer
pub struct TransferSession {
    request: Arc<TransferRequest>,
    role: Role,
    state: SessionState,
    bytes_transferred: u64,
    acknowledged_bytes: u64,
    started_at: Instant,
    last_progress: Instant,
    chunk_size: usize,
    destination: Option<PathBuf>,
    tracker: TrackerHandle,
    speed: SpeedReport,
    progress_tx: watch::Sender<TransferProgress>,
    events: EventBus,
    progress_interval: Duration,
    last_published: Option<Instant>,
}

impl TransferSession {
    pub fn new(
        request: Arc<TransferRequest>,
        role: Role,
        tracker: &SharedTracker,
        events: EventBus,
        progress_interval: Duration,
    ) -> (Self, watch::Receiver<TransferProgress>) {
        let now = Instant::now();
        let tracker = tracker.track(request.transfer_id, request.total_size);
        tracker.record(now, 0);
        let remote = request.remote(role);
        let initial = TransferProgress {
            session_id: request.transfer_id,
            role,
            peer_id: remote.peer_id.clone(),
            peer_name: remote.display_name.clone(),
            file_name: request.file_name.clone(),
            state: SessionState::Negotiating,
            bytes_transferred: 0,
            acknowledged_bytes: 0,
            total_size: request.total_size,
            chunk_size: request.chunk_size,
            smoothed_speed: None,
            instantaneous_speed: None,
            eta: None,
            destination: None,
        };
        let (progress_tx, progress_rx) = watch::channel(initial);

        let mut session = Self {
            chunk_size: request.chunk_size,
            request,
            role,
            state: SessionState::Negotiating,
            bytes_transferred: 0,
            acknowledged_bytes: 0,
            started_at: now,
            last_progress: now,
            destination: None,
            tracker,
            speed: SpeedReport::default(),
            progress_tx,
            events,
            progress_interval,
            last_published: None,
        };
        session.publish();
        (session, progress_rx)
    }

    pub fn id(&self) -> TransferId {
        self.request.transfer_id
    }

    pub fn request(&self) -> &TransferRequest {
        &self.request
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_size(&self) -> u64 {
        self.request.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.request.total_size - self.bytes_transferred
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Time since bytes last moved
    pub fn idle_for(&self) -> Duration {
        self.last_progress.elapsed()
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.chunk_size = chunk_size;
    }

    pub fn set_destination(&mut self, path: PathBuf) {
        self.destination = Some(path);
    }

    /// Change state and publish the change right away
    pub fn set_state(&mut self, next: SessionState) -> bool {
        let from = self.state;
        if !self.state.transition(next) {
            return false;
        }
        tracing::debug!("Session {} {} -> {}", self.id(), from, next);
        self.publish();
        true
    }

    /// Account for `n` more bytes moved. Never lets the count pass the total.
    pub fn add_bytes(&mut self, n: usize) -> Result<(), TransferError> {
        let n = n as u64;
        if n > self.remaining() {
            return Err(TransferError::Protocol(format!(
                "{} bytes past the end of a {} byte file",
                n - self.remaining(),
                self.request.total_size
            )));
        }
        let now = Instant::now();
        self.bytes_transferred += n;
        self.last_progress = now;
        self.tracker.record(now, self.bytes_transferred);
        self.maybe_publish(now);
        Ok(())
    }

    /// Record the receiver's cumulative acknowledgement
    pub fn set_acknowledged(&mut self, bytes: u64) {
        self.acknowledged_bytes = self
            .acknowledged_bytes
            .max(bytes.min(self.bytes_transferred));
    }

    /// Periodic sample even when nothing moved, so a stall shows up in the speed
    pub fn tick(&mut self) {
        let now = Instant::now();
        self.tracker.record(now, self.bytes_transferred);
        self.maybe_publish(now);
    }

    pub fn snapshot(&self) -> TransferProgress {
        let remote = self.request.remote(self.role);
        TransferProgress {
            session_id: self.id(),
            role: self.role,
            peer_id: remote.peer_id.clone(),
            peer_name: remote.display_name.clone(),
            file_name: self.request.file_name.clone(),
            state: self.state,
            bytes_transferred: self.bytes_transferred,
            acknowledged_bytes: self.acknowledged_bytes,
            total_size: self.request.total_size,
            chunk_size: self.chunk_size,
            smoothed_speed: self.speed.smoothed,
            instantaneous_speed: self.speed.instantaneous,
            eta: self.speed.eta,
            destination: self.destination.clone(),
        }
    }

    fn maybe_publish(&mut self, now: Instant) {
        let due = self
            .last_published
            .is_none_or(|t| now.duration_since(t) >= self.progress_interval);
        if due {
            self.publish();
        }
    }

    fn publish(&mut self) {
        self.last_published = Some(Instant::now());
        self.speed = self.tracker.report();
        let snapshot = self.snapshot();
        self.progress_tx.send_replace(snapshot.clone());
        self.events.publish(AppEvent::TransferStateChanged(snapshot));
    }

    /// Move to the terminal state matching `result` and announce the outcome
    pub fn finish(mut self, result: Result<(), TransferError>) -> TransferOutcome {
        let outcome = TransferOutcome::from_result(&result);
        match &result {
            Ok(()) => tracing::info!(
                "Transfer {} ({}) of {:?} completed: {} bytes in {:.1?}",
                self.id(),
                self.role,
                self.request.file_name,
                self.bytes_transferred,
                self.started_at.elapsed()
            ),
            Err(TransferError::Cancelled) => {
                tracing::info!("Transfer {} ({}) cancelled", self.id(), self.role)
            }
            Err(e) => tracing::warn!("Transfer {} ({}) failed: {}", self.id(), self.role, e),
        }

        if self.state.is_terminal() {
            tracing::error!("Session {} finished twice", self.id());
        }
        self.set_state(outcome.as_state());
        self.events.publish(AppEvent::TransferFinished {
            session_id: self.id(),
            file_name: self.request.file_name.clone(),
            role: self.role,
            outcome,
        });
        outcome
    }
}
