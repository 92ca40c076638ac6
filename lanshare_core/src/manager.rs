//! Lifecycle and concurrency policy for transfer sessions.
//!
//! The manager starts sender sessions on request, runs the accept policy for
//! incoming connections and keeps a read-only view of every live session.
//! Each session runs on its own task and owns its counters; the manager only
//! holds the session's progress `watch` receiver and its cancellation token.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{FailureReason, ManagerError, RejectReason};
use crate::events::{AppEvent, EventBus};
use crate::identity::Identity;
use crate::registry::{PeerStatus, SharedRegistry};
use crate::throughput::SharedTracker;
use crate::transfer::constants::{DISK_SPACE_MARGIN, TRANSFER_PROTOCOL_VERSION};
use crate::transfer::protocol::{TransferHeader, TransferMsg, notify_peer, recv_msg};
use crate::transfer::session::{
    PeerRef, Role, TransferId, TransferProgress, TransferRequest, TransferSession,
};
use crate::transfer::utils::{available_space, validate_offer};
use crate::transfer::{receiver, sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

struct ActiveSession {
    progress: watch::Receiver<TransferProgress>,
    cancel: CancellationToken,
}

struct PendingIncoming {
    request: Arc<TransferRequest>,
    respond: oneshot::Sender<bool>,
}

#[derive(Default)]
struct State {
    /// Ids of every session from first sight of the offer until it ends
    claimed: HashSet<TransferId>,
    active: HashMap<TransferId, ActiveSession>,
    pending: HashMap<TransferId, PendingIncoming>,
    running: usize,
    inbound: HashMap<String, usize>,
    outbound: HashMap<String, usize>,
}

type SharedState = Arc<Mutex<State>>;

fn lock(state: &SharedState) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A claimed transfer id and, once granted, a concurrency slot.
/// Dropping it releases both and forgets the session.
struct Reservation {
    state: SharedState,
    id: TransferId,
    slot: Option<(Direction, String)>,
}

impl Reservation {
    /// Claim `id`; `None` if a session with this id already exists
    fn claim(state: &SharedState, id: TransferId) -> Option<Self> {
        if !lock(state).claimed.insert(id) {
            return None;
        }
        Some(Self {
            state: state.clone(),
            id,
            slot: None,
        })
    }

    /// Take a slot against the global and per-peer limits
    fn take_slot(
        &mut self,
        direction: Direction,
        peer_id: &str,
        config: &TransferConfig,
    ) -> Result<(), RejectReason> {
        let mut state = lock(&self.state);
        if state.running >= config.max_concurrent_transfers {
            return Err(RejectReason::TooManyTransfers);
        }
        let (per_peer, limit) = match direction {
            Direction::Inbound => (&mut state.inbound, config.max_inbound_per_peer),
            Direction::Outbound => (&mut state.outbound, config.max_outbound_per_peer),
        };
        if per_peer.get(peer_id).copied().unwrap_or(0) >= limit {
            return Err(RejectReason::TooManyTransfers);
        }
        *per_peer.entry(peer_id.to_string()).or_default() += 1;
        state.running += 1;
        self.slot = Some((direction, peer_id.to_string()));
        Ok(())
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.claimed.remove(&self.id);
        state.active.remove(&self.id);
        state.pending.remove(&self.id);
        if let Some((direction, peer_id)) = self.slot.take() {
            state.running = state.running.saturating_sub(1);
            let per_peer = match direction {
                Direction::Inbound => &mut state.inbound,
                Direction::Outbound => &mut state.outbound,
            };
            if let Some(count) = per_peer.get_mut(&peer_id) {
                *count -= 1;
                if *count == 0 {
                    per_peer.remove(&peer_id);
                }
            }
        }
    }
}

struct Inner {
    config: TransferConfig,
    identity: Identity,
    registry: SharedRegistry,
    tracker: SharedTracker,
    events: EventBus,
    state: SharedState,
    shutdown: CancellationToken,
}

/// Cheap to clone; all clones share the same sessions
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<Inner>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        identity: Identity,
        registry: SharedRegistry,
        tracker: SharedTracker,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                identity,
                registry,
                tracker,
                events,
                state: SharedState::default(),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Start sending `path` to `peer_id`. Returns as soon as the session is spawned.
    pub async fn initiate_send(
        &self,
        peer_id: &str,
        path: &Path,
    ) -> Result<TransferId, ManagerError> {
        let inner = &self.inner;
        let peer = inner
            .registry
            .read()
            .await
            .get(peer_id)
            .ok_or_else(|| ManagerError::UnknownPeer(peer_id.to_string()))?;
        if peer.status != PeerStatus::Online {
            return Err(ManagerError::PeerOffline(peer_id.to_string()));
        }

        let unreadable = |source| ManagerError::FileUnreadable {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(unreadable)?;
        if !metadata.is_file() {
            return Err(ManagerError::NotAFile(path.to_path_buf()));
        }
        // Fail now rather than inside the session if we cannot read it
        tokio::fs::File::open(path).await.map_err(unreadable)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ManagerError::NotAFile(path.to_path_buf()))?;

        let request = Arc::new(TransferRequest {
            transfer_id: TransferId::new(),
            source: inner.identity.as_peer(),
            destination: PeerRef {
                peer_id: peer.peer_id.clone(),
                display_name: peer.display_name.clone(),
            },
            file_name,
            total_size: metadata.len(),
            chunk_size: inner.config.chunk_size,
            checksum: inner.config.checksum,
        });
        let id = request.transfer_id;

        let mut reservation =
            Reservation::claim(&inner.state, id).ok_or(ManagerError::TooManyTransfers)?;
        reservation
            .take_slot(Direction::Outbound, &peer.peer_id, &inner.config)
            .map_err(|_| ManagerError::TooManyTransfers)?;

        let (mut session, cancel) = self.register(request, Role::Sender);
        let manager = self.clone();
        let path: PathBuf = path.to_path_buf();
        tokio::spawn(async move {
            let config = &manager.inner.config;
            let result = sender::send_file(&mut session, peer.addr, &path, config, &cancel).await;
            drop(reservation);
            session.finish(result);
        });
        Ok(id)
    }

    /// Create the session, publish its first snapshot and track it as active
    fn register(
        &self,
        request: Arc<TransferRequest>,
        role: Role,
    ) -> (TransferSession, CancellationToken) {
        let inner = &self.inner;
        let id = request.transfer_id;
        let (session, progress) = TransferSession::new(
            request,
            role,
            &inner.tracker,
            inner.events.clone(),
            inner.config.progress_interval(),
        );
        let cancel = inner.shutdown.child_token();
        lock(&inner.state).active.insert(
            id,
            ActiveSession {
                progress,
                cancel: cancel.clone(),
            },
        );
        (session, cancel)
    }

    /// Serve one incoming transfer connection to completion
    pub async fn on_incoming_connection(&self, stream: TcpStream, remote: SocketAddr) {
        let inner = &self.inner;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (mut read_half, mut writer) = stream.into_split();

        let handshake = inner.config.handshake_timeout();
        let header = match timeout(handshake, recv_msg(&mut read_half)).await {
            Ok(Ok(TransferMsg::Offer(header))) => header,
            Ok(Ok(other)) => {
                tracing::warn!("Expected an offer from {}, got {:?}", remote, other);
                let abort = TransferMsg::Abort {
                    reason: FailureReason::ProtocolViolation,
                };
                notify_peer(&mut writer, &abort).await;
                return;
            }
            Ok(Err(e)) => {
                tracing::debug!("Bad handshake from {}: {}", remote, e);
                return;
            }
            Err(_) => {
                tracing::debug!("No offer from {} within {:?}", remote, handshake);
                return;
            }
        };
        tracing::info!(
            "Offer {} from {} ({}): {:?}, {} bytes",
            header.transfer_id,
            header.sender_name,
            remote,
            header.file_name,
            header.file_size
        );

        let request = Arc::new(TransferRequest::from_header(
            &header,
            inner.identity.as_peer(),
        ));
        let reservation = match self.admit(&header) {
            Ok(r) => r,
            Err(reason) => return self.reject(&mut writer, &request, reason).await,
        };

        if !inner.config.auto_accept && !self.ask_user(&request).await {
            return self
                .reject(&mut writer, &request, RejectReason::Declined)
                .await;
        }

        let (mut session, cancel) = self.register(request, Role::Receiver);
        let result = receiver::receive_file(
            &mut session,
            read_half,
            writer,
            &inner.config.download_dir,
            &inner.config,
            &cancel,
        )
        .await;
        drop(reservation);

        let result = result.map(|path| {
            inner
                .events
                .status(format!("Saved {}", path.display()));
        });
        session.finish(result);
    }

    /// Accept policy, in order. The reservation it returns holds the id and a slot.
    fn admit(&self, header: &TransferHeader) -> Result<Reservation, RejectReason> {
        let inner = &self.inner;
        if header.version != TRANSFER_PROTOCOL_VERSION {
            return Err(RejectReason::UnsupportedVersion);
        }
        let mut reservation = Reservation::claim(&inner.state, header.transfer_id)
            .ok_or(RejectReason::DuplicateTransfer)?;
        validate_offer(header.file_size, inner.config.max_file_size)?;
        reservation.take_slot(Direction::Inbound, &header.sender_id, &inner.config)?;

        if let Some(available) = available_space(&inner.config.download_dir) {
            if available < header.file_size.saturating_add(DISK_SPACE_MARGIN) {
                return Err(RejectReason::InsufficientDiskSpace);
            }
        }
        Ok(reservation)
    }

    async fn reject(
        &self,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
        request: &TransferRequest,
        reason: RejectReason,
    ) {
        tracing::info!(
            "Rejecting {:?} from {}: {}",
            request.file_name,
            request.source.display_name,
            reason
        );
        notify_peer(writer, &TransferMsg::Reject { reason }).await;
    }

    /// Publish the request and wait for `respond_incoming`, up to the accept timeout
    async fn ask_user(&self, request: &Arc<TransferRequest>) -> bool {
        let inner = &self.inner;
        let id = request.transfer_id;
        let (respond, answer) = oneshot::channel();
        lock(&inner.state).pending.insert(
            id,
            PendingIncoming {
                request: request.clone(),
                respond,
            },
        );
        inner.events.publish(AppEvent::IncomingRequest {
            session_id: id,
            request: request.clone(),
        });

        let accept_timeout = inner.config.accept_timeout();
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => false,
            r = timeout(accept_timeout, answer) => match r {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(_)) => false,
                Err(_) => {
                    tracing::info!("No answer for transfer {} within {:?}", id, accept_timeout);
                    false
                }
            },
        };
        lock(&inner.state).pending.remove(&id);
        accepted
    }

    /// Answer a pending incoming request. Returns false if none was waiting.
    pub fn respond_incoming(&self, session_id: TransferId, accept: bool) -> bool {
        let pending = lock(&self.inner.state).pending.remove(&session_id);
        match pending {
            Some(p) => p.respond.send(accept).is_ok(),
            None => false,
        }
    }

    /// Cancel an active session or decline a pending request.
    /// Unknown and already finished sessions are left alone.
    pub fn cancel(&self, session_id: TransferId) {
        let mut state = lock(&self.inner.state);
        if let Some(pending) = state.pending.remove(&session_id) {
            let _ = pending.respond.send(false);
            return;
        }
        if let Some(active) = state.active.get(&session_id) {
            tracing::info!("Cancelling transfer {}", session_id);
            active.cancel.cancel();
        }
    }

    /// Progress of every running session
    pub fn list_active(&self) -> Vec<TransferProgress> {
        let state = lock(&self.inner.state);
        let mut sessions: Vec<TransferProgress> = state
            .active
            .values()
            .map(|s| s.progress.borrow().clone())
            .collect();
        sessions.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        sessions
    }

    /// Offers waiting for the user's answer
    pub fn pending_requests(&self) -> Vec<Arc<TransferRequest>> {
        lock(&self.inner.state)
            .pending
            .values()
            .map(|p| p.request.clone())
            .collect()
    }
}
