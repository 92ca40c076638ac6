//! Live set of peers seen on the network.
//!
//! The registry is the only owner of peer state. Discovery writes to it
//! (announcements and the expiry sweep); everyone else reads cloned
//! snapshots.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Reachability of a peer, ordered from fresh to gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerStatus {
    Online,
    /// Missed a few announcements
    Stale,
    /// Silent long enough to be considered gone; removed later
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub peer_id: String,
    pub display_name: String,
    /// IP the announcement came from plus the advertised transfer port
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this id was seen
    Added,
    /// Known peer, nothing visible changed
    Refreshed,
    /// Known peer whose name, address or status changed
    Changed,
}

/// A transition applied by `expire_stale`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerChange {
    Stale(String),
    Offline(String),
    Removed(String),
}

/// Silence thresholds, measured from `last_seen`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub stale_after: Duration,
    pub offline_after: Duration,
    pub remove_after: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10),
            offline_after: Duration::from_secs(15),
            remove_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, Peer>,
    policy: ExpiryPolicy,
}

pub type SharedRegistry = Arc<RwLock<PeerRegistry>>;

impl PeerRegistry {
    pub fn new(policy: ExpiryPolicy) -> Self {
        Self {
            peers: HashMap::new(),
            policy,
        }
    }

    pub fn shared(policy: ExpiryPolicy) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(policy)))
    }

    /// Insert or refresh a peer and mark it online
    pub fn upsert(
        &mut self,
        peer_id: &str,
        display_name: &str,
        ip: IpAddr,
        port: u16,
        now: Instant,
    ) -> UpsertOutcome {
        let addr = SocketAddr::new(ip, port);

        // An address belongs to one peer; a restarted instance gets a new id
        let evicted: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.addr == addr && p.peer_id != peer_id)
            .map(|p| p.peer_id.clone())
            .collect();
        for id in evicted {
            tracing::debug!("Peer {} replaced by {} at {}", id, peer_id, addr);
            self.peers.remove(&id);
        }

        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                let changed = peer.display_name != display_name
                    || peer.addr != addr
                    || peer.status != PeerStatus::Online;
                peer.display_name = display_name.to_string();
                peer.addr = addr;
                peer.last_seen = peer.last_seen.max(now);
                peer.status = PeerStatus::Online;
                if changed {
                    UpsertOutcome::Changed
                } else {
                    UpsertOutcome::Refreshed
                }
            }
            None => {
                tracing::info!("Discovered peer {} ({}) at {}", display_name, peer_id, addr);
                self.peers.insert(
                    peer_id.to_string(),
                    Peer {
                        peer_id: peer_id.to_string(),
                        display_name: display_name.to_string(),
                        addr,
                        last_seen: now,
                        status: PeerStatus::Online,
                    },
                );
                UpsertOutcome::Added
            }
        }
    }

    /// All peers, sorted by display name
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        peers
    }

    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.get(peer_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Age silent peers: Online -> Stale -> Offline -> removed.
    /// Only a fresh `upsert` brings a peer back online.
    pub fn expire_stale(&mut self, now: Instant) -> Vec<PeerChange> {
        let policy = self.policy;
        let mut changes = Vec::new();

        self.peers.retain(|id, peer| {
            let silence = now.saturating_duration_since(peer.last_seen);
            if silence >= policy.remove_after {
                tracing::info!("Peer {} ({}) removed", peer.display_name, id);
                changes.push(PeerChange::Removed(id.clone()));
                return false;
            }

            let target = if silence >= policy.offline_after {
                PeerStatus::Offline
            } else if silence >= policy.stale_after {
                PeerStatus::Stale
            } else {
                PeerStatus::Online
            };
            if target > peer.status {
                peer.status = target;
                changes.push(match target {
                    PeerStatus::Stale => PeerChange::Stale(id.clone()),
                    _ => PeerChange::Offline(id.clone()),
                });
            }
            true
        });

        changes
    }
}
