use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::events::{AppEvent, EventBus};
use crate::identity::Identity;
use crate::registry::{SharedRegistry, UpsertOutcome};
use crate::{DISCOVERY_PROTOCOL_VERSION, DiscoveryPacket, MAGIC_BYTES, PacketKind};

/// Default UDP port for announcements
pub const DISCOVERY_PORT: u16 = 8512;

/// Announcements are small; anything bigger is not ours
const MAX_DATAGRAM: usize = 2048;

/// Upper bound of the random delay added to each announce interval, in percent
const JITTER_PERCENT: u64 = 10;

/// Build an on-wire packet: `MAGIC_BYTES` followed by JSON
pub fn encode_packet(packet: &DiscoveryPacket) -> Vec<u8> {
    let mut bytes = MAGIC_BYTES.to_vec();
    // Serializing a struct of strings and integers cannot fail
    if let Ok(json) = serde_json::to_vec(packet) {
        bytes.extend_from_slice(&json);
    }
    bytes
}

/// Parse a datagram; `None` for foreign, malformed or other-version packets
pub fn decode_packet(data: &[u8]) -> Option<DiscoveryPacket> {
    let json = data.strip_prefix(MAGIC_BYTES)?;
    let packet: DiscoveryPacket = match serde_json::from_slice(json) {
        Ok(p) => p,
        Err(e) => {
            tracing::trace!("Dropping malformed discovery packet: {}", e);
            return None;
        }
    };
    if packet.version != DISCOVERY_PROTOCOL_VERSION {
        tracing::trace!("Dropping discovery packet with version {}", packet.version);
        return None;
    }
    Some(packet)
}

/// Broadcasts our presence and records everyone else's
pub struct DiscoveryService {
    socket: Arc<UdpSocket>,
    config: DiscoveryConfig,
    identity: Identity,
    transfer_port: u16,
    registry: SharedRegistry,
    events: EventBus,
}

impl DiscoveryService {
    pub async fn bind(
        config: DiscoveryConfig,
        identity: Identity,
        transfer_port: u16,
        registry: SharedRegistry,
        events: EventBus,
    ) -> Result<Self, DiscoveryError> {
        let addr = config.bind_addr;
        let bind_err = |source| DiscoveryError::NetworkUnavailable { addr, source };

        let socket = UdpSocket::bind(addr).await.map_err(bind_err)?;
        socket.set_broadcast(true).map_err(bind_err)?;
        tracing::info!("Discovery listening on {}", addr);

        Ok(Self {
            socket: Arc::new(socket),
            config,
            identity,
            transfer_port,
            registry,
            events,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn packet(&self, kind: PacketKind) -> Vec<u8> {
        encode_packet(&DiscoveryPacket {
            version: DISCOVERY_PROTOCOL_VERSION,
            kind,
            instance_id: self.identity.instance_id.clone(),
            display_name: self.identity.display_name.clone(),
            transfer_port: self.transfer_port,
        })
    }

    /// Broadcast an announcement. Failures are logged, never returned.
    pub async fn announce(&self) {
        self.announce_to(self.config.broadcast_addr).await;
    }

    /// Send an announcement to one address
    pub async fn announce_to(&self, target: SocketAddr) {
        self.send(PacketKind::Announce, target).await;
    }

    async fn send(&self, kind: PacketKind, target: SocketAddr) {
        let packet = self.packet(kind);
        if let Err(e) = self.socket.send_to(&packet, target).await {
            tracing::debug!("Discovery send to {} failed: {}", target, e);
        }
    }

    /// Handle one datagram from `from`. Returns true if the peer list changed.
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> bool {
        let Some(packet) = decode_packet(data) else {
            return false;
        };
        if packet.instance_id == self.identity.instance_id {
            return false;
        }

        let outcome = self.registry.write().await.upsert(
            &packet.instance_id,
            &packet.display_name,
            from.ip(),
            packet.transfer_port,
            Instant::now(),
        );

        // Newcomers hear about us right away instead of at the next interval
        if packet.kind == PacketKind::Announce && outcome != UpsertOutcome::Refreshed {
            self.send(PacketKind::Reply, from).await;
        }

        if outcome == UpsertOutcome::Refreshed {
            return false;
        }
        self.publish_peers().await;
        true
    }

    async fn publish_peers(&self) {
        let peers = self.registry.read().await.snapshot();
        self.events.publish(AppEvent::PeerListChanged(peers));
    }

    /// Receive loop; runs until `shutdown` fires
    pub fn start_listening(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = service.socket.recv_from(&mut buf) => r,
                };
                match received {
                    Ok((len, from)) => {
                        service.handle_datagram(&buf[..len], from).await;
                    }
                    // Windows reports ICMP port-unreachable as a receive error
                    Err(e) => tracing::debug!("Discovery receive error: {}", e),
                }
            }
            tracing::debug!("Discovery listener stopped");
        })
    }

    /// Announce now, then every interval plus a little jitter
    pub fn start_announcing(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let interval = service.config.interval();
            loop {
                service.announce().await;
                let jitter_max = interval.as_millis() as u64 * JITTER_PERCENT / 100;
                let jitter = Duration::from_millis(rand::rng().random_range(0..=jitter_max));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval + jitter) => {}
                }
            }
        })
    }

    /// Periodically age silent peers
    pub fn start_sweeping(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let changes = service.registry.write().await.expire_stale(Instant::now());
                if !changes.is_empty() {
                    tracing::debug!("Peer expiry: {:?}", changes);
                    service.publish_peers().await;
                }
            }
        })
    }
}
