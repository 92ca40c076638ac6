use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod manager;
pub mod registry;
pub mod throughput;
pub mod transfer;

pub use config::AppConfig;
pub use error::{FailureReason, RejectReason, StartupError};
pub use events::{AppCommand, AppEvent, EventBus};
pub use registry::{Peer, PeerStatus};
pub use transfer::{TransferId, TransferOutcome, TransferProgress};

use discovery::DiscoveryService;
use identity::Identity;
use manager::TransferManager;
use registry::{PeerRegistry, SharedRegistry};
use throughput::SharedTracker;

/// Magic bytes to identify our app's packets (7 bytes: "LANSHR\0")
pub const MAGIC_BYTES: &[u8] = b"LANSHR\x00";

/// Version carried in every discovery packet
pub const DISCOVERY_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    /// Periodic broadcast
    Announce,
    /// Unicast answer to an announcement from a newcomer
    Reply,
}

/// Presence message sent over UDP after `MAGIC_BYTES`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    pub version: u32,
    pub kind: PacketKind,
    pub instance_id: String,
    pub display_name: String,
    /// TCP port of the transfer listener
    pub transfer_port: u16,
}

/// A running node: discovery, the transfer listener and the manager
pub struct Backend {
    identity: Identity,
    registry: SharedRegistry,
    discovery: Arc<DiscoveryService>,
    manager: TransferManager,
    events: EventBus,
    transfer_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Backend {
    /// Bind both sockets and start the background loops.
    /// Failing to bind either socket is fatal.
    pub async fn start(config: AppConfig, events: EventBus) -> Result<Self, StartupError> {
        let identity = Identity::generate(config.display_name.as_deref());
        let registry = PeerRegistry::shared(config.discovery.expiry_policy());
        let tracker = SharedTracker::new();
        let shutdown = CancellationToken::new();

        let listener = transfer::bind_listener(
            config.transfer.bind_addr,
            config.transfer.socket_buffer_size,
        )?;
        let transfer_addr = listener
            .local_addr()
            .map_err(|source| StartupError::TransferListener {
                addr: config.transfer.bind_addr,
                source,
            })?;

        let discovery = match DiscoveryService::bind(
            config.discovery.clone(),
            identity.clone(),
            transfer_addr.port(),
            registry.clone(),
            events.clone(),
        )
        .await
        {
            Ok(ds) => Arc::new(ds),
            Err(e) => {
                tracing::error!("{}", e);
                events.error(format!("Network unavailable: {}", e));
                return Err(e.into());
            }
        };

        let manager = TransferManager::new(
            config.transfer.clone(),
            identity.clone(),
            registry.clone(),
            tracker,
            events.clone(),
            shutdown.clone(),
        );

        let tasks = vec![
            tokio::spawn(transfer::run_server(
                listener,
                manager.clone(),
                shutdown.clone(),
            )),
            discovery.start_listening(shutdown.clone()),
            discovery.start_announcing(shutdown.clone()),
            discovery.start_sweeping(shutdown.clone()),
        ];

        let reachable = identity::lan_address()
            .map(|ip| SocketAddr::new(ip, transfer_addr.port()).to_string())
            .unwrap_or_else(|| format!("port {}", transfer_addr.port()));
        events.status(format!(
            "{} ({}) ready, receiving on {}",
            identity.display_name, identity.instance_id, reachable
        ));

        Ok(Self {
            identity,
            registry,
            discovery,
            manager,
            events,
            transfer_addr,
            shutdown,
            tasks,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Where the transfer listener actually bound
    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }

    /// Execute one UI command
    pub async fn handle_command(&self, cmd: AppCommand) {
        match cmd {
            AppCommand::Rescan => {
                self.events.status("Scanning...");
                self.discovery.announce().await;
            }
            AppCommand::SendFile { peer_id, path } => {
                match self.manager.initiate_send(&peer_id, &path).await {
                    Ok(id) => tracing::debug!("Started transfer {} to {}", id, peer_id),
                    Err(e) => {
                        tracing::warn!("Cannot send {:?}: {}", path, e);
                        self.events.error(format!("Cannot send file: {}", e));
                    }
                }
            }
            AppCommand::RespondIncoming { session_id, accept } => {
                if !self.manager.respond_incoming(session_id, accept) {
                    self.events
                        .error(format!("Transfer request {} is no longer pending", session_id));
                }
            }
            AppCommand::Cancel { session_id } => self.manager.cancel(session_id),
        }
    }

    /// Stop the background loops and cancel every session
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("Backend stopped");
    }
}

/// Run a node until the command channel closes
pub async fn run_backend(
    config: AppConfig,
    mut cmd_rx: mpsc::Receiver<AppCommand>,
    events: EventBus,
) -> Result<(), StartupError> {
    let backend = Backend::start(config, events).await?;

    // Main loop: Wait for commands from UI
    while let Some(cmd) = cmd_rx.recv().await {
        backend.handle_command(cmd).await;
    }

    backend.shutdown().await;
    Ok(())
}
