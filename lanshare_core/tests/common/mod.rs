#![allow(dead_code)]

use lanshare_core::{AppConfig, AppEvent, Backend, EventBus, TransferId, TransferOutcome};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

pub const WAIT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config for a node on loopback with ephemeral ports and short timeouts
pub fn test_config(name: &str, download_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.display_name = Some(name.to_string());
    config.discovery.bind_addr = "127.0.0.1:0".parse().unwrap();
    // Nothing listens on the discard port; peers are introduced explicitly
    config.discovery.broadcast_addr = "127.0.0.1:9".parse().unwrap();
    config.discovery.interval_ms = 60_000;
    config.transfer.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.transfer.download_dir = download_dir.to_path_buf();
    config.transfer.chunk_size = 64 * 1024;
    config.transfer.connect_timeout_ms = 2_000;
    config.transfer.handshake_timeout_ms = 2_000;
    config.transfer.idle_timeout_ms = 5_000;
    config.transfer.accept_timeout_ms = 5_000;
    config.transfer.progress_interval_ms = 50;
    config.transfer.auto_accept = true;
    config
}

pub struct Node {
    pub backend: Backend,
    pub events: broadcast::Receiver<AppEvent>,
}

pub async fn start_node(config: AppConfig) -> Node {
    let bus = EventBus::new();
    let events = bus.subscribe();
    let backend = Backend::start(config, bus).await.expect("backend starts");
    Node { backend, events }
}

impl Node {
    pub fn id(&self) -> String {
        self.backend.identity().instance_id.clone()
    }

    /// Make `other` known to this node at `addr` without going through discovery
    pub async fn introduce(&self, other: &Node, addr: SocketAddr) {
        self.introduce_peer(&other.id(), &other.backend.identity().display_name, addr)
            .await;
    }

    /// Register any listener as a peer, e.g. a hand-driven socket
    pub async fn introduce_peer(&self, peer_id: &str, display_name: &str, addr: SocketAddr) {
        self.backend.registry().write().await.upsert(
            peer_id,
            display_name,
            addr.ip(),
            addr.port(),
            Instant::now(),
        );
    }

    pub async fn wait_finished(&mut self, id: TransferId) -> TransferOutcome {
        self.wait_finished_within(id, WAIT).await
    }

    pub async fn wait_finished_within(&mut self, id: TransferId, limit: Duration) -> TransferOutcome {
        let events = &mut self.events;
        tokio::time::timeout(limit, async {
            loop {
                match events.recv().await {
                    Ok(AppEvent::TransferFinished {
                        session_id,
                        outcome,
                        ..
                    }) if session_id == id => return outcome,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event bus closed: {}", e),
                }
            }
        })
        .await
        .expect("transfer finished in time")
    }

    /// Wait for the first event `pick` returns something for
    pub async fn wait_for<T>(&mut self, mut pick: impl FnMut(&AppEvent) -> Option<T>) -> T {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(ev) => {
                        if let Some(found) = pick(&ev) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(e) => panic!("event bus closed: {}", e),
                }
            }
        })
        .await
        .expect("event arrived in time")
    }
}

/// Write `len` bytes of a repeating, non-trivial pattern
pub fn write_test_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

pub fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

/// How a proxy treats the sender-to-receiver direction
#[derive(Clone, Copy)]
pub enum Tamper {
    /// Flip one byte in the payload of the first data frame
    FlipFirstData,
    /// Drop both connections after forwarding this many bytes
    SeverAfter(usize),
    /// Forward at most 16 KiB per read, pausing this long after each
    Throttle(Duration),
}

/// Single-connection TCP proxy in front of `upstream`
pub async fn spawn_proxy(upstream: SocketAddr, tamper: Tamper) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (client, _) = listener.accept().await.unwrap();
        let server = TcpStream::connect(upstream).await.unwrap();
        let (mut client_read, mut client_write) = client.into_split();
        let (mut server_read, mut server_write) = server.into_split();

        let back = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut server_read, &mut client_write).await;
        });

        match tamper {
            Tamper::FlipFirstData => {
                let mut flipped = false;
                loop {
                    let mut head = [0u8; 5];
                    if client_read.read_exact(&mut head).await.is_err() {
                        break;
                    }
                    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
                    let mut payload = vec![0u8; len];
                    if client_read.read_exact(&mut payload).await.is_err() {
                        break;
                    }
                    // Data payloads start with an 8-byte offset
                    if head[0] == 0x02 && !flipped && len > 8 {
                        payload[8 + (len - 8) / 2] ^= 0xFF;
                        flipped = true;
                    }
                    if server_write.write_all(&head).await.is_err()
                        || server_write.write_all(&payload).await.is_err()
                    {
                        break;
                    }
                }
                let _ = server_write.shutdown().await;
                let _ = back.await;
            }
            Tamper::SeverAfter(limit) => {
                let mut forwarded = 0;
                let mut buf = vec![0u8; 16 * 1024];
                while forwarded < limit {
                    let want = buf.len().min(limit - forwarded);
                    match client_read.read(&mut buf[..want]).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if server_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            forwarded += n;
                        }
                    }
                }
                back.abort();
                // Dropping every half closes both connections
            }
            Tamper::Throttle(pause) => {
                let mut buf = vec![0u8; 16 * 1024];
                loop {
                    match client_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if server_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            tokio::time::sleep(pause).await;
                        }
                    }
                }
                let _ = server_write.shutdown().await;
                let _ = back.await;
            }
        }
    });
    addr
}
