//! Headless LAN Share node.
//!
//! ```text
//! lanshare listen [--yes]        receive files; --yes accepts without asking
//! lanshare peers                 list peers seen within one announce interval
//! lanshare send <peer> <file>    send a file to a peer (id or display name)
//! ```

use anyhow::{Context, Result, bail};
use lanshare_core::transfer::utils::{format_eta, format_speed};
use lanshare_core::{AppConfig, AppEvent, Backend, EventBus, Peer, TransferId, TransferOutcome};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

/// How long `send` waits for the target to show up
const PEER_WAIT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = AppConfig::load();

    match args.first().map(String::as_str) {
        Some("listen") => {
            if args.iter().any(|a| a == "--yes") {
                config.transfer.auto_accept = true;
            }
            listen(config).await
        }
        Some("peers") => peers(config).await,
        Some("send") => {
            let (Some(peer), Some(file)) = (args.get(1), args.get(2)) else {
                bail!("usage: lanshare send <peer> <file>");
            };
            send(config, peer, PathBuf::from(file)).await
        }
        _ => {
            eprintln!("usage: lanshare <listen [--yes] | peers | send <peer> <file>>");
            std::process::exit(2);
        }
    }
}

async fn listen(config: AppConfig) -> Result<()> {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let backend = Backend::start(config, events).await?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut waiting: VecDeque<TransferId> = VecDeque::new();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line(), if stdin_open => {
                let Ok(Some(line)) = line else {
                    stdin_open = false;
                    continue;
                };
                let Some(id) = waiting.pop_front() else { continue };
                let accept = matches!(line.trim(), "y" | "Y" | "yes");
                backend.manager().respond_incoming(id, accept);
            }
            event = rx.recv() => match event {
                Ok(AppEvent::IncomingRequest { session_id, request }) => {
                    println!(
                        "{} wants to send {} ({} bytes). Accept? [y/N]",
                        request.source.display_name, request.file_name, request.total_size
                    );
                    waiting.push_back(session_id);
                }
                Ok(ev @ AppEvent::TransferFinished { session_id, .. }) => {
                    waiting.retain(|id| *id != session_id);
                    print_event(&ev);
                }
                Ok(ev) => print_event(&ev),
                Err(RecvError::Lagged(n)) => tracing::debug!("Skipped {} events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    backend.shutdown().await;
    Ok(())
}

async fn peers(config: AppConfig) -> Result<()> {
    let wait = config.discovery.interval() + Duration::from_secs(1);
    let backend = Backend::start(config, EventBus::new()).await?;
    tokio::time::sleep(wait).await;

    let peers = backend.registry().read().await.snapshot();
    if peers.is_empty() {
        println!("No peers found");
    }
    for peer in &peers {
        println!(
            "{:<28} {:<20} {:<22} {:?}",
            peer.peer_id, peer.display_name, peer.addr, peer.status
        );
    }
    backend.shutdown().await;
    Ok(())
}

async fn send(config: AppConfig, target: &str, path: PathBuf) -> Result<()> {
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let backend = Backend::start(config, events).await?;

    let peer = tokio::time::timeout(PEER_WAIT, wait_for_peer(&backend, target))
        .await
        .with_context(|| format!("peer {} not found on the network", target))?;

    let id = backend
        .manager()
        .initiate_send(&peer.peer_id, &path)
        .await
        .with_context(|| format!("cannot send {}", path.display()))?;

    let outcome = loop {
        match rx.recv().await {
            Ok(AppEvent::TransferFinished {
                session_id,
                outcome,
                ..
            }) if session_id == id => break outcome,
            Ok(ev @ AppEvent::TransferStateChanged(_)) => print_event(&ev),
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => bail!("event bus closed"),
        }
    };

    backend.shutdown().await;
    println!("{}", outcome.user_message());
    match outcome {
        TransferOutcome::Completed => Ok(()),
        _ => std::process::exit(1),
    }
}

async fn wait_for_peer(backend: &Backend, target: &str) -> Peer {
    loop {
        let found = backend
            .registry()
            .read()
            .await
            .snapshot()
            .into_iter()
            .find(|p| p.peer_id == target || p.display_name == target);
        if let Some(peer) = found {
            return peer;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn print_event(event: &AppEvent) {
    match event {
        AppEvent::Status(msg) => println!("{}", msg),
        AppEvent::Error(msg) => eprintln!("error: {}", msg),
        AppEvent::PeerListChanged(peers) => println!("{} peer(s) on the network", peers.len()),
        AppEvent::TransferStateChanged(p) => println!(
            "[{}] {} {:5.1}%  {}  ETA {}",
            p.state,
            p.file_name,
            p.fraction() * 100.0,
            format_speed(p.smoothed_speed),
            format_eta(p.eta)
        ),
        AppEvent::TransferFinished {
            file_name,
            role,
            outcome,
            ..
        } => println!("{} ({}): {}", file_name, role, outcome.user_message()),
        AppEvent::IncomingRequest { .. } => {}
    }
}
