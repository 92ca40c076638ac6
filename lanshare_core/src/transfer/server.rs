use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;

use crate::error::StartupError;
use crate::manager::TransferManager;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

const LISTEN_BACKLOG: u32 = 128;

/// Bind the transfer listener. A nonzero `buffer_size` sets SO_RCVBUF before
/// `listen` so accepted connections inherit it.
pub fn bind_listener(addr: SocketAddr, buffer_size: usize) -> Result<TcpListener, StartupError> {
    let fail = |source| StartupError::TransferListener { addr, source };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(fail)?;
    #[cfg(unix)]
    socket.set_reuseaddr(true).map_err(fail)?;
    if buffer_size > 0 {
        let size = u32::try_from(buffer_size).unwrap_or(u32::MAX);
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::debug!("Could not set SO_RCVBUF to {}: {}", size, e);
        }
    }
    socket.bind(addr).map_err(fail)?;
    let listener = socket.listen(LISTEN_BACKLOG).map_err(fail)?;
    tracing::info!(
        "Transfer listener on {}",
        listener.local_addr().unwrap_or(addr)
    );
    Ok(listener)
}

/// Accept transfer connections until `shutdown` fires; each one gets its own task
pub async fn run_server(
    listener: TcpListener,
    manager: TransferManager,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, remote)) => {
                tracing::debug!("Transfer connection from {}", remote);
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.on_incoming_connection(stream, remote).await;
                });
            }
            Err(e) => {
                tracing::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("Transfer listener stopped");
}
