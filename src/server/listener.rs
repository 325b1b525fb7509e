use std::io;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::ServerConfig;
use crate::http::connection::Connection;
use crate::server::context::ServerContext;

/// Accepts TCP connections and spawns a [`Connection`] for each.
///
/// Transient accept errors are logged and the loop keeps going; only a
/// broken listener stops it.
pub async fn run(ctx: Arc<ServerContext>, cfg: &ServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.listen_addr).await?;
    info!("Listening on {}", cfg.listen_addr);

    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let _ = socket.set_nodelay(true);
                let local = socket
                    .local_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "-".to_string());
                tracing::debug!(remote = %peer, "accepted connection");
                Connection::spawn(
                    socket,
                    local,
                    peer.to_string(),
                    ctx.clone(),
                    cfg.buffer_size,
                );
            }
            Err(err) if is_fatal_accept_error(&err) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "accept failed, retrying");
            }
        }
    }
}

/// Accepts Unix-domain stream connections and spawns a [`Connection`] for
/// each.
#[cfg(unix)]
pub async fn run_unix(
    ctx: Arc<ServerContext>,
    path: std::path::PathBuf,
    buffer_size: usize,
) -> anyhow::Result<()> {
    use tokio::net::UnixListener;

    // A socket file left over from a previous run would make bind fail.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!("Listening on {}", path.display());

    let local = path.display().to_string();
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                tracing::debug!(remote = ?addr, "accepted connection");
                Connection::spawn(
                    socket,
                    local.clone(),
                    format!("{:?}", addr),
                    ctx.clone(),
                    buffer_size,
                );
            }
            Err(err) if is_fatal_accept_error(&err) => return Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "accept failed, retrying");
            }
        }
    }
}

/// Errors that mean the listener itself is broken.
fn is_fatal_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput
    )
}
