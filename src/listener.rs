//! Accept loop with a bounded number of concurrently served connections.

use std::fmt::Debug;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use futures::FutureExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::codec::WireError;
use crate::context::RendezvousContext;
use crate::dispatcher::ConnectionHandler;

/// Pause after a failed `accept`, so a persistent failure such as running out
/// of file descriptors does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Bind the listening socket. Failing to bind is fatal.
pub async fn bind(listen_addr: IpAddr, port: u16) -> Result<TcpListener> {
    TcpListener::bind((listen_addr, port))
        .await
        .with_context(|| format!("Failed to bind to local TCP port {listen_addr}:{port}. Is an instance of this program already running?"))
}

/// A bound listener together with the context its connections are served
/// with.
#[derive(Debug)]
pub struct RendezvousServer {
    listener: TcpListener,
    ctx: RendezvousContext,
}

impl RendezvousServer {
    pub fn new(listener: TcpListener, ctx: RendezvousContext) -> Self {
        Self { listener, ctx }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &RendezvousContext {
        &self.ctx
    }

    /// Serve connections until the process exits.
    pub async fn run(self) -> Result<()> {
        run_listener(self.listener, self.ctx).await
    }
}

/// Accept connections forever, serving at most `max_connections` at a time.
///
/// A pool slot is taken before accepting, so connections beyond the limit
/// wait in the kernel's listen backlog instead of piling up in memory.
pub async fn run_listener(listener: TcpListener, ctx: RendezvousContext) -> Result<()> {
    let max_connections = ctx.cli().max_connections;
    let pool = Arc::new(Semaphore::new(max_connections));
    info!("Serving up to {max_connections} connections at a time");

    loop {
        let permit = pool
            .clone()
            .acquire_owned()
            .await
            .context("connection pool closed")?;

        let (stream, peer_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        debug!("Accepted incoming connection from {peer_address}");

        let ctx = ctx.clone();
        tokio::spawn(async move {
            answer_peer(stream, ctx, peer_address).await;
            drop(permit);
        });
    }
}

/// Serve one connection until it closes.
///
/// Errors and panics are caught and logged here; neither reaches the accept
/// loop.
pub async fn answer_peer<S>(stream: S, ctx: RendezvousContext, peer_address: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Debug + Unpin,
{
    let handler = ConnectionHandler::new(ctx, peer_address);
    let panic_result = std::panic::AssertUnwindSafe(handler.run(stream))
        .catch_unwind()
        .await;

    match panic_result {
        Ok(Ok(())) => debug!("Connection with {peer_address} closed"),
        Ok(Err(WireError::IdleTimeout(idle_timeout))) => {
            info!("Closing connection with {peer_address}, idle for more than {idle_timeout:?}")
        }
        Ok(Err(WireError::MalformedMessage(reason))) => {
            warn!("Closing connection with {peer_address} after malformed message: {reason}")
        }
        Ok(Err(e)) => warn!("Connection with {peer_address} failed: {e}"),
        Err(_panic) => error!("Connection task for {peer_address} panicked"),
    }
}
