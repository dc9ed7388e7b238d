//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::BoundaryError;
use crate::server::handler::ConnectionHandler;

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Accepts connections and hands each to the [`ConnectionHandler`] on its
/// own task.
pub struct RelayServer {
    listener: TcpListener,
    handler: Arc<ConnectionHandler>,
}

impl RelayServer {
    pub fn new(listener: TcpListener, handler: ConnectionHandler) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` flips to `true` (or its sender is dropped),
    /// then clean up every live session.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = ?self.listener.local_addr().ok(), "Relay listening");

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut shutdown) => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move {
                                match handler.handle(stream, peer).await {
                                    Ok(()) => {}
                                    Err(e @ (BoundaryError::Handshake(_)
                                    | BoundaryError::UnknownPath(_)
                                    | BoundaryError::MissingToken)) => {
                                        debug!(%peer, error = %e, "Connection refused");
                                    }
                                    Err(e) => info!(%peer, error = %e, "Connection ended early"),
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "Failed to accept connection"),
                    }
                }
            }
        }

        info!("Relay shutting down");
        self.handler.hub().shutdown().await;
    }
}
