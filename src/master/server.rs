use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::master::registry::MasterRegistry;

/// Accepts worker connections and hands each to the registry
pub struct MasterServer {
    listener: TcpListener,
    registry: MasterRegistry,
}

impl MasterServer {
    /// Bind the registry's configured listen address
    pub async fn bind(registry: MasterRegistry) -> Result<Self> {
        let listener = TcpListener::bind(registry.config().listen_addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &MasterRegistry {
        &self.registry
    }

    /// Accept until `shutdown` is cancelled, then drop every worker link.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(addr = %self.local_addr()?, "Master listening for workers");

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
            }
            tracing::debug!(peer = %peer, "Accepted connection");

            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.serve_connection(stream, peer.to_string()).await {
                    tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                }
            });
        }

        tracing::info!(nodes = self.registry.node_count(), "Master shutting down");
        self.registry.close_all();
        Ok(())
    }
}
