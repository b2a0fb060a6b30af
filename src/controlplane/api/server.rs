//! API Server
//!
//! Serves the REST router until shutdown is signalled.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::cluster::SystemService;
use crate::controlplane::HostContext;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

impl ApiServerConfig {
    pub fn from_addr(addr: &str) -> Result<Self> {
        let rest_addr = addr
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid api address '{}': {}", addr, e)))?;
        Ok(Self { rest_addr })
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    host: Arc<HostContext>,
    system: Arc<SystemService>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, host: Arc<HostContext>, system: Arc<SystemService>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            host,
            system,
            shutdown_tx,
        }
    }

    /// Run the API server until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server on {}", self.config.rest_addr);

        let rest_handle = self.spawn_rest_server();
        match rest_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("REST server task failed: {:?}", e);
                Err(Error::Internal(format!("REST server task failed: {}", e)))
            }
        }
    }

    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let app = RestRouter::new(self.host.clone(), self.system.clone()).build();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move { run_rest_server(addr, app, shutdown_rx).await })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_rest_server(
    addr: SocketAddr,
    app: axum::Router,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[test]
    fn test_config_from_addr() {
        let config = ApiServerConfig::from_addr("127.0.0.1:9000").unwrap();
        assert_eq!(config.rest_addr.port(), 9000);
        assert!(ApiServerConfig::from_addr("nowhere").is_err());
    }
}
