//! Main network handler

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::proxy::HttpProxy;
use crate::Result;

use super::{HttpHandler, SHUTDOWN_TIMEOUT_MS};

/// Accepts client connections and hands them to the proxy
///
/// At most `limits.max_connections` connections are served at once; one
/// arriving over the limit is closed without being read.
pub struct NetworkHandler {
    config: Arc<ServerConfig>,
    proxy: Arc<HttpProxy>,
    connection_slots: Arc<Semaphore>,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkHandler {
    /// Create a handler forwarding to `config.target_url`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: ServerConfig) -> Result<Self> {
        let config = Arc::new(config);
        let proxy = HttpProxy::new(Arc::clone(&config))?;
        Ok(Self::with_proxy(proxy))
    }

    /// Create a handler around an existing proxy
    #[must_use]
    pub fn with_proxy(proxy: HttpProxy) -> Self {
        let config = Arc::new(proxy.config().clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            connection_slots: Arc::new(Semaphore::new(config.limits.max_connections.max(1))),
            config,
            proxy: Arc::new(proxy),
            shutdown_tx,
        }
    }

    /// Proxy serving the connections
    #[must_use]
    pub fn proxy(&self) -> &Arc<HttpProxy> {
        &self.proxy
    }

    /// Sender that stops [`Self::run`] and [`Self::serve`] when signalled
    #[must_use]
    pub fn shutdown_signal(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Listen on `0.0.0.0:<listen_port>` until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the port cannot be bound
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.listen_port));
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from `listener` until Ctrl-C or a shutdown signal
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(
            "Listening on {} (proxy to {}, cassettes in {})",
            addr,
            self.config.target_url,
            self.config.cassette_dir.display()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer_addr) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&self.connection_slots).try_acquire_owned() else {
                        warn!(
                            "Connection limit of {} reached, rejecting {}",
                            self.config.limits.max_connections, peer_addr
                        );
                        drop(stream);
                        continue;
                    };
                    debug!(
                        "Accepted {} ({} slots left)",
                        peer_addr,
                        self.connection_slots.available_permits()
                    );

                    let proxy = Arc::clone(&self.proxy);
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = HttpHandler::handle_connection(stream, proxy).await {
                            debug!("Connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        warn!("Connection task failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("{} connections still open after {:?}, aborting", tasks.len(), shutdown_timeout);
            tasks.shutdown().await;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
