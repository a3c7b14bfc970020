//! Accept loop and connection lifecycle

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LimitsConfig};
use crate::recording::RecordingHandler;
use crate::Result;

use super::connection_pool::ConnectionPool;
use super::{HttpHandler, SHUTDOWN_TIMEOUT_MS};

/// HTTP server in front of a [`RecordingHandler`]
pub struct ProxyServer {
    config: Arc<Config>,
    recording: Arc<RecordingHandler>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Create a new server
    #[must_use]
    pub fn new(config: Config, recording: Arc<RecordingHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            connection_pool: ConnectionPool::new(config.limits.max_connections),
            config: Arc::new(config),
            recording,
            shutdown_tx,
        }
    }

    /// Sender that stops the server when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured address and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until Ctrl-C or a
    /// shutdown signal, then drain open connections
    ///
    /// # Errors
    ///
    /// Returns error if the listener address cannot be read
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            "Listening on {} (recordings in {})",
            listener.local_addr()?,
            self.config.storage_location.display()
        );

        let shutdown = shutdown_signal(self.shutdown_tx.subscribe());
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => self.spawn_connection(&mut connections, stream, peer_addr),
                        Err(e) => error!("Accept error: {e}"),
                    }
                }
            }
        }

        info!("Initiating graceful shutdown");
        self.shutdown_tx.send(()).ok();

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = connections.join_next().await {
                if let Err(e) = result {
                    warn!("Connection task error: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Aborting {} connections still open", connections.len());
            connections.abort_all();
        }

        let active = self.recording.active_sessions();
        if active > 0 {
            warn!("{active} session(s) still active at shutdown");
        }
        info!("Shutdown complete");
        Ok(())
    }

    fn spawn_connection(&self, connections: &mut JoinSet<()>, stream: TcpStream, peer_addr: SocketAddr) {
        let Some(guard) = self.connection_pool.try_acquire() else {
            warn!("Connection limit reached, rejecting {peer_addr}");
            return;
        };

        let recording = Arc::clone(&self.recording);
        let limits = self.config.limits.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        connections.spawn(async move {
            let _guard = guard;
            serve_connection(stream, peer_addr, recording, limits, shutdown_rx).await;
        });
    }
}

async fn shutdown_signal(mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = shutdown_rx.recv() => info!("Received shutdown signal"),
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    recording: Arc<RecordingHandler>,
    limits: LimitsConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Accepted connection from {peer_addr}");

    let service = service_fn(move |request| {
        let recording = Arc::clone(&recording);
        let limits = limits.clone();
        async move { Ok::<_, Infallible>(HttpHandler::handle(&recording, &limits, request).await) }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown_rx.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    if let Err(e) = result {
        debug!("Connection from {peer_addr} ended with error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AssetsStore;
    use crate::ProxyError;
    use std::path::{Path, PathBuf};

    struct NoStore;

    impl AssetsStore for NoStore {
        fn restore(&self, _: &Path) -> Result<PathBuf> {
            Err(ProxyError::Other("no store".to_string()))
        }
        fn push(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn reset(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn test_server(max_connections: usize) -> ProxyServer {
        let dir = std::env::temp_dir();
        let recording = Arc::new(RecordingHandler::new(&dir, Arc::new(NoStore)).unwrap());
        let config = Config {
            limits: LimitsConfig {
                max_connections,
                ..LimitsConfig::default()
            },
            ..Config::default()
        };
        ProxyServer::new(config, recording)
    }

    #[test]
    fn test_server_creation() {
        let server = test_server(10);
        assert_eq!(server.connection_pool.max_connections(), 10);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let server = test_server(10);
        let shutdown = server.shutdown_handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let handle = tokio::spawn(async move { server.serve(listener).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.send(()).ok();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.is_ok());
    }
}
