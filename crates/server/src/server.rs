//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket and gives
//! each one its own upload controller. Connections are independent: a
//! session id only has meaning within the connection that created it.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sluice_protocol::constants::WS_MAX_MESSAGE_SIZE;
use sluice_transfer::UploadContext;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use crate::ServerError;
use crate::connection::{self, Connection};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

pub struct UploadServer {
    addr: SocketAddr,
    ctx: UploadContext,
    connections: Mutex<HashMap<u64, Connection>>,
    next_conn: AtomicU64,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl UploadServer {
    /// Creates a server sharing `ctx` between all connections.
    ///
    /// Fails if the upload options are unusable.
    pub fn new(config: ServerConfig, ctx: UploadContext) -> Result<Arc<Self>, ServerError> {
        ctx.options.validate()?;
        Ok(Arc::new(Self {
            addr: SocketAddr::new(config.host, config.port),
            ctx,
            connections: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }))
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Aborts upload `id` on every connection that has it.
    ///
    /// Returns the number of connections the request was sent to.
    pub async fn abort_upload(&self, id: &str) -> usize {
        let handles: Vec<_> = self
            .connections
            .lock()
            .await
            .values()
            .map(Connection::controller)
            .collect();

        let mut sent = 0;
        for handle in handles {
            if handle.abort(id).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Closes every open connection.
    pub async fn disconnect_all(&self) {
        for conn in self.connections.lock().await.values() {
            conn.close();
        }
    }

    /// Gracefully shuts down the server.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    self.disconnect_all().await;
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades a TCP connection to WebSocket and serves it until the peer
    /// goes away.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        tracing::info!(%peer_addr, "WebSocket connection established");

        let (conn, finished) = connection::spawn_connection(
            ws_stream,
            peer_addr,
            self.ctx.clone(),
            self.cancel.clone(),
        );

        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().await.insert(conn_id, conn);

        if let Err(e) = finished.await {
            tracing::error!(%peer_addr, "read pump panicked: {e}");
        }

        // Dropping the connection lets its controller wind down.
        self.connections.lock().await.remove(&conn_id);
        Ok(())
    }
}
