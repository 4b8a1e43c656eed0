//! The client-facing server: TCP accept loop, connection handoff and graceful shutdown.

pub mod connection;
mod error;
pub mod gateway;
pub mod message;
pub mod registry;
pub mod schema;
pub mod sql;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing_futures::Instrument;

pub use self::connection::Connection;
pub use self::error::Error;
pub use self::gateway::Gateway;

use self::sql::Cluster;
use self::sql::SqlEngine;

/// The protocol version advertised by this server. Clients must send exactly this value,
/// little-endian, as their first 8 bytes.
pub const PROTOCOL_VERSION: u64 = 0x7139_6dcb_52a8_04f1;

/// Default heartbeat timeout advertised to clients, in milliseconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT: u64 = 15_000;

/// Capacity of the queue handing accepted sockets over to the serve loop.
const INCOMING_BACKLOG: usize = 64;

/// Server tunables.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// The address to listen on.
    pub bind: String,
    /// The heartbeat timeout advertised to clients, in milliseconds. Connections with no
    /// complete request within this window are aborted.
    pub heartbeat_timeout: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// The TCP server hosting client connections.
///
/// Accepting and serving are decoupled: the accept loop pushes sockets into a bounded queue
/// which the serve loop drains, spawning one connection task per socket. Shutdown is a watch
/// signal observed by the accept loop, the serve loop and every live connection.
pub struct Server<E: SqlEngine, C: Cluster> {
    engine: Arc<E>,
    cluster: Arc<C>,
    options: ServerOptions,
}

impl<E: SqlEngine, C: Cluster> Server<E, C> {
    pub fn new(engine: Arc<E>, cluster: Arc<C>, options: ServerOptions) -> Self {
        Self {
            engine,
            cluster,
            options,
        }
    }

    /// Bind the listening socket and start serving, returning a handle for shutdown.
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.options.bind).await?;
        let local_addr = listener.local_addr()?;
        let (tx_shutdown, rx_shutdown) = watch::channel(false);
        let (tx_conn, rx_conn) = mpsc::channel(INCOMING_BACKLOG);

        tokio::spawn(
            accept_loop(listener, tx_conn, rx_shutdown.clone())
                .instrument(tracing::info_span!("accept", addr = %local_addr)),
        );
        tokio::spawn(
            serve_loop(
                rx_conn,
                rx_shutdown,
                self.engine,
                self.cluster,
                self.options.heartbeat_timeout,
            )
            .instrument(tracing::info_span!("serve", addr = %local_addr)),
        );

        tracing::info!(%local_addr, "server listening");
        Ok(ServerHandle {
            local_addr,
            tx_shutdown,
        })
    }
}

/// A handle to a running server.
pub struct ServerHandle {
    local_addr: std::net::SocketAddr,
    tx_shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and abort the live ones.
    pub fn shutdown(&self) {
        let _ = self.tx_shutdown.send(true);
    }
}

/// Accept sockets and hand them to the serve loop over the bounded incoming queue.
async fn accept_loop(listener: TcpListener, tx_conn: mpsc::Sender<TcpStream>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "accepted connection");
                        if tx_conn.send(socket).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::error!(error=%err, "error accepting connection");
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("accept loop stopping");
                return;
            }
        }
    }
}

/// Drain the incoming queue, spawning one task per connection.
async fn serve_loop<E: SqlEngine, C: Cluster>(
    mut rx_conn: mpsc::Receiver<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
    engine: Arc<E>,
    cluster: Arc<C>,
    heartbeat_timeout: u64,
) {
    loop {
        tokio::select! {
            incoming = rx_conn.recv() => {
                let socket = match incoming {
                    Some(socket) => socket,
                    None => return,
                };
                let gateway = Gateway::new(engine.clone(), cluster.clone(), heartbeat_timeout);
                let conn = Connection::new(
                    socket,
                    gateway,
                    PROTOCOL_VERSION,
                    Duration::from_millis(heartbeat_timeout),
                )
                .with_shutdown(shutdown.clone());
                tokio::spawn(conn.run().instrument(tracing::debug_span!("connection")));
            }
            _ = shutdown.changed() => {
                tracing::info!("serve loop stopping");
                return;
            }
        }
    }
}
