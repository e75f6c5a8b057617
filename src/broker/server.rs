//! Server entry point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task;
use tracing::{error, info, warn};

use crate::broker::connection::handle_connection;
use crate::config::Config;
use crate::core::queue::QueueEngine;
use crate::core::reaper::Reaper;
use crate::core::topics::TopicRegistry;
use crate::store::{MemoryStore, Store};

/// Process-wide state, constructed at startup and passed explicitly to every
/// connection task.
pub struct ServerContext {
    pub config: Config,
    pub engine: Arc<QueueEngine>,
    pub topics: Arc<TopicRegistry>,
    next_conn_id: AtomicU64,
}

impl ServerContext {
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let engine = Arc::new(QueueEngine::new(
            Arc::clone(&store),
            config.store.prefix.clone(),
            config.queues.default_ttl_seconds,
        ));
        let topics = Arc::new(TopicRegistry::new(store, config.store.prefix.clone()));
        Self {
            config,
            engine,
            topics,
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Start the server with the in-process store.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let listener = bind(&config).await?;
    serve(listener, config, store).await
}

/// Bind the listen socket, optionally evicting the previous port holder.
pub async fn bind(config: &Config) -> anyhow::Result<TcpListener> {
    let addr = config.server.bind_addr();
    match TcpListener::bind(&addr).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && config.server.free_port => {
            warn!(addr, "port in use, evicting previous holder");
            free_port(config.server.port);
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(TcpListener::bind(&addr).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Accept loop over an already-bound listener. Spawns the reaper and one
/// task per connection.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    store: Arc<dyn Store>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "zaku listening");
    let ctx = Arc::new(ServerContext::new(config, store));

    let reaper = Reaper::new(Arc::clone(&ctx.engine));
    task::spawn(reaper.run());

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let ctx = Arc::clone(&ctx);
        let conn_id = ctx.next_conn_id();
        info!(%peer_addr, conn_id, "client connected");

        task::spawn(async move {
            if let Err(e) = handle_connection(socket, ctx, conn_id).await {
                error!(%peer_addr, conn_id, error = %e, "connection error");
            } else {
                info!(%peer_addr, conn_id, "client disconnected");
            }
        });
    }
}

#[cfg(unix)]
fn free_port(port: u16) {
    // same behavior as the port-killing startup flag of the original
    // deployment; best effort only
    let status = std::process::Command::new("fuser")
        .arg("-k")
        .arg(format!("{port}/tcp"))
        .status();
    if let Err(e) = status {
        warn!(port, error = %e, "could not evict port holder");
    }
}

#[cfg(not(unix))]
fn free_port(port: u16) {
    warn!(port, "--free-port is not supported on this platform");
}
