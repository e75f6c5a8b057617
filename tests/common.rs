use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use zaku::broker::serve;
use zaku::config::Config;
use zaku::store::{MemoryStore, Store};

pub fn init_logging() {
    use once_cell::sync::OnceCell;
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("zaku=debug")
            .with_test_writer()
            .try_init();
    });
}

/// Spawn a server on an ephemeral port with a fresh in-process store.
pub async fn spawn_server() -> SocketAddr {
    spawn_server_with(Config::default()).await
}

pub async fn spawn_server_with(config: Config) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    tokio::spawn(async move {
        let _ = serve(listener, config, store).await;
    });
    addr
}
