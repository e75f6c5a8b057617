pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod store;
pub mod util;

use crate::broker::server::start_server;
use crate::config::Config;

pub async fn run(config: Config) -> anyhow::Result<()> {
    start_server(config).await
}
