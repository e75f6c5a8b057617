use clap::Parser;
use std::path::PathBuf;
use std::process;

use zaku::config::{load_config, Config};
use zaku::logging::init_logging;
use zaku::run;

/// Zaku task-queue server.
#[derive(Debug, Parser)]
#[command(name = "zakud", version, about = "Zaku task-queue server")]
struct Args {
    /// Listen host.
    #[arg(long)]
    host: Option<String>,

    /// Listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    /// Kill the previous holder of the port before binding.
    #[arg(long)]
    free_port: bool,

    /// Path to a zaku.toml config file.
    #[arg(long, default_value = "zaku.toml")]
    config: PathBuf,

    /// Key namespace prefix in the backing store.
    #[arg(long)]
    prefix: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _guard = init_logging(args.verbose);

    let mut config = if args.config.exists() {
        match load_config(&args.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("[FATAL] failed to load {}: {e}", args.config.display());
                process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.free_port {
        config.server.free_port = true;
    }
    if let Some(prefix) = args.prefix {
        config.store.prefix = prefix;
    }
    config.apply_env();

    tokio::select! {
        result = run(config) => {
            if let Err(e) = result {
                eprintln!("[FATAL] server crashed: {e}");
                process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
}
