//! CLI client for a running Zaku server.
//!
//! Covers the queue verbs plus pub/sub, one operation per invocation.

use clap::{Parser, Subcommand};

use zaku::client::Client;
use zaku::core::value::Value;

#[derive(Debug, Parser)]
#[command(name = "zaku-cli", version, about = "Zaku CLI: queue and pub/sub commands")]
struct Cli {
    /// Address of the Zaku server.
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a queue (idempotent)
    Init { queue: String },

    /// Append a task carrying a text payload
    Add {
        queue: String,
        message: String,
        /// Client-supplied task id
        #[arg(long)]
        id: Option<String>,
        /// Claim TTL in seconds
        #[arg(long)]
        ttl: Option<f64>,
    },

    /// Claim the oldest pending task
    Take { queue: String },

    /// Mark a claimed task done
    Done { queue: String, task_id: String },

    /// Revert a claimed task to pending
    Reset { queue: String, task_id: String },

    /// Delete every task in a queue
    Clear { queue: String },

    /// Delete a queue entirely
    Remove { queue: String },

    /// Publish a message to a topic
    Pub { topic: String, message: String },

    /// Stream messages from a topic
    Sub {
        topic: String,
        /// Idle timeout in seconds; the stream ends after this much silence
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Round-trip check
    Ping,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let client = match (std::env::var("ZAKU_USER"), std::env::var("ZAKU_KEY")) {
        (Ok(user), Ok(key)) => Client::connect_with_auth(&cli.addr, &user, &key).await?,
        _ => Client::connect(&cli.addr).await?,
    };

    match cli.command {
        Command::Init { queue } => {
            client.init_queue(&queue).await?;
            println!("ok");
        }
        Command::Add {
            queue,
            message,
            id,
            ttl,
        } => {
            let payload = Value::map([("text", Value::Str(message))]);
            let task_id = client
                .add_with(&queue, Some(payload), id.as_deref(), ttl)
                .await?;
            println!("{task_id}");
        }
        Command::Take { queue } => match client.take(&queue).await? {
            Some((task_id, payload)) => {
                println!("{task_id}");
                if let Some(payload) = payload {
                    println!("{payload:?}");
                }
            }
            None => println!("(empty)"),
        },
        Command::Done { queue, task_id } => {
            client.mark_done(&queue, &task_id).await?;
            println!("ok");
        }
        Command::Reset { queue, task_id } => {
            client.mark_reset(&queue, &task_id).await?;
            println!("ok");
        }
        Command::Clear { queue } => {
            client.clear_queue(&queue).await?;
            println!("ok");
        }
        Command::Remove { queue } => {
            client.remove_queue(&queue).await?;
            println!("ok");
        }
        Command::Pub { topic, message } => {
            let count = client
                .publish(&topic, Value::map([("text", Value::Str(message))]))
                .await?;
            println!("delivered to {count} subscriber(s)");
        }
        Command::Sub { topic, timeout } => {
            let mut stream = client.subscribe_stream(&topic, timeout).await?;
            while let Some(event) = stream.next().await {
                println!("{event:?}");
            }
        }
        Command::Ping => {
            client.ping().await?;
            println!("pong");
        }
    }
    Ok(())
}
