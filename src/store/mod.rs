//! Backing-store contract.
//!
//! The queue engine and the pub/sub fabric talk to the store only through
//! this trait: JSON documents by key, ordered lists, key-prefix iteration,
//! and publish/subscribe channels. Any store offering these four primitives
//! (a key-value store with JSON support and native pub/sub, for example)
//! can sit behind it.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::core::error::Result;

/// A live subscription to one store channel.
///
/// Messages published before `subscribe` returned are never delivered.
pub struct ChannelSubscription {
    rx: broadcast::Receiver<Bytes>,
}

impl ChannelSubscription {
    pub fn new(rx: broadcast::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the channel is gone. Lagged messages are
    /// skipped; delivery is at-most-once.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "store channel subscriber lagged, dropping");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Write a JSON document, replacing any existing value.
    async fn put_json(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Write a JSON document only if the key is absent. Returns whether the
    /// write happened.
    async fn put_json_nx(&self, key: &str, value: serde_json::Value) -> Result<bool>;

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Delete a document; returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn list_push_head(&self, key: &str, item: String) -> Result<()>;

    async fn list_push_tail(&self, key: &str, item: String) -> Result<()>;

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>>;

    async fn list_len(&self, key: &str) -> Result<usize>;

    /// All keys starting with `prefix`, in unspecified order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Broadcast `message` on `channel`; returns the number of current
    /// channel subscribers the message was handed to.
    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize>;

    /// Open a subscription on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription>;
}
