//! Process-wide topic table.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::error::Result;
use crate::core::topics::topic::{Topic, TopicName};
use crate::store::Store;

/// Thread-safe store for active topics, constructed once at startup and
/// passed through the server context.
pub struct TopicRegistry {
    store: Arc<dyn Store>,
    prefix: String,
    topics: DashMap<TopicName, Arc<Topic>>,
}

impl TopicRegistry {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            topics: DashMap::new(),
        }
    }

    fn channel(&self, topic: &str) -> String {
        format!("{}:topic:{}", self.prefix, topic)
    }

    /// Register a local subscriber, creating the topic on first use.
    pub async fn subscribe(&self, name: &str) -> Result<broadcast::Receiver<Bytes>> {
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic.subscribe());
        }
        let opened = Topic::open(name, &self.store, &self.channel(name)).await?;
        debug!(topic = name, "topic created");
        // a racing subscribe may have inserted first; the loser's forwarder
        // is torn down by Drop
        let topic = self
            .topics
            .entry(name.to_string())
            .or_insert(opened)
            .clone();
        Ok(topic.subscribe())
    }

    /// Broadcast a payload. Returns the number of subscribers the event was
    /// handed to on this fabric, which is not proof of receipt.
    pub async fn publish(&self, name: &str, payload: Bytes) -> Result<usize> {
        let local = self
            .topics
            .get(name)
            .map(|topic| topic.subscriber_count())
            .unwrap_or(0);
        self.store.publish(&self.channel(name), payload).await?;
        Ok(local)
    }

    /// Drop the topic if its last local subscriber has left. Called by
    /// subscription pumps on their way out.
    pub fn release(&self, name: &str) {
        let remove = self
            .topics
            .get(name)
            .map(|topic| topic.subscriber_count() == 0)
            .unwrap_or(false);
        if remove {
            self.topics.remove(name);
            debug!(topic = name, "last subscriber left, topic dropped");
        }
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
