//! One active topic: a store-channel forwarder plus local fan-out.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::core::error::Result;
use crate::store::Store;

/// Events buffered per topic before slow subscribers start dropping.
const FANOUT_CAPACITY: usize = 256;

pub type TopicName = String;

#[derive(Debug)]
pub struct Topic {
    name: TopicName,
    tx: broadcast::Sender<Bytes>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl Topic {
    /// Open the topic: subscribe to its store channel, then bridge every
    /// channel message into the local fan-out. The store subscription is
    /// established before this returns, so an event published after `open`
    /// completes is never missed.
    pub(crate) async fn open(
        name: impl Into<TopicName>,
        store: &Arc<dyn Store>,
        channel: &str,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let (tx, _) = broadcast::channel(FANOUT_CAPACITY);
        let mut channel_sub = store.subscribe(channel).await?;

        let topic = Arc::new(Topic {
            name,
            tx: tx.clone(),
            forwarder: Mutex::new(None),
        });

        let handle = tokio::spawn(async move {
            while let Some(message) = channel_sub.recv().await {
                // send() fails only when no local subscriber is live; the
                // event is simply not deliverable here
                let _ = tx.send(message);
            }
        });
        *topic.forwarder.lock() = Some(handle);
        Ok(topic)
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    /// Register a local subscriber on the fan-out.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.tx.subscribe()
    }

    /// Live local subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Drop for Topic {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}
