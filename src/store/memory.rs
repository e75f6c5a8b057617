//! In-process store provider.
//!
//! Implements the full backing-store contract with process-local state:
//! documents and lists in sharded maps, channels over tokio broadcast. Used
//! standalone and in tests; a Redis/JSON deployment satisfies the same trait
//! out of tree.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::core::error::Result;
use crate::store::{ChannelSubscription, Store};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<String, serde_json::Value>,
    lists: DashMap<String, VecDeque<String>>,
    channels: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<Bytes> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_json(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.docs.insert(key.to_string(), value);
        Ok(())
    }

    async fn put_json_nx(&self, key: &str, value: serde_json::Value) -> Result<bool> {
        // entry() holds the shard lock, making check-then-insert atomic
        let mut inserted = false;
        self.docs.entry(key.to_string()).or_insert_with(|| {
            inserted = true;
            value
        });
        Ok(inserted)
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.docs.get(key).map(|entry| entry.value().clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.docs.remove(key).is_some())
    }

    async fn list_push_head(&self, key: &str, item: String) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_front(item);
        Ok(())
    }

    async fn list_push_tail(&self, key: &str, item: String) -> Result<()> {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(item);
        Ok(())
    }

    async fn list_pop_head(&self, key: &str) -> Result<Option<String>> {
        match self.lists.get_mut(key) {
            Some(mut list) => Ok(list.pop_front()),
            None => Ok(None),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|list| list.len()).unwrap_or(0))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .docs
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        for entry in self.lists.iter() {
            if entry.key().starts_with(prefix) {
                keys.push(entry.key().clone());
            }
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, message: Bytes) -> Result<usize> {
        match self.channels.get(channel) {
            // send() errors when every receiver is gone; that is 0 delivered
            Some(tx) => Ok(tx.send(message).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription> {
        Ok(ChannelSubscription::new(self.channel(channel).subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn documents_put_get_delete() {
        let store = MemoryStore::new();
        store.put_json("k1", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get_json("k1").await.unwrap(), Some(json!({"a": 1})));
        assert!(store.delete("k1").await.unwrap());
        assert!(!store.delete("k1").await.unwrap());
        assert_eq!(store.get_json("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_nx_only_writes_once() {
        let store = MemoryStore::new();
        assert!(store.put_json_nx("k", json!(1)).await.unwrap());
        assert!(!store.put_json_nx("k", json!(2)).await.unwrap());
        assert_eq!(store.get_json("k").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn lists_are_ordered() {
        let store = MemoryStore::new();
        store.list_push_tail("l", "a".into()).await.unwrap();
        store.list_push_tail("l", "b".into()).await.unwrap();
        store.list_push_head("l", "z".into()).await.unwrap();
        assert_eq!(store.list_len("l").await.unwrap(), 3);
        assert_eq!(store.list_pop_head("l").await.unwrap(), Some("z".into()));
        assert_eq!(store.list_pop_head("l").await.unwrap(), Some("a".into()));
        assert_eq!(store.list_pop_head("l").await.unwrap(), Some("b".into()));
        assert_eq!(store.list_pop_head("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_matches_prefix_only() {
        let store = MemoryStore::new();
        store.put_json("app:a", json!(1)).await.unwrap();
        store.put_json("app:b", json!(2)).await.unwrap();
        store.put_json("other:c", json!(3)).await.unwrap();
        let mut keys = store.scan_prefix("app:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["app:a".to_string(), "app:b".to_string()]);
    }

    #[tokio::test]
    async fn publish_reaches_current_subscribers_only() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", Bytes::from_static(b"early")).await.unwrap(), 0);

        let mut sub = store.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", Bytes::from_static(b"hello")).await.unwrap(), 1);
        assert_eq!(sub.recv().await, Some(Bytes::from_static(b"hello")));
    }
}
