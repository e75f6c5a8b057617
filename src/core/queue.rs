//! Per-queue state machine over the backing store.
//!
//! Key layout, all under one namespace prefix:
//! - `{prefix}:queues:{name}` - queue index marker
//! - `{prefix}:queue:{name}:pending` - ordered list of pending task ids
//! - `{prefix}:queue:{name}:claims:{id}` - claim entry `{deadline, ttl, payload}`
//! - `{prefix}:queue:{name}:meta:{id}` - task record plus encoded payload
//!
//! Every store round-trip runs under the bounded-backoff retry policy;
//! exhaustion surfaces `BACKING_STORE_UNAVAILABLE`.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::codec;
use crate::core::error::{Result, ZakuError};
use crate::core::task::{now_ms, TaskRecord, TaskStatus};
use crate::core::value::Value;
use crate::store::Store;
use crate::util::retry::Backoff;

/// Bound on the pop-then-write claim loop.
const CLAIM_ATTEMPTS: u32 = 8;

/// Outcome of one reap pass over a queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReapOutcome {
    /// Claims reverted to pending.
    pub reaped: usize,
    /// Smallest `ttl_seconds` among claims still outstanding.
    pub min_active_ttl: Option<f64>,
}

pub struct QueueEngine {
    store: Arc<dyn Store>,
    prefix: String,
    default_ttl: f64,
    backoff: Backoff,
}

impl QueueEngine {
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>, default_ttl: f64) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            default_ttl,
            backoff: Backoff::default(),
        }
    }

    fn marker_key(&self, queue: &str) -> String {
        format!("{}:queues:{}", self.prefix, queue)
    }

    fn pending_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:pending", self.prefix, queue)
    }

    fn claims_prefix(&self, queue: &str) -> String {
        format!("{}:queue:{}:claims:", self.prefix, queue)
    }

    fn claim_key(&self, queue: &str, task_id: &str) -> String {
        format!("{}{}", self.claims_prefix(queue), task_id)
    }

    fn meta_prefix(&self, queue: &str) -> String {
        format!("{}:queue:{}:meta:", self.prefix, queue)
    }

    fn meta_key(&self, queue: &str, task_id: &str) -> String {
        format!("{}{}", self.meta_prefix(queue), task_id)
    }

    /// Idempotent queue creation; also called implicitly by `add`.
    pub async fn init_queue(&self, queue: &str) -> Result<()> {
        validate_name(queue)?;
        let key = self.marker_key(queue);
        self.backoff
            .run(|| {
                self.store
                    .put_json_nx(&key, json!({ "created_at": now_ms() }))
            })
            .await?;
        Ok(())
    }

    /// Names of all registered queues.
    pub async fn list_queues(&self) -> Result<Vec<String>> {
        let prefix = format!("{}:queues:", self.prefix);
        let keys = self
            .backoff
            .run(|| self.store.scan_prefix(&prefix))
            .await?;
        Ok(keys
            .into_iter()
            .map(|k| k[prefix.len()..].to_string())
            .collect())
    }

    pub async fn pending_len(&self, queue: &str) -> Result<usize> {
        validate_name(queue)?;
        let key = self.pending_key(queue);
        self.backoff.run(|| self.store.list_len(&key)).await
    }

    /// Append a task. Fails with `CONFLICT` when `task_id` is already present
    /// in this queue, pending or claimed.
    pub async fn add(
        &self,
        queue: &str,
        task_id: Option<String>,
        payload: Option<&Value>,
        ttl: Option<f64>,
    ) -> Result<String> {
        self.init_queue(queue).await?;

        let id = match task_id {
            Some(id) if id.is_empty() => return Err(ZakuError::invalid("task id must be non-empty")),
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        let ttl = match ttl {
            Some(t) if t <= 0.0 => return Err(ZakuError::invalid("ttl must be positive")),
            Some(t) => t,
            None => self.default_ttl,
        };

        let record = TaskRecord::new(id.clone(), ttl);
        let mut doc = serde_json::to_value(&record)?;
        if let Some(payload) = payload {
            doc["payload"] = json!(encode_payload(payload));
        }

        let meta_key = self.meta_key(queue, &id);
        let inserted = self
            .backoff
            .run(|| self.store.put_json_nx(&meta_key, doc.clone()))
            .await?;
        if !inserted {
            return Err(ZakuError::conflict(format!(
                "task {id:?} already exists in queue {queue:?}"
            )));
        }

        let pending_key = self.pending_key(queue);
        self.backoff
            .run(|| self.store.list_push_tail(&pending_key, id.clone()))
            .await?;
        debug!(queue, task_id = %id, "task added");
        Ok(id)
    }

    /// Claim the oldest pending task. Returns `None` on an empty queue.
    ///
    /// Pop-then-write: the pending pop is the atomic hand-off, so no two
    /// concurrent takes can return the same id. If the claim write fails the
    /// id is re-inserted at the head and the loop retries, bounded.
    pub async fn take(
        &self,
        queue: &str,
        ttl_override: Option<f64>,
    ) -> Result<Option<(String, Option<Value>)>> {
        validate_name(queue)?;
        let pending_key = self.pending_key(queue);

        for _ in 0..CLAIM_ATTEMPTS {
            let Some(task_id) = self
                .backoff
                .run(|| self.store.list_pop_head(&pending_key))
                .await?
            else {
                return Ok(None);
            };

            let meta_key = self.meta_key(queue, &task_id);
            let Some(mut meta) = self.backoff.run(|| self.store.get_json(&meta_key)).await? else {
                // id left behind by a concurrent clear; skip it
                warn!(queue, task_id, "pending id without metadata, dropping");
                continue;
            };

            let record: TaskRecord = serde_json::from_value(strip_payload(&meta))?;
            let payload = meta
                .get("payload")
                .and_then(|v| v.as_str())
                .map(decode_payload)
                .transpose()?;

            let ttl = ttl_override.unwrap_or(record.ttl_seconds);
            let claimed_at = now_ms();
            let deadline = claimed_at + (ttl * 1000.0) as u64;

            let claim_key = self.claim_key(queue, &task_id);
            let claim_doc = json!({
                "deadline": deadline,
                "ttl": ttl,
                "payload": meta.get("payload").cloned().unwrap_or(serde_json::Value::Null),
            });
            if let Err(e) = self
                .backoff
                .run(|| self.store.put_json(&claim_key, claim_doc.clone()))
                .await
            {
                // undo the pop so the task is not lost, then bubble up
                self.store
                    .list_push_head(&pending_key, task_id.clone())
                    .await?;
                return Err(e);
            }

            meta["status"] = json!(TaskStatus::Claimed);
            meta["claimed_at"] = json!(claimed_at);
            self.backoff
                .run(|| self.store.put_json(&meta_key, meta.clone()))
                .await?;

            debug!(queue, task_id, deadline, "task claimed");
            return Ok(Some((task_id, payload)));
        }
        Err(ZakuError::store_unavailable(format!(
            "claim loop exhausted on queue {queue:?}"
        )))
    }

    /// Remove a completed task. Succeeds when the entry is already gone, to
    /// tolerate at-least-once delivery of completion signals.
    pub async fn mark_done(&self, queue: &str, task_id: &str) -> Result<()> {
        validate_name(queue)?;
        let claim_key = self.claim_key(queue, task_id);
        let meta_key = self.meta_key(queue, task_id);
        self.backoff.run(|| self.store.delete(&claim_key)).await?;
        self.backoff.run(|| self.store.delete(&meta_key)).await?;
        debug!(queue, task_id, "task done");
        Ok(())
    }

    /// Revert a claimed task to pending, re-inserting at the tail. No-op
    /// success when the task is not claimed.
    pub async fn mark_reset(&self, queue: &str, task_id: &str) -> Result<()> {
        validate_name(queue)?;
        let claim_key = self.claim_key(queue, task_id);
        let existed = self.backoff.run(|| self.store.delete(&claim_key)).await?;
        if !existed {
            return Ok(());
        }
        self.requeue(queue, task_id).await?;
        debug!(queue, task_id, "task reset");
        Ok(())
    }

    /// Revert expired claims. Each reap is conditional: the deadline is
    /// re-read before the delete so a claim completed by a racing `MARK_DONE`
    /// (or refreshed entry) is left alone.
    pub async fn reap_expired(&self, queue: &str) -> Result<ReapOutcome> {
        validate_name(queue)?;
        let prefix = self.claims_prefix(queue);
        let keys = self
            .backoff
            .run(|| self.store.scan_prefix(&prefix))
            .await?;

        let mut outcome = ReapOutcome::default();
        for key in keys {
            let task_id = key[prefix.len()..].to_string();
            let Some(claim) = self.backoff.run(|| self.store.get_json(&key)).await? else {
                continue;
            };
            let deadline = claim.get("deadline").and_then(|v| v.as_u64()).unwrap_or(0);
            let ttl = claim.get("ttl").and_then(|v| v.as_f64());

            if deadline > now_ms() {
                outcome.min_active_ttl = match (outcome.min_active_ttl, ttl) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
                continue;
            }

            // re-read guard against a just-completed MARK_DONE
            let Some(current) = self.backoff.run(|| self.store.get_json(&key)).await? else {
                continue;
            };
            let still_expired = current
                .get("deadline")
                .and_then(|v| v.as_u64())
                .map(|d| d <= now_ms())
                .unwrap_or(false);
            if !still_expired {
                continue;
            }
            if !self.backoff.run(|| self.store.delete(&key)).await? {
                continue;
            }
            self.requeue(queue, &task_id).await?;
            warn!(queue, task_id, "claim expired, task reaped to pending tail");
            outcome.reaped += 1;
        }
        Ok(outcome)
    }

    /// Delete every task in the queue but keep it registered.
    pub async fn clear_queue(&self, queue: &str) -> Result<()> {
        validate_name(queue)?;
        let pending_key = self.pending_key(queue);
        while self
            .backoff
            .run(|| self.store.list_pop_head(&pending_key))
            .await?
            .is_some()
        {}
        for prefix in [self.claims_prefix(queue), self.meta_prefix(queue)] {
            for key in self.backoff.run(|| self.store.scan_prefix(&prefix)).await? {
                self.backoff.run(|| self.store.delete(&key)).await?;
            }
        }
        debug!(queue, "queue cleared");
        Ok(())
    }

    /// Delete the queue's state and its registration.
    pub async fn remove_queue(&self, queue: &str) -> Result<()> {
        self.clear_queue(queue).await?;
        let marker = self.marker_key(queue);
        self.backoff.run(|| self.store.delete(&marker)).await?;
        debug!(queue, "queue removed");
        Ok(())
    }

    /// Tail re-insert plus metadata flip back to pending.
    async fn requeue(&self, queue: &str, task_id: &str) -> Result<()> {
        let meta_key = self.meta_key(queue, task_id);
        if let Some(mut meta) = self.backoff.run(|| self.store.get_json(&meta_key)).await? {
            meta["status"] = json!(TaskStatus::Pending);
            if let Some(obj) = meta.as_object_mut() {
                obj.remove("claimed_at");
            }
            self.backoff
                .run(|| self.store.put_json(&meta_key, meta.clone()))
                .await?;
        }
        let pending_key = self.pending_key(queue);
        self.backoff
            .run(|| self.store.list_push_tail(&pending_key, task_id.to_string()))
            .await?;
        Ok(())
    }
}

fn validate_name(queue: &str) -> Result<()> {
    if queue.is_empty() {
        return Err(ZakuError::invalid("queue name must be non-empty"));
    }
    if queue
        .chars()
        .any(|c| c.is_control() || c.is_whitespace() || c == ':')
    {
        return Err(ZakuError::invalid(format!("invalid queue name {queue:?}")));
    }
    Ok(())
}

fn encode_payload(payload: &Value) -> String {
    general_purpose::STANDARD.encode(codec::encode(payload))
}

fn decode_payload(encoded: &str) -> Result<Value> {
    let raw = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ZakuError::internal("stored payload is not valid base64"))?;
    codec::decode_all(Bytes::from(raw))
}

/// Copy of a meta document without the payload field, for record decoding.
fn strip_payload(meta: &serde_json::Value) -> serde_json::Value {
    let mut copy = meta.clone();
    if let Some(obj) = copy.as_object_mut() {
        obj.remove("payload");
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn engine() -> QueueEngine {
        QueueEngine::new(Arc::new(MemoryStore::new()), "zaku-test", 5.0)
    }

    #[tokio::test]
    async fn take_on_empty_queue_returns_none() {
        let engine = engine();
        engine.init_queue("q1").await.unwrap();
        assert!(engine.take("q1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fifo_order_under_single_claimant() {
        let engine = engine();
        let a = engine
            .add("q1", None, Some(&Value::map([("a", Value::Int(1))])), None)
            .await
            .unwrap();
        let b = engine
            .add("q1", None, Some(&Value::map([("a", Value::Int(2))])), None)
            .await
            .unwrap();

        let (id1, payload1) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(id1, a);
        assert_eq!(
            payload1.unwrap().get("a").and_then(Value::as_int),
            Some(1)
        );
        let (id2, _) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(id2, b);
        assert!(engine.take("q1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_id_collision_is_conflict() {
        let engine = engine();
        engine
            .add("q1", Some("5".into()), None, None)
            .await
            .unwrap();
        let err = engine
            .add("q1", Some("5".into()), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn reset_requeues_at_tail() {
        let engine = engine();
        let a = engine.add("q1", Some("A".into()), None, None).await.unwrap();
        engine.add("q1", Some("B".into()), None, None).await.unwrap();

        let (claimed, _) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(claimed, a);
        engine.mark_reset("q1", &a).await.unwrap();

        let (first, _) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(first, "B");
        let (second, _) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(second, "A");
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let engine = engine();
        let id = engine.add("q1", None, None, None).await.unwrap();
        engine.take("q1", None).await.unwrap().unwrap();
        engine.mark_reset("q1", &id).await.unwrap();
        let len_after_one = engine.pending_len("q1").await.unwrap();
        engine.mark_reset("q1", &id).await.unwrap();
        assert_eq!(engine.pending_len("q1").await.unwrap(), len_after_one);
    }

    #[tokio::test]
    async fn done_is_idempotent_and_removes_entirely() {
        let engine = engine();
        let id = engine.add("q1", None, None, None).await.unwrap();
        engine.take("q1", None).await.unwrap().unwrap();
        engine.mark_done("q1", &id).await.unwrap();
        engine.mark_done("q1", &id).await.unwrap();
        assert!(engine.take("q1", None).await.unwrap().is_none());
        // a done task's id is free for reuse
        engine.add("q1", Some(id), None, None).await.unwrap();
    }

    #[tokio::test]
    async fn expired_claim_is_reaped_to_tail() {
        let engine = engine();
        let stale = engine.add("q1", Some("stale".into()), None, None).await.unwrap();
        engine.add("q1", Some("fresh".into()), None, None).await.unwrap();

        engine.take("q1", Some(0.001)).await.unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let outcome = engine.reap_expired("q1").await.unwrap();
        assert_eq!(outcome.reaped, 1);

        let (first, _) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(first, "fresh");
        let (second, _) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(second, stale);
    }

    #[tokio::test]
    async fn reap_leaves_live_claims_alone() {
        let engine = engine();
        engine.add("q1", None, None, Some(30.0)).await.unwrap();
        engine.take("q1", None).await.unwrap().unwrap();
        let outcome = engine.reap_expired("q1").await.unwrap();
        assert_eq!(outcome.reaped, 0);
        assert_eq!(outcome.min_active_ttl, Some(30.0));
    }

    #[tokio::test]
    async fn concurrent_takes_return_distinct_ids() {
        let engine = Arc::new(engine());
        for _ in 0..8 {
            engine.add("q1", None, None, None).await.unwrap();
        }
        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.take("q1", None).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            if let Some((id, _)) = handle.await.unwrap() {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8, "min(N, M) distinct ids, none twice");
    }

    #[tokio::test]
    async fn clear_keeps_registration_remove_deletes_it() {
        let engine = engine();
        engine.add("q1", None, None, None).await.unwrap();
        engine.clear_queue("q1").await.unwrap();
        assert_eq!(engine.pending_len("q1").await.unwrap(), 0);
        assert_eq!(engine.list_queues().await.unwrap(), vec!["q1".to_string()]);

        engine.remove_queue("q1").await.unwrap();
        assert!(engine.list_queues().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let engine = engine();
        for bad in ["", "has space", "has:colon", "tab\there"] {
            assert!(engine.init_queue(bad).await.is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn ndarray_payload_survives_store_round_trip() {
        use crate::core::value::{Dtype, Ndarray};
        let engine = engine();
        let payload = Value::map([
            ("x", Value::Int(7)),
            (
                "weights",
                Value::Ndarray(Ndarray::new(Dtype::F32, vec![2, 2], vec![0u8; 16])),
            ),
        ]);
        engine.add("q1", None, Some(&payload), None).await.unwrap();
        let (_, got) = engine.take("q1", None).await.unwrap().unwrap();
        assert_eq!(got.unwrap(), payload);
    }
}
