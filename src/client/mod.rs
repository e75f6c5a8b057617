//! Client library.
//!
//! One persistent connection; a reader task routes replies to callers by
//! `rid` and EVENT frames to their subscription streams. On top of the raw
//! operations it offers the scoped claim (`pop`) and the RPC-over-queue
//! pattern (`rpc`, `rpc_stream`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::connection::spawn_connection_writer;
use crate::core::envelope::{Envelope, Op};
use crate::core::error::{Result, ZakuError};
use crate::core::value::Value;

/// Events buffered per subscription on the client side.
const EVENT_BUFFER: usize = 256;

struct ClientInner {
    writer_tx: mpsc::Sender<Bytes>,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    events: DashMap<String, mpsc::Sender<Envelope>>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    next_rid: AtomicU64,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

/// Handle to one server connection. Cheap to clone; all clones share the
/// connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_inner(addr).await
    }

    /// Connect and present shared-secret credentials as the first frame.
    pub async fn connect_with_auth(
        addr: impl ToSocketAddrs,
        user: &str,
        key: &str,
    ) -> Result<Self> {
        let client = Self::connect_inner(addr).await?;
        let rid = client.rid();
        let auth = Envelope::request(Op::Auth, rid.clone()).with_payload(Value::map([
            ("user", Value::Str(user.to_string())),
            ("key", Value::Str(key.to_string())),
        ]));
        client.call(auth).await?;
        Ok(client)
    }

    async fn connect_inner(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader_half, writer_half) = stream.into_split();
        let writer_tx = spawn_connection_writer(writer_half, EVENT_BUFFER);

        let inner = Arc::new(ClientInner {
            writer_tx,
            pending: DashMap::new(),
            events: DashMap::new(),
            reader: parking_lot::Mutex::new(None),
            next_rid: AtomicU64::new(1),
        });
        let handle = tokio::spawn(read_loop(BufReader::new(reader_half), Arc::clone(&inner)));
        *inner.reader.lock() = Some(handle);
        Ok(Self { inner })
    }

    fn rid(&self) -> String {
        format!("c-{}", self.inner.next_rid.fetch_add(1, Ordering::Relaxed))
    }

    /// Send one request and await its ACK/ERR.
    async fn call(&self, envelope: Envelope) -> Result<Envelope> {
        let rid = envelope
            .rid
            .clone()
            .ok_or_else(|| ZakuError::internal("request built without rid"))?;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(rid.clone(), tx);

        if self
            .inner
            .writer_tx
            .send(envelope.encode_frame())
            .await
            .is_err()
        {
            self.inner.pending.remove(&rid);
            return Err(ZakuError::internal("connection closed"));
        }

        let reply = rx
            .await
            .map_err(|_| ZakuError::internal("connection closed before reply"))?;
        match reply.op {
            Op::Err => {
                let info = reply
                    .error
                    .ok_or_else(|| ZakuError::internal("ERR frame without error detail"))?;
                Err(info.into())
            }
            _ => Ok(reply),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(Envelope::request(Op::Ping, self.rid())).await?;
        Ok(())
    }

    pub async fn init_queue(&self, queue: &str) -> Result<()> {
        self.call(Envelope::request(Op::InitQueue, self.rid()).with_queue(queue))
            .await?;
        Ok(())
    }

    pub async fn clear_queue(&self, queue: &str) -> Result<()> {
        self.call(Envelope::request(Op::ClearQueue, self.rid()).with_queue(queue))
            .await?;
        Ok(())
    }

    pub async fn remove_queue(&self, queue: &str) -> Result<()> {
        self.call(Envelope::request(Op::RemoveQueue, self.rid()).with_queue(queue))
            .await?;
        Ok(())
    }

    /// Append a task; the server mints the id.
    pub async fn add(&self, queue: &str, payload: Value) -> Result<String> {
        self.add_with(queue, Some(payload), None, None).await
    }

    pub async fn add_with(
        &self,
        queue: &str,
        payload: Option<Value>,
        task_id: Option<&str>,
        ttl: Option<f64>,
    ) -> Result<String> {
        let mut env = Envelope::request(Op::Add, self.rid()).with_queue(queue);
        if let Some(payload) = payload {
            env = env.with_payload(payload);
        }
        if let Some(task_id) = task_id {
            env = env.with_task_id(task_id);
        }
        if let Some(ttl) = ttl {
            env = env.with_ttl(ttl);
        }
        let reply = self.call(env).await?;
        reply
            .task_id
            .ok_or_else(|| ZakuError::internal("ADD reply without task id"))
    }

    /// Claim the oldest pending task; `None` when the queue is empty.
    pub async fn take(&self, queue: &str) -> Result<Option<(String, Option<Value>)>> {
        let reply = self
            .call(Envelope::request(Op::Take, self.rid()).with_queue(queue))
            .await?;
        Ok(reply.task_id.map(|id| (id, reply.payload)))
    }

    pub async fn mark_done(&self, queue: &str, task_id: &str) -> Result<()> {
        self.call(
            Envelope::request(Op::MarkDone, self.rid())
                .with_queue(queue)
                .with_task_id(task_id),
        )
        .await?;
        Ok(())
    }

    pub async fn mark_reset(&self, queue: &str, task_id: &str) -> Result<()> {
        self.call(
            Envelope::request(Op::MarkReset, self.rid())
                .with_queue(queue)
                .with_task_id(task_id),
        )
        .await?;
        Ok(())
    }

    /// Scoped claim: take a task and return a guard that guarantees exactly
    /// one of `MARK_DONE` (via [`ClaimedTask::done`]) or `MARK_RESET` (on
    /// drop) on every exit path.
    pub async fn pop(&self, queue: &str) -> Result<Option<ClaimedTask>> {
        match self.take(queue).await? {
            Some((task_id, payload)) => Ok(Some(ClaimedTask {
                client: self.clone(),
                queue: queue.to_string(),
                task_id,
                payload,
                settled: false,
            })),
            None => Ok(None),
        }
    }

    /// Broadcast a payload; returns the count handed to the fabric.
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<i64> {
        let reply = self
            .call(
                Envelope::request(Op::Publish, self.rid())
                    .with_topic(topic)
                    .with_payload(payload),
            )
            .await?;
        Ok(reply
            .payload
            .as_ref()
            .and_then(Value::as_int)
            .unwrap_or(0))
    }

    /// Open a streaming subscription. `timeout` is a per-event idle
    /// deadline; on expiry the server ends the stream.
    pub async fn subscribe_stream(&self, topic: &str, timeout: Option<f64>) -> Result<EventStream> {
        let rid = self.rid();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.inner.events.insert(rid.clone(), tx);

        let mut env = Envelope::request(Op::Subscribe, rid.clone()).with_topic(topic);
        if let Some(timeout) = timeout {
            env = env.with_ttl(timeout);
        }
        if let Err(e) = self.call(env).await {
            self.inner.events.remove(&rid);
            return Err(e);
        }
        Ok(EventStream {
            client: self.clone(),
            rid,
            topic: topic.to_string(),
            rx,
            open: true,
        })
    }

    /// One-shot consumption: first event within `timeout` seconds, or `None`.
    pub async fn subscribe_one(&self, topic: &str, timeout: f64) -> Result<Option<Value>> {
        let mut stream = self.subscribe_stream(topic, Some(timeout)).await?;
        let event = stream.next().await;
        stream.unsubscribe().await;
        Ok(event)
    }

    pub async fn unsubscribe(&self, rid: &str) -> Result<()> {
        self.inner.events.remove(rid);
        self.call(Envelope::request(Op::Unsubscribe, rid.to_string()))
            .await?;
        Ok(())
    }

    /// RPC over the queue: subscribe to a fresh reply topic, enqueue the
    /// request with `_request_id`, await the first result.
    pub async fn rpc(&self, queue: &str, payload: Value, timeout: f64) -> Result<Option<Value>> {
        let mut stream = self.rpc_stream(queue, payload, Some(timeout)).await?;
        let reply = stream.next().await;
        stream.unsubscribe().await;
        Ok(reply)
    }

    /// Streaming RPC: like [`Client::rpc`] but yields every published result.
    pub async fn rpc_stream(
        &self,
        queue: &str,
        payload: Value,
        timeout: Option<f64>,
    ) -> Result<EventStream> {
        let request_id = Uuid::new_v4().to_string();
        let stream = self.subscribe_stream(&request_id, timeout).await?;

        let mut pairs = match payload {
            Value::Map(pairs) => pairs,
            other => vec![("value".to_string(), other)],
        };
        pairs.push(("_request_id".to_string(), Value::Str(request_id)));

        if let Err(e) = self
            .add_with(queue, Some(Value::Map(pairs)), None, None)
            .await
        {
            stream.unsubscribe().await;
            return Err(e);
        }
        Ok(stream)
    }
}

/// A claimed task whose release is tied to scope: consume with `done()` or
/// let the drop issue `MARK_RESET`.
pub struct ClaimedTask {
    client: Client,
    queue: String,
    task_id: String,
    payload: Option<Value>,
    settled: bool,
}

impl ClaimedTask {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Normal completion: `MARK_DONE`.
    pub async fn done(mut self) -> Result<()> {
        self.settled = true;
        self.client.mark_done(&self.queue, &self.task_id).await
    }

    /// Abnormal completion: `MARK_RESET`, explicitly.
    pub async fn reset(mut self) -> Result<()> {
        self.settled = true;
        self.client.mark_reset(&self.queue, &self.task_id).await
    }
}

impl Drop for ClaimedTask {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let client = self.client.clone();
        let queue = std::mem::take(&mut self.queue);
        let task_id = std::mem::take(&mut self.task_id);
        tokio::spawn(async move {
            if let Err(e) = client.mark_reset(&queue, &task_id).await {
                warn!(queue, task_id, error = %e, "scoped claim reset failed");
            }
        });
    }
}

/// Live subscription yielding decoded event payloads.
pub struct EventStream {
    client: Client,
    rid: String,
    topic: String,
    rx: mpsc::Receiver<Envelope>,
    open: bool,
}

impl EventStream {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event payload. `None` once the subscription ends, whether by
    /// server timeout (terminal empty EVENT) or unsubscribe.
    pub async fn next(&mut self) -> Option<Value> {
        if !self.open {
            return None;
        }
        match self.rx.recv().await {
            Some(envelope) => match envelope.payload {
                Some(value) => Some(value),
                None => {
                    // terminal event: the server already dropped the
                    // subscription
                    self.open = false;
                    None
                }
            },
            None => {
                self.open = false;
                None
            }
        }
    }

    /// Cancel the subscription.
    pub async fn unsubscribe(mut self) {
        self.open = false;
        if let Err(e) = self.client.unsubscribe(&self.rid).await {
            debug!(topic = self.topic, error = %e, "unsubscribe failed");
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.client.inner.events.remove(&self.rid);
        if self.open {
            let client = self.client.clone();
            let rid = std::mem::take(&mut self.rid);
            tokio::spawn(async move {
                let _ = client.unsubscribe(&rid).await;
            });
        }
    }
}

/// Route inbound frames: EVENTs to their stream, replies to their caller.
async fn read_loop(mut reader: BufReader<OwnedReadHalf>, inner: Arc<ClientInner>) {
    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = BytesMut::with_capacity(len);
        body.resize(len, 0);
        if reader.read_exact(&mut body[..]).await.is_err() {
            break;
        }
        let envelope = match Envelope::decode(body.freeze()) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "undecodable frame from server");
                break;
            }
        };

        let Some(rid) = envelope.rid.clone() else {
            // final connection-level ERR
            if let Some(info) = envelope.error {
                warn!(code = info.code, message = info.message, "server closed connection");
            }
            break;
        };

        match envelope.op {
            Op::Event => {
                if let Some(tx) = inner.events.get(&rid) {
                    if tx.try_send(envelope).is_err() {
                        warn!(rid, "event buffer full, event dropped");
                    }
                }
            }
            _ => {
                if let Some((_, tx)) = inner.pending.remove(&rid) {
                    let _ = tx.send(envelope);
                }
            }
        }
    }
    // wake every waiter
    inner.pending.clear();
    inner.events.clear();
}
