//! Per-connection protocol driver.
//!
//! Reads length-prefixed envelopes, dispatches each request on its own task
//! (in-flight concurrency per connection, correlated by `rid`), and funnels
//! every outbound frame through one writer task. Closing the connection
//! cancels its subscriptions and best-effort resets its claimed tasks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::server::ServerContext;
use crate::core::codec;
use crate::core::envelope::{Envelope, Op};
use crate::core::error::{Result, ZakuError};
use crate::core::value::Value;

/// Per-connection bookkeeping for disconnect cleanup.
struct ConnectionState {
    id: u64,
    /// Tasks this connection currently holds, as (queue, task_id).
    claimed: Mutex<HashSet<(String, String)>>,
    /// Active subscriptions by rid.
    subscriptions: Mutex<HashMap<String, SubscriptionEntry>>,
}

struct SubscriptionEntry {
    topic: String,
    pump: JoinHandle<()>,
}

/// All frames leave through this channel; the task owns the write half.
pub(crate) fn spawn_connection_writer(
    mut half: OwnedWriteHalf,
    capacity: usize,
) -> mpsc::Sender<Bytes> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = half.shutdown().await;
    });
    tx
}

pub async fn handle_connection(
    stream: TcpStream,
    ctx: Arc<ServerContext>,
    conn_id: u64,
) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    let (reader_half, writer_half) = stream.into_split();
    let mut reader = BufReader::new(reader_half);
    let writer_tx = spawn_connection_writer(writer_half, ctx.config.delivery.outbound_buffer);

    let conn = Arc::new(ConnectionState {
        id: conn_id,
        claimed: Mutex::new(HashSet::new()),
        subscriptions: Mutex::new(HashMap::new()),
    });

    let mut authenticated = !ctx.config.auth.required();
    let max_frame = ctx.config.server.max_frame_bytes;

    loop {
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break; // peer closed
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max_frame {
            warn!(%peer, conn_id, len, "oversized frame");
            send_final_err(
                &writer_tx,
                &ZakuError::invalid(format!("frame of {len} bytes exceeds limit")),
            )
            .await;
            break;
        }

        let mut body = BytesMut::with_capacity(len);
        body.resize(len, 0);
        if reader.read_exact(&mut body[..]).await.is_err() {
            break;
        }

        let envelope = match Envelope::decode(body.freeze()) {
            Ok(env) => env,
            Err(e) => {
                warn!(%peer, conn_id, error = %e, "malformed envelope");
                send_final_err(&writer_tx, &e).await;
                break;
            }
        };

        // handshake: when credentials are configured the first frame must be
        // a valid AUTH
        if !authenticated {
            match check_auth(&ctx, &envelope) {
                Ok(rid) => {
                    authenticated = true;
                    let _ = writer_tx.send(Envelope::ack(rid).encode_frame()).await;
                    continue;
                }
                Err(e) => {
                    warn!(%peer, conn_id, "authentication failed");
                    match envelope.rid.clone() {
                        Some(rid) => {
                            let _ = writer_tx.send(Envelope::err(rid, &e).encode_frame()).await;
                        }
                        None => send_final_err(&writer_tx, &e).await,
                    }
                    break;
                }
            }
        }

        let Some(rid) = envelope.rid.clone() else {
            send_final_err(&writer_tx, &ZakuError::invalid("request missing rid")).await;
            break;
        };

        let ctx = Arc::clone(&ctx);
        let conn = Arc::clone(&conn);
        let writer_tx = writer_tx.clone();
        tokio::spawn(async move {
            let reply = match handle_request(&envelope, &ctx, &conn, &writer_tx).await {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(conn_id = conn.id, op = envelope.op.as_str(), error = %e, "request failed");
                    Envelope::err(rid, &e)
                }
            };
            let _ = writer_tx.send(reply.encode_frame()).await;
        });
    }

    cleanup(&ctx, &conn).await;
    info!(%peer, conn_id, "connection closed");
    Ok(())
}

fn check_auth(ctx: &ServerContext, envelope: &Envelope) -> Result<String> {
    if envelope.op != Op::Auth {
        return Err(ZakuError::unauthenticated("expected AUTH frame"));
    }
    let rid = envelope
        .rid
        .clone()
        .ok_or_else(|| ZakuError::invalid("request missing rid"))?;
    let payload = envelope
        .payload
        .as_ref()
        .ok_or_else(|| ZakuError::unauthenticated("AUTH missing credentials"))?;
    let user = payload.get("user").and_then(Value::as_str).unwrap_or("");
    let key = payload.get("key").and_then(Value::as_str).unwrap_or("");
    if !ctx.config.auth.matches(user, key) {
        return Err(ZakuError::unauthenticated("bad credentials"));
    }
    Ok(rid)
}

async fn handle_request(
    envelope: &Envelope,
    ctx: &Arc<ServerContext>,
    conn: &Arc<ConnectionState>,
    writer_tx: &mpsc::Sender<Bytes>,
) -> Result<Envelope> {
    let rid = envelope
        .rid
        .clone()
        .ok_or_else(|| ZakuError::invalid("request missing rid"))?;

    match envelope.op {
        Op::Ping => Ok(Envelope::ack(rid)),

        Op::Auth => Ok(Envelope::ack(rid)), // repeated AUTH is harmless

        Op::InitQueue => {
            ctx.engine.init_queue(require_queue(envelope)?).await?;
            Ok(Envelope::ack(rid))
        }

        Op::RemoveQueue => {
            ctx.engine.remove_queue(require_queue(envelope)?).await?;
            Ok(Envelope::ack(rid))
        }

        Op::ClearQueue => {
            ctx.engine.clear_queue(require_queue(envelope)?).await?;
            Ok(Envelope::ack(rid))
        }

        Op::Add => {
            let queue = require_queue(envelope)?;
            let id = ctx
                .engine
                .add(
                    queue,
                    envelope.task_id.clone(),
                    envelope.payload.as_ref(),
                    envelope.ttl,
                )
                .await?;
            Ok(Envelope::ack(rid).with_task_id(id))
        }

        Op::Take => {
            let queue = require_queue(envelope)?;
            match ctx.engine.take(queue, envelope.ttl).await? {
                Some((task_id, payload)) => {
                    conn.claimed
                        .lock()
                        .insert((queue.to_string(), task_id.clone()));
                    let mut ack = Envelope::ack(rid).with_task_id(task_id);
                    if let Some(payload) = payload {
                        ack = ack.with_payload(payload);
                    }
                    Ok(ack)
                }
                // empty queue is a null result, not an error
                None => Ok(Envelope::ack(rid)),
            }
        }

        Op::MarkDone => {
            let queue = require_queue(envelope)?;
            let task_id = require_task_id(envelope)?;
            ctx.engine.mark_done(queue, task_id).await?;
            conn.claimed
                .lock()
                .remove(&(queue.to_string(), task_id.to_string()));
            Ok(Envelope::ack(rid))
        }

        Op::MarkReset => {
            let queue = require_queue(envelope)?;
            let task_id = require_task_id(envelope)?;
            ctx.engine.mark_reset(queue, task_id).await?;
            conn.claimed
                .lock()
                .remove(&(queue.to_string(), task_id.to_string()));
            Ok(Envelope::ack(rid))
        }

        Op::Publish => {
            let topic = require_topic(envelope)?;
            let payload = envelope.payload.clone().unwrap_or(Value::Null);
            let count = ctx.topics.publish(topic, codec::encode(&payload)).await?;
            Ok(Envelope::ack(rid).with_payload(Value::Int(count as i64)))
        }

        Op::Subscribe => {
            let topic = require_topic(envelope)?.to_string();
            subscribe(ctx, conn, writer_tx, rid.clone(), topic, envelope.ttl).await?;
            Ok(Envelope::ack(rid))
        }

        Op::Unsubscribe => {
            // the rid names the subscription being cancelled
            let entry = conn.subscriptions.lock().remove(&rid);
            if let Some(entry) = entry {
                entry.pump.abort();
                // wait for the pump to drop its receiver so the topic's
                // subscriber count is settled before the ACK
                let _ = entry.pump.await;
                ctx.topics.release(&entry.topic);
                debug!(conn_id = conn.id, rid, "unsubscribed");
            }
            Ok(Envelope::ack(rid))
        }

        Op::Event | Op::Ack | Op::Err => {
            Err(ZakuError::invalid("server-initiated op on a request"))
        }
    }
}

/// Register a subscription and start its event pump.
async fn subscribe(
    ctx: &Arc<ServerContext>,
    conn: &Arc<ConnectionState>,
    writer_tx: &mpsc::Sender<Bytes>,
    rid: String,
    topic: String,
    timeout: Option<f64>,
) -> Result<()> {
    {
        let subscriptions = conn.subscriptions.lock();
        if subscriptions.contains_key(&rid) {
            return Err(ZakuError::invalid(format!(
                "subscription {rid:?} already exists on this connection"
            )));
        }
    }

    let rx = ctx.topics.subscribe(&topic).await?;
    let pump = tokio::spawn(event_pump(
        Arc::clone(ctx),
        Arc::clone(conn),
        writer_tx.clone(),
        rid.clone(),
        topic.clone(),
        timeout,
        rx,
    ));
    conn.subscriptions
        .lock()
        .insert(rid, SubscriptionEntry { topic, pump });
    Ok(())
}

/// Forward topic events to the connection until closed, unsubscribed, or
/// idle past `timeout`. The idle deadline resets on every delivery; expiry
/// sends a terminal empty EVENT.
async fn event_pump(
    ctx: Arc<ServerContext>,
    conn: Arc<ConnectionState>,
    writer_tx: mpsc::Sender<Bytes>,
    rid: String,
    topic: String,
    timeout: Option<f64>,
    mut rx: broadcast::Receiver<Bytes>,
) {
    let idle = timeout
        .filter(|t| *t > 0.0)
        .map(std::time::Duration::from_secs_f64);

    loop {
        let next = match idle {
            Some(idle) => match tokio::time::timeout(idle, rx.recv()).await {
                Ok(result) => result,
                Err(_) => {
                    // idle deadline: terminal empty event, then auto-unsubscribe
                    let terminal = Envelope::event(rid.clone(), topic.clone(), None);
                    let _ = writer_tx.try_send(terminal.encode_frame());
                    break;
                }
            },
            None => rx.recv().await,
        };

        match next {
            Ok(raw) => {
                let payload = match codec::decode_all(raw) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(topic, error = %e, "undecodable event payload, dropping");
                        continue;
                    }
                };
                let frame =
                    Envelope::event(rid.clone(), topic.clone(), Some(payload)).encode_frame();
                // non-blocking: a full outbound buffer drops this event
                if let Err(mpsc::error::TrySendError::Full(_)) = writer_tx.try_send(frame) {
                    warn!(conn_id = conn.id, topic, rid, "outbound buffer full, event dropped");
                } else if writer_tx.is_closed() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(conn_id = conn.id, topic, skipped, "subscriber lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    drop(rx);
    conn.subscriptions.lock().remove(&rid);
    ctx.topics.release(&topic);
}

/// Disconnect: cancel subscriptions, then best-effort reset of every task
/// this connection still holds. The reset may race the reaper harmlessly.
async fn cleanup(ctx: &Arc<ServerContext>, conn: &Arc<ConnectionState>) {
    let subscriptions: Vec<SubscriptionEntry> = {
        let mut subs = conn.subscriptions.lock();
        subs.drain().map(|(_, entry)| entry).collect()
    };
    for entry in subscriptions {
        entry.pump.abort();
        let _ = entry.pump.await;
        ctx.topics.release(&entry.topic);
    }

    let claimed: Vec<(String, String)> = conn.claimed.lock().drain().collect();
    for (queue, task_id) in claimed {
        if let Err(e) = ctx.engine.mark_reset(&queue, &task_id).await {
            warn!(queue, task_id, error = %e, "could not reset claim on disconnect");
        } else {
            debug!(queue, task_id, "claim released on disconnect");
        }
    }
}

async fn send_final_err(writer_tx: &mpsc::Sender<Bytes>, error: &ZakuError) {
    let mut frame = Envelope::request(Op::Err, "");
    frame.rid = None;
    frame.error = Some(error.into());
    let _ = writer_tx.send(frame.encode_frame()).await;
}

fn require_queue(envelope: &Envelope) -> Result<&str> {
    envelope
        .queue
        .as_deref()
        .ok_or_else(|| ZakuError::invalid("queue is required"))
}

fn require_task_id(envelope: &Envelope) -> Result<&str> {
    envelope
        .task_id
        .as_deref()
        .ok_or_else(|| ZakuError::invalid("task_id is required"))
}

fn require_topic(envelope: &Envelope) -> Result<&str> {
    envelope
        .topic
        .as_deref()
        .ok_or_else(|| ZakuError::invalid("topic is required"))
}
