//! Request/response envelopes and frame helpers.
//!
//! Every frame on the wire is a `u32` big-endian length prefix followed by a
//! codec-encoded map. The recognized fields are `op`, `rid`, `queue`,
//! `task_id`, `topic`, `ttl`, `payload`, and `error`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::codec;
use crate::core::error::{ErrorKind, Result, ZakuError};
use crate::core::value::Value;

/// Operations multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    InitQueue,
    RemoveQueue,
    ClearQueue,
    Add,
    Take,
    MarkDone,
    MarkReset,
    Publish,
    Subscribe,
    Unsubscribe,
    Ping,
    Auth,
    // server-initiated
    Event,
    Ack,
    Err,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Op::InitQueue => "INIT_QUEUE",
            Op::RemoveQueue => "REMOVE_QUEUE",
            Op::ClearQueue => "CLEAR_QUEUE",
            Op::Add => "ADD",
            Op::Take => "TAKE",
            Op::MarkDone => "MARK_DONE",
            Op::MarkReset => "MARK_RESET",
            Op::Publish => "PUBLISH",
            Op::Subscribe => "SUBSCRIBE",
            Op::Unsubscribe => "UNSUBSCRIBE",
            Op::Ping => "PING",
            Op::Auth => "AUTH",
            Op::Event => "EVENT",
            Op::Ack => "ACK",
            Op::Err => "ERR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "INIT_QUEUE" => Op::InitQueue,
            "REMOVE_QUEUE" => Op::RemoveQueue,
            "CLEAR_QUEUE" => Op::ClearQueue,
            "ADD" => Op::Add,
            "TAKE" => Op::Take,
            "MARK_DONE" => Op::MarkDone,
            "MARK_RESET" => Op::MarkReset,
            "PUBLISH" => Op::Publish,
            "SUBSCRIBE" => Op::Subscribe,
            "UNSUBSCRIBE" => Op::Unsubscribe,
            "PING" => Op::Ping,
            "AUTH" => Op::Auth,
            "EVENT" => Op::Event,
            "ACK" => Op::Ack,
            "ERR" => Op::Err,
            _ => return None,
        })
    }
}

/// Error detail carried on ERR frames.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl From<&ZakuError> for ErrorInfo {
    fn from(e: &ZakuError) -> Self {
        ErrorInfo {
            code: e.kind.code().to_string(),
            message: e.message.clone(),
        }
    }
}

impl From<ErrorInfo> for ZakuError {
    fn from(info: ErrorInfo) -> Self {
        ZakuError::new(ErrorKind::from_code(&info.code), info.message)
    }
}

/// One frame on the wire, either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub op: Op,
    /// Request correlation id; absent only on server-initiated frames that
    /// are not tied to a subscription.
    pub rid: Option<String>,
    pub queue: Option<String>,
    pub task_id: Option<String>,
    pub topic: Option<String>,
    /// Claim TTL or subscription timeout override, in seconds.
    pub ttl: Option<f64>,
    pub payload: Option<Value>,
    pub error: Option<ErrorInfo>,
}

impl Envelope {
    pub fn request(op: Op, rid: impl Into<String>) -> Self {
        Self {
            op,
            rid: Some(rid.into()),
            queue: None,
            task_id: None,
            topic: None,
            ttl: None,
            payload: None,
            error: None,
        }
    }

    /// ACK reply mirroring the request's rid.
    pub fn ack(rid: impl Into<String>) -> Self {
        Self::request(Op::Ack, rid)
    }

    /// ERR reply mirroring the request's rid.
    pub fn err(rid: impl Into<String>, error: &ZakuError) -> Self {
        let mut env = Self::request(Op::Err, rid);
        env.error = Some(ErrorInfo::from(error));
        env
    }

    /// EVENT frame for the subscription registered under `rid`. `payload`
    /// `None` is the terminal event after a subscription timeout.
    pub fn event(rid: impl Into<String>, topic: impl Into<String>, payload: Option<Value>) -> Self {
        let mut env = Self::request(Op::Event, rid);
        env.topic = Some(topic.into());
        env.payload = payload;
        env
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_ttl(mut self, ttl: f64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn to_value(&self) -> Value {
        let mut pairs: Vec<(String, Value)> = vec![("op".into(), Value::Str(self.op.as_str().into()))];
        if let Some(rid) = &self.rid {
            pairs.push(("rid".into(), Value::Str(rid.clone())));
        }
        if let Some(queue) = &self.queue {
            pairs.push(("queue".into(), Value::Str(queue.clone())));
        }
        if let Some(task_id) = &self.task_id {
            pairs.push(("task_id".into(), Value::Str(task_id.clone())));
        }
        if let Some(topic) = &self.topic {
            pairs.push(("topic".into(), Value::Str(topic.clone())));
        }
        if let Some(ttl) = self.ttl {
            pairs.push(("ttl".into(), Value::Float(ttl)));
        }
        if let Some(payload) = &self.payload {
            pairs.push(("payload".into(), payload.clone()));
        }
        if let Some(error) = &self.error {
            pairs.push((
                "error".into(),
                Value::map([
                    ("code", Value::Str(error.code.clone())),
                    ("message", Value::Str(error.message.clone())),
                ]),
            ));
        }
        Value::Map(pairs)
    }

    fn from_value(value: Value) -> Result<Self> {
        let Value::Map(_) = &value else {
            return Err(ZakuError::invalid("envelope must be a map"));
        };
        let op_str = value
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| ZakuError::invalid("envelope missing op"))?;
        let op = Op::from_str(op_str)
            .ok_or_else(|| ZakuError::invalid(format!("unknown op {op_str:?}")))?;

        let get_str = |key: &str| -> Result<Option<String>> {
            match value.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Str(s)) => Ok(Some(s.clone())),
                Some(_) => Err(ZakuError::invalid(format!("{key} must be a string"))),
            }
        };

        let ttl = match value.get("ttl") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_float()
                    .ok_or_else(|| ZakuError::invalid("ttl must be a number"))?,
            ),
        };

        let error = match value.get("error") {
            None | Some(Value::Null) => None,
            Some(err) => {
                let code = err
                    .get("code")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ZakuError::invalid("error missing code"))?;
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Some(ErrorInfo {
                    code: code.to_string(),
                    message: message.to_string(),
                })
            }
        };

        Ok(Envelope {
            op,
            rid: get_str("rid")?,
            queue: get_str("queue")?,
            task_id: get_str("task_id")?,
            topic: get_str("topic")?,
            ttl,
            payload: value.get("payload").cloned(),
            error,
        })
    }

    /// Serialize as a length-prefixed frame into `buf`.
    pub fn encode_frame_into(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(128);
        codec::encode_into(&self.to_value(), &mut body);
        buf.reserve(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
    }

    /// Serialize as a standalone length-prefixed frame.
    pub fn encode_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        self.encode_frame_into(&mut buf);
        buf.freeze()
    }

    /// Decode a frame body (without the length prefix).
    pub fn decode(body: Bytes) -> Result<Self> {
        Self::from_value(codec::decode_all(body)?)
    }
}
