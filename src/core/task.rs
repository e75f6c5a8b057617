//! Task records as stored in the backing store.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Task lifecycle state.
///
/// Transitions:
/// - Pending -> Claimed on `TAKE`
/// - Claimed -> removed on `MARK_DONE`
/// - Claimed -> Pending on `MARK_RESET` or reaper expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Done,
}

/// Stored record for one task, minus its payload. The payload lives next to
/// the record as base64 of the codec encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub status: TaskStatus,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds, set while claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<u64>,
    /// How long a claim on this task stays valid before reaping.
    pub ttl_seconds: f64,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, ttl_seconds: f64) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            created_at: now_ms(),
            claimed_at: None,
            ttl_seconds,
        }
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_without_claimed_at_when_pending() {
        let record = TaskRecord::new("t1", 5.0);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("claimed_at").is_none());
    }

    #[test]
    fn record_round_trips_through_json() {
        let mut record = TaskRecord::new("t2", 0.5);
        record.status = TaskStatus::Claimed;
        record.claimed_at = Some(123_456);
        let json = serde_json::to_string(&record).unwrap();
        let back: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "t2");
        assert_eq!(back.status, TaskStatus::Claimed);
        assert_eq!(back.claimed_at, Some(123_456));
    }
}
