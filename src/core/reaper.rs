//! Background reclaim of expired claims.
//!
//! One task per process. Each tick walks the queue index, reaps every claim
//! whose deadline has passed, and adapts the next sleep to the smallest
//! active TTL so short-lived claims are reverted promptly.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::core::queue::QueueEngine;

/// Upper bound on the tick period.
const MAX_TICK: Duration = Duration::from_secs(1);
/// Lower bound, so tiny TTLs cannot spin the sweep.
const MIN_TICK: Duration = Duration::from_millis(50);

pub struct Reaper {
    engine: Arc<QueueEngine>,
}

impl Reaper {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self { engine }
    }

    /// Run forever. Ticks are idempotent; errors are logged and the sweep
    /// continues on the next tick.
    pub async fn run(self) {
        let mut tick = MAX_TICK;
        loop {
            tokio::time::sleep(tick).await;
            tick = self.sweep_once().await;
        }
    }

    /// One pass over every known queue. Returns the next tick period:
    /// `min(1s, smallest active ttl / 4)`, floored.
    pub async fn sweep_once(&self) -> Duration {
        let queues = match self.engine.list_queues().await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(error = %e, "reaper could not list queues");
                return MAX_TICK;
            }
        };

        let mut min_ttl: Option<f64> = None;
        for queue in queues {
            match self.engine.reap_expired(&queue).await {
                Ok(outcome) => {
                    if outcome.reaped > 0 {
                        debug!(queue, reaped = outcome.reaped, "reaper pass");
                    }
                    min_ttl = match (min_ttl, outcome.min_active_ttl) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                }
                Err(e) => warn!(queue, error = %e, "reap pass failed"),
            }
        }

        match min_ttl {
            Some(ttl) => Duration::from_secs_f64(ttl / 4.0).clamp(MIN_TICK, MAX_TICK),
            None => MAX_TICK,
        }
    }
}
