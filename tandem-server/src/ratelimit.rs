//! Per-connection token bucket.
//!
//! Every connection refills at a steady rate up to a burst capacity.
//! Domain actions cost a full token, sync frames a quarter; protocol
//! chatter (hello, subscribe, snapshot requests) is free. A rejected
//! frame consumes nothing, so a client that backs off recovers exactly
//! as fast as the refill rate allows.

use std::time::Instant;

use crate::protocol::ClientFrame;

/// Cost of one domain action.
pub const ACTION_COST: f64 = 1.0;
/// Cost of one sync frame.
pub const SYNC_COST: f64 = 0.25;

/// Bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateConfig {
    /// Burst capacity in tokens.
    pub capacity: f64,
    /// Refill rate in tokens per second.
    pub refill_per_sec: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: 40.0,
            refill_per_sec: 20.0,
        }
    }
}

/// The cost charged for an inbound frame.
pub fn frame_cost(frame: &ClientFrame) -> f64 {
    match frame {
        ClientFrame::RegistryAction { .. }
        | ClientFrame::ListAction { .. }
        | ClientFrame::BulletinAction { .. } => ACTION_COST,
        ClientFrame::Sync { .. } => SYNC_COST,
        ClientFrame::Hello { .. }
        | ClientFrame::Subscribe { .. }
        | ClientFrame::Unsubscribe { .. }
        | ClientFrame::RequestFullState { .. } => 0.0,
    }
}

/// Token bucket with fractional costs.
#[derive(Debug)]
pub struct TokenBucket {
    config: RateConfig,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New bucket, full to capacity.
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            tokens: config.capacity,
            last_refill: Instant::now(),
        }
    }

    /// Charge `cost` tokens, refilling first. Returns false (charging
    /// nothing) when the bucket cannot cover the cost.
    pub fn try_consume(&mut self, cost: f64) -> bool {
        self.try_consume_at(cost, Instant::now())
    }

    pub(crate) fn try_consume_at(&mut self, cost: f64, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.config.refill_per_sec).min(self.config.capacity);

        if cost <= 0.0 {
            return true;
        }
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Currently available tokens (as of the last refill).
    pub fn available(&self) -> f64 {
        self.tokens
    }
}
