//! Token Tracker (spec §2): per-session counters of input/output/cached/
//! reasoning tokens and the computed cost, accumulated across every agent
//! dispatch regardless of whether that dispatch ultimately succeeded —
//! tokens are spent either way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub struct TokenSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_usd: f64,
}

/// Cost is accumulated in micro-dollars so the running total can live in an
/// `AtomicU64` alongside the token counters rather than behind a mutex.
#[derive(Clone, Default)]
pub struct TokenTracker {
    input_tokens: Arc<AtomicU64>,
    output_tokens: Arc<AtomicU64>,
    cached_input_tokens: Arc<AtomicU64>,
    reasoning_tokens: Arc<AtomicU64>,
    cost_micros: Arc<AtomicU64>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, input_tokens: u64, output_tokens: u64, cached_input_tokens: u64, reasoning_tokens: u64, cost_usd: f64) {
        self.input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.output_tokens.fetch_add(output_tokens, Ordering::Relaxed);
        self.cached_input_tokens.fetch_add(cached_input_tokens, Ordering::Relaxed);
        self.reasoning_tokens.fetch_add(reasoning_tokens, Ordering::Relaxed);
        self.cost_micros.fetch_add((cost_usd * 1_000_000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            cached_input_tokens: self.cached_input_tokens.load(Ordering::Relaxed),
            reasoning_tokens: self.reasoning_tokens.load(Ordering::Relaxed),
            cost_usd: self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        let snapshot = self.snapshot();
        snapshot.input_tokens + snapshot.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_across_multiple_records() {
        let tracker = TokenTracker::new();
        tracker.record(100, 50, 10, 0, 0.01);
        tracker.record(200, 75, 0, 5, 0.02);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.input_tokens, 300);
        assert_eq!(snapshot.output_tokens, 125);
        assert_eq!(snapshot.cached_input_tokens, 10);
        assert_eq!(snapshot.reasoning_tokens, 5);
        assert!((snapshot.cost_usd - 0.03).abs() < 1e-9);
    }

    #[test]
    fn total_tokens_sums_input_and_output() {
        let tracker = TokenTracker::new();
        tracker.record(100, 50, 0, 0, 0.0);
        assert_eq!(tracker.total_tokens(), 150);
    }
}
