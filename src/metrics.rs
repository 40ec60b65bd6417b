//! Optional recall-latency tracking.
//!
//! Enabled by `ZMEM_RECALL_METRICS=true`. Samples go into a rolling window;
//! every few records a `count/p50/p95` summary is emitted to the
//! diagnostics stream.

use std::collections::VecDeque;
use std::sync::Mutex;

const WINDOW_SIZE: usize = 200;
const EMIT_EVERY: u64 = 20;

/// Rolling window of recall latencies in milliseconds.
pub struct RecallLatencyWindow {
    samples: Mutex<VecDeque<f64>>,
    recorded: std::sync::atomic::AtomicU64,
}

impl RecallLatencyWindow {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(WINDOW_SIZE)),
            recorded: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Record one latency sample; periodically emits a summary.
    pub fn record(&self, millis: f64) {
        let count = {
            let mut samples = match self.samples.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            if samples.len() == WINDOW_SIZE {
                samples.pop_front();
            }
            samples.push_back(millis);
            samples.len()
        };

        let total = self
            .recorded
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            + 1;
        if total % EMIT_EVERY == 0 {
            if let Some((p50, p95)) = self.percentiles() {
                tracing::info!(count, p50, p95, "recall latency window");
            }
        }
    }

    /// Current (p50, p95) over the window, or `None` when empty.
    pub fn percentiles(&self) -> Option<(f64, f64)> {
        let samples = self.samples.lock().ok()?;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some((percentile(&sorted, 0.50), percentile(&sorted, 0.95)))
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecallLatencyWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over an already-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
