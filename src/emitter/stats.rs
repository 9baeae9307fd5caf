use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Nearest-rank percentile over already sorted samples.
fn calculate_percentile(sorted_samples: &[Duration], percentile: f64) -> Duration {
    if sorted_samples.is_empty() {
        return Duration::ZERO;
    }

    let percentile = percentile.clamp(0.0, 1.0);
    let last = sorted_samples.len() - 1;
    let index_f64 = percentile * last as f64;

    let index = if index_f64.is_finite() && index_f64 >= 0.0 {
        (index_f64.floor() as usize).min(last)
    } else {
        0
    };

    sorted_samples
        .get(index)
        .copied()
        .unwrap_or(Duration::ZERO)
}

/// Point-in-time view of emitter activity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitterStats {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub events_failed: u64,
    pub oversize_dropped: u64,
    pub corrupt_dropped: u64,
    pub backoffs: u64,
    pub queue_errors: u64,
    pub average_latency: Duration,
    pub p95_latency: Duration,
    pub p99_latency: Duration,
    pub last_send_latency: Duration,
}

#[derive(Debug, Default)]
pub struct EmitterMetrics {
    batches_sent: AtomicU64,
    events_sent: AtomicU64,
    events_failed: AtomicU64,
    oversize_dropped: AtomicU64,
    corrupt_dropped: AtomicU64,
    backoffs: AtomicU64,
    queue_errors: AtomicU64,
    latency_samples: Mutex<VecDeque<Duration>>,
}

impl EmitterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, succeeded: usize, failed: usize, latency: Duration) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.events_sent.fetch_add(succeeded as u64, Ordering::Relaxed);
        self.events_failed.fetch_add(failed as u64, Ordering::Relaxed);

        let mut samples = self.latency_samples.lock();
        samples.push_back(latency);
        if samples.len() > MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn record_oversize_dropped(&self, count: usize) {
        self.oversize_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_corrupt_dropped(&self) {
        self.corrupt_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backoff(&self) {
        self.backoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_error(&self) {
        self.queue_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EmitterStats {
        let (average_latency, p95_latency, p99_latency, last_send_latency) = {
            let samples = self.latency_samples.lock();
            match samples.back().copied() {
                None => (Duration::ZERO, Duration::ZERO, Duration::ZERO, Duration::ZERO),
                Some(last) => {
                    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
                    sorted.sort();

                    let total: Duration = sorted.iter().sum();
                    let average = total / sorted.len() as u32;

                    (
                        average,
                        calculate_percentile(&sorted, 0.95),
                        calculate_percentile(&sorted, 0.99),
                        last,
                    )
                }
            }
        };

        EmitterStats {
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            events_sent: self.events_sent.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            oversize_dropped: self.oversize_dropped.load(Ordering::Relaxed),
            corrupt_dropped: self.corrupt_dropped.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
            queue_errors: self.queue_errors.load(Ordering::Relaxed),
            average_latency,
            p95_latency,
            p99_latency,
            last_send_latency,
        }
    }
}
