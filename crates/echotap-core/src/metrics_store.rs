//! Per-channel latency histories with a global rollup.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Per-channel sample buffer capacity.
pub const SAMPLE_BUFFER_CAP: usize = 10_000;

/// How many of the oldest samples are shed when the buffer overflows.
pub const SAMPLE_EVICTION_CHUNK: usize = 1_000;

#[derive(Debug, Default)]
struct ChannelMetrics {
    /// Round-trip samples in milliseconds.
    samples: Vec<f64>,
    outbound: u64,
    dropped: u64,
    late: u64,
}

#[derive(Debug, Default)]
struct GlobalCounters {
    channels_started: u64,
    latencies_recorded: u64,
}

/// Counter view of one channel, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChannelCounters {
    pub samples: usize,
    pub outbound: u64,
    pub dropped: u64,
    pub late: u64,
}

/// Aggregated statistics over every channel seen by the process.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalStatsSnapshot {
    pub total_channels: u64,
    pub active_channels: usize,
    pub total_latencies: u64,
    pub p50_latency: f64,
    pub p95_latency: f64,
    pub p99_latency: f64,
    pub max_latency: f64,
    pub avg_latency: f64,
    pub late_ratio: f64,
    pub packet_loss_ratio: f64,
    pub timestamp: DateTime<Utc>,
}

/// Shared store of per-channel latency/loss/lateness counters.
///
/// Writers touch one channel mutex each; the two global counters sit under
/// their own lock. Channel histories survive teardown so the rollup and the
/// final report cover calls that already ended.
#[derive(Debug, Default)]
pub struct MetricsStore {
    channels: RwLock<HashMap<String, Mutex<ChannelMetrics>>>,
    counters: Mutex<GlobalCounters>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the monotone started-channels counter. Called on every begin
    /// event, before wiring can still fail.
    pub fn mark_channel_started(&self) {
        let mut counters = self.counters.lock().expect("metrics counters lock poisoned");
        counters.channels_started += 1;
    }

    pub fn record_latency(&self, channel_id: &str, latency_ms: f64) {
        self.with_channel(channel_id, |channel| {
            channel.samples.push(latency_ms);
            if channel.samples.len() > SAMPLE_BUFFER_CAP {
                // Fresh allocation, not an in-place shift: the oversized
                // buffer must go back to the allocator.
                channel.samples = channel.samples[SAMPLE_EVICTION_CHUNK..].to_vec();
            }
        });
        let mut counters = self.counters.lock().expect("metrics counters lock poisoned");
        counters.latencies_recorded += 1;
    }

    pub fn record_outbound(&self, channel_id: &str) {
        self.with_channel(channel_id, |channel| channel.outbound += 1);
    }

    pub fn record_drops(&self, channel_id: &str, count: u64) {
        self.with_channel(channel_id, |channel| channel.dropped += count);
    }

    pub fn record_late(&self, channel_id: &str) {
        self.with_channel(channel_id, |channel| channel.late += 1);
    }

    pub fn channel_counters(&self, channel_id: &str) -> Option<ChannelCounters> {
        let map = self.channels.read().expect("metrics map lock poisoned");
        map.get(channel_id).map(|entry| {
            let channel = entry.lock().expect("channel metrics lock poisoned");
            ChannelCounters {
                samples: channel.samples.len(),
                outbound: channel.outbound,
                dropped: channel.dropped,
                late: channel.late,
            }
        })
    }

    /// Computes the global rollup. Pure: repeated calls over unchanged
    /// state yield the same numbers (modulo the timestamp).
    pub fn snapshot(&self, active_channels: usize) -> GlobalStatsSnapshot {
        let mut all_samples = Vec::new();
        let mut total_outbound = 0u64;
        let mut total_dropped = 0u64;
        let mut total_late = 0u64;
        {
            let map = self.channels.read().expect("metrics map lock poisoned");
            for entry in map.values() {
                let channel = entry.lock().expect("channel metrics lock poisoned");
                all_samples.extend_from_slice(&channel.samples);
                total_outbound += channel.outbound;
                total_dropped += channel.dropped;
                total_late += channel.late;
            }
        }
        let (channels_started, latencies_recorded) = {
            let counters = self.counters.lock().expect("metrics counters lock poisoned");
            (counters.channels_started, counters.latencies_recorded)
        };

        all_samples.sort_by(|a, b| a.total_cmp(b));
        let avg = if all_samples.is_empty() {
            0.0
        } else {
            all_samples.iter().sum::<f64>() / all_samples.len() as f64
        };

        GlobalStatsSnapshot {
            total_channels: channels_started,
            active_channels,
            total_latencies: latencies_recorded,
            p50_latency: nearest_rank(&all_samples, 0.50),
            p95_latency: nearest_rank(&all_samples, 0.95),
            p99_latency: nearest_rank(&all_samples, 0.99),
            max_latency: all_samples.last().copied().unwrap_or(0.0),
            avg_latency: avg,
            late_ratio: ratio(total_late, total_outbound),
            packet_loss_ratio: ratio(total_dropped, total_outbound),
            timestamp: Utc::now(),
        }
    }

    fn with_channel<R>(&self, channel_id: &str, apply: impl FnOnce(&mut ChannelMetrics) -> R) -> R {
        {
            let map = self.channels.read().expect("metrics map lock poisoned");
            if let Some(entry) = map.get(channel_id) {
                let mut channel = entry.lock().expect("channel metrics lock poisoned");
                return apply(&mut channel);
            }
        }
        let mut map = self.channels.write().expect("metrics map lock poisoned");
        let entry = map.entry(channel_id.to_string()).or_default();
        let mut channel = entry.lock().expect("channel metrics lock poisoned");
        apply(&mut channel)
    }
}

/// Nearest-rank percentile over a sorted slice: `samples[⌊n·q⌋]`, clamped.
fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * quantile) as usize).min(sorted.len() - 1);
    sorted[index]
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
