//! Media-clock pacing for outbound packets.

use std::time::{Duration, Instant};

/// Schedules egress sends against the media clock.
///
/// The base timestamp and base instant are latched from the first outbound
/// packet and never change for the channel's lifetime. A packet with media
/// timestamp `ts` is due at `base_instant + (ts - base_ts) / sample_rate`;
/// a stream already behind its clock is never delayed further.
#[derive(Debug)]
pub struct PacketPacer {
    sample_rate: u32,
    base: Option<(u32, Instant)>,
}

impl PacketPacer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            base: None,
        }
    }

    /// Latches the base on first use and returns how long to hold the
    /// packet before sending. `Duration::ZERO` means send now.
    pub fn schedule(&mut self, timestamp: u32, now: Instant) -> Duration {
        let (base_ts, base_instant) = match self.base {
            Some(base) => base,
            None => {
                self.base = Some((timestamp, now));
                return Duration::ZERO;
            }
        };
        let due = base_instant + self.clock_offset(base_ts, timestamp);
        due.saturating_duration_since(now)
    }

    /// The media-clock deadline for `timestamp`, used for lateness checks
    /// on returns. `None` until the first outbound packet latched the base.
    pub fn expected_instant(&self, timestamp: u32) -> Option<Instant> {
        self.base
            .map(|(base_ts, base_instant)| base_instant + self.clock_offset(base_ts, timestamp))
    }

    pub fn is_latched(&self) -> bool {
        self.base.is_some()
    }

    fn clock_offset(&self, base_ts: u32, timestamp: u32) -> Duration {
        let samples = u64::from(timestamp.wrapping_sub(base_ts));
        Duration::from_micros(samples * 1_000_000 / u64::from(self.sample_rate))
    }
}
