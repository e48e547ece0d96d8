//! Correlates outbound sequence numbers with their echoed returns.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Entries older than this are swept on every record. Any round trip above
/// it is an outage, not a measurement.
pub const CORRELATOR_MAX_AGE: Duration = Duration::from_secs(3);

/// Maps `sequence -> send instant` for one channel. An entry is consumed on
/// the first matching return; later duplicates find nothing.
#[derive(Debug, Default)]
pub struct LatencyCorrelator {
    sent: HashMap<u16, Instant>,
}

impl LatencyCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the send instant for a sequence number and sweeps entries
    /// past the age ceiling.
    pub fn record(&mut self, sequence: u16, sent_at: Instant) {
        self.sent.insert(sequence, sent_at);
        self.sent
            .retain(|_, at| sent_at.saturating_duration_since(*at) <= CORRELATOR_MAX_AGE);
    }

    /// Removes the entry for `sequence` and returns the round-trip time.
    /// `None` when the sequence was never recorded, already consumed, or
    /// swept for age.
    pub fn consume(&mut self, sequence: u16, arrived_at: Instant) -> Option<Duration> {
        self.sent
            .remove(&sequence)
            .map(|sent_at| arrived_at.saturating_duration_since(sent_at))
    }

    pub fn len(&self) -> usize {
        self.sent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.is_empty()
    }
}
