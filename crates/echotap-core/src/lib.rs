//! Core measurement primitives for the echotap media probe.
//!
//! Pure-CPU building blocks shared by the per-channel workers and the
//! runtime: port reservation, media-header codec, round-trip correlation,
//! sequence accounting, media-clock pacing, and the metrics store. Nothing
//! in this crate performs I/O; callers pass in `Instant`s so every piece is
//! deterministic under test.

pub mod latency_correlator;
pub mod media_header;
pub mod metrics_store;
pub mod packet_pacer;
pub mod port_pool;
pub mod sequence_meter;

pub use latency_correlator::LatencyCorrelator;
pub use media_header::{MediaHeader, MEDIA_HEADER_LEN};
pub use metrics_store::{GlobalStatsSnapshot, MetricsStore};
pub use packet_pacer::PacketPacer;
pub use port_pool::{PortPool, PortPoolError};
pub use sequence_meter::{SequenceMeter, SequenceTotals};

/// Media sample rate for G.711 audio (Hz).
pub const G711_SAMPLE_RATE: u32 = 8000;

/// Samples carried per packet at 8 kHz with 20 ms packetisation.
pub const G711_SAMPLES_PER_PACKET: u32 = 160;
