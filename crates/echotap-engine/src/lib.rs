//! Control-plane client for the telephony engine.
//!
//! The engine exposes a REST surface for call control plus an event
//! WebSocket. Everything the probe needs is captured by the
//! [`EngineControlPlane`] capability trait so tests can substitute a fake
//! engine; [`EngineRestClient`] is the production implementation and
//! [`engine_event_stream`] delivers begin/end events with a polling
//! fallback.

pub mod engine_contract;
pub mod engine_event_stream;
pub mod engine_rest_client;

pub use engine_contract::{
    ChannelLookup, EngineControlPlane, EngineError, EngineEvent, ExternalMediaRequest,
};
pub use engine_event_stream::{run_engine_event_stream, EngineEventStreamConfig};
pub use engine_rest_client::EngineRestClient;
