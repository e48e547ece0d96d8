//! Capability contract between the probe and the telephony engine.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
/// Failure taxonomy for engine control-plane calls.
///
/// Only `NotFound` is retryable in the answer path; `Transport` drives the
/// reconnect loops.
pub enum EngineError {
    #[error("engine object not found")]
    NotFound,
    #[error("engine rejected credentials")]
    Auth,
    #[error("engine protocol error: {0}")]
    Protocol(String),
    #[error("engine transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for EngineError {
    fn from(error: reqwest::Error) -> Self {
        EngineError::Transport(error.to_string())
    }
}

/// Control-plane events the lifecycle manager consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    CallBegin { channel_id: String },
    CallEnd { channel_id: String },
}

/// Result of probing a channel's existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLookup {
    Exists,
    NotFound,
}

/// Parameters for mirroring a call's media to a UDP sink.
///
/// Everything except the sink and the source channel is fixed in this
/// system: G.711 µ-law over UDP, raw media packets with 12-byte headers,
/// both directions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMediaRequest {
    pub app: String,
    pub external_host: String,
    pub format: String,
    pub direction: String,
    pub encapsulation: String,
    pub mirror_channel_id: String,
}

impl ExternalMediaRequest {
    /// The fixed µ-law bidirectional mirror used for every call.
    pub fn ulaw_bidirectional(app: &str, sink_host: &str, sink_port: u16, channel_id: &str) -> Self {
        Self {
            app: app.to_string(),
            external_host: format!("{sink_host}:{sink_port}"),
            format: "ulaw".to_string(),
            direction: "both".to_string(),
            encapsulation: "rtp".to_string(),
            mirror_channel_id: format!("external-media-{channel_id}"),
        }
    }
}

#[async_trait]
/// The subset of engine operations the probe depends on.
///
/// The worker and lifecycle manager only ever see this trait, so a fake
/// engine can stand in during tests.
pub trait EngineControlPlane: Send + Sync {
    /// Marks the call as active so media begins flowing.
    async fn answer(&self, channel_id: &str) -> Result<(), EngineError>;

    /// Creates a mixing conference and returns its bridge id.
    async fn create_bridge(&self) -> Result<String, EngineError>;

    /// Asks the engine to duplicate the call's media to the given UDP
    /// sink; returns the mirror channel id.
    async fn create_external_media(
        &self,
        request: &ExternalMediaRequest,
    ) -> Result<String, EngineError>;

    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), EngineError>;

    async fn hangup(&self, channel_id: &str) -> Result<(), EngineError>;

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), EngineError>;

    /// Existence probe used by the zombie scrubber.
    async fn lookup(&self, channel_id: &str) -> Result<ChannelLookup, EngineError>;

    /// Ids of all currently active channels; the polling fallback builds
    /// synthetic begin/end events from this.
    async fn list_channels(&self) -> Result<Vec<String>, EngineError>;
}
