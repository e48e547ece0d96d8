//! Runtime wiring for the echotap probe.
//!
//! Composes the core measurement primitives and the engine control plane
//! into a running service: per-channel UDP workers, the channel lifecycle
//! manager that reacts to engine events, and the status endpoint.

pub mod channel_lifecycle;
pub mod channel_worker;
pub mod service_config;
pub mod status_server;


pub use channel_lifecycle::{ChannelLifecycleConfig, ChannelLifecycleManager};
pub use channel_worker::{spawn_channel_worker, ChannelWorkerConfig, ChannelWorkerHandle};
pub use service_config::ServiceConfig;
pub use status_server::{build_status_router, run_status_server, StatusState};
