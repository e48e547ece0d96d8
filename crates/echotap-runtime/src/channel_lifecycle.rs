//! Channel lifecycle orchestration.
//!
//! Consumes engine call events: on begin it reserves a media port, asks the
//! engine to mirror the call onto it, joins mirror and call in a
//! conference, and starts the relay worker; on end (or zombie scrub, or
//! process shutdown) it tears everything down exactly once.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use echotap_core::{MetricsStore, PortPool};
use echotap_engine::{
    ChannelLookup, EngineControlPlane, EngineError, EngineEvent, ExternalMediaRequest,
};

use crate::channel_worker::{spawn_channel_worker, ChannelWorkerConfig, ChannelWorkerHandle};

/// Answer retry contract: the begin event can arrive fractionally before
/// the engine has committed the channel to its own registry.
pub const ANSWER_ATTEMPTS: usize = 3;
pub const ANSWER_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Production cadence of the zombie scrubber.
pub const SCRUB_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
/// Wiring parameters shared by every channel.
pub struct ChannelLifecycleConfig {
    pub app_name: String,
    pub bind_ip: IpAddr,
    pub echo_addr: SocketAddr,
    pub engine_ip: IpAddr,
    pub sample_rate: u32,
    pub scrub_interval: Duration,
    pub answer_attempts: usize,
    pub answer_retry_delay: Duration,
}

/// Everything needed to undo one wired channel.
struct ChannelRecord {
    channel_id: String,
    bridge_id: String,
    mirror_id: String,
    local_port: u16,
    worker: ChannelWorkerHandle,
    started_at: Instant,
}

const WORKER_FAILURE_QUEUE_CAPACITY: usize = 64;

/// Owns the active-channel map and drives begin/end handling.
pub struct ChannelLifecycleManager {
    config: ChannelLifecycleConfig,
    control: Arc<dyn EngineControlPlane>,
    ports: Arc<PortPool>,
    metrics: Arc<MetricsStore>,
    active: Mutex<HashMap<String, Arc<ChannelRecord>>>,
    worker_failures_tx: mpsc::Sender<String>,
    worker_failures_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl ChannelLifecycleManager {
    pub fn new(
        config: ChannelLifecycleConfig,
        control: Arc<dyn EngineControlPlane>,
        ports: Arc<PortPool>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        let (worker_failures_tx, worker_failures_rx) = mpsc::channel(WORKER_FAILURE_QUEUE_CAPACITY);
        Self {
            config,
            control,
            ports,
            metrics,
            active: Mutex::new(HashMap::new()),
            worker_failures_tx,
            worker_failures_rx: Mutex::new(Some(worker_failures_rx)),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active map lock poisoned").len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let active = self.active.lock().expect("active map lock poisoned");
        active.keys().cloned().collect()
    }

    pub fn is_active(&self, channel_id: &str) -> bool {
        let active = self.active.lock().expect("active map lock poisoned");
        active.contains_key(channel_id)
    }

    /// Wires a newly begun call: answer, reserve a port, mirror the media
    /// onto it, bridge call and mirror, start the relay worker.
    pub async fn handle_call_begin(&self, channel_id: &str) -> Result<()> {
        if self.is_active(channel_id) {
            warn!(channel = %channel_id, "begin event for already wired channel, ignoring");
            return Ok(());
        }
        self.metrics.mark_channel_started();

        answer_with_retry(
            self.control.as_ref(),
            channel_id,
            self.config.answer_attempts,
            self.config.answer_retry_delay,
        )
        .await
        .with_context(|| format!("failed to answer channel {channel_id}"))?;

        let local_port = match self.ports.allocate() {
            Ok(port) => port,
            Err(error) => {
                warn!(channel = %channel_id, %error, "no media port available, hanging call up");
                if let Err(hangup_error) = self.control.hangup(channel_id).await {
                    warn!(channel = %channel_id, %hangup_error, "hangup after port exhaustion failed");
                }
                return Err(error.into());
            }
        };

        match self.wire_channel(channel_id, local_port).await {
            Ok(record) => {
                info!(channel = %channel_id, port = local_port, "channel wired");
                let mut active = self.active.lock().expect("active map lock poisoned");
                active.insert(channel_id.to_string(), Arc::new(record));
                Ok(())
            }
            Err(error) => {
                self.ports.release(local_port);
                Err(error)
            }
        }
    }

    async fn wire_channel(&self, channel_id: &str, local_port: u16) -> Result<ChannelRecord> {
        let bridge_id = self
            .control
            .create_bridge()
            .await
            .context("failed to create conference bridge")?;

        let request = ExternalMediaRequest::ulaw_bidirectional(
            &self.config.app_name,
            &self.config.bind_ip.to_string(),
            local_port,
            channel_id,
        );
        let mirror_id = match self.control.create_external_media(&request).await {
            Ok(mirror_id) => mirror_id,
            Err(error) => {
                self.discard_bridge(&bridge_id).await;
                return Err(error).context("failed to create media mirror");
            }
        };

        if let Err(error) = self.control.add_to_bridge(&bridge_id, channel_id).await {
            self.discard_mirror(&mirror_id).await;
            self.discard_bridge(&bridge_id).await;
            return Err(error).context("failed to attach channel to bridge");
        }
        if let Err(error) = self.control.add_to_bridge(&bridge_id, &mirror_id).await {
            self.discard_mirror(&mirror_id).await;
            self.discard_bridge(&bridge_id).await;
            return Err(error).context("failed to attach mirror to bridge");
        }

        let worker_config = ChannelWorkerConfig {
            channel_id: channel_id.to_string(),
            bind_ip: self.config.bind_ip,
            local_port,
            echo_addr: self.config.echo_addr,
            engine_ip: self.config.engine_ip,
            sample_rate: self.config.sample_rate,
            failure_tx: Some(self.worker_failures_tx.clone()),
        };
        match spawn_channel_worker(worker_config, self.metrics.clone()).await {
            Ok(worker) => Ok(ChannelRecord {
                channel_id: channel_id.to_string(),
                bridge_id,
                mirror_id,
                local_port,
                worker,
                started_at: Instant::now(),
            }),
            Err(error) => {
                self.discard_mirror(&mirror_id).await;
                self.discard_bridge(&bridge_id).await;
                Err(error).context("failed to start media worker")
            }
        }
    }

    /// Tears a channel down. The single successful removal from the active
    /// map wins, so cleanup runs exactly once per record.
    pub async fn handle_call_end(&self, channel_id: &str) {
        let record = {
            let mut active = self.active.lock().expect("active map lock poisoned");
            active.remove(channel_id)
        };
        let Some(record) = record else {
            debug!(channel = %channel_id, "end event for unknown channel");
            return;
        };
        self.teardown(record).await;
    }

    async fn teardown(&self, record: Arc<ChannelRecord>) {
        record.worker.stop().await;
        self.ports.release(record.local_port);
        self.discard_mirror(&record.mirror_id).await;
        self.discard_bridge(&record.bridge_id).await;
        info!(
            channel = %record.channel_id,
            lifetime_secs = record.started_at.elapsed().as_secs(),
            "channel torn down"
        );
    }

    async fn discard_mirror(&self, mirror_id: &str) {
        if let Err(error) = self.control.hangup(mirror_id).await {
            warn!(mirror = %mirror_id, %error, "mirror hangup failed");
        }
    }

    async fn discard_bridge(&self, bridge_id: &str) {
        if let Err(error) = self.control.destroy_bridge(bridge_id).await {
            warn!(bridge = %bridge_id, %error, "bridge teardown failed");
        }
    }

    /// One scrub pass: tear down records whose engine channel no longer
    /// exists. A transport failure skips the whole round; the next tick
    /// will see a healthy engine again.
    pub async fn scrub_zombies(&self) {
        for channel_id in self.active_ids() {
            match self.control.lookup(&channel_id).await {
                Ok(ChannelLookup::Exists) => {}
                Ok(ChannelLookup::NotFound) => {
                    warn!(channel = %channel_id, "zombie channel detected, tearing down");
                    self.handle_call_end(&channel_id).await;
                }
                Err(error) => {
                    debug!(%error, "zombie scrub lookup failed, skipping this round");
                    return;
                }
            }
        }
    }

    /// Tears down channels whose worker died on a fatal socket error.
    /// Single consumer; later calls return immediately.
    pub async fn run_worker_failure_listener(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let receiver = {
            let mut slot = self
                .worker_failures_rx
                .lock()
                .expect("worker failure receiver lock poisoned");
            slot.take()
        };
        let Some(mut failures_rx) = receiver else {
            return;
        };
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                maybe_failed = failures_rx.recv() => {
                    let Some(channel_id) = maybe_failed else {
                        return;
                    };
                    warn!(channel = %channel_id, "media worker died, tearing channel down");
                    self.handle_call_end(&channel_id).await;
                }
            }
        }
    }

    pub async fn run_zombie_scrubber(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scrub_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; scrubbing starts one interval in.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = ticker.tick() => self.scrub_zombies().await,
            }
        }
    }

    /// Serially applies engine events until shutdown or stream end.
    pub async fn run_event_loop(
        &self,
        mut events_rx: mpsc::Receiver<EngineEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                maybe_event = events_rx.recv() => {
                    let Some(event) = maybe_event else {
                        return;
                    };
                    match event {
                        EngineEvent::CallBegin { channel_id } => {
                            if let Err(error) = self.handle_call_begin(&channel_id).await {
                                warn!(channel = %channel_id, error = %format!("{error:#}"), "failed to wire channel");
                            }
                        }
                        EngineEvent::CallEnd { channel_id } => {
                            self.handle_call_end(&channel_id).await;
                        }
                    }
                }
            }
        }
    }

    /// Periodic one-line operator summary.
    pub async fn run_metrics_reporter(
        &self,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot(self.active_count());
                    println!(
                        "STATUS: channels={} latency={:.1}ms loss={:.2}% late={:.2}%",
                        snapshot.active_channels,
                        snapshot.avg_latency,
                        snapshot.packet_loss_ratio * 100.0,
                        snapshot.late_ratio * 100.0,
                    );
                }
            }
        }
    }

    /// Tears down every active channel and prints the final report.
    pub async fn shutdown(&self) {
        for channel_id in self.active_ids() {
            self.handle_call_end(&channel_id).await;
        }
        self.print_sla_report();
    }

    pub fn print_sla_report(&self) {
        let snapshot = self.metrics.snapshot(self.active_count());
        println!("=== FINAL SLA REPORT ===");
        println!(
            "p50={:.1}ms p95={:.1}ms p99={:.1}ms max={:.1}ms",
            snapshot.p50_latency, snapshot.p95_latency, snapshot.p99_latency, snapshot.max_latency,
        );
        println!(
            "late_ratio={:.2}% drops={:.2}%",
            snapshot.late_ratio * 100.0,
            snapshot.packet_loss_ratio * 100.0,
        );
        println!(
            "total channels: {} active channels: {}",
            snapshot.total_channels, snapshot.active_channels,
        );
        println!("allocated media ports: {}", self.ports.in_use_count());
        println!("========================");
    }
}

/// Answers a channel, retrying only the not-found race with a fixed short
/// backoff; any other error is fatal for the channel.
pub async fn answer_with_retry(
    control: &dyn EngineControlPlane,
    channel_id: &str,
    attempts: usize,
    delay: Duration,
) -> Result<(), EngineError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match control.answer(channel_id).await {
            Ok(()) => return Ok(()),
            Err(EngineError::NotFound) if attempt < attempts => {
                debug!(channel = %channel_id, attempt, "channel not yet registered, retrying answer");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
