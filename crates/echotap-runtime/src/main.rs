//! Service entry point: wires configuration, control plane, lifecycle
//! manager, event stream, scrubber, reporter, and status endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use echotap_core::{MetricsStore, PortPool, G711_SAMPLE_RATE};
use echotap_engine::{
    run_engine_event_stream, EngineControlPlane, EngineEventStreamConfig, EngineRestClient,
};
use echotap_runtime::channel_lifecycle::{ANSWER_ATTEMPTS, ANSWER_RETRY_DELAY, SCRUB_INTERVAL};
use echotap_runtime::{
    run_status_server, ChannelLifecycleConfig, ChannelLifecycleManager, ServiceConfig, StatusState,
};

const EVENT_QUEUE_CAPACITY: usize = 256;
const EVENT_RECONNECT_DELAY: Duration = Duration::from_secs(2);
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    info!(engine = %config.engine_url, app = %config.app_name, "starting echotap");

    let echo_addr = resolve_echo_addr(&config).await?;
    let ports = Arc::new(PortPool::new(config.port_min, config.port_max)?);
    let metrics = Arc::new(MetricsStore::new());
    let control: Arc<dyn EngineControlPlane> = Arc::new(EngineRestClient::new(
        &config.engine_url,
        &config.engine_user,
        &config.engine_pass,
    )?);

    let lifecycle = Arc::new(ChannelLifecycleManager::new(
        ChannelLifecycleConfig {
            app_name: config.app_name.clone(),
            bind_ip: config.bind_ip,
            echo_addr,
            // The engine mirrors media from the host it shares with the
            // probe, so its peer IP is the bind address.
            engine_ip: config.bind_ip,
            sample_rate: G711_SAMPLE_RATE,
            scrub_interval: SCRUB_INTERVAL,
            answer_attempts: ANSWER_ATTEMPTS,
            answer_retry_delay: ANSWER_RETRY_DELAY,
        },
        control.clone(),
        ports.clone(),
        metrics.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

    let stream_task = tokio::spawn(run_engine_event_stream(
        EngineEventStreamConfig {
            engine_url: config.engine_url.clone(),
            username: config.engine_user.clone(),
            password: config.engine_pass.clone(),
            app_name: config.app_name.clone(),
            reconnect_delay: EVENT_RECONNECT_DELAY,
            poll_interval: EVENT_POLL_INTERVAL,
        },
        control.clone(),
        events_tx,
        shutdown_rx.clone(),
    ));

    let status_task = tokio::spawn(run_status_server(
        SocketAddr::new(config.bind_ip, config.service_port),
        Arc::new(StatusState {
            metrics: metrics.clone(),
            ports: ports.clone(),
            lifecycle: lifecycle.clone(),
        }),
        shutdown_rx.clone(),
    ));

    let failure_task = tokio::spawn({
        let lifecycle = lifecycle.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { lifecycle.run_worker_failure_listener(shutdown_rx).await }
    });
    let scrubber_task = tokio::spawn({
        let lifecycle = lifecycle.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { lifecycle.run_zombie_scrubber(shutdown_rx).await }
    });
    let reporter_task = tokio::spawn({
        let lifecycle = lifecycle.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = config.metrics_interval;
        async move { lifecycle.run_metrics_reporter(interval, shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        _ = lifecycle.run_event_loop(events_rx, shutdown_rx.clone()) => warn!("engine event loop ended"),
    }

    let _ = shutdown_tx.send(true);
    lifecycle.shutdown().await;

    let _ = failure_task.await;
    let _ = scrubber_task.await;
    let _ = reporter_task.await;
    if let Ok(Err(error)) = stream_task.await {
        warn!(error = %format!("{error:#}"), "event stream ended with error");
    }
    if let Ok(Err(error)) = status_task.await {
        warn!(error = %format!("{error:#}"), "status endpoint ended with error");
    }
    Ok(())
}

async fn resolve_echo_addr(config: &ServiceConfig) -> Result<SocketAddr> {
    tokio::net::lookup_host((config.echo_host.as_str(), config.echo_port))
        .await
        .with_context(|| {
            format!(
                "failed to resolve echo endpoint {}:{}",
                config.echo_host, config.echo_port
            )
        })?
        .next()
        .with_context(|| {
            format!(
                "echo endpoint {}:{} resolved to no addresses",
                config.echo_host, config.echo_port
            )
        })
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
