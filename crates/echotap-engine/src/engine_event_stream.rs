//! Delivery of engine call events: WebSocket primary, polling fallback.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::engine_contract::{EngineControlPlane, EngineEvent};

type EngineSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
/// Connection settings for [`run_engine_event_stream`].
pub struct EngineEventStreamConfig {
    pub engine_url: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
    pub reconnect_delay: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    channel: Option<EventChannel>,
}

#[derive(Debug, Deserialize)]
struct EventChannel {
    id: String,
}

/// Decodes one event-socket payload. Event types the probe does not track
/// yield `None`.
pub fn parse_engine_event(text: &str) -> Option<EngineEvent> {
    let envelope: EventEnvelope = serde_json::from_str(text).ok()?;
    let channel_id = envelope.channel?.id;
    match envelope.event_type.as_str() {
        "StasisStart" => Some(EngineEvent::CallBegin { channel_id }),
        "StasisEnd" => Some(EngineEvent::CallEnd { channel_id }),
        _ => None,
    }
}

/// Feeds engine call events into `events_tx` until shutdown.
///
/// The WebSocket is the primary transport and reconnects indefinitely once
/// established. When the very first connection cannot be made at all, the
/// loop falls back to polling the channel list and synthesising begin/end
/// events by set difference.
pub async fn run_engine_event_stream(
    config: EngineEventStreamConfig,
    control: Arc<dyn EngineControlPlane>,
    events_tx: mpsc::Sender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let connected = tokio::select! {
        _ = shutdown_rx.changed() => return Ok(()),
        connected = connect(&config) => connected,
    };
    match connected {
        Ok(socket) => {
            info!("engine event socket connected");
            run_socket_sessions(config, socket, events_tx, shutdown_rx).await
        }
        Err(error) => {
            warn!(%error, "engine event socket unavailable, falling back to channel polling");
            run_polling_loop(config, control, events_tx, shutdown_rx).await
        }
    }
}

/// Opens the event socket, trying the query-string auth convention first
/// and retrying the handshake with a basic-auth header when rejected.
async fn connect(config: &EngineEventStreamConfig) -> Result<EngineSocket> {
    let query_url = format!(
        "ws://{}/ari/events?api_key={}:{}&app={}",
        config.engine_url, config.username, config.password, config.app_name
    );
    let first_error = match connect_async(query_url.as_str()).await {
        Ok((socket, _response)) => return Ok(socket),
        Err(error) => error,
    };

    let header_url = format!("ws://{}/ari/events?app={}", config.engine_url, config.app_name);
    let mut request = header_url
        .as_str()
        .into_client_request()
        .context("failed to build event socket request")?;
    let credentials = BASE64.encode(format!("{}:{}", config.username, config.password));
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Basic {credentials}")
            .parse()
            .context("failed to build authorization header")?,
    );
    match connect_async(request).await {
        Ok((socket, _response)) => Ok(socket),
        Err(second_error) => bail!(
            "event socket rejected both auth conventions: query-string: {first_error}; header: {second_error}"
        ),
    }
}

async fn run_socket_sessions(
    config: EngineEventStreamConfig,
    first: EngineSocket,
    events_tx: mpsc::Sender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut socket = Some(first);
    loop {
        if let Some(active) = socket.take() {
            if let Err(error) = drive_socket(active, &events_tx, &mut shutdown_rx).await {
                warn!(%error, "engine event socket session error");
            }
            if *shutdown_rx.borrow() || events_tx.is_closed() {
                return Ok(());
            }
        }
        tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
        match connect(&config).await {
            Ok(reconnected) => {
                info!("engine event socket reconnected");
                socket = Some(reconnected);
            }
            Err(error) => warn!(%error, "engine event socket reconnect failed"),
        }
    }
}

async fn drive_socket(
    mut socket: EngineSocket,
    events_tx: &mpsc::Sender<EngineEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            maybe_message = socket.next() => {
                let Some(message) = maybe_message else {
                    return Ok(());
                };
                let message = message.context("failed reading engine event socket")?;
                if let WsMessage::Text(text) = message {
                    match parse_engine_event(text.as_str()) {
                        Some(event) => {
                            if events_tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => debug!("ignoring unrecognised engine event"),
                    }
                }
            }
        }
    }
}

async fn run_polling_loop(
    config: EngineEventStreamConfig,
    control: Arc<dyn EngineControlPlane>,
    events_tx: mpsc::Sender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let mut known: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let current: HashSet<String> = match control.list_channels().await {
            Ok(ids) => ids.into_iter().collect(),
            Err(error) => {
                debug!(%error, "channel poll failed, skipping cycle");
                continue;
            }
        };

        let mut begun: Vec<String> = current.difference(&known).cloned().collect();
        let mut ended: Vec<String> = known.difference(&current).cloned().collect();
        begun.sort();
        ended.sort();
        for channel_id in begun {
            if events_tx
                .send(EngineEvent::CallBegin { channel_id })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        for channel_id in ended {
            if events_tx
                .send(EngineEvent::CallEnd { channel_id })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        known = current;
    }
}
