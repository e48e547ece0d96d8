//! Per-channel UDP media relay.
//!
//! One worker owns one socket and two tasks: a reader that pulls datagrams
//! off the wire under a short deadline, and a processor that paces egress
//! toward the echo peer and correlates the returns. The receive deadline
//! and the pacing sleep must stay in separate tasks; the deadline is what
//! keeps cancellation fast.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use echotap_core::{LatencyCorrelator, MediaHeader, MetricsStore, PacketPacer, SequenceMeter};

/// Tolerance added to the media-clock deadline before a return counts as
/// late: 3 ms of the 22 ms per-packet ceiling for G.711 at 8 kHz with
/// 20 ms packetisation.
pub const LATE_TOLERANCE: Duration = Duration::from_millis(3);

/// Bounds how long the reader sits in the kernel before re-checking the
/// stop signal.
const RECV_DEADLINE: Duration = Duration::from_millis(100);

const PACKET_QUEUE_CAPACITY: usize = 1000;
const SOCKET_BUFFER_BYTES: usize = 2 * 1024 * 1024;
const MAX_DATAGRAM_LEN: usize = 1500;

/// Construction inputs for one channel's relay.
#[derive(Debug, Clone)]
pub struct ChannelWorkerConfig {
    pub channel_id: String,
    pub bind_ip: IpAddr,
    pub local_port: u16,
    pub echo_addr: SocketAddr,
    /// Source-address discriminator: datagrams from this IP are engine
    /// egress, everything else is an echo return.
    pub engine_ip: IpAddr,
    pub sample_rate: u32,
    /// Notified with the channel id when the socket dies fatally, so the
    /// lifecycle manager can run full teardown.
    pub failure_tx: Option<mpsc::Sender<String>>,
}

struct InboundDatagram {
    data: Vec<u8>,
    from: SocketAddr,
    arrived: Instant,
    from_engine: bool,
}

/// Stop signal plus join point for a running worker.
#[derive(Debug)]
pub struct ChannelWorkerHandle {
    channel_id: String,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl ChannelWorkerHandle {
    /// The socket address the worker is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals both tasks and joins them. Idempotent; stopping an already
    /// stopped worker is a no-op.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let tasks = self.tasks.lock().await.take();
        if let Some((reader, processor)) = tasks {
            if let Err(error) = reader.await {
                error!(channel = %self.channel_id, %error, "reader task join failed");
            }
            if let Err(error) = processor.await {
                error!(channel = %self.channel_id, %error, "processor task join failed");
            }
        }
    }
}

/// Binds the media socket and starts the reader/processor pair.
pub async fn spawn_channel_worker(
    config: ChannelWorkerConfig,
    metrics: Arc<MetricsStore>,
) -> Result<ChannelWorkerHandle> {
    let socket = Arc::new(bind_media_socket(config.bind_ip, config.local_port)?);
    let local_addr = socket
        .local_addr()
        .context("failed to read media socket address")?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let (queue_tx, queue_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);

    let reader = tokio::spawn(run_reader(
        config.channel_id.clone(),
        socket.clone(),
        config.engine_ip,
        config.echo_addr,
        queue_tx,
        stop_rx.clone(),
        config.failure_tx.clone(),
    ));
    let processor = tokio::spawn(run_processor(
        config.channel_id.clone(),
        socket,
        config.echo_addr,
        config.sample_rate,
        metrics,
        queue_rx,
        stop_rx,
    ));

    debug!(channel = %config.channel_id, addr = %local_addr, "media worker started");
    Ok(ChannelWorkerHandle {
        channel_id: config.channel_id,
        local_addr,
        stop_tx,
        tasks: Mutex::new(Some((reader, processor))),
    })
}

fn bind_media_socket(bind_ip: IpAddr, port: u16) -> Result<UdpSocket> {
    let address = SocketAddr::new(bind_ip, port);
    let socket = Socket::new(Domain::for_address(address), Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create media socket")?;
    socket
        .set_recv_buffer_size(SOCKET_BUFFER_BYTES)
        .context("failed to size media receive buffer")?;
    socket
        .set_send_buffer_size(SOCKET_BUFFER_BYTES)
        .context("failed to size media send buffer")?;
    socket
        .set_nonblocking(true)
        .context("failed to make media socket non-blocking")?;
    socket
        .bind(&address.into())
        .with_context(|| format!("failed to bind media socket on {address}"))?;
    UdpSocket::from_std(socket.into()).context("failed to register media socket with the runtime")
}

async fn run_reader(
    channel_id: String,
    socket: Arc<UdpSocket>,
    engine_ip: IpAddr,
    echo_addr: SocketAddr,
    queue_tx: mpsc::Sender<InboundDatagram>,
    stop_rx: watch::Receiver<bool>,
    failure_tx: Option<mpsc::Sender<String>>,
) {
    let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        if *stop_rx.borrow() {
            break;
        }
        match tokio::time::timeout(RECV_DEADLINE, socket.recv_from(&mut buffer)).await {
            Err(_deadline) => continue,
            Ok(Err(error)) => {
                error!(channel = %channel_id, %error, "media socket receive failed");
                if let Some(failure_tx) = &failure_tx {
                    let _ = failure_tx.try_send(channel_id.clone());
                }
                break;
            }
            Ok(Ok((length, from))) => {
                // The exact echo address wins over the IP comparison, so a
                // reflector co-located with the engine still classifies.
                let from_engine = from != echo_addr && from.ip() == engine_ip;
                let datagram = InboundDatagram {
                    data: buffer[..length].to_vec(),
                    from,
                    arrived: Instant::now(),
                    from_engine,
                };
                match queue_tx.try_send(datagram) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(channel = %channel_id, "packet queue full, dropping datagram");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    debug!(channel = %channel_id, "reader stopped");
}

struct RelayState {
    pacer: PacketPacer,
    correlator: LatencyCorrelator,
    meter: SequenceMeter,
    /// Observed source address of the engine's media, learned from egress
    /// datagrams; returns are forwarded here.
    engine_addr: Option<SocketAddr>,
    parse_errors: u64,
}

#[allow(clippy::too_many_arguments)]
async fn run_processor(
    channel_id: String,
    socket: Arc<UdpSocket>,
    echo_addr: SocketAddr,
    sample_rate: u32,
    metrics: Arc<MetricsStore>,
    mut queue_rx: mpsc::Receiver<InboundDatagram>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut state = RelayState {
        pacer: PacketPacer::new(sample_rate),
        correlator: LatencyCorrelator::new(),
        meter: SequenceMeter::new(),
        engine_addr: None,
        parse_errors: 0,
    };
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            maybe_datagram = queue_rx.recv() => {
                let Some(datagram) = maybe_datagram else {
                    break;
                };
                if datagram.from_engine {
                    let keep_running = handle_egress(
                        &channel_id,
                        &socket,
                        echo_addr,
                        &metrics,
                        &mut state,
                        datagram,
                        &mut stop_rx,
                    )
                    .await;
                    if !keep_running {
                        break;
                    }
                } else {
                    handle_ingress(&channel_id, &socket, &metrics, &mut state, datagram).await;
                }
            }
        }
    }
    if state.parse_errors > 0 {
        debug!(channel = %channel_id, parse_errors = state.parse_errors, "processor stopped");
    } else {
        debug!(channel = %channel_id, "processor stopped");
    }
}

/// Engine → echo. Returns `false` when a stop arrived during the pacing
/// sleep and the send was abandoned.
async fn handle_egress(
    channel_id: &str,
    socket: &UdpSocket,
    echo_addr: SocketAddr,
    metrics: &MetricsStore,
    state: &mut RelayState,
    datagram: InboundDatagram,
    stop_rx: &mut watch::Receiver<bool>,
) -> bool {
    state.engine_addr = Some(datagram.from);
    let Some(header) = MediaHeader::parse(&datagram.data) else {
        state.parse_errors += 1;
        debug!(channel = %channel_id, "dropping malformed egress datagram");
        return true;
    };

    let now = Instant::now();
    state.correlator.record(header.sequence_number, now);
    state.meter.track_outbound(header.sequence_number);
    metrics.record_outbound(channel_id);

    // A stream already behind its media clock goes out immediately.
    let delay = state.pacer.schedule(header.timestamp, now);
    if delay > Duration::ZERO {
        tokio::select! {
            _ = stop_rx.changed() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    if let Err(error) = socket.send_to(&datagram.data, echo_addr).await {
        warn!(channel = %channel_id, %error, "failed to forward datagram to echo");
    }
    true
}

/// Echo → engine: correlate, meter, lateness, forward.
async fn handle_ingress(
    channel_id: &str,
    socket: &UdpSocket,
    metrics: &MetricsStore,
    state: &mut RelayState,
    datagram: InboundDatagram,
) {
    let Some(header) = MediaHeader::parse(&datagram.data) else {
        state.parse_errors += 1;
        debug!(channel = %channel_id, "dropping malformed ingress datagram");
        return;
    };

    match state.correlator.consume(header.sequence_number, datagram.arrived) {
        Some(rtt) => metrics.record_latency(channel_id, rtt.as_secs_f64() * 1000.0),
        None => debug!(
            channel = %channel_id,
            sequence = header.sequence_number,
            "return without matching send entry"
        ),
    }

    let gap = state.meter.track_inbound(header.sequence_number);
    if gap > 0 {
        metrics.record_drops(channel_id, u64::from(gap));
    }

    if let Some(expected) = state.pacer.expected_instant(header.timestamp) {
        if datagram.arrived > expected + LATE_TOLERANCE {
            metrics.record_late(channel_id);
        }
    }

    match state.engine_addr {
        Some(engine_addr) => {
            if let Err(error) = socket.send_to(&datagram.data, engine_addr).await {
                warn!(channel = %channel_id, %error, "failed to forward datagram to engine");
            }
        }
        None => debug!(channel = %channel_id, "return before any engine datagram, nowhere to forward"),
    }
}
