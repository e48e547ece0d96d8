//! End-to-end media scenarios: a real worker relaying between a scripted
//! engine socket and a loopback echo.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use echotap_core::media_header::{encode_packet, MediaHeader};
use echotap_core::{MetricsStore, G711_SAMPLES_PER_PACKET};
use echotap_runtime::{spawn_channel_worker, ChannelWorkerConfig, ChannelWorkerHandle};

const PACKET_INTERVAL: Duration = Duration::from_millis(20);

enum EchoBehavior {
    Immediate,
    DropSequences(HashSet<u16>),
    DelaySequence { sequence: u16, delay: Duration },
}

/// Loopback reflector: returns every datagram byte-identical to its
/// sender, with optional scripted loss or per-sequence delay.
async fn spawn_echo(behavior: EchoBehavior) -> (SocketAddr, JoinHandle<()>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("bind echo"));
    let addr = socket.local_addr().expect("echo addr");
    let task = tokio::spawn(async move {
        let mut buffer = vec![0u8; 2048];
        loop {
            let Ok((length, from)) = socket.recv_from(&mut buffer).await else {
                break;
            };
            let data = buffer[..length].to_vec();
            let sequence = MediaHeader::parse(&data).map(|header| header.sequence_number);
            match (&behavior, sequence) {
                (EchoBehavior::DropSequences(dropped), Some(seq)) if dropped.contains(&seq) => {}
                (EchoBehavior::DelaySequence { sequence, delay }, Some(seq))
                    if *sequence == seq =>
                {
                    let socket = socket.clone();
                    let delay = *delay;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = socket.send_to(&data, from).await;
                    });
                }
                _ => {
                    let _ = socket.send_to(&data, from).await;
                }
            }
        }
    });
    (addr, task)
}

async fn start_worker(
    channel_id: &str,
    echo_addr: SocketAddr,
    metrics: Arc<MetricsStore>,
) -> ChannelWorkerHandle {
    spawn_channel_worker(
        ChannelWorkerConfig {
            channel_id: channel_id.to_string(),
            bind_ip: "127.0.0.1".parse().expect("ip"),
            local_port: 0,
            echo_addr,
            engine_ip: "127.0.0.1".parse().expect("ip"),
            sample_rate: 8000,
            failure_tx: None,
        },
        metrics,
    )
    .await
    .expect("worker starts")
}

fn media_packet(sequence_number: u16, timestamp: u32) -> Vec<u8> {
    let header = MediaHeader {
        version: 2,
        marker: false,
        payload_type: 0,
        sequence_number,
        timestamp,
        ssrc: 0xE0E0_0001,
    };
    encode_packet(&header, &[0x7Fu8; 160])
}

/// Sends `count` packets on the media clock: sequences ascending from
/// `first_sequence`, timestamps advancing one packet's worth of samples.
async fn drive_media(
    engine: &UdpSocket,
    worker_addr: SocketAddr,
    first_sequence: u16,
    count: u16,
) {
    let mut ticker = tokio::time::interval(PACKET_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    for index in 0..count {
        ticker.tick().await;
        let packet = media_packet(
            first_sequence.wrapping_add(index),
            u32::from(index) * G711_SAMPLES_PER_PACKET,
        );
        engine
            .send_to(&packet, worker_addr)
            .await
            .expect("send media");
    }
}

async fn drain_returns(engine: &UdpSocket, expected: usize) -> usize {
    let mut buffer = vec![0u8; 2048];
    let mut received = 0;
    while received < expected {
        match timeout(Duration::from_millis(500), engine.recv_from(&mut buffer)).await {
            Ok(Ok(_)) => received += 1,
            _ => break,
        }
    }
    received
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn single_call_clean_round_trips() {
    let metrics = Arc::new(MetricsStore::new());
    let (echo_addr, echo_task) = spawn_echo(EchoBehavior::Immediate).await;
    let worker = start_worker("call-clean", echo_addr, metrics.clone()).await;
    let engine = UdpSocket::bind("127.0.0.1:0").await.expect("bind engine");

    drive_media(&engine, worker.local_addr(), 1000, 100).await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            metrics
                .channel_counters("call-clean")
                .is_some_and(|counters| counters.samples == 100)
        })
        .await,
        "expected 100 round-trip samples"
    );
    let counters = metrics.channel_counters("call-clean").expect("counters");
    assert_eq!(counters.outbound, 100);
    assert_eq!(counters.dropped, 0);
    assert_eq!(counters.late, 0, "immediate echo must never be late");
    assert_eq!(drain_returns(&engine, 100).await, 100);

    let snapshot = metrics.snapshot(1);
    assert!(snapshot.p50_latency <= snapshot.p95_latency);
    assert!(snapshot.p95_latency <= snapshot.p99_latency);
    assert!(snapshot.p99_latency <= snapshot.max_latency);
    assert!(
        snapshot.max_latency < 50.0,
        "loopback round trip out of envelope: {} ms",
        snapshot.max_latency
    );

    worker.stop().await;
    echo_task.abort();
}

#[tokio::test]
async fn lost_returns_surface_as_sequence_gaps() {
    let metrics = Arc::new(MetricsStore::new());
    let dropped: HashSet<u16> = [1000, 1010, 1020, 1030, 1040].into_iter().collect();
    let (echo_addr, echo_task) = spawn_echo(EchoBehavior::DropSequences(dropped)).await;
    let worker = start_worker("call-lossy", echo_addr, metrics.clone()).await;
    let engine = UdpSocket::bind("127.0.0.1:0").await.expect("bind engine");

    drive_media(&engine, worker.local_addr(), 1000, 50).await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            metrics
                .channel_counters("call-lossy")
                .is_some_and(|counters| counters.samples == 45)
        })
        .await,
        "expected 45 surviving round trips"
    );
    let counters = metrics.channel_counters("call-lossy").expect("counters");
    assert_eq!(counters.outbound, 50);
    assert_eq!(counters.dropped, 5, "five dropped returns must be metered");
    assert_eq!(counters.late, 0);
    assert_eq!(drain_returns(&engine, 45).await, 45);

    worker.stop().await;
    echo_task.abort();
}

#[tokio::test]
async fn delayed_return_counts_as_late_once() {
    let metrics = Arc::new(MetricsStore::new());
    let (echo_addr, echo_task) = spawn_echo(EchoBehavior::DelaySequence {
        sequence: 2005,
        delay: Duration::from_millis(10),
    })
    .await;
    let worker = start_worker("call-late", echo_addr, metrics.clone()).await;
    let engine = UdpSocket::bind("127.0.0.1:0").await.expect("bind engine");

    drive_media(&engine, worker.local_addr(), 2000, 50).await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            metrics
                .channel_counters("call-late")
                .is_some_and(|counters| counters.samples == 50)
        })
        .await,
        "the delayed return still yields a sample"
    );
    let counters = metrics.channel_counters("call-late").expect("counters");
    assert_eq!(counters.dropped, 0);
    assert_eq!(
        counters.late, 1,
        "a 10 ms delay against a 3 ms tolerance is late"
    );

    worker.stop().await;
    echo_task.abort();
}

#[tokio::test]
async fn sequence_wrap_keeps_round_trips_continuous() {
    let metrics = Arc::new(MetricsStore::new());
    let (echo_addr, echo_task) = spawn_echo(EchoBehavior::Immediate).await;
    let worker = start_worker("call-wrap", echo_addr, metrics.clone()).await;
    let engine = UdpSocket::bind("127.0.0.1:0").await.expect("bind engine");

    // Sequences cross 0xFFFF -> 0x0000 mid-stream.
    drive_media(&engine, worker.local_addr(), 0xFFF0, 32).await;

    assert!(
        wait_until(Duration::from_secs(3), || {
            metrics
                .channel_counters("call-wrap")
                .is_some_and(|counters| counters.samples == 32)
        })
        .await,
        "expected continuous samples across the wrap"
    );
    let counters = metrics.channel_counters("call-wrap").expect("counters");
    assert_eq!(counters.outbound, 32);
    assert_eq!(counters.dropped, 0, "the wrap itself is not a gap");

    worker.stop().await;
    echo_task.abort();
}
