//! Lifecycle scenarios: port exhaustion under concurrent begins and the
//! zombie scrubber, driven against an in-memory engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;

use echotap_core::{MetricsStore, PortPool};
use echotap_engine::{
    ChannelLookup, EngineControlPlane, EngineError, ExternalMediaRequest,
};
use echotap_runtime::{ChannelLifecycleConfig, ChannelLifecycleManager};

#[derive(Debug, Default)]
struct FakeEngineState {
    live_channels: HashSet<String>,
    hangups: Vec<String>,
    destroyed_bridges: Vec<String>,
    bridges_created: usize,
}

#[derive(Debug, Default)]
struct FakeEngine {
    state: Mutex<FakeEngineState>,
}

impl FakeEngine {
    fn set_live(&self, channel_id: &str, live: bool) {
        let mut state = self.state.lock().expect("fake engine lock");
        if live {
            state.live_channels.insert(channel_id.to_string());
        } else {
            state.live_channels.remove(channel_id);
        }
    }

    fn hangups(&self) -> Vec<String> {
        self.state.lock().expect("fake engine lock").hangups.clone()
    }

    fn destroyed_bridges(&self) -> Vec<String> {
        let state = self.state.lock().expect("fake engine lock");
        state.destroyed_bridges.clone()
    }
}

#[async_trait]
impl EngineControlPlane for FakeEngine {
    async fn answer(&self, _channel_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_bridge(&self) -> Result<String, EngineError> {
        let mut state = self.state.lock().expect("fake engine lock");
        state.bridges_created += 1;
        Ok(format!("bridge-{}", state.bridges_created))
    }

    async fn create_external_media(
        &self,
        request: &ExternalMediaRequest,
    ) -> Result<String, EngineError> {
        Ok(request.mirror_channel_id.clone())
    }

    async fn add_to_bridge(&self, _bridge_id: &str, _channel_id: &str) -> Result<(), EngineError> {
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("fake engine lock");
        state.hangups.push(channel_id.to_string());
        Ok(())
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock().expect("fake engine lock");
        state.destroyed_bridges.push(bridge_id.to_string());
        Ok(())
    }

    async fn lookup(&self, channel_id: &str) -> Result<ChannelLookup, EngineError> {
        let state = self.state.lock().expect("fake engine lock");
        if state.live_channels.contains(channel_id) {
            Ok(ChannelLookup::Exists)
        } else {
            Ok(ChannelLookup::NotFound)
        }
    }

    async fn list_channels(&self) -> Result<Vec<String>, EngineError> {
        let state = self.state.lock().expect("fake engine lock");
        Ok(state.live_channels.iter().cloned().collect())
    }
}

fn manager_with(
    engine: Arc<FakeEngine>,
    port_min: u16,
    port_max: u16,
    scrub_interval: Duration,
) -> (Arc<ChannelLifecycleManager>, Arc<PortPool>, Arc<MetricsStore>) {
    let ports = Arc::new(PortPool::new(port_min, port_max).expect("valid range"));
    let metrics = Arc::new(MetricsStore::new());
    let manager = Arc::new(ChannelLifecycleManager::new(
        ChannelLifecycleConfig {
            app_name: "echotap".to_string(),
            bind_ip: "127.0.0.1".parse().expect("ip"),
            echo_addr: "127.0.0.1:4000".parse().expect("addr"),
            engine_ip: "127.0.0.1".parse().expect("ip"),
            sample_rate: 8000,
            scrub_interval,
            answer_attempts: 3,
            answer_retry_delay: Duration::from_millis(5),
        },
        engine,
        ports.clone(),
        metrics.clone(),
    ));
    (manager, ports, metrics)
}

#[tokio::test]
async fn port_exhaustion_caps_concurrent_calls_and_recovers() {
    let engine = Arc::new(FakeEngine::default());
    for channel in ["call-1", "call-2", "call-3", "call-4", "call-5"] {
        engine.set_live(channel, true);
    }
    // Pool of three ports, four begins.
    let (manager, ports, _metrics) =
        manager_with(engine.clone(), 46400, 46402, Duration::from_secs(120));

    let mut results = Vec::new();
    for channel in ["call-1", "call-2", "call-3", "call-4"] {
        results.push(manager.handle_call_begin(channel).await);
    }
    assert!(results[0].is_ok() && results[1].is_ok() && results[2].is_ok());
    assert!(results[3].is_err(), "fourth call must hit exhaustion");
    assert_eq!(manager.active_count(), 3);
    assert!(
        !manager.is_active("call-4"),
        "the failed call leaves no trace in the active map"
    );
    assert!(engine.hangups().contains(&"call-4".to_string()));
    assert_eq!(ports.in_use_count(), 3);

    // Closing any one call frees its port; a subsequent begin succeeds.
    manager.handle_call_end("call-2").await;
    assert_eq!(ports.in_use_count(), 2);
    manager
        .handle_call_begin("call-5")
        .await
        .expect("freed port is allocatable");
    assert_eq!(manager.active_count(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn zombie_scrubber_reclaims_forgotten_channels() {
    let engine = Arc::new(FakeEngine::default());
    engine.set_live("call-zombie", true);
    let (manager, ports, metrics) =
        manager_with(engine.clone(), 46410, 46412, Duration::from_millis(200));

    manager
        .handle_call_begin("call-zombie")
        .await
        .expect("wired");
    assert_eq!(ports.in_use_count(), 1);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scrubber = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run_zombie_scrubber(shutdown_rx).await }
    });

    // The engine silently forgets the call; no end event is ever sent.
    engine.set_live("call-zombie", false);

    let reclaimed = async {
        while manager.is_active("call-zombie") {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(Duration::from_secs(2), reclaimed)
        .await
        .expect("scrubber reclaims the zombie within a few cycles");

    assert_eq!(ports.in_use_count(), 0);
    let mirror_hangups = engine
        .hangups()
        .iter()
        .filter(|id| *id == "external-media-call-zombie")
        .count();
    assert_eq!(mirror_hangups, 1, "teardown must run exactly once");
    assert_eq!(engine.destroyed_bridges().len(), 1);

    // The rollup still carries the channel after teardown.
    let snapshot = metrics.snapshot(manager.active_count());
    assert_eq!(snapshot.total_channels, 1);
    assert_eq!(snapshot.active_channels, 0);

    shutdown_tx.send(true).expect("signal shutdown");
    let _ = timeout(Duration::from_secs(1), scrubber).await;
}
