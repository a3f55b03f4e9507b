use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use pubsub_relay::broker::memory::{MemoryBroker, PublishFault};
use pubsub_relay::broker::{
    BrokerClient, BrokerConnector, BrokerError, ClientSettings, Endpoint, PublishSession,
    Subscriber,
};
use pubsub_relay::relay::prober::{ProbeOutcome, HEARTBEAT_TIME_FORMAT};
use pubsub_relay::relay::{
    CommandOutcome, ConnectOutcome, ConnectParams, TaskOutcome, WakeHandler,
};
use pubsub_relay::{Command, Event, EventKind, Relay, RelayConfig};
use tokio::sync::{broadcast, oneshot};

/// Keeps the liveness timer out of the way for tests that do not probe.
fn quiet_config() -> RelayConfig {
    RelayConfig {
        subscribe_grace_ms: 3_600_000,
        ..RelayConfig::default()
    }
}

fn relay(broker: &MemoryBroker) -> Relay {
    Relay::new(quiet_config(), Arc::new(broker.clone()), None)
}

async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("event within timeout")
        .expect("emitter open")
}

/// Reads events until one matches `pred`, returning it.
async fn wait_for(rx: &mut broadcast::Receiver<Event>, pred: impl Fn(&Event) -> bool) -> Event {
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn connect_and_wait(relay: &Relay, rx: &mut broadcast::Receiver<Event>, channel: &str) {
    let outcome = relay
        .manager()
        .connect(ConnectParams::new(channel, "local", 1883))
        .await;
    assert_eq!(outcome, ConnectOutcome::Subscribing);
    wait_for(rx, |e| e.kind == EventKind::Subscribed && e.channel == channel).await;
    wait_for(rx, |e| e.payload.starts_with("successfully connected.")).await;
}

#[tokio::test(start_paused = true)]
async fn connect_scenario_emits_subscribed_then_success_then_arms_probe() {
    let broker = MemoryBroker::new();
    let relay = Relay::new(RelayConfig::default(), Arc::new(broker.clone()), None);
    let mut events = relay.events();

    let outcome = relay
        .manager()
        .connect(ConnectParams::new("room1", "10.0.0.5", 6379))
        .await;
    assert_eq!(outcome, ConnectOutcome::Subscribing);

    let first = next_event(&mut events).await;
    assert_eq!(first.kind, EventKind::Subscribed);
    assert_eq!(first.payload, "room1 subscribed");

    let second = next_event(&mut events).await;
    assert_eq!(second.kind, EventKind::Message);
    assert_eq!(second.channel, "room1");
    assert_eq!(second.payload, "successfully connected. room1 - 10.0.0.5:6379");

    assert!(!relay.manager().liveness_armed().await);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(relay.manager().liveness_armed().await);
}

#[tokio::test]
async fn repeated_connect_to_same_channel_reports_already_connected() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    for _ in 0..3 {
        let outcome = relay
            .manager()
            .connect(ConnectParams::new("room1", "local", 1883))
            .await;
        assert_eq!(outcome, ConnectOutcome::AlreadyConnected);
    }

    for _ in 0..3 {
        let event = wait_for(&mut events, |e| e.kind == EventKind::Message).await;
        assert_eq!(event.payload, "already connected. room1 - local:1883");
    }
    assert_eq!(relay.manager().record_count().await, 1);
    assert_eq!(broker.clients_created(), 1);
}

#[tokio::test]
async fn switching_channel_tears_down_the_old_one() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room-a").await;

    let outcome = relay
        .manager()
        .connect(ConnectParams::new("room-b", "local", 1883))
        .await;
    assert_eq!(outcome, ConnectOutcome::Subscribing);
    wait_for(&mut events, |e| {
        e.kind == EventKind::Subscribed && e.channel == "room-b"
    })
    .await;

    assert_eq!(broker.subscriber_count("room-a").await, 0);
    assert_eq!(broker.subscriber_count("room-b").await, 1);
    assert_eq!(broker.clients_live(), 1);
    assert_eq!(relay.manager().record_count().await, 1);
    assert_eq!(
        relay.manager().current_record().await.unwrap().channel(),
        "room-b"
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_clears_everything() {
    let broker = MemoryBroker::new();
    let relay = Relay::new(RelayConfig::default(), Arc::new(broker.clone()), None);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(relay.manager().liveness_armed().await);

    let outcome = relay.submit(Command::Disconnect).wait().await;
    assert_eq!(outcome, TaskOutcome::Completed(CommandOutcome::Disconnect(None)));

    let event = wait_for(&mut events, |e| e.kind == EventKind::Unsubscribed).await;
    assert_eq!(event.payload, "room1 unsubscribed");
    assert_eq!(relay.manager().record_count().await, 0);
    assert!(!relay.manager().is_connecting());
    assert!(!relay.manager().liveness_armed().await);
    assert_eq!(broker.clients_live(), 0);

    // Disconnecting again from the idle state is harmless
    relay.manager().disconnect(false).await;
    assert_eq!(relay.manager().record_count().await, 0);
}

#[tokio::test]
async fn published_message_loops_back_to_host() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    let outcome = relay
        .submit(Command::Send {
            channel: "room1".into(),
            payload: "hello there".into(),
        })
        .wait()
        .await;
    assert_eq!(outcome, TaskOutcome::Completed(CommandOutcome::Send));

    let event = wait_for(&mut events, |e| e.kind == EventKind::Message).await;
    assert_eq!(event.channel, "room1");
    assert_eq!(event.payload, "hello there");
    assert_eq!(event.to_host().command, "REDIS");
}

#[tokio::test]
async fn unreachable_broker_reports_fail_to_connect() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let relay = relay(&broker);
    let mut events = relay.events();

    let outcome = relay
        .manager()
        .connect(ConnectParams::new("room1", "10.0.0.99", 6379))
        .await;
    assert_eq!(outcome, ConnectOutcome::Failed);

    let event = next_event(&mut events).await;
    assert_eq!(event.kind, EventKind::StatusText);
    assert_eq!(event.payload, "fail to connect");
    assert_eq!(relay.manager().record_count().await, 0);
    assert!(!relay.manager().is_connecting());
    assert_eq!(broker.clients_live(), 0);

    // The host may retry once the broker is back
    broker.set_reachable(true);
    let outcome = relay
        .manager()
        .connect(ConnectParams::new("room1", "10.0.0.99", 6379))
        .await;
    assert_eq!(outcome, ConnectOutcome::Subscribing);
}

#[tokio::test(start_paused = true)]
async fn rapid_connects_only_execute_the_last() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    let mut events = relay.events();

    let first = relay.submit(Command::Connect {
        channel: "room1".into(),
        host: "local".into(),
        port: 1883,
    });
    let second = relay.submit(Command::Connect {
        channel: "room1".into(),
        host: "local".into(),
        port: 1883,
    });

    assert_eq!(first.wait().await, TaskOutcome::Cancelled);
    assert_eq!(
        second.wait().await,
        TaskOutcome::Completed(CommandOutcome::Connect(ConnectOutcome::Subscribing))
    );
    wait_for(&mut events, |e| e.kind == EventKind::Subscribed).await;
    assert_eq!(broker.clients_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_published_to_own_channel_periodically() {
    let broker = MemoryBroker::new();
    let config = RelayConfig {
        check_interval_ms: 60_000,
        ..RelayConfig::default()
    };
    let relay = Relay::new(config, Arc::new(broker.clone()), None);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    let heartbeat = wait_for(&mut events, |e| e.payload.starts_with("check redis connection ")).await;
    assert_eq!(heartbeat.channel, "room1");
    let stamp = heartbeat
        .payload
        .trim_start_matches("check redis connection ");
    assert!(NaiveDateTime::parse_from_str(stamp, HEARTBEAT_TIME_FORMAT).is_ok());

    wait_for(&mut events, |e| e.payload.starts_with("check redis connection ")).await;
    let heartbeats = broker
        .published()
        .await
        .into_iter()
        .filter(|(_, payload)| payload.starts_with("check redis connection "))
        .count();
    assert_eq!(heartbeats, 2);
}

#[tokio::test]
async fn probe_timeout_reports_fail_to_reconnect_and_keeps_record() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    broker.set_publish_fault(Some(PublishFault::Timeout)).await;
    let outcome = relay.submit(Command::ConnectionCheck).wait().await;
    assert_eq!(
        outcome,
        TaskOutcome::Completed(CommandOutcome::ConnectionCheck(vec![
            ProbeOutcome::TimedOut {
                channel: "room1".into()
            }
        ]))
    );

    let event = wait_for(&mut events, |e| e.kind == EventKind::StatusText).await;
    assert_eq!(event.payload, "fail to reconnect");
    assert_eq!(relay.manager().record_count().await, 1);
    assert!(relay.manager().is_connecting());
}

#[tokio::test]
async fn probe_refusal_is_only_logged() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    broker.set_publish_fault(Some(PublishFault::Refused)).await;
    let outcomes = relay.manager().check_connection().await;
    assert_eq!(
        outcomes,
        vec![ProbeOutcome::Refused {
            channel: "room1".into()
        }]
    );
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(relay.manager().record_count().await, 1);
}

#[derive(Default)]
struct RecordingWake {
    woken: Mutex<Vec<String>>,
}

impl WakeHandler for RecordingWake {
    fn wake(&self, _channel: &str, payload: &str) {
        if let Ok(mut woken) = self.woken.lock() {
            woken.push(payload.to_string());
        }
    }
}

#[tokio::test]
async fn wake_marker_in_message_wakes_host() {
    let broker = MemoryBroker::new();
    let wake = Arc::new(RecordingWake::default());
    let relay = Relay::new(
        quiet_config(),
        Arc::new(broker.clone()),
        Some(wake.clone()),
    );
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    relay.manager().send("room1", "ShowMain: incoming call").await;
    let event = wait_for(&mut events, |e| e.kind == EventKind::Message).await;
    assert_eq!(event.payload, "ShowMain: incoming call");
    assert_eq!(
        wake.woken.lock().unwrap().as_slice(),
        ["ShowMain: incoming call".to_string()]
    );
}

#[tokio::test]
async fn send_without_connection_is_dropped() {
    let broker = MemoryBroker::new();
    let relay = relay(&broker);

    let outcome = relay
        .submit(Command::Send {
            channel: "room1".into(),
            payload: "nobody listens".into(),
        })
        .wait()
        .await;
    assert_eq!(outcome, TaskOutcome::Completed(CommandOutcome::Send));
    assert!(broker.published().await.is_empty());
}

/// Call of a client that [`GatedBroker`] holds until released.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// After the subscriber session is open, before it is handed out
    Subscriber,
    /// Before the client is shut down
    Shutdown,
}

/// Memory broker whose first gated call waits for the release signal.
struct GatedBroker {
    inner: MemoryBroker,
    gate: Gate,
    release: Arc<tokio::sync::Mutex<Option<oneshot::Receiver<()>>>>,
}

impl GatedBroker {
    fn new(inner: &MemoryBroker, gate: Gate) -> (Self, oneshot::Sender<()>) {
        let (release_tx, release_rx) = oneshot::channel();
        let broker = Self {
            inner: inner.clone(),
            gate,
            release: Arc::new(tokio::sync::Mutex::new(Some(release_rx))),
        };
        (broker, release_tx)
    }
}

impl BrokerConnector for GatedBroker {
    fn client(
        &self,
        endpoint: &Endpoint,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        Ok(Arc::new(GatedClient {
            inner: self.inner.client(endpoint, settings)?,
            gate: self.gate,
            release: self.release.clone(),
        }))
    }
}

struct GatedClient {
    inner: Arc<dyn BrokerClient>,
    gate: Gate,
    release: Arc<tokio::sync::Mutex<Option<oneshot::Receiver<()>>>>,
}

impl GatedClient {
    async fn hold(&self, at: Gate) {
        if self.gate != at {
            return;
        }
        let release = self.release.lock().await.take();
        if let Some(release) = release {
            let _ = release.await;
        }
    }
}

#[async_trait]
impl BrokerClient for GatedClient {
    async fn connect(&self) -> Result<Arc<dyn PublishSession>, BrokerError> {
        self.inner.connect().await
    }

    async fn connect_subscriber(&self) -> Result<Subscriber, BrokerError> {
        let subscriber = self.inner.connect_subscriber().await?;
        self.hold(Gate::Subscriber).await;
        Ok(subscriber)
    }

    async fn shutdown(&self) {
        self.hold(Gate::Shutdown).await;
        self.inner.shutdown().await;
    }
}

#[tokio::test]
async fn subscribe_finishing_after_disconnect_leaves_new_record_alone() {
    let broker = MemoryBroker::new();
    let (gated, release) = GatedBroker::new(&broker, Gate::Subscriber);
    let relay = Relay::new(quiet_config(), Arc::new(gated), None);
    let mut events = relay.events();

    let manager = relay.manager().clone();
    let stale = tokio::spawn(async move {
        manager
            .connect(ConnectParams::new("room1", "local", 1883))
            .await
    });
    while relay.manager().current_record().await.is_none() {
        tokio::task::yield_now().await;
    }

    assert_eq!(relay.manager().disconnect(false).await, None);
    connect_and_wait(&relay, &mut events, "room2").await;
    let current = relay.manager().current_record().await.unwrap();

    release.send(()).unwrap();
    assert_eq!(stale.await.unwrap(), ConnectOutcome::Superseded);

    let after = relay.manager().current_record().await.unwrap();
    assert_eq!(after.id(), current.id());
    assert_eq!(after.channel(), "room2");
    assert!(after.is_connected());
    assert!(relay.manager().is_connecting());
    assert_eq!(relay.manager().record_count().await, 1);
    assert_eq!(broker.clients_live(), 1);
    assert_eq!(broker.subscriber_count("room1").await, 0);
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn channel_switch_gives_up_when_another_channel_reappears() {
    let broker = MemoryBroker::new();
    let (gated, release) = GatedBroker::new(&broker, Gate::Shutdown);
    let relay = Relay::new(quiet_config(), Arc::new(gated), None);
    let mut events = relay.events();
    connect_and_wait(&relay, &mut events, "room1").await;

    // The switch to room2 stalls while the room1 client shuts down
    let manager = relay.manager().clone();
    let switch = tokio::spawn(async move {
        manager
            .connect(ConnectParams::new("room2", "local", 1883))
            .await
    });
    while relay.manager().current_record().await.is_some() {
        tokio::task::yield_now().await;
    }

    relay.manager().disconnect(false).await;
    connect_and_wait(&relay, &mut events, "room3").await;

    release.send(()).unwrap();
    assert_eq!(switch.await.unwrap(), ConnectOutcome::RetryExhausted);

    let current = relay.manager().current_record().await.unwrap();
    assert_eq!(current.channel(), "room3");
    assert!(current.is_connected());
    assert_eq!(broker.subscriber_count("room2").await, 0);
    assert_eq!(broker.subscriber_count("room3").await, 1);
}
