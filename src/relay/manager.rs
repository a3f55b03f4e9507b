//! Connection Manager
//!
//! Owns the single connection record and sequences connect, disconnect and
//! reconnect. All mutation of the record slot and the connecting flag goes
//! through this type; the subscription listener and the liveness prober only
//! read them.
//!
//! # Invariants
//!
//! - At most one [`ConnectionRecord`] exists. The slot is an `Option`, so a
//!   second record can only be stored by replacing (and shutting down) the
//!   first.
//! - The connecting flag is set from the moment a connect attempt claims it
//!   until the next teardown.
//!
//! # Ordering
//!
//! Commands run on independent tasks. Nothing orders a `send` relative to a
//! connect or disconnect, and the dispatcher's debounce only narrows the
//! window in which two lifecycle operations can interleave.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::emitter::{Event, EventEmitter};
use super::prober::{self, LivenessProber, ProbeOutcome};
use super::publisher::Publisher;
use super::subscription;
use crate::broker::{BrokerClient, BrokerConnector, Endpoint, SubscribeSession};
use crate::config::RelayConfig;

pub const FAIL_TO_CONNECT: &str = "fail to connect";

/// Teardown-then-retry attempts allowed when switching channels.
const CHANNEL_SWITCH_RETRIES: u8 = 1;

/// Target of a connect operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub channel: String,
    pub endpoint: Endpoint,
}

impl ConnectParams {
    pub fn new(channel: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            channel: channel.into(),
            endpoint: Endpoint::new(host, port),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Record stored and subscribe requested; acknowledgement follows as an event
    Subscribing,
    /// A connection was already in flight or established
    AlreadyConnected,
    /// Broker unreachable; everything was torn down
    Failed,
    /// A disconnect replaced this attempt's record before it finished
    Superseded,
    /// Another channel kept reappearing after teardown
    RetryExhausted,
}

/// In-process representation of one broker client and its subscription.
pub struct ConnectionRecord {
    id: u64,
    client: Arc<dyn BrokerClient>,
    channel: String,
    endpoint: Endpoint,
    subscription: Mutex<Option<Arc<dyn SubscribeSession>>>,
    connected: AtomicBool,
}

impl ConnectionRecord {
    fn new(id: u64, client: Arc<dyn BrokerClient>, params: ConnectParams) -> Self {
        Self {
            id,
            client,
            channel: params.channel,
            endpoint: params.endpoint,
            subscription: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn client(&self) -> &Arc<dyn BrokerClient> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) async fn set_subscription(&self, session: Arc<dyn SubscribeSession>) {
        *self.subscription.lock().await = Some(session);
    }

    async fn subscription(&self) -> Option<Arc<dyn SubscribeSession>> {
        self.subscription.lock().await.clone()
    }
}

pub(crate) struct Shared {
    config: RwLock<RelayConfig>,
    connector: Arc<dyn BrokerConnector>,
    slot: Mutex<Option<Arc<ConnectionRecord>>>,
    connecting: AtomicBool,
    last_params: Mutex<Option<ConnectParams>>,
    next_record: AtomicU64,
    pub(crate) publisher: Publisher,
    pub(crate) prober: LivenessProber,
    pub(crate) emitter: EventEmitter,
}

/// Cheaply cloneable handle; clones share the same connection state.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn BrokerConnector>,
        emitter: EventEmitter,
    ) -> Self {
        info!("Creating connection manager with config: {:?}", config);
        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                connector,
                slot: Mutex::new(None),
                connecting: AtomicBool::new(false),
                last_params: Mutex::new(None),
                next_record: AtomicU64::new(1),
                publisher: Publisher::new(),
                prober: LivenessProber::new(),
                emitter,
            }),
        }
    }

    pub async fn config(&self) -> RelayConfig {
        self.shared.config.read().await.clone()
    }

    /// Replaces the configuration. Running timers keep their period until
    /// they are re-armed.
    pub async fn set_config(&self, config: RelayConfig) {
        info!("Updating relay config: {:?}", config);
        *self.shared.config.write().await = config;
    }

    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.emitter.subscribe()
    }

    pub fn is_connecting(&self) -> bool {
        self.shared.connecting.load(Ordering::SeqCst)
    }

    pub async fn record_count(&self) -> usize {
        usize::from(self.shared.slot.lock().await.is_some())
    }

    pub async fn current_record(&self) -> Option<Arc<ConnectionRecord>> {
        self.shared.slot.lock().await.clone()
    }

    pub(crate) async fn is_current(&self, record_id: u64) -> bool {
        self.shared
            .slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|record| record.id == record_id)
    }

    pub async fn liveness_armed(&self) -> bool {
        self.shared.prober.is_armed().await
    }

    /// Parameters of the most recent connect request.
    pub async fn last_params(&self) -> Option<ConnectParams> {
        self.shared.last_params.lock().await.clone()
    }

    /// Connects to `params.channel` on `params.endpoint` and subscribes.
    pub async fn connect(&self, params: ConnectParams) -> ConnectOutcome {
        *self.shared.last_params.lock().await = Some(params.clone());
        self.connect_bounded(params, CHANNEL_SWITCH_RETRIES).await
    }

    async fn connect_bounded(&self, params: ConnectParams, mut retries: u8) -> ConnectOutcome {
        // A record for another channel is torn down before connecting
        loop {
            let other_channel = self
                .current_record()
                .await
                .filter(|record| record.channel != params.channel)
                .map(|record| record.channel.clone());

            let Some(other_channel) = other_channel else {
                break;
            };
            if retries == 0 {
                warn!(
                    "Channel {} still connected after teardown, giving up on {}",
                    other_channel, params.channel
                );
                return ConnectOutcome::RetryExhausted;
            }
            retries -= 1;
            info!(
                "Switching channel from {} to {}, tearing down first",
                other_channel, params.channel
            );
            self.teardown().await;
        }

        if self.shared.connecting.swap(true, Ordering::SeqCst) {
            info!("Already connected to {}", params.channel);
            let text = format!("already connected. {} - {}", params.channel, params.endpoint);
            self.send(&params.channel, &text).await;
            return ConnectOutcome::AlreadyConnected;
        }

        let settings = self.shared.config.read().await.client_settings();
        let client = match self.shared.connector.client(&params.endpoint, &settings) {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to create broker client for {}: {}", params.endpoint, e);
                self.fail_connect().await;
                return ConnectOutcome::Failed;
            }
        };

        let id = self.shared.next_record.fetch_add(1, Ordering::SeqCst);
        let record = Arc::new(ConnectionRecord::new(id, client, params));

        let displaced = {
            let mut slot = self.shared.slot.lock().await;
            debug!("Connection records before connect: {}", usize::from(slot.is_some()));
            slot.replace(record.clone())
        };
        if let Some(displaced) = displaced {
            warn!(
                "Displaced stale connection record for {} while connecting",
                displaced.channel
            );
            displaced.client.shutdown().await;
        }

        info!("Connecting to {} on {}", record.channel, record.endpoint);
        subscription::subscribe(self.clone(), record).await
    }

    /// Tears the connection down and optionally connects again with the last
    /// known parameters.
    pub async fn disconnect(&self, reconnect_after: bool) -> Option<ConnectOutcome> {
        info!("Disconnecting (reconnect: {})", reconnect_after);
        self.teardown().await;

        if !reconnect_after {
            return None;
        }
        match self.last_params().await {
            Some(params) => Some(self.connect_bounded(params, 0).await),
            None => {
                warn!("Reconnect requested but no connection was ever made");
                None
            }
        }
    }

    /// Publishes on `channel` through the shared publisher. Failures are
    /// logged, never returned.
    pub async fn send(&self, channel: &str, payload: &str) {
        let client = self.current_record().await.map(|record| record.client.clone());
        self.shared
            .publisher
            .send(client.as_ref(), channel, payload)
            .await;
    }

    /// Runs one liveness probe round immediately.
    pub async fn check_connection(&self) -> Vec<ProbeOutcome> {
        prober::probe(self).await
    }

    /// Full teardown followed by the `fail to connect` status event.
    pub(crate) async fn fail_connect(&self) {
        self.teardown().await;
        self.shared.emitter.emit(Event::status(FAIL_TO_CONNECT));
    }

    async fn teardown(&self) {
        self.shared.prober.cancel().await;
        self.shared.publisher.clear().await;

        let record = self.shared.slot.lock().await.take();
        if let Some(record) = record {
            if record.is_connected() {
                if let Some(session) = record.subscription().await {
                    if let Err(e) = session.unsubscribe(&record.channel).await {
                        warn!("Failed to unsubscribe from {}: {}", record.channel, e);
                    }
                }
            }
            record.client.shutdown().await;
            info!("Closed connection to {} on {}", record.channel, record.endpoint);
        }

        self.shared.connecting.store(false, Ordering::SeqCst);
    }
}
