//! MQTT adapter for the broker capability, built on `rumqttc`.
//!
//! Every session (one subscriber, any number of publishers) owns its own
//! `AsyncClient`/`EventLoop` pair. The event loop is driven by a background
//! task which keeps polling after transport errors, waiting the configured
//! constant reconnect delay between attempts. Channels map one-to-one onto
//! MQTT topics and everything is sent at-most-once.

use std::collections::{BTreeSet, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BrokerClient, BrokerConnector, BrokerError, BrokerEvent, ClientSettings, Endpoint,
    PublishSession, SubscribeSession, Subscriber,
};

/// Creates [`MqttBrokerClient`]s.
#[derive(Clone, Debug, Default)]
pub struct MqttConnector;

impl BrokerConnector for MqttConnector {
    fn client(
        &self,
        endpoint: &Endpoint,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        if endpoint.host.trim().is_empty() {
            return Err(BrokerError::InvalidEndpoint(endpoint.to_string()));
        }
        if endpoint.port == 0 {
            return Err(BrokerError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Arc::new(MqttBrokerClient::new(
            endpoint.clone(),
            settings.clone(),
        )))
    }
}

pub struct MqttBrokerClient {
    endpoint: Endpoint,
    settings: ClientSettings,
    shutdown: CancellationToken,
    sessions: Mutex<Vec<AsyncClient>>,
    next_session: AtomicUsize,
}

impl MqttBrokerClient {
    pub fn new(endpoint: Endpoint, settings: ClientSettings) -> Self {
        Self {
            endpoint,
            settings,
            shutdown: CancellationToken::new(),
            sessions: Mutex::new(Vec::new()),
            next_session: AtomicUsize::new(0),
        }
    }

    fn options(&self, role: &str) -> MqttOptions {
        let n = self.next_session.fetch_add(1, Ordering::Relaxed);
        let id = format!(
            "{}-{}-{}-{}",
            self.settings.client_id,
            std::process::id(),
            role,
            n
        );
        let mut options = MqttOptions::new(id, self.endpoint.host.clone(), self.endpoint.port);
        options
            .set_keep_alive(self.settings.keep_alive)
            .set_clean_session(true);
        options
    }

    /// Opens a session and waits for the broker's ConnAck.
    async fn open_session(&self, role: &str) -> Result<(AsyncClient, EventLoop), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Closed(format!("client for {} shut down", self.endpoint)));
        }

        let (client, mut eventloop) =
            AsyncClient::new(self.options(role), self.settings.request_capacity);

        debug!("Opening {} session to {}", role, self.endpoint);
        loop {
            let polled = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    return Err(BrokerError::Closed(format!("client for {} shut down", self.endpoint)));
                }
                polled = eventloop.poll() => polled,
            };
            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("{} session to {} established: {:?}", role, self.endpoint, ack.code);
                    break;
                }
                Ok(other) => debug!("Ignoring {:?} before ConnAck", other),
                Err(e) => {
                    warn!("{} session to {} failed: {}", role, self.endpoint, e);
                    return Err(BrokerError::ConnectionRefused(e.to_string()));
                }
            }
        }

        self.sessions.lock().await.push(client.clone());
        Ok((client, eventloop))
    }
}

#[async_trait]
impl BrokerClient for MqttBrokerClient {
    async fn connect(&self) -> Result<Arc<dyn PublishSession>, BrokerError> {
        let (client, eventloop) = self.open_session("pub").await?;
        let (signals, _) = broadcast::channel(16);

        tokio::spawn(drive_publisher(
            eventloop,
            signals.clone(),
            self.settings.clone(),
            self.shutdown.child_token(),
        ));

        Ok(Arc::new(MqttPublishSession {
            client,
            signals,
            in_flight: Mutex::new(()),
            command_timeout: self.settings.command_timeout,
        }))
    }

    async fn connect_subscriber(&self) -> Result<Subscriber, BrokerError> {
        let (client, eventloop) = self.open_session("sub").await?;
        let (events_tx, events_rx) = mpsc::channel(self.settings.request_capacity);
        let state = Arc::new(Mutex::new(SubscriptionState::default()));

        tokio::spawn(drive_subscriber(
            eventloop,
            client.clone(),
            state.clone(),
            events_tx,
            self.settings.clone(),
            self.shutdown.child_token(),
        ));

        Ok(Subscriber {
            session: Arc::new(MqttSubscribeSession {
                client,
                state,
                command_timeout: self.settings.command_timeout,
            }),
            events: events_rx,
        })
    }

    async fn shutdown(&self) {
        let sessions: Vec<AsyncClient> = self.sessions.lock().await.drain(..).collect();
        for client in &sessions {
            if let Err(e) = client.try_disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        self.shutdown.cancel();
        info!("Shut down broker client for {} ({} sessions)", self.endpoint, sessions.len());
    }
}

/// Subscribe/unsubscribe requests waiting for their acknowledgement, and the
/// channels acknowledged so far.
#[derive(Default, Debug)]
struct SubscriptionState {
    pending_subscribe: VecDeque<String>,
    pending_unsubscribe: VecDeque<(String, oneshot::Sender<()>)>,
    active: BTreeSet<String>,
}

struct MqttSubscribeSession {
    client: AsyncClient,
    state: Arc<Mutex<SubscriptionState>>,
    command_timeout: Duration,
}

impl MqttSubscribeSession {
    async fn forget_unsubscribe(&self, channel: &str) {
        let mut state = self.state.lock().await;
        if let Some(pos) = state
            .pending_unsubscribe
            .iter()
            .rposition(|(pending, _)| pending == channel)
        {
            state.pending_unsubscribe.remove(pos);
        }
    }
}

#[async_trait]
impl SubscribeSession for MqttSubscribeSession {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        self.state
            .lock()
            .await
            .pending_subscribe
            .push_back(channel.to_string());

        if let Err(e) = self.client.subscribe(channel, QoS::AtMostOnce).await {
            self.state.lock().await.pending_subscribe.pop_back();
            return Err(BrokerError::Closed(e.to_string()));
        }
        Ok(())
    }

    /// Returns once the UnsubAck has been forwarded to the event stream, so
    /// the `Unsubscribed` event survives an immediate shutdown.
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let (acked_tx, acked_rx) = oneshot::channel();
        self.state
            .lock()
            .await
            .pending_unsubscribe
            .push_back((channel.to_string(), acked_tx));

        let request = async {
            self.client
                .unsubscribe(channel)
                .await
                .map_err(|e| BrokerError::Closed(e.to_string()))?;
            acked_rx
                .await
                .map_err(|_| BrokerError::Closed("subscriber driver stopped".into()))
        };

        match timeout(self.command_timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.forget_unsubscribe(channel).await;
                Err(e)
            }
            Err(_) => {
                self.forget_unsubscribe(channel).await;
                Err(BrokerError::Timeout(format!(
                    "unsubscribe from {} not acknowledged within {:?}",
                    channel, self.command_timeout
                )))
            }
        }
    }
}

struct MqttPublishSession {
    client: AsyncClient,
    signals: broadcast::Sender<Result<(), BrokerError>>,
    /// One publish in flight per session; a confirmation belongs to its holder
    in_flight: Mutex<()>,
    command_timeout: Duration,
}

#[async_trait]
impl PublishSession for MqttPublishSession {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let attempt = async {
            let _in_flight = self.in_flight.lock().await;
            // Subscribe before queueing so the confirmation cannot be missed
            let mut signals = self.signals.subscribe();

            self.client
                .publish(channel, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
                .await
                .map_err(|e| BrokerError::Closed(e.to_string()))?;

            loop {
                match signals.recv().await {
                    Ok(result) => return result,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(BrokerError::Closed("publisher driver stopped".into()))
                    }
                }
            }
        };

        match timeout(self.command_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(format!(
                "publish to {} not confirmed within {:?}",
                channel, self.command_timeout
            ))),
        }
    }
}

fn classify(error: &ConnectionError) -> BrokerError {
    match error {
        ConnectionError::Io(io) if io.kind() == ErrorKind::ConnectionRefused => {
            BrokerError::ConnectionRefused(error.to_string())
        }
        ConnectionError::ConnectionRefused(code) => {
            BrokerError::ConnectionRefused(format!("{:?}", code))
        }
        _ => BrokerError::Timeout(error.to_string()),
    }
}

/// Waits out the reconnect delay. Returns false if cancelled meanwhile.
async fn backoff(settings: &ClientSettings, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(settings.reconnect_delay) => true,
    }
}

async fn drive_publisher(
    mut eventloop: EventLoop,
    signals: broadcast::Sender<Result<(), BrokerError>>,
    settings: ClientSettings,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                // No receiver simply means nobody is waiting on a publish
                let _ = signals.send(Ok(()));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Publisher connection error: {}", e);
                let _ = signals.send(Err(classify(&e)));
                if !backoff(&settings, &cancel).await {
                    break;
                }
            }
        }
    }
    debug!("Publisher driver stopped");
}

async fn drive_subscriber(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<Mutex<SubscriptionState>>,
    events: mpsc::Sender<BrokerEvent>,
    settings: ClientSettings,
    cancel: CancellationToken,
) {
    let mut reconnecting = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let mut acked = None;
        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) if reconnecting => {
                reconnecting = false;
                resubscribe(&client, &state).await;
                None
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                let mut state = state.lock().await;
                state.pending_subscribe.pop_front().map(|channel| {
                    state.active.insert(channel.clone());
                    BrokerEvent::Subscribed {
                        channel,
                        count: state.active.len(),
                    }
                })
            }
            Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                let mut state = state.lock().await;
                state.pending_unsubscribe.pop_front().map(|(channel, ack)| {
                    acked = Some(ack);
                    state.active.remove(&channel);
                    BrokerEvent::Unsubscribed {
                        channel,
                        count: state.active.len(),
                    }
                })
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(BrokerEvent::Message {
                channel: publish.topic.clone(),
                payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            }),
            Ok(_) => None,
            Err(e) => {
                warn!(
                    "Subscriber connection error, retrying in {:?}: {}",
                    settings.reconnect_delay, e
                );
                reconnecting = true;
                if !backoff(&settings, &cancel).await {
                    break;
                }
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                debug!("Subscriber event listener dropped");
            }
        }
        if let Some(ack) = acked {
            // The unsubscriber may have given up already
            let _ = ack.send(());
        }
    }
    debug!("Subscriber driver stopped");
}

/// Re-requests every acknowledged channel after the broker session was lost.
async fn resubscribe(client: &AsyncClient, state: &Arc<Mutex<SubscriptionState>>) {
    let mut state = state.lock().await;
    let channels: Vec<String> = std::mem::take(&mut state.active).into_iter().collect();
    for channel in channels {
        info!("Resubscribing to {} after reconnect", channel);
        match client.try_subscribe(channel.as_str(), QoS::AtMostOnce) {
            Ok(()) => state.pending_subscribe.push_back(channel),
            Err(e) => warn!("Failed to resubscribe to {}: {}", channel, e),
        }
    }
}
