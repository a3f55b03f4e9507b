//! In-process loopback broker.
//!
//! Implements the broker capability without any network: a publish is
//! delivered to every subscriber session of the same [`MemoryBroker`] that
//! subscribed to the channel. Reachability and publish failures can be
//! switched at runtime, which makes the broker suitable for exercising the
//! relay's failure paths.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    BrokerClient, BrokerConnector, BrokerError, BrokerEvent, ClientSettings, Endpoint,
    PublishSession, SubscribeSession, Subscriber,
};

const EVENT_CAPACITY: usize = 64;

/// Failure injected into every publish while set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishFault {
    Refused,
    Timeout,
}

struct SubscriberEntry {
    client_id: usize,
    session_id: usize,
    channels: BTreeSet<String>,
    events: mpsc::Sender<BrokerEvent>,
}

#[derive(Default)]
struct BrokerState {
    subscribers: Vec<SubscriberEntry>,
    published: Vec<(String, String)>,
    publish_fault: Option<PublishFault>,
}

struct Shared {
    reachable: AtomicBool,
    clients_created: AtomicUsize,
    clients_live: AtomicUsize,
    sessions_created: AtomicUsize,
    state: Mutex<BrokerState>,
}

/// Handle to one in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                reachable: AtomicBool::new(true),
                clients_created: AtomicUsize::new(0),
                clients_live: AtomicUsize::new(0),
                sessions_created: AtomicUsize::new(0),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    /// Makes new sessions fail with `ConnectionRefused` while false.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub async fn set_publish_fault(&self, fault: Option<PublishFault>) {
        self.shared.state.lock().await.publish_fault = fault;
    }

    /// Every successfully published `(channel, payload)` pair, oldest first.
    pub async fn published(&self) -> Vec<(String, String)> {
        self.shared.state.lock().await.published.clone()
    }

    /// Number of distinct subscriber sessions currently holding `channel`.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .subscribers
            .iter()
            .filter(|entry| entry.channels.contains(channel))
            .count()
    }

    pub fn clients_created(&self) -> usize {
        self.shared.clients_created.load(Ordering::SeqCst)
    }

    /// Clients created and not yet shut down.
    pub fn clients_live(&self) -> usize {
        self.shared.clients_live.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self, endpoint: &Endpoint) -> Result<(), BrokerError> {
        if self.shared.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionRefused(format!(
                "{} is unreachable",
                endpoint
            )))
        }
    }
}

impl BrokerConnector for MemoryBroker {
    fn client(
        &self,
        endpoint: &Endpoint,
        _settings: &ClientSettings,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        if endpoint.host.trim().is_empty() {
            return Err(BrokerError::InvalidEndpoint(endpoint.to_string()));
        }
        let id = self.shared.clients_created.fetch_add(1, Ordering::SeqCst);
        self.shared.clients_live.fetch_add(1, Ordering::SeqCst);
        debug!("Memory broker client {} created for {}", id, endpoint);
        Ok(Arc::new(MemoryClient {
            broker: self.clone(),
            id,
            endpoint: endpoint.clone(),
            shut_down: AtomicBool::new(false),
        }))
    }
}

struct MemoryClient {
    broker: MemoryBroker,
    id: usize,
    endpoint: Endpoint,
    shut_down: AtomicBool,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(format!("client {} shut down", self.id)));
        }
        self.broker.ensure_reachable(&self.endpoint)
    }
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn connect(&self) -> Result<Arc<dyn PublishSession>, BrokerError> {
        self.ensure_open()?;
        Ok(Arc::new(MemoryPublisher {
            broker: self.broker.clone(),
        }))
    }

    async fn connect_subscriber(&self) -> Result<Subscriber, BrokerError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let session_id = self
            .broker
            .shared
            .sessions_created
            .fetch_add(1, Ordering::SeqCst);

        // The broker holds the only sender, so the stream ends on shutdown
        self.broker
            .shared
            .state
            .lock()
            .await
            .subscribers
            .push(SubscriberEntry {
                client_id: self.id,
                session_id,
                channels: BTreeSet::new(),
                events: tx,
            });
        debug!("Memory subscriber session {} opened", session_id);

        Ok(Subscriber {
            session: Arc::new(MemorySubscribeSession {
                broker: self.broker.clone(),
                session_id,
            }),
            events: rx,
        })
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.shared.clients_live.fetch_sub(1, Ordering::SeqCst);
        self.broker
            .shared
            .state
            .lock()
            .await
            .subscribers
            .retain(|entry| entry.client_id != self.id);
        debug!("Memory broker client {} shut down", self.id);
    }
}

struct MemorySubscribeSession {
    broker: MemoryBroker,
    session_id: usize,
}

impl MemorySubscribeSession {
    /// Applies `change` to this session's channel set. Returns the resulting
    /// channel count and the session's event sender, or `None` once the
    /// owning client is shut down.
    async fn update_channels(
        &self,
        change: impl FnOnce(&mut BTreeSet<String>),
    ) -> Option<(usize, mpsc::Sender<BrokerEvent>)> {
        let mut state = self.broker.shared.state.lock().await;
        let entry = state
            .subscribers
            .iter_mut()
            .find(|entry| entry.session_id == self.session_id)?;
        change(&mut entry.channels);
        Some((entry.channels.len(), entry.events.clone()))
    }
}

#[async_trait]
impl SubscribeSession for MemorySubscribeSession {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let (count, events) = self
            .update_channels(|channels| {
                channels.insert(channel.to_string());
            })
            .await
            .ok_or_else(|| BrokerError::Closed("subscriber session closed".into()))?;

        let _ = events
            .send(BrokerEvent::Subscribed {
                channel: channel.to_string(),
                count,
            })
            .await;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError> {
        let (count, events) = self
            .update_channels(|channels| {
                channels.remove(channel);
            })
            .await
            .ok_or_else(|| BrokerError::Closed("subscriber session closed".into()))?;

        let _ = events
            .send(BrokerEvent::Unsubscribed {
                channel: channel.to_string(),
                count,
            })
            .await;
        Ok(())
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
}

#[async_trait]
impl PublishSession for MemoryPublisher {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let targets = {
            let mut state = self.broker.shared.state.lock().await;
            match state.publish_fault {
                Some(PublishFault::Refused) => {
                    return Err(BrokerError::ConnectionRefused(format!(
                        "publish to {} refused",
                        channel
                    )))
                }
                Some(PublishFault::Timeout) => {
                    return Err(BrokerError::Timeout(format!(
                        "publish to {} timed out",
                        channel
                    )))
                }
                None => {}
            }
            state
                .published
                .push((channel.to_string(), payload.to_string()));
            state
                .subscribers
                .iter()
                .filter(|entry| entry.channels.contains(channel))
                .map(|entry| entry.events.clone())
                .collect::<Vec<_>>()
        };

        // Never waits; the publishing task may be the listener of this queue
        for target in targets {
            let delivery = BrokerEvent::Message {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            if let Err(e) = target.try_send(delivery) {
                debug!("Dropped delivery on {}: {}", channel, e);
            }
        }
        Ok(())
    }
}
