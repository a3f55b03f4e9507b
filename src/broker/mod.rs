//! # Broker Client Capability
//!
//! The relay never speaks a broker wire protocol itself. Everything it needs
//! from a publish/subscribe broker is expressed by the traits in this module:
//!
//! ```text
//! BrokerConnector ──client()──► BrokerClient ──connect()────────────► PublishSession
//!                                            ──connect_subscriber()──► Subscriber
//!                                            ──shutdown()
//! ```
//!
//! Two adapters are provided:
//! - [`mqtt`] - network client built on `rumqttc`
//! - [`memory`] - in-process loopback broker for tests and offline hosts
//!
//! Inbound broker callbacks are not delivered through a listener object with
//! one method per callback. A subscriber session instead yields a stream of
//! [`BrokerEvent`] values which the relay matches on in a single place.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Address of a broker.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-client settings derived from the relay configuration.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    pub client_id: String,
    /// Constant delay between reconnect attempts after a transport failure
    pub reconnect_delay: Duration,
    pub command_timeout: Duration,
    pub keep_alive: Duration,
    pub request_capacity: usize,
}

/// Callback from a subscriber session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BrokerEvent {
    Subscribed { channel: String, count: usize },
    Unsubscribed { channel: String, count: usize },
    Message { channel: String, payload: String },
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached or refused the session
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// A previously usable session stopped answering
    #[error("Command timed out: {0}")]
    Timeout(String),

    /// The session was shut down locally
    #[error("Session closed: {0}")]
    Closed(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Outbound half of a broker session.
#[async_trait]
pub trait PublishSession: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;
}

/// Control half of a subscriber session.
///
/// Acknowledgements arrive asynchronously on the [`Subscriber::events`]
/// stream, not as return values of these calls.
#[async_trait]
pub trait SubscribeSession: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), BrokerError>;
}

/// An established subscriber session and the stream of its callbacks.
///
/// The stream ends once the owning client is shut down.
pub struct Subscriber {
    pub session: Arc<dyn SubscribeSession>,
    pub events: mpsc::Receiver<BrokerEvent>,
}

/// One broker client bound to one endpoint.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Opens an outbound session.
    async fn connect(&self) -> Result<Arc<dyn PublishSession>, BrokerError>;

    /// Opens a subscriber session.
    async fn connect_subscriber(&self) -> Result<Subscriber, BrokerError>;

    /// Closes every session opened through this client.
    async fn shutdown(&self);
}

/// Factory for broker clients. Construction performs no I/O.
pub trait BrokerConnector: Send + Sync {
    fn client(
        &self,
        endpoint: &Endpoint,
        settings: &ClientSettings,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}
