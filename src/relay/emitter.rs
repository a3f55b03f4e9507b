use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Value of the `command` field on every event delivered to the host.
pub const EVENT_COMMAND: &str = "REDIS";

/// Channel name used for status events that belong to no channel.
pub const STATUS_CHANNEL: &str = "unknown";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Subscribed,
    Unsubscribed,
    Message,
    StatusText,
}

/// State or message notification for the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub channel: String,
    pub payload: String,
    pub timestamp: DateTime<Local>,
}

impl Event {
    fn new(kind: EventKind, channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind,
            channel: channel.into(),
            payload: payload.into(),
            timestamp: Local::now(),
        }
    }

    pub fn subscribed(channel: &str) -> Self {
        Self::new(EventKind::Subscribed, channel, format!("{} subscribed", channel))
    }

    pub fn unsubscribed(channel: &str) -> Self {
        Self::new(
            EventKind::Unsubscribed,
            channel,
            format!("{} unsubscribed", channel),
        )
    }

    pub fn message(channel: &str, payload: &str) -> Self {
        Self::new(EventKind::Message, channel, payload)
    }

    pub fn status(text: impl Into<String>) -> Self {
        Self::new(EventKind::StatusText, STATUS_CHANNEL, text)
    }

    /// Projection onto the host event schema.
    pub fn to_host(&self) -> HostEvent {
        HostEvent {
            command: EVENT_COMMAND.to_string(),
            channel: self.channel.clone(),
            data: self.payload.clone(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {:?} {} - {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.kind,
            self.channel,
            self.payload
        )
    }
}

/// Event as the host receives it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HostEvent {
    pub command: String,
    pub channel: String,
    pub data: String,
}

/// Host side effect that brings the presentation layer to the foreground.
pub trait WakeHandler: Send + Sync {
    fn wake(&self, channel: &str, payload: &str);
}

/// One-way delivery of relay events to the host.
///
/// Events sent while no receiver is subscribed are dropped.
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<Event>,
    wake: Option<Arc<dyn WakeHandler>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, wake: None }
    }

    pub fn with_wake_handler(mut self, handler: Arc<dyn WakeHandler>) -> Self {
        self.wake = Some(handler);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        debug!("REDIS : {} - {}", event.channel, event.payload);
        if self.sender.send(event).is_err() {
            debug!("No host listener registered, event dropped");
        }
    }

    /// Emits an inbound message, first waking the host if the payload
    /// carries `marker`.
    pub fn emit_message(&self, channel: &str, payload: &str, marker: &str) {
        if !marker.is_empty() && payload.contains(marker) {
            match &self.wake {
                Some(handler) => {
                    debug!("Wake marker received on {}: {}", channel, payload);
                    handler.wake(channel, payload);
                }
                None => debug!("Wake marker received but no wake handler registered"),
            }
        }
        self.emit(Event::message(channel, payload));
    }
}
