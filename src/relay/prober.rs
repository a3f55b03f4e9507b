//! Liveness Prober
//!
//! A silently dead broker connection is only noticed when something is sent
//! over it. While a subscription is active the prober periodically publishes
//! a heartbeat to the subscribed channel itself; the heartbeat comes back as
//! an ordinary message when the connection is healthy.

use chrono::{DateTime, Local};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::emitter::Event;
use super::manager::ConnectionManager;
use crate::broker::BrokerError;

pub const FAIL_TO_RECONNECT: &str = "fail to reconnect";

/// Timestamp layout of the heartbeat payload.
pub const HEARTBEAT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const HEARTBEAT_PREFIX: &str = "check redis connection ";

pub fn heartbeat_payload(now: DateTime<Local>) -> String {
    format!("{}{}", HEARTBEAT_PREFIX, now.format(HEARTBEAT_TIME_FORMAT))
}

/// Result of probing one connection record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    Delivered { channel: String },
    /// Connection gone; assumed to be torn down elsewhere
    Refused { channel: String },
    /// Connection was live and stopped answering
    TimedOut { channel: String },
}

struct Timer {
    cancel: CancellationToken,
    armed: Arc<AtomicBool>,
}

/// Owner of the single repeating liveness timer.
#[derive(Default)]
pub struct LivenessProber {
    timer: Mutex<Option<Timer>>,
}

impl LivenessProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any existing timer and arms a new one after `delay`.
    ///
    /// The first heartbeat goes out as soon as the timer is armed, then every
    /// `check_interval`.
    pub async fn start_after(&self, manager: ConnectionManager, delay: Duration) {
        let period = manager.config().await.check_interval();
        let cancel = CancellationToken::new();
        let armed = Arc::new(AtomicBool::new(false));

        let previous = self.timer.lock().await.replace(Timer {
            cancel: cancel.clone(),
            armed: armed.clone(),
        });
        if let Some(previous) = previous {
            debug!("Replacing existing liveness timer");
            previous.cancel.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
            }

            info!("Liveness timer armed, period {:?}", period);
            armed.store(true, Ordering::SeqCst);

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        probe(&manager).await;
                    }
                }
            }
            debug!("Liveness timer stopped");
        });
    }

    pub async fn cancel(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.cancel.cancel();
            debug!("Liveness timer cancelled");
        }
    }

    pub async fn is_armed(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|timer| !timer.cancel.is_cancelled() && timer.armed.load(Ordering::SeqCst))
    }
}

/// Publishes one heartbeat per stored record to the record's own channel.
pub(crate) async fn probe(manager: &ConnectionManager) -> Vec<ProbeOutcome> {
    let Some(record) = manager.current_record().await else {
        debug!("No connection to probe");
        return Vec::new();
    };

    let channel = record.channel().to_string();
    let payload = heartbeat_payload(Local::now());
    let result = manager
        .shared
        .publisher
        .publish(Some(record.client()), &channel, &payload)
        .await;

    let outcome = match result {
        Ok(()) => {
            debug!("Heartbeat sent to {}", channel);
            ProbeOutcome::Delivered { channel }
        }
        Err(BrokerError::Timeout(reason)) => {
            // The record stays; recovery is up to the client's reconnect
            // backoff or an explicit disconnect/connect from the host
            warn!("Heartbeat to {} timed out: {}", channel, reason);
            manager.shared.emitter.emit(Event::status(FAIL_TO_RECONNECT));
            ProbeOutcome::TimedOut { channel }
        }
        Err(e) => {
            warn!("Heartbeat to {} failed: {}", channel, e);
            ProbeOutcome::Refused { channel }
        }
    };
    vec![outcome]
}
