//! Subscription Handler
//!
//! Opens the subscriber session for a freshly stored record, subscribes to the
//! record's channel and spawns the listener that turns broker callbacks into
//! relay events.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::emitter::Event;
use super::manager::{ConnectOutcome, ConnectionManager, ConnectionRecord};
use crate::broker::{BrokerEvent, Subscriber};

pub(crate) async fn subscribe(
    manager: ConnectionManager,
    record: Arc<ConnectionRecord>,
) -> ConnectOutcome {
    let Subscriber { session, events } = match record.client().connect_subscriber().await {
        Ok(subscriber) => subscriber,
        Err(e) => {
            warn!(
                "Failed to open subscriber session to {}: {}",
                record.endpoint(),
                e
            );
            return abort(&manager, &record).await;
        }
    };

    if !manager.is_current(record.id()).await {
        info!("Connection to {} was torn down while subscribing", record.channel());
        record.client().shutdown().await;
        return ConnectOutcome::Superseded;
    }

    record.set_subscription(session.clone()).await;
    tokio::spawn(listen(manager.clone(), record.clone(), events));

    if let Err(e) = session.subscribe(record.channel()).await {
        warn!("Failed to subscribe to {}: {}", record.channel(), e);
        return abort(&manager, &record).await;
    }

    debug!("Subscribe requested for {}", record.channel());
    ConnectOutcome::Subscribing
}

/// Failure path of a connect attempt. A record that is no longer stored is
/// only closed; the current connection belongs to someone else.
async fn abort(manager: &ConnectionManager, record: &Arc<ConnectionRecord>) -> ConnectOutcome {
    if manager.is_current(record.id()).await {
        manager.fail_connect().await;
        ConnectOutcome::Failed
    } else {
        record.client().shutdown().await;
        ConnectOutcome::Superseded
    }
}

async fn listen(
    manager: ConnectionManager,
    record: Arc<ConnectionRecord>,
    mut events: mpsc::Receiver<BrokerEvent>,
) {
    while let Some(event) = events.recv().await {
        handle(&manager, &record, event).await;
    }
    debug!("Listener for {} (record {}) finished", record.channel(), record.id());
}

async fn handle(manager: &ConnectionManager, record: &Arc<ConnectionRecord>, event: BrokerEvent) {
    match event {
        BrokerEvent::Subscribed { channel, count } => {
            // Acks for a record that was torn down must not arm anything
            if !manager.is_current(record.id()).await {
                debug!("Ignoring subscribe ack for stale record {}", record.id());
                return;
            }
            record.set_connected(true);
            info!("Subscribed to {} ({} active)", channel, count);
            manager.shared.emitter.emit(Event::subscribed(&channel));

            let text = format!("successfully connected. {} - {}", channel, record.endpoint());
            manager.send(&channel, &text).await;

            let grace = manager.config().await.subscribe_grace();
            manager
                .shared
                .prober
                .start_after(manager.clone(), grace)
                .await;
        }
        BrokerEvent::Unsubscribed { channel, count } => {
            record.set_connected(false);
            info!("Unsubscribed from {} ({} active)", channel, count);
            manager.shared.emitter.emit(Event::unsubscribed(&channel));
        }
        BrokerEvent::Message { channel, payload } => {
            let marker = manager.config().await.wake_marker;
            manager
                .shared
                .emitter
                .emit_message(&channel, &payload, &marker);
        }
    }
}
