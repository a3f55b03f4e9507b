use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{BrokerClient, BrokerError, PublishSession};

/// Shared outbound session used by heartbeats and host sends.
///
/// The session is opened on first use from the currently stored client and
/// dropped on every disconnect.
#[derive(Default)]
pub struct Publisher {
    session: Mutex<Option<Arc<dyn PublishSession>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `payload` on `channel`, opening the shared session from
    /// `client` if none exists yet.
    pub async fn publish(
        &self,
        client: Option<&Arc<dyn BrokerClient>>,
        channel: &str,
        payload: &str,
    ) -> Result<(), BrokerError> {
        let session = {
            // Held across connect so concurrent senders share one session
            let mut guard = self.session.lock().await;
            match guard.as_ref() {
                Some(session) => session.clone(),
                None => {
                    let client = client
                        .ok_or_else(|| BrokerError::Closed("no active connection".into()))?;
                    debug!("Opening shared publish session");
                    let session = client.connect().await?;
                    *guard = Some(session.clone());
                    session
                }
            }
        };
        session.publish(channel, payload).await
    }

    /// Like [`publish`](Self::publish) but only logs failures.
    pub async fn send(&self, client: Option<&Arc<dyn BrokerClient>>, channel: &str, payload: &str) {
        match self.publish(client, channel, payload).await {
            Ok(()) => debug!("Sent to {}: {}", channel, payload),
            Err(BrokerError::Closed(reason)) => {
                debug!("Dropping send to {}: {}", channel, reason)
            }
            Err(e) => warn!("Failed to send to {}: {}", channel, e),
        }
    }

    pub async fn clear(&self) {
        if self.session.lock().await.take().is_some() {
            debug!("Cleared shared publish session");
        }
    }

    pub async fn is_open(&self) -> bool {
        self.session.lock().await.is_some()
    }
}
