//! # Relay Core
//!
//! Keeps one live publish/subscribe session against a broker, survives
//! transient network failure and relays inbound messages to the host.
//!
//! ## Module Architecture
//!
//! ```text
//! relay/
//! ├── command.rs       - Host commands and their parsing
//! ├── dispatcher.rs    - Debounced hand-off of commands to background tasks
//! ├── manager.rs       - Connection lifecycle and the single-record invariant
//! ├── subscription.rs  - Subscribe and translate broker callbacks
//! ├── prober.rs        - Periodic self-addressed heartbeat
//! ├── publisher.rs     - Lazily opened shared outbound session
//! └── emitter.rs       - Events towards the host
//! ```
//!
//! ## Control Flow
//!
//! ```text
//! host ─[Command]→ Dispatcher ─→ Manager ─→ Subscription ─→ Prober
//!                                   │             │            │
//!                                   └─────────────┴────────────┴─→ Emitter ─[Event]→ host
//! ```
//!
//! Broker failures never leave this module as errors. They are logged and
//! surface to the host as status events (`fail to connect`,
//! `fail to reconnect`).

pub mod command;
pub mod dispatcher;
pub mod emitter;
pub mod manager;
pub mod prober;
pub mod publisher;
mod subscription;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub use command::{Command, CommandError, HostCommand};
pub use dispatcher::{CommandDispatcher, CommandOutcome, TaskHandle, TaskOutcome};
pub use emitter::{Event, EventEmitter, EventKind, HostEvent, WakeHandler};
pub use manager::{ConnectOutcome, ConnectParams, ConnectionManager, ConnectionRecord};
pub use prober::ProbeOutcome;

use crate::broker::BrokerConnector;
use crate::config::RelayConfig;

/// Connection manager and dispatcher wired together.
pub struct Relay {
    manager: ConnectionManager,
    dispatcher: CommandDispatcher,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        connector: Arc<dyn BrokerConnector>,
        wake: Option<Arc<dyn WakeHandler>>,
    ) -> Self {
        let mut emitter = EventEmitter::new(config.event_capacity);
        if let Some(wake) = wake {
            emitter = emitter.with_wake_handler(wake);
        }
        let manager = ConnectionManager::new(config, connector, emitter);
        let dispatcher = CommandDispatcher::new(manager.clone());
        Self {
            manager,
            dispatcher,
        }
    }

    /// Registers a new event listener. Events emitted before this call are
    /// not replayed.
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.manager.events()
    }

    pub fn submit(&self, command: Command) -> TaskHandle {
        self.dispatcher.submit(command)
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn set_config(&self, config: RelayConfig) {
        self.manager.set_config(config).await;
    }

    /// Final teardown when the host goes away.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.manager.disconnect(false).await;
    }
}
