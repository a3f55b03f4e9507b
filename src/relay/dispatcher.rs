//! Command Dispatcher
//!
//! Hands host commands to background tasks without blocking the caller.
//! Connect and disconnect are debounced: a new one cancels whichever of the
//! two is still waiting and is itself delayed by the configured debounce.
//! Issuing them back to back against a broker client tends to produce
//! spurious connection errors, and the delay absorbs rapid toggling.
//! Send and connection-check run immediately.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::command::Command;
use super::manager::{ConnectOutcome, ConnectParams, ConnectionManager};
use super::prober::ProbeOutcome;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    Connect(ConnectOutcome),
    /// Carries the reconnect outcome when one was requested
    Disconnect(Option<ConnectOutcome>),
    Send,
    ConnectionCheck(Vec<ProbeOutcome>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(CommandOutcome),
    /// Cancelled before it started, by a newer lifecycle command or explicitly
    Cancelled,
    /// The task panicked or was aborted
    Failed(String),
}

/// Handle to a submitted command.
///
/// Dropping the handle does not cancel the command.
pub struct TaskHandle {
    command: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Cancels the command if it has not started executing yet.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("{} task failed: {}", self.command, e);
                TaskOutcome::Failed(e.to_string())
            }
        }
    }
}

pub struct CommandDispatcher {
    manager: ConnectionManager,
    pending_lifecycle: Arc<Mutex<Option<CancellationToken>>>,
}

impl CommandDispatcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            pending_lifecycle: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedules `command` on a background task and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, command: Command) -> TaskHandle {
        let name = command.name();
        let cancel = CancellationToken::new();
        debug!("Submitting command: {}", command);

        let join = if command.is_lifecycle() {
            self.replace_pending(cancel.clone());
            tokio::spawn(run_debounced(
                self.manager.clone(),
                command,
                cancel.clone(),
            ))
        } else {
            let manager = self.manager.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                if token.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                TaskOutcome::Completed(execute(&manager, command).await)
            })
        };

        TaskHandle {
            command: name,
            cancel,
            join,
        }
    }

    fn replace_pending(&self, token: CancellationToken) {
        let mut pending = match self.pending_lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = pending.replace(token) {
            if !previous.is_cancelled() {
                debug!("Cancelling pending connect/disconnect");
                previous.cancel();
            }
        }
    }
}

async fn run_debounced(
    manager: ConnectionManager,
    command: Command,
    cancel: CancellationToken,
) -> TaskOutcome {
    let delay = manager.config().await.debounce();
    tokio::select! {
        _ = cancel.cancelled() => {
            info!("{} superseded before execution", command.name());
            return TaskOutcome::Cancelled;
        }
        _ = sleep(delay) => {}
    }
    TaskOutcome::Completed(execute(&manager, command).await)
}

async fn execute(manager: &ConnectionManager, command: Command) -> CommandOutcome {
    match command {
        Command::Connect {
            channel,
            host,
            port,
        } => CommandOutcome::Connect(
            manager
                .connect(ConnectParams::new(channel, host, port))
                .await,
        ),
        Command::Disconnect => CommandOutcome::Disconnect(manager.disconnect(false).await),
        Command::Send { channel, payload } => {
            manager.send(&channel, &payload).await;
            CommandOutcome::Send
        }
        Command::ConnectionCheck => CommandOutcome::ConnectionCheck(manager.check_connection().await),
    }
}
