//! Client-side relay for a publish/subscribe broker.
//!
//! [`relay`] holds the connection lifecycle manager, [`broker`] the client
//! capability it drives and [`config`] the tunables.

pub mod broker;
pub mod config;
pub mod relay;

pub use config::{ConfigError, RelayConfig};
pub use relay::{Command, Event, EventKind, Relay};
