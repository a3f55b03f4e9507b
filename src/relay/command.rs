use serde::Deserialize;
use std::fmt;
use tracing::debug;

/// Payload substituted when a send command carries none.
pub const MISSING_PAYLOAD: &str = "no data to send";

/// Discrete command issued by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Connect {
        channel: String,
        host: String,
        port: u16,
    },
    Disconnect,
    Send {
        channel: String,
        payload: String,
    },
    ConnectionCheck,
}

impl Command {
    /// Connect and disconnect are debounced by the dispatcher.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Command::Connect { .. } | Command::Disconnect)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect => "disconnect",
            Command::Send { .. } => "send",
            Command::ConnectionCheck => "connection-check",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Command::Connect {
                channel,
                host,
                port,
            } => write!(f, "connect {} - {}:{}", channel, host, port),
            Command::Send { channel, payload } => write!(f, "send {} - {}", channel, payload),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Command {command} is missing field {field}")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("Malformed command: {0}")]
    Malformed(String),
}

/// Command as the host sends it: a flat record keyed by `command`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct HostCommand {
    pub command: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data")]
    pub payload: Option<String>,
}

impl HostCommand {
    /// Parses one JSON-encoded host command.
    pub fn from_json(line: &str) -> Result<Self, CommandError> {
        serde_json::from_str(line).map_err(|e| CommandError::Malformed(e.to_string()))
    }

    /// Converts into a [`Command`], filling in what the host left out where
    /// a placeholder makes sense.
    pub fn into_command(self, default_port: u16) -> Result<Command, CommandError> {
        match self.command.as_str() {
            "connect" => {
                let channel = non_empty(self.channel).ok_or(CommandError::MissingField {
                    command: "connect",
                    field: "channel",
                })?;
                let host = non_empty(self.host).ok_or(CommandError::MissingField {
                    command: "connect",
                    field: "host",
                })?;
                let port = self.port.unwrap_or_else(|| {
                    debug!("Connect without port, using {}", default_port);
                    default_port
                });
                Ok(Command::Connect {
                    channel,
                    host,
                    port,
                })
            }
            "disconnect" => Ok(Command::Disconnect),
            "send" => {
                let channel = non_empty(self.channel).ok_or(CommandError::MissingField {
                    command: "send",
                    field: "channel",
                })?;
                let payload = self.payload.unwrap_or_else(|| MISSING_PAYLOAD.to_string());
                Ok(Command::Send { channel, payload })
            }
            "connection-check" => Ok(Command::ConnectionCheck),
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
