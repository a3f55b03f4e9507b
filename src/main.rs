use clap::Parser;
use color_eyre::Result;
use pubsub_relay::broker::memory::MemoryBroker;
use pubsub_relay::broker::mqtt::MqttConnector;
use pubsub_relay::broker::BrokerConnector;
use pubsub_relay::relay::{HostCommand, WakeHandler};
use pubsub_relay::{Relay, RelayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Logs wake requests; a graphical host would raise its window here.
struct LogWake;

impl WakeHandler for LogWake {
    fn wake(&self, channel: &str, payload: &str) {
        info!("Wake requested by {}: {}", channel, payload);
    }
}

/// Relays host commands on stdin to a publish/subscribe broker and broker
/// events back on stdout, one JSON object per line.
#[derive(Parser, Debug)]
#[command(name = "pubsub-relay", version)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the in-process loopback broker instead of the network
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => RelayConfig::default_path()?,
    };
    let config = RelayConfig::load(&config_path).await?;
    info!("Starting relay with config from {}", config_path.display());

    let connector: Arc<dyn BrokerConnector> = if args.offline {
        info!("Offline mode, using in-process broker");
        Arc::new(MemoryBroker::new())
    } else {
        Arc::new(MqttConnector)
    };

    let default_port = config.default_port;
    let relay = Relay::new(config, connector, Some(Arc::new(LogWake)));

    // Register before the first command so no event is missed
    let mut events = relay.events();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        loop {
            match events.recv().await {
                Ok(event) => {
                    let line = match serde_json::to_string(&event.to_host()) {
                        Ok(line) => line,
                        Err(e) => {
                            error!("Failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if stdout.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(RecvError::Lagged(skipped)) => warn!("Event output lagged, {} dropped", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    match HostCommand::from_json(&line).and_then(|c| c.into_command(default_port)) {
                        Ok(command) => {
                            debug!("Host command: {}", command);
                            relay.submit(command);
                        }
                        Err(e) => warn!("Ignoring host command: {}", e),
                    }
                }
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read input: {}", e);
                    break;
                }
            }
        }
    }

    relay.shutdown().await;
    printer.abort();
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    // Logs go to stderr; stdout carries the event stream
    FmtSubscriber::builder()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .pretty()
        .init();
}

/// `RUST_LOG` directives, falling back to `info` when unset or invalid.
fn log_filter(directives: Option<String>) -> EnvFilter {
    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn args_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_config_and_offline_flags() {
        let args = Args::try_parse_from(["pubsub-relay", "--config", "relay.toml", "--offline"])
            .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("relay.toml")));
        assert!(args.offline);
    }

    #[test]
    fn log_filter_follows_rust_log() {
        assert_eq!(
            log_filter(Some("debug".into())).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
        assert_eq!(log_filter(None).max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn rejects_unknown_argument() {
        assert!(Args::try_parse_from(["pubsub-relay", "--verbose"]).is_err());
    }
}
