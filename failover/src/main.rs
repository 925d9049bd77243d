use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use failover_core::{FailoverConfig, FailoverError, FailoverResult, ResourceClass};

mod udp;

use udp::{ControlRequest, TransportConfig, UdpTransport};

#[derive(Parser)]
#[command(name = "failover")]
#[command(about = "Two-node high-availability resource failover daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the failover daemon
    Run {
        /// Path to the TOML configuration file
        #[arg(long, default_value = "/etc/failover/failover.toml")]
        config: PathBuf,
    },
    /// Parse and validate a configuration file, then exit
    ValidateConfig {
        #[arg(long, default_value = "/etc/failover/failover.toml")]
        config: PathBuf,
    },
    /// Ask the running daemon to hand resources to its peer
    Standby {
        #[arg(long, default_value = "/etc/failover/failover.toml")]
        config: PathBuf,

        /// Resources to give up: local, foreign or all
        #[arg(long, default_value = "all")]
        scope: String,
    },
    /// Print the running daemon's status as JSON
    Status {
        #[arg(long, default_value = "/etc/failover/failover.toml")]
        config: PathBuf,
    },
    /// Ask the running daemon to release everything and stop
    Shutdown {
        #[arg(long, default_value = "/etc/failover/failover.toml")]
        config: PathBuf,
    },
    /// Print a configuration file with every default filled in
    PrintDefaultConfig,
}

/// Sections of the configuration file that belong to the daemon rather than
/// the engine
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DaemonSections {
    transport: TransportConfig,
}

fn load(path: &Path) -> FailoverResult<(FailoverConfig, TransportConfig)> {
    let config = FailoverConfig::from_file(path)?;
    let contents = std::fs::read_to_string(path)?;
    let sections: DaemonSections = toml::from_str(&contents)?;
    sections.transport.validate(&config)?;
    Ok((config, sections.transport))
}

fn parse_scope(scope: &str) -> FailoverResult<ResourceClass> {
    match scope {
        "local" => Ok(ResourceClass::Local),
        "foreign" => Ok(ResourceClass::Foreign),
        "all" => Ok(ResourceClass::All),
        other => Err(FailoverError::invalid_operation(
            "standby",
            format!("unknown scope '{}', expected local, foreign or all", other),
        )),
    }
}

async fn control(path: &Path, request: ControlRequest) -> FailoverResult<()> {
    let (_, transport) = load(path)?;
    let reply = udp::control_request(transport.control, &request, Duration::from_secs(5)).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    if reply["result"] == "error" {
        return Err(FailoverError::invalid_operation(
            "control",
            reply["message"].as_str().unwrap_or("request failed"),
        ));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> FailoverResult<()> {
    let cli = Cli::parse();

    // The configured level only applies when RUST_LOG does not say otherwise
    let level = match &cli.command {
        Commands::Run { config } => FailoverConfig::from_file(config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
        _ => "warn".to_string(),
    };
    let directive = format!("failover={level},failover_core={level}");
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .map_err(|e| FailoverError::configuration("logging.level", format!("{}", e)))?,
    );
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { config } => {
            let (config, transport) = load(&config)?;
            tracing::info!(
                node = %config.node_name,
                nice_failback = config.nice_failback(),
                auto_failback = config.auto_failback(),
                "Starting failover daemon"
            );
            UdpTransport::new(config, transport)?.run().await
        }
        Commands::ValidateConfig { config } => {
            let (config, _) = load(&config)?;
            println!("Configuration for node '{}' is valid", config.node_name);
            Ok(())
        }
        Commands::Standby { config, scope } => {
            let scope = parse_scope(&scope)?;
            control(&config, ControlRequest::Standby { scope }).await
        }
        Commands::Status { config } => control(&config, ControlRequest::Status).await,
        Commands::Shutdown { config } => control(&config, ControlRequest::Shutdown).await,
        Commands::PrintDefaultConfig => {
            let rendered = toml::to_string_pretty(&FailoverConfig::default()).map_err(|e| {
                FailoverError::configuration("print-default-config", e.to_string())
            })?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_load_reads_both_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
node_name = "alpha"

[[nodes]]
name = "beta"

[transport]
bind = "127.0.0.1:7940"
control = "127.0.0.1:7941"
keepalive = "500ms"
dead_time = "5s"

[transport.peers]
beta = "127.0.0.1:8940"
"#
        )
        .unwrap();

        let (config, transport) = load(file.path()).unwrap();
        assert_eq!(config.node_name, "alpha");
        assert_eq!(transport.keepalive, Duration::from_millis(500));
        assert_eq!(transport.peers.len(), 1);
    }

    #[test]
    fn test_load_rejects_missing_peer_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
node_name = "alpha"

[[nodes]]
name = "beta"
"#
        )
        .unwrap();
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn test_parse_scope() {
        assert_eq!(parse_scope("foreign").unwrap(), ResourceClass::Foreign);
        assert!(parse_scope("both").is_err());
    }
}
