//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG: &str = "voltlink.json5";

/// VoltLink telemetry relay.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Relay between Modbus field devices, an MQTT bus and live viewers")]
pub struct RelayArgs {
    /// Path to configuration file. Built-in defaults are used if it does not exist.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the HTTP/WebSocket listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = RelayArgs::try_parse_from(["voltlink"]).unwrap();
        assert_eq!(args.config, PathBuf::from("voltlink.json5"));
        assert!(args.log_level.is_none());
        assert!(args.listen.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = RelayArgs::try_parse_from([
            "voltlink",
            "-c",
            "/etc/voltlink/site.json5",
            "--log-level",
            "debug",
            "--listen",
            "127.0.0.1:9000",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("/etc/voltlink/site.json5"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.listen, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn test_rejects_bad_listen_address() {
        assert!(RelayArgs::try_parse_from(["voltlink", "--listen", "nowhere"]).is_err());
    }
}
