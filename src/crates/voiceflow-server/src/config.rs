//! Command line and environment configuration for the server binary
//!
//! Workflow settings live in the TOML file named by `--config`; this struct
//! only covers what the process itself needs.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "voiceflow-server", version, about = "Websocket call server for voiceflow booking workflows")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "VOICEFLOW_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Path to a settings TOML file
    #[arg(long, env = "VOICEFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "VOICEFLOW_LOG", default_value = "info")]
    pub log: String,

    /// Maximum concurrent calls
    #[arg(long, env = "VOICEFLOW_MAX_CALLS", default_value_t = 1000)]
    pub max_calls: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::try_parse_from(["voiceflow-server"]).unwrap();
        assert_eq!(config.bind, "127.0.0.1:8080".parse().unwrap());
        assert!(config.config.is_none());
        assert_eq!(config.max_calls, 1000);
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = ServerConfig::try_parse_from([
            "voiceflow-server",
            "--bind",
            "0.0.0.0:9000",
            "--config",
            "voiceflow.toml",
            "--max-calls",
            "4",
        ])
        .unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.config, Some(PathBuf::from("voiceflow.toml")));
        assert_eq!(config.max_calls, 4);
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(ServerConfig::try_parse_from(["voiceflow-server", "--bind", "nowhere"]).is_err());
    }
}
