use std::path::PathBuf;

use clap::Parser;
use devp2p::crypto::node_id_from_hex;
use devp2p::types::NodeId;
use serde::Deserialize;
use sync::DEFAULT_NETWORK_ID;
use thiserror::Error;

/// Consensus tick period when none is configured.
pub const DEFAULT_TICK_MS: u64 = 1_000;

// ============================================================================
// CLI STRUCTS
// ============================================================================

/// qpos-node: QPOS consensus node with peer block sync.
#[derive(Parser, Debug, Default)]
#[command(name = "qpos-node", version = "0.1.0")]
pub struct Cli {
    /// Path to TOML configuration file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Path to directory for node key and local data.
    #[arg(long = "datadir")]
    pub datadir: Option<PathBuf>,

    /// Network identifier peers must announce.
    #[arg(long = "network-id")]
    pub network_id: Option<u64>,

    /// JSON node list naming the authorized miners.
    #[arg(long = "miners")]
    pub miners: Option<PathBuf>,

    /// Comma-separated node ids (128 hex chars) always counted as miners.
    #[arg(long = "ex-node", value_delimiter = ',')]
    pub ex_nodes: Vec<String>,

    /// Count this node as a miner.
    #[arg(long = "exnodes-me")]
    pub exnodes_me: bool,

    /// Count this node and every connected peer as miners.
    #[arg(long = "exnodes-anyone")]
    pub exnodes_anyone: bool,

    /// Consensus tick period in milliseconds.
    #[arg(long = "tick-ms")]
    pub tick_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Comma-separated client id fragments to refuse.
    #[arg(long = "client-blacklist", value_delimiter = ',')]
    pub client_blacklist: Vec<String>,
}

// ============================================================================
// CONFIG FILE STRUCTS
// ============================================================================

/// Configuration loaded from TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub datadir: Option<String>,
    pub network_id: Option<u64>,
    pub miners: Option<String>,
    #[serde(default)]
    pub ex_nodes: Vec<String>,
    pub exnodes_me: Option<bool>,
    pub exnodes_anyone: Option<bool>,
    pub tick_ms: Option<u64>,
    pub log_level: Option<String>,
    pub client_blacklist: Option<Vec<String>>,
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

/// Final merged configuration for runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub datadir: PathBuf,
    pub network_id: u64,
    pub miners_file: Option<PathBuf>,
    pub ex_nodes: Vec<NodeId>,
    pub exnodes_me: bool,
    pub exnodes_anyone: bool,
    pub tick_ms: u64,
    pub log_level: String,
    pub client_blacklist: Vec<String>,
}

impl RuntimeConfig {
    /// Merge CLI args with config file. Precedence: CLI > config file > defaults.
    pub fn from_cli_and_file(cli: &Cli, file: ConfigFile) -> Result<Self, ConfigError> {
        let datadir = cli
            .datadir
            .clone()
            .or_else(|| file.datadir.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data"));

        let network_id = cli.network_id.or(file.network_id).unwrap_or(DEFAULT_NETWORK_ID);

        let miners_file = cli.miners.clone().or_else(|| file.miners.map(PathBuf::from));

        let ex_node_strings = if !cli.ex_nodes.is_empty() {
            cli.ex_nodes.clone()
        } else {
            file.ex_nodes
        };
        let ex_nodes = ex_node_strings
            .iter()
            .map(|s| node_id_from_hex(s).map_err(|e| ConfigError::InvalidNodeId(s.clone(), e)))
            .collect::<Result<Vec<_>, _>>()?;

        let exnodes_me = cli.exnodes_me || file.exnodes_me.unwrap_or(false);
        let exnodes_anyone = cli.exnodes_anyone || file.exnodes_anyone.unwrap_or(false);

        let tick_ms = cli.tick_ms.or(file.tick_ms).unwrap_or(DEFAULT_TICK_MS);
        if tick_ms == 0 {
            return Err(ConfigError::InvalidValue("tick-ms", "must be positive".to_string()));
        }

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        let client_blacklist = if !cli.client_blacklist.is_empty() {
            cli.client_blacklist.clone()
        } else {
            file.client_blacklist
                .unwrap_or_else(|| sync::SyncConfig::default().client_blacklist)
        };

        Ok(RuntimeConfig {
            datadir,
            network_id,
            miners_file,
            ex_nodes,
            exnodes_me,
            exnodes_anyone,
            tick_ms,
            log_level,
            client_blacklist,
        })
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid node id {0:?}: {1}")]
    InvalidNodeId(String, &'static str),
    #[error("--{0}: {1}")]
    InvalidValue(&'static str, String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

// ============================================================================
// LOADING FUNCTIONS
// ============================================================================

/// Load TOML config file, returns default if path is None.
pub fn load_config_file(path: Option<&PathBuf>) -> Result<ConfigFile, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)?;
            toml::from_str(&content).map_err(ConfigError::Toml)
        }
        None => Ok(ConfigFile::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_id(b: u8) -> String {
        hex::encode([b; 64])
    }

    #[test]
    fn defaults_without_cli_or_file() {
        let cfg = RuntimeConfig::from_cli_and_file(&Cli::default(), ConfigFile::default()).unwrap();
        assert_eq!(cfg.datadir, PathBuf::from("data"));
        assert_eq!(cfg.network_id, DEFAULT_NETWORK_ID);
        assert_eq!(cfg.tick_ms, DEFAULT_TICK_MS);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.client_blacklist, vec!["/v0.7.0/".to_string()]);
        assert!(cfg.ex_nodes.is_empty());
        assert!(!cfg.exnodes_me && !cfg.exnodes_anyone);
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str(&format!(
            "network_id = 7\ntick_ms = 500\nlog_level = \"debug\"\nex_nodes = [\"{}\"]\nexnodes_me = true\n",
            hex_id(1)
        ))
        .unwrap();
        let ex_nodes = format!("{},{}", hex_id(2), hex_id(3));
        let cli = Cli::parse_from(["qpos-node", "--network-id", "9", "--ex-node", ex_nodes.as_str()]);
        let cfg = RuntimeConfig::from_cli_and_file(&cli, file).unwrap();
        assert_eq!(cfg.network_id, 9);
        assert_eq!(cfg.tick_ms, 500);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.ex_nodes, vec![[2u8; 64], [3u8; 64]]);
        assert!(cfg.exnodes_me);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        assert!(toml::from_str::<ConfigFile>("mining = true\n").is_err());
    }

    #[test]
    fn bad_values_are_reported() {
        let cli = Cli::parse_from(["qpos-node", "--ex-node", "abcd"]);
        assert!(matches!(
            RuntimeConfig::from_cli_and_file(&cli, ConfigFile::default()),
            Err(ConfigError::InvalidNodeId(..))
        ));
        let cli = Cli::parse_from(["qpos-node", "--tick-ms", "0"]);
        assert!(matches!(
            RuntimeConfig::from_cli_and_file(&cli, ConfigFile::default()),
            Err(ConfigError::InvalidValue("tick-ms", _))
        ));
    }

    #[test]
    fn missing_config_path_is_default() {
        assert!(load_config_file(None).unwrap().network_id.is_none());
        let missing = PathBuf::from("/nonexistent/qpos-node.toml");
        assert!(matches!(load_config_file(Some(&missing)), Err(ConfigError::Io(_))));
    }
}
