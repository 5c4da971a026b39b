use std::path::PathBuf;
use std::time::Duration;

use alloy_primitives::Address;
use clap::Parser;
use forks::params::MAXIMUM_EXTRA_DATA_SIZE;
use forks::ChainConfig;
use serde::Deserialize;
use sync::SyncConfig;
use thiserror::Error;

// ============================================================================
// CLI STRUCTS
// ============================================================================

/// r5-node: single node chain with a local miner and the chain syncer.
#[derive(Parser, Debug)]
#[command(name = "r5-node", version = "0.1.0")]
pub struct Cli {
    /// Path to TOML configuration file.
    #[arg(short = 'C', long)]
    pub config: Option<PathBuf>,

    /// Start sealing blocks right away.
    #[arg(long)]
    pub mine: bool,

    /// Address receiving block rewards (required with --mine).
    #[arg(long)]
    pub etherbase: Option<String>,

    /// Text stamped into the extra data of produced blocks.
    #[arg(long = "extra-data")]
    pub extra_data: Option<String>,

    /// Gas limit produced blocks converge towards.
    #[arg(long = "gas-ceil")]
    pub gas_ceil: Option<u64>,

    /// Minimum tip (wei) of remote transactions included in produced blocks.
    #[arg(long = "gas-price")]
    pub gas_price: Option<u64>,

    /// Sealing work recommit interval in milliseconds.
    #[arg(long = "recommit")]
    pub recommit_ms: Option<u64>,

    /// Chain id of the local chain.
    #[arg(long = "chain-id")]
    pub chain_id: Option<u64>,

    /// Fixed block period in seconds; recommits on every new transaction.
    #[arg(long)]
    pub period: Option<u64>,

    /// Peers needed before a sync starts without the force timer.
    #[arg(long = "min-sync-peers")]
    pub min_sync_peers: Option<usize>,

    #[arg(long = "max-peers")]
    pub max_peers: Option<usize>,

    /// Comma-separated addresses funded in the genesis block.
    #[arg(long, value_delimiter = ',')]
    pub prefund: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

// ============================================================================
// CONFIG FILE STRUCTS
// ============================================================================

/// Configuration loaded from TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub mine: Option<bool>,
    pub chain_id: Option<u64>,
    pub period: Option<u64>,
    pub min_sync_peers: Option<usize>,
    pub max_peers: Option<usize>,
    #[serde(default)]
    pub prefund: Vec<String>,
    pub log_level: Option<String>,
    /// `[miner]` table; missing keys keep their defaults.
    pub miner: Option<miner::Config>,
}

// ============================================================================
// RUNTIME CONFIG
// ============================================================================

/// Final merged configuration for runtime.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub mine: bool,
    pub miner: miner::Config,
    pub chain: ChainConfig,
    pub sync: SyncConfig,
    pub prefund: Vec<Address>,
    pub log_level: String,
}

impl RuntimeConfig {
    /// Merge CLI args with config file. Precedence: CLI > config file > defaults.
    pub fn from_cli_and_file(cli: &Cli, file: ConfigFile) -> Result<Self, ConfigError> {
        let mine = cli.mine || file.mine.unwrap_or(false);

        let mut miner = file.miner.unwrap_or_default();
        if let Some(etherbase) = &cli.etherbase {
            miner.etherbase = parse_address(etherbase)?;
        }
        if mine && miner.etherbase.is_zero() {
            return Err(ConfigError::MissingRequired("etherbase"));
        }
        if let Some(extra) = &cli.extra_data {
            miner.extra_data = extra.as_bytes().to_vec();
        }
        if miner.extra_data.len() > MAXIMUM_EXTRA_DATA_SIZE {
            return Err(ConfigError::ExtraTooLong {
                len: miner.extra_data.len(),
                max: MAXIMUM_EXTRA_DATA_SIZE,
            });
        }
        if let Some(ceil) = cli.gas_ceil {
            miner.gas_ceil = ceil;
        }
        if let Some(price) = cli.gas_price {
            miner.gas_price = price;
        }
        if let Some(ms) = cli.recommit_ms {
            miner.recommit = Duration::from_millis(ms);
        }

        let defaults = ChainConfig::default();
        let chain = ChainConfig {
            chain_id: cli.chain_id.or(file.chain_id).unwrap_or(defaults.chain_id),
            period: cli.period.or(file.period).or(defaults.period),
            ..defaults
        };

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            max_peers: cli.max_peers.or(file.max_peers).unwrap_or(defaults.max_peers),
            min_sync_peers: cli
                .min_sync_peers
                .or(file.min_sync_peers)
                .unwrap_or(defaults.min_sync_peers),
            ..defaults
        };

        let prefund = if !cli.prefund.is_empty() {
            &cli.prefund
        } else {
            &file.prefund
        };
        let prefund = prefund
            .iter()
            .map(|s| parse_address(s))
            .collect::<Result<Vec<_>, _>>()?;

        let log_level = cli
            .log_level
            .clone()
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());

        Ok(RuntimeConfig {
            mine,
            miner,
            chain,
            sync,
            prefund,
            log_level,
        })
    }
}

fn parse_address(s: &str) -> Result<Address, ConfigError> {
    s.parse().map_err(|_| ConfigError::InvalidAddress(s.to_string()))
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--{0} is required (via CLI or config file)")]
    MissingRequired(&'static str),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("extra data too long: {len} > {max}")]
    ExtraTooLong { len: usize, max: usize },
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
