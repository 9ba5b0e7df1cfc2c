use std::fs;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncError;

// If bitcoind takes more than 3 minutes to answer one of our queries, fail.
const DEFAULT_RPC_TIMEOUT: u64 = 180;

// A retry happens every second, this makes us give up after one minute.
const DEFAULT_RETRIES: usize = 60;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub network: bitcoin::Network,
    pub bitcoind: BitcoindConfig,
    /// How often the backend polls for a new tip
    pub poll_interval: Duration,
    /// Emit a rescan progress notification every this many blocks
    pub progress_interval: u32,
}

#[derive(Debug, Clone)]
pub struct BitcoindConfig {
    pub addr: SocketAddr,
    pub cookie_path: PathBuf,
    pub rpc_timeout: Duration,
    pub retries: usize,
}

fn default_rpc_port(network: bitcoin::Network) -> u16 {
    match network {
        bitcoin::Network::Testnet => 18332,
        bitcoin::Network::Signet => 38332,
        bitcoin::Network::Regtest => 18443,
        _ => 8332,
    }
}

fn network_dir(data_dir: &Path, network: bitcoin::Network) -> PathBuf {
    match network {
        bitcoin::Network::Testnet => data_dir.join("testnet3"),
        bitcoin::Network::Signet => data_dir.join("signet"),
        bitcoin::Network::Regtest => data_dir.join("regtest"),
        _ => data_dir.to_path_buf(),
    }
}

fn is_true(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl SyncConfig {
    /// Defaults for a node running locally with its data in `data_dir`.
    pub fn new(network: bitcoin::Network, data_dir: &Path) -> Self {
        Self {
            network,
            bitcoind: BitcoindConfig {
                addr: SocketAddr::from(([127, 0, 0, 1], default_rpc_port(network))),
                cookie_path: network_dir(data_dir, network).join(".cookie"),
                rpc_timeout: Duration::from_secs(DEFAULT_RPC_TIMEOUT),
                retries: DEFAULT_RETRIES,
            },
            poll_interval: Duration::from_secs(10),
            progress_interval: 1_000,
        }
    }

    /// Load a Bitcoin Core style configuration file on top of the defaults for
    /// `data_dir`. A missing file yields the defaults.
    pub fn load(conf_path: &Path, data_dir: &Path) -> Result<Self, SyncError> {
        if !conf_path.exists() {
            log::debug!("No config file at {}, using defaults", conf_path.display());
            return Ok(Self::new(bitcoin::Network::Bitcoin, data_dir));
        }
        let file = fs::File::open(conf_path)
            .map_err(|e| SyncError::Config(format!("Failed to open config file: {}", e)))?;
        Self::parse(io::BufReader::new(file), data_dir)
    }

    pub fn parse<R: BufRead>(reader: R, data_dir: &Path) -> Result<Self, SyncError> {
        let mut entries = Vec::new();
        let mut section = String::new();

        for line in reader.lines() {
            let line =
                line.map_err(|e| SyncError::Config(format!("Failed to read line: {}", e)))?;
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].to_string();
                continue;
            }

            match trimmed.split_once('=') {
                Some((key, value)) => {
                    entries.push((section.clone(), key.trim().to_string(), value.trim().to_string()))
                }
                None => {
                    return Err(SyncError::Config(format!("Invalid line: '{}'", trimmed)));
                }
            }
        }

        // The network decides the defaults the other settings override.
        let mut network = bitcoin::Network::Bitcoin;
        for (_, key, value) in &entries {
            match key.as_str() {
                "testnet" if is_true(value) => network = bitcoin::Network::Testnet,
                "signet" if is_true(value) => network = bitcoin::Network::Signet,
                "regtest" if is_true(value) => network = bitcoin::Network::Regtest,
                _ => {}
            }
        }

        let mut config = Self::new(network, data_dir);
        for (section, key, value) in &entries {
            config.apply_setting(section, key, value)?;
        }
        Ok(config)
    }

    fn apply_setting(&mut self, section: &str, key: &str, value: &str) -> Result<(), SyncError> {
        match (section, key) {
            (_, "testnet") | (_, "signet") | (_, "regtest") => {}
            ("", "rpcconnect") | ("bitcoind", "addr") => {
                let port = self.bitcoind.addr.port();
                self.bitcoind.addr = match value.parse::<SocketAddr>() {
                    Ok(addr) => addr,
                    Err(_) => format!("{}:{}", value, port).parse::<SocketAddr>().map_err(|e| {
                        SyncError::Config(format!("Invalid bitcoind address '{}': {}", value, e))
                    })?,
                };
            }
            ("", "rpcport") | ("bitcoind", "port") => {
                let port = value
                    .parse::<u16>()
                    .map_err(|e| SyncError::Config(format!("Invalid rpcport '{}': {}", value, e)))?;
                self.bitcoind.addr.set_port(port);
            }
            ("", "rpccookiefile") | ("bitcoind", "cookiefile") => {
                self.bitcoind.cookie_path = PathBuf::from(value);
            }
            ("", "rpcclienttimeout") | ("bitcoind", "timeout") => {
                let secs = value
                    .parse::<u64>()
                    .map_err(|e| SyncError::Config(format!("Invalid timeout '{}': {}", value, e)))?;
                self.bitcoind.rpc_timeout = Duration::from_secs(secs);
            }
            ("bitcoind", "retries") => {
                self.bitcoind.retries = value
                    .parse()
                    .map_err(|e| SyncError::Config(format!("Invalid retries '{}': {}", value, e)))?;
            }
            ("sync", "pollinterval") => {
                let secs = value.parse::<u64>().map_err(|e| {
                    SyncError::Config(format!("Invalid poll interval '{}': {}", value, e))
                })?;
                self.poll_interval = Duration::from_secs(secs.max(1));
            }
            ("sync", "progressinterval") => {
                let blocks = value.parse::<u32>().map_err(|e| {
                    SyncError::Config(format!("Invalid progress interval '{}': {}", value, e))
                })?;
                self.progress_interval = blocks.max(1);
            }
            _ => {
                log::debug!("Ignoring unknown config option: [{}] {}", section, key);
            }
        }
        Ok(())
    }
}
