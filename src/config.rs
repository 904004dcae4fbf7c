use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};

pub const MIN_DIFFICULTY: u32 = 1;
pub const MAX_DIFFICULTY: u32 = 8;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// SQLite database path; `:memory:` is accepted for ephemeral nodes.
    pub database_path: PathBuf,
    pub api_listen: SocketAddr,
    pub p2p_listen: SocketAddr,
    /// Peer endpoints dialed at startup, `host:port`.
    pub peers: Vec<String>,
    pub difficulty: u32,
    #[serde(default = "default_mining_timeout_ms")]
    pub mining_timeout_ms: u64,
    #[serde(default = "default_max_data_size")]
    pub max_data_size: usize,
    #[serde(default = "default_verifier_interval_secs")]
    pub verifier_interval_secs: u64,
    #[serde(default = "default_verifier_batch")]
    pub verifier_batch: usize,
}

fn default_mining_timeout_ms() -> u64 {
    120_000
}

fn default_max_data_size() -> usize {
    1024 * 1024
}

fn default_verifier_interval_secs() -> u64 {
    60
}

fn default_verifier_batch() -> usize {
    50
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: NodeConfig = toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        if let Some(parent) = self.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Environment keys override the file, matching the deployment contract:
    /// `PORT`, `P2P_PORT`, `PEERS`, `DATABASE_URL`, `DIFFICULTY`,
    /// `MINING_TIMEOUT_MS`, `MAX_DATA_SIZE`.
    pub fn apply_env_overrides(&mut self) -> ChainResult<()> {
        if let Some(port) = read_env_parsed::<u16>("PORT")? {
            self.api_listen.set_port(port);
        }
        if let Some(port) = read_env_parsed::<u16>("P2P_PORT")? {
            self.p2p_listen.set_port(port);
        }
        if let Ok(peers) = env::var("PEERS") {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database_path = PathBuf::from(url);
        }
        if let Some(difficulty) = read_env_parsed::<u32>("DIFFICULTY")? {
            self.difficulty = difficulty;
        }
        if let Some(timeout) = read_env_parsed::<u64>("MINING_TIMEOUT_MS")? {
            self.mining_timeout_ms = timeout;
        }
        if let Some(size) = read_env_parsed::<usize>("MAX_DATA_SIZE")? {
            self.max_data_size = size;
        }
        Ok(())
    }

    pub fn validate(&self) -> ChainResult<()> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&self.difficulty) {
            return Err(ChainError::Config(format!(
                "difficulty {} outside supported range {MIN_DIFFICULTY}..={MAX_DIFFICULTY}",
                self.difficulty
            )));
        }
        if self.max_data_size == 0 {
            return Err(ChainError::Config("max_data_size must be positive".into()));
        }
        if self.verifier_batch == 0 {
            return Err(ChainError::Config("verifier_batch must be positive".into()));
        }
        Ok(())
    }
}

fn read_env_parsed<T: std::str::FromStr>(key: &str) -> ChainResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ChainError::Config(format!("invalid {key} value: {raw}"))),
        Err(_) => Ok(None),
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_path: PathBuf::from("./data/ledger.db"),
            api_listen: "0.0.0.0:4001".parse().expect("valid socket addr"),
            p2p_listen: "0.0.0.0:6001".parse().expect("valid socket addr"),
            peers: Vec::new(),
            difficulty: 4,
            mining_timeout_ms: default_mining_timeout_ms(),
            max_data_size: default_max_data_size(),
            verifier_interval_secs: default_verifier_interval_secs(),
            verifier_batch: default_verifier_batch(),
        }
    }
}
