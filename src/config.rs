use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::chain::RetryPolicy;
use crate::domain::{BlockNumber, ContractAddress};
use crate::ingest::IngestConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    pub chain_rpc_url: String,
    pub contracts: Vec<ContractSpec>,
    pub batch_size: u64,
    pub confirmation_depth: u64,
    pub max_retries: u32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub heartbeat_timeout: Duration,
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub db_timeout: Duration,
    pub qf_weighted: bool,
}

/// A contract to index, written `address[@deploymentBlock]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractSpec {
    pub address: ContractAddress,
    pub deployment_block: Option<BlockNumber>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let port = parse_or(&env_map, "PORT", 8080u16, "must be a valid u16")?;

        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let chain_rpc_url = env_map
            .get("CHAIN_RPC_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("CHAIN_RPC_URL".to_string()))?;

        let contracts = match env_map.get("CONTRACTS") {
            Some(list) => parse_contracts(list)?,
            None => Vec::new(),
        };

        let batch_size = parse_or(&env_map, "BATCH_SIZE", 500u64, "must be a valid u64")?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "BATCH_SIZE".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        let confirmation_depth =
            parse_or(&env_map, "CONFIRMATION_DEPTH", 12u64, "must be a valid u64")?;
        let max_retries = parse_or(&env_map, "MAX_RETRIES", 5u32, "must be a valid u32")?;
        if max_retries == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_RETRIES".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let retry_initial = parse_ms(&env_map, "RETRY_INITIAL_MS", 200)?;
        let retry_max = parse_ms(&env_map, "RETRY_MAX_MS", 10_000)?;
        if retry_max < retry_initial {
            return Err(ConfigError::InvalidValue(
                "RETRY_MAX_MS".to_string(),
                "must not be below RETRY_INITIAL_MS".to_string(),
            ));
        }

        let qf_weighted = match env_map
            .get("QF_WEIGHTED")
            .map(|s| s.as_str())
            .unwrap_or("false")
        {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(ConfigError::InvalidValue(
                    "QF_WEIGHTED".to_string(),
                    format!("must be true or false, got {}", other),
                ))
            }
        };

        Ok(Config {
            port,
            database_path,
            chain_rpc_url,
            contracts,
            batch_size,
            confirmation_depth,
            max_retries,
            retry_initial,
            retry_max,
            heartbeat_timeout: parse_ms(&env_map, "HEARTBEAT_TIMEOUT_MS", 30_000)?,
            poll_interval: parse_ms(&env_map, "POLL_INTERVAL_MS", 2_000)?,
            rpc_timeout: parse_ms(&env_map, "RPC_TIMEOUT_MS", 10_000)?,
            db_timeout: parse_ms(&env_map, "DB_TIMEOUT_MS", 5_000)?,
            qf_weighted,
        })
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            batch_size: self.batch_size,
            confirmation_depth: self.confirmation_depth,
            retry: RetryPolicy::new(self.max_retries, self.retry_initial, self.retry_max),
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    env_map: &HashMap<String, String>,
    key: &str,
    default: T,
    expected: &str,
) -> Result<T, ConfigError> {
    match env_map.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), expected.to_string())),
        None => Ok(default),
    }
}

fn parse_ms(
    env_map: &HashMap<String, String>,
    key: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    parse_or(env_map, key, default_ms, "must be milliseconds as a u64").map(Duration::from_millis)
}

fn parse_contracts(list: &str) -> Result<Vec<ContractSpec>, ConfigError> {
    let mut specs: Vec<ContractSpec> = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let spec = entry.parse::<ContractSpec>()?;
        if specs.iter().any(|s| s.address == spec.address) {
            return Err(ConfigError::InvalidValue(
                "CONTRACTS".to_string(),
                format!("duplicate contract {}", spec.address),
            ));
        }
        specs.push(spec);
    }
    Ok(specs)
}

impl std::str::FromStr for ContractSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidValue("CONTRACTS".to_string(), reason);
        let (address, block) = match s.split_once('@') {
            Some((address, block)) => (address.trim(), Some(block.trim())),
            None => (s.trim(), None),
        };
        if !address.starts_with("0x") || address.len() < 3 {
            return Err(invalid(format!("{} is not a 0x address", address)));
        }
        let deployment_block = block
            .map(|b| {
                b.parse::<BlockNumber>()
                    .map_err(|_| invalid(format!("bad deployment block in {}", s)))
            })
            .transpose()?;
        Ok(ContractSpec {
            address: ContractAddress::new(address),
            deployment_block,
        })
    }
}
