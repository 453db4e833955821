use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::logging::LogFormat;

/// Typed environment lookup. Unset variables fall back silently; values
/// that are set but unparsable fall back with a warning, since they
/// usually mean a deployment typo.
pub fn read_env<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparsable environment value, using the default");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub state_storage_frequency: u64,
    pub log_format: LogFormat,
    pub log_thread_names: bool,
    pub dev_validator_count: u8,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: PathBuf::from(read_env(
                "NODE_DATA_DIR",
                "./beacon-data".to_owned(),
            )),
            bind_addr: read_env("NODE_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080))),
            state_storage_frequency: read_env("NODE_STATE_STORAGE_FREQUENCY", 32),
            log_format: read_env("NODE_LOG_FORMAT", LogFormat::Plain),
            log_thread_names: read_env("NODE_LOG_THREAD_NAMES", false),
            dev_validator_count: read_env("NODE_DEV_VALIDATOR_COUNT", 64),
        }
    }
}
