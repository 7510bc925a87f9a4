//! Server configuration from environment variables.
//!
//! | Variable                    | Default          |
//! |-----------------------------|------------------|
//! | `TANDEM_RELAY_ADDR`         | `127.0.0.1:9090` |
//! | `TANDEM_HTTP_ADDR`          | `127.0.0.1:8080` |
//! | `TANDEM_DATA_DIR`           | `./tandem_data`  |
//! | `TANDEM_BROADCAST_CAPACITY` | `256`            |
//! | `TANDEM_MAX_PEERS`          | `100`            |
//! | `TANDEM_HEARTBEAT_SECS`     | `30`             |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::server::ServerConfig;
use crate::storage::StoreConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket relay bind address
    pub relay_addr: String,
    /// HTTP API bind address
    pub http_addr: String,
    /// RocksDB directory
    pub data_dir: PathBuf,
    pub broadcast_capacity: usize,
    pub max_peers_per_topic: usize,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            relay_addr: server.bind_addr,
            http_addr: "127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("./tandem_data"),
            broadcast_capacity: server.broadcast_capacity,
            max_peers_per_topic: server.max_peers_per_topic,
            heartbeat_interval_secs: server.heartbeat_interval_secs,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            relay_addr: lookup("TANDEM_RELAY_ADDR").unwrap_or(defaults.relay_addr),
            http_addr: lookup("TANDEM_HTTP_ADDR").unwrap_or(defaults.http_addr),
            data_dir: lookup("TANDEM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            broadcast_capacity: parse(&lookup, "TANDEM_BROADCAST_CAPACITY", defaults.broadcast_capacity)?,
            max_peers_per_topic: parse(&lookup, "TANDEM_MAX_PEERS", defaults.max_peers_per_topic)?,
            heartbeat_interval_secs: parse(&lookup, "TANDEM_HEARTBEAT_SECS", defaults.heartbeat_interval_secs)?,
        })
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.relay_addr.clone(),
            max_peers_per_topic: self.max_peers_per_topic,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.data_dir)
    }
}

fn parse<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.relay_addr, "127.0.0.1:9090");
        assert_eq!(config.http_addr, "127.0.0.1:8080");
        assert_eq!(config.data_dir, PathBuf::from("./tandem_data"));
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.max_peers_per_topic, 100);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TANDEM_RELAY_ADDR", "0.0.0.0:7000"),
            ("TANDEM_DATA_DIR", "/var/lib/tandem"),
            ("TANDEM_MAX_PEERS", " 8 "),
            ("TANDEM_HEARTBEAT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.relay_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_topic, 8);

        let server = config.server_config();
        assert_eq!(server.bind_addr, "0.0.0.0:7000");
        assert_eq!(server.heartbeat_interval_secs, 5);
        assert_eq!(config.store_config().path, PathBuf::from("/var/lib/tandem"));
    }

    #[test]
    fn test_invalid_number() {
        let err = Config::from_lookup(lookup(&[("TANDEM_BROADCAST_CAPACITY", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                name: "TANDEM_BROADCAST_CAPACITY",
                value: "lots".to_string()
            }
        );
        assert!(err.to_string().contains("TANDEM_BROADCAST_CAPACITY"));
    }
}
