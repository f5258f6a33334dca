//! Server configuration.
//!
//! Settings come from an optional JSON file and are then overridden by
//! command line flags. Every field has a default so an empty object is a
//! valid configuration.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";
pub const DEFAULT_LISTEN_PORT: u16 = 1080;
pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 15;
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 4096;
/// Read from the working directory when no file is named on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "socks5d.json";

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address
    pub listen_ip: String,
    /// Listen port, 0 picks an ephemeral port
    pub listen_port: u16,
    /// Runtime worker threads
    pub workers: usize,
    /// Seconds a connection may spend negotiating before it is evicted
    pub handshake_timeout: u64,
    /// Largest chunk relayed per step
    pub relay_buffer_size: usize,
    /// Accept UDP ASSOCIATE requests
    pub udp_associate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_ip: DEFAULT_LISTEN_IP.to_owned(),
            listen_port: DEFAULT_LISTEN_PORT,
            workers: default_workers(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            udp_associate: true,
        }
    }
}

/// Two workers per available core.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(2)
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        info!("loading config file {}", path.display());

        let data = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Config::from_json(&data)
    }

    /// Load `path`, or `DEFAULT_CONFIG_FILE` if it exists, or fall back to
    /// the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        Config::load_or(path, Path::new(DEFAULT_CONFIG_FILE))
    }

    fn load_or(path: Option<&Path>, fallback: &Path) -> Result<Config> {
        match path {
            Some(path) => Config::load(path),
            None if fallback.is_file() => Config::load(fallback),
            None => Ok(Config::default()),
        }
    }

    pub fn from_json(data: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(data).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.handshake_timeout == 0 {
            return Err(Error::config("handshake_timeout must be at least 1 second"));
        }
        if self.relay_buffer_size == 0 {
            return Err(Error::config("relay_buffer_size must be at least 1 byte"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_ip
            .parse()
            .map_err(|_| Error::config(format!("invalid listen_ip {:?}", self.listen_ip)))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_addr().unwrap(), "127.0.0.1:1080".parse().unwrap());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(15));
        assert!(config.workers >= 2);
    }

    #[test]
    fn test_from_json() {
        let config = Config::from_json(
            r#"{
                "listen_ip": "::1",
                "listen_port": 9050,
                "workers": 3,
                "handshake_timeout": 5,
                "relay_buffer_size": 1024,
                "udp_associate": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen_addr().unwrap(), "[::1]:9050".parse().unwrap());
        assert_eq!(config.workers, 3);
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.relay_buffer_size, 1024);
        assert!(!config.udp_associate);
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.listen_ip = "localhost".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.handshake_timeout = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.relay_buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_json(r#"{"listen_host": "0.0.0.0"}"#).is_err());
    }

    #[test]
    fn test_load_or_default_file() {
        let dir = std::env::temp_dir().join(format!("socks5d-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let fallback = dir.join(DEFAULT_CONFIG_FILE);

        let config = Config::load_or(None, &fallback).unwrap();
        assert_eq!(config, Config::default());

        fs::write(&fallback, r#"{"listen_port": 1081}"#).unwrap();
        let config = Config::load_or(None, &fallback).unwrap();
        assert_eq!(config.listen_port, 1081);

        // a named file wins over the fallback
        let named = dir.join("named.json");
        fs::write(&named, r#"{"listen_port": 1082}"#).unwrap();
        let config = Config::load_or(Some(&named), &fallback).unwrap();
        assert_eq!(config.listen_port, 1082);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/socks5d.json").unwrap_err();
        assert!(err.to_string().starts_with("configuration error: cannot read"));
    }
}
