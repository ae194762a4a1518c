//! Endpoint configuration.
//!
//! [`ConfigFile`] is the on-disk format (JSON, or TOML for `.toml` files);
//! [`Config`] is the validated runtime snapshot shared by every handler.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{new_codec, Codec, Direction, MasterKey, Method};
use crate::error::{Error, Result};

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Remote endpoint host
    pub server: String,
    /// Remote endpoint port
    pub server_port: u16,
    /// Local SOCKS5 listen address
    pub local_address: String,
    /// Local SOCKS5 listen port
    pub local_port: u16,
    /// Transport cipher
    pub method: Method,
    /// Key derived from the password
    pub key: MasterKey,
    /// Idle time after which a connection is dropped
    pub timeout: Duration,
    /// Hosts the local endpoint reaches without the tunnel
    pub direct_hosts: Vec<String>,
    /// Upper bound for one DNS lookup
    pub dns_timeout: Duration,
    /// How long DNS answers are reused
    pub dns_cache_ttl: Duration,
}

impl Config {
    /// Configuration for a tunnel to `server:server_port` with defaults for
    /// everything else.
    pub fn new(server: impl Into<String>, server_port: u16, password: &str) -> Result<Self> {
        let file = ConfigFile {
            server: server.into(),
            server_port,
            password: Some(password.to_string()),
            ..ConfigFile::default()
        };
        file.to_config()
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        ConfigFile::load(path)?.to_config()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("server cannot be empty"));
        }
        if self.server_port == 0 {
            return Err(Error::config("server_port cannot be 0"));
        }
        if self.local_address.is_empty() {
            return Err(Error::config("local_address cannot be empty"));
        }
        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be at least one second"));
        }
        if self.dns_timeout.is_zero() {
            return Err(Error::config("dns_timeout must be at least one second"));
        }
        if self.direct_hosts.iter().any(|h| h.trim().is_empty()) {
            return Err(Error::config("direct_hosts cannot contain empty entries"));
        }
        Ok(())
    }

    /// Fresh transport codec bound to `direction`.
    pub fn codec(&self, direction: Direction) -> Codec {
        Codec::new(direction, new_codec(self.method, &self.key))
    }

    /// Address the local endpoint listens on.
    pub fn local_listen_addr(&self) -> Result<SocketAddr> {
        first_addr(&self.local_address, self.local_port)
    }

    /// Address the remote endpoint listens on.
    pub fn server_listen_addr(&self) -> Result<SocketAddr> {
        first_addr(&self.server, self.server_port)
    }
}

fn first_addr(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::config(format!("{}:{} does not resolve", host, port)))
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    /// Remote endpoint host
    pub server: String,
    /// Remote endpoint port
    pub server_port: u16,
    /// Local SOCKS5 listen address
    pub local_address: String,
    /// Local SOCKS5 listen port
    pub local_port: u16,
    /// Shared password
    pub password: Option<String>,
    /// Transport cipher name
    pub method: String,
    /// Idle timeout (seconds)
    pub timeout: u64,
    /// Domain suffixes and IP literals reached without the tunnel
    pub direct_hosts: Vec<String>,
    /// DNS lookup timeout (seconds)
    pub dns_timeout: u64,
    /// DNS cache lifetime (seconds)
    pub dns_cache_ttl: u64,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            server: String::new(),
            server_port: 0,
            local_address: "127.0.0.1".into(),
            local_port: 1080,
            password: None,
            method: Method::default().name().into(),
            timeout: 300,
            direct_hosts: Vec::new(),
            dns_timeout: 5,
            dns_cache_ttl: 300,
        }
    }
}

impl ConfigFile {
    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::config(format!("invalid JSON: {}", e)))
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid TOML: {}", e)))
    }

    /// Read a file; `.toml` files are TOML, anything else JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&text),
            _ => Self::from_json(&text),
        }
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<Config> {
        let method: Method = self.method.parse()?;
        let key = match (&self.password, method) {
            (Some(password), _) if !password.is_empty() => MasterKey::from_password(password)?,
            (_, Method::Plain) => MasterKey::from_bytes([0u8; crate::crypto::KEY_SIZE]),
            _ => return Err(Error::config("password is required")),
        };

        let config = Config {
            server: self.server.clone(),
            server_port: self.server_port,
            local_address: self.local_address.clone(),
            local_port: self.local_port,
            method,
            key,
            timeout: Duration::from_secs(self.timeout),
            direct_hosts: self.direct_hosts.clone(),
            dns_timeout: Duration::from_secs(self.dns_timeout),
            dns_cache_ttl: Duration::from_secs(self.dns_cache_ttl),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_defaults() {
        let file = ConfigFile::from_json(
            r#"{"server": "203.0.113.9", "server_port": 8388, "password": "pw"}"#,
        )
        .unwrap();
        let config = file.to_config().unwrap();

        assert_eq!(config.local_address, "127.0.0.1");
        assert_eq!(config.local_port, 1080);
        assert_eq!(config.method, Method::ChaCha20IetfPoly1305);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.dns_timeout, Duration::from_secs(5));
        assert!(config.direct_hosts.is_empty());
        assert_eq!(config.key, MasterKey::from_password("pw").unwrap());
    }

    #[test]
    fn test_toml() {
        let file = ConfigFile::from_toml(
            r#"
            server = "tunnel.example.net"
            server_port = 8388
            local_port = 1090
            method = "plain"
            timeout = 60
            direct_hosts = ["lan", "10.0.0.1"]
            "#,
        )
        .unwrap();
        let config = file.to_config().unwrap();

        assert_eq!(config.local_port, 1090);
        assert_eq!(config.method, Method::Plain);
        assert_eq!(config.direct_hosts, vec!["lan".to_string(), "10.0.0.1".to_string()]);
    }

    #[test]
    fn test_validation() {
        let missing_password =
            ConfigFile::from_json(r#"{"server": "a", "server_port": 1}"#).unwrap();
        assert!(missing_password.to_config().is_err());

        let no_server = ConfigFile {
            password: Some("pw".into()),
            server_port: 1,
            ..ConfigFile::default()
        };
        assert!(no_server.to_config().is_err());

        let zero_timeout = ConfigFile {
            server: "a".into(),
            server_port: 1,
            password: Some("pw".into()),
            timeout: 0,
            ..ConfigFile::default()
        };
        assert!(zero_timeout.to_config().is_err());

        let bad_method = ConfigFile {
            server: "a".into(),
            server_port: 1,
            password: Some("pw".into()),
            method: "rc4".into(),
            ..ConfigFile::default()
        };
        assert!(matches!(bad_method.to_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(ConfigFile::from_json(r#"{"server": "a", "sever_port": 1}"#).is_err());
    }

    #[test]
    fn test_listen_addrs() {
        let mut config = Config::new("127.0.0.1", 8388, "pw").unwrap();
        config.local_port = 0;

        assert_eq!(config.server_listen_addr().unwrap(), "127.0.0.1:8388".parse().unwrap());
        assert_eq!(config.local_listen_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = std::env::temp_dir();
        let json = dir.join(format!("sstunnel-test-{}.json", std::process::id()));
        let toml = dir.join(format!("sstunnel-test-{}.toml", std::process::id()));
        std::fs::write(&json, r#"{"server": "a", "server_port": 2, "password": "x"}"#).unwrap();
        std::fs::write(&toml, "server = \"b\"\nserver_port = 3\npassword = \"y\"\n").unwrap();

        assert_eq!(Config::load(&json).unwrap().server, "a");
        assert_eq!(Config::load(&toml).unwrap().server_port, 3);

        std::fs::remove_file(json).unwrap();
        std::fs::remove_file(toml).unwrap();
    }
}
