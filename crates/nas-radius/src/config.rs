//! Client configuration (JSON via serde, teacher-style defaults).

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// One upstream RADIUS server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server IP address.
    pub address: String,

    /// Shared secret for this server.
    pub secret: String,

    /// Authentication port; `null` disables the auth service here.
    #[serde(default = "default_auth_port")]
    pub auth_port: Option<u16>,

    /// Accounting port; `null` disables the accounting service here.
    #[serde(default = "default_acct_port")]
    pub acct_port: Option<u16>,

    /// Concurrent in-flight request limit; 0 falls back to the global
    /// `req_limit` (0 there too = unlimited).
    #[serde(default)]
    pub req_limit: usize,

    /// Back-off after a failure, seconds; overrides the global
    /// `fail_time_secs` when set.
    #[serde(default)]
    pub fail_time_secs: Option<u64>,
}

fn default_auth_port() -> Option<u16> {
    Some(1812)
}

fn default_acct_port() -> Option<u16> {
    Some(1813)
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let _: IpAddr = self.address.parse().map_err(|e| {
            ConfigError::Invalid(format!("Invalid server address '{}': {}", self.address, e))
        })?;
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Server '{}' has an empty secret",
                self.address
            )));
        }
        if self.auth_port.is_none() && self.acct_port.is_none() {
            return Err(ConfigError::Invalid(format!(
                "Server '{}' offers neither authentication nor accounting",
                self.address
            )));
        }
        Ok(())
    }
}

/// AAA client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upstream servers.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Per-try response timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Sends per server before failing over (also the consecutive-timeout
    /// threshold that marks a server failed).
    #[serde(default = "default_max_try")]
    pub max_try: u32,

    /// Overall accounting deadline, seconds. While an interim update stays
    /// unanswered longer than this, the server is failed and the request
    /// reassigned; 0 means give up silently instead.
    #[serde(default = "default_acct_timeout")]
    pub acct_timeout_secs: u64,

    /// Maintain Acct-Delay-Time on retransmissions (forces identifier bump
    /// and re-signing).
    #[serde(default)]
    pub acct_delay_time: bool,

    /// Interim-Update interval, seconds; 0 disables interim records (local
    /// counters are still refreshed periodically).
    #[serde(default)]
    pub interim_interval_secs: u64,

    /// Skip an interim update when the session is within this margin of
    /// its absolute timeout, seconds.
    #[serde(default = "default_interim_safe_margin")]
    pub interim_safe_margin_secs: u64,

    /// Default server back-off after failure, seconds; 0 retries
    /// immediately.
    #[serde(default)]
    pub fail_time_secs: u64,

    /// Default per-server concurrent request limit; 0 = unlimited.
    #[serde(default)]
    pub req_limit: usize,

    /// NAS-Identifier attribute value.
    #[serde(default)]
    pub nas_identifier: Option<String>,

    /// NAS-IP-Address attribute value.
    #[serde(default)]
    pub nas_ip_address: Option<Ipv4Addr>,

    /// Log sent and received packets at debug level.
    #[serde(default)]
    pub verbose: bool,
}

fn default_timeout() -> u64 {
    3
}

fn default_max_try() -> u32 {
    3
}

fn default_acct_timeout() -> u64 {
    60
}

fn default_interim_safe_margin() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            servers: Vec::new(),
            timeout_secs: default_timeout(),
            max_try: default_max_try(),
            acct_timeout_secs: default_acct_timeout(),
            acct_delay_time: false,
            interim_interval_secs: 0,
            interim_safe_margin_secs: default_interim_safe_margin(),
            fail_time_secs: 0,
            req_limit: 0,
            nas_identifier: None,
            nas_ip_address: None,
            verbose: false,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: ClientConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs cannot be 0".into()));
        }
        if self.max_try == 0 {
            return Err(ConfigError::Invalid("max_try cannot be 0".into()));
        }
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Example configuration, as written when no config file exists yet.
    pub fn example() -> ClientConfig {
        ClientConfig {
            servers: vec![ServerConfig {
                address: "192.0.2.10".into(),
                secret: "change-me".into(),
                auth_port: Some(1812),
                acct_port: Some(1813),
                req_limit: 0,
                fail_time_secs: None,
            }],
            interim_interval_secs: 600,
            nas_identifier: Some("nas-1".into()),
            ..ClientConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"servers":[{"address":"192.0.2.1","secret":"s"}]}"#).unwrap();
        assert_eq!(config.timeout_secs, 3);
        assert_eq!(config.max_try, 3);
        assert_eq!(config.interim_safe_margin_secs, 10);
        assert_eq!(config.servers[0].auth_port, Some(1812));
        assert_eq!(config.servers[0].acct_port, Some(1813));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_disabled_service_port() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"servers":[{"address":"192.0.2.1","secret":"s","auth_port":null}]}"#,
        )
        .unwrap();
        assert_eq!(config.servers[0].auth_port, None);
        assert_eq!(config.servers[0].acct_port, Some(1813));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"servers":[{"address":"not-an-ip","secret":"s"}]}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let server = ServerConfig {
            address: "192.0.2.1".into(),
            secret: String::new(),
            auth_port: Some(1812),
            acct_port: Some(1813),
            req_limit: 0,
            fail_time_secs: None,
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_no_service_rejected() {
        let server = ServerConfig {
            address: "192.0.2.1".into(),
            secret: "s".into(),
            auth_port: None,
            acct_port: None,
            req_limit: 0,
            fail_time_secs: None,
        };
        assert!(server.validate().is_err());
    }

    #[test]
    fn test_example_roundtrip() {
        let example = ClientConfig::example();
        example.validate().unwrap();
        let json = serde_json::to_string(&example).unwrap();
        let parsed: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.servers.len(), 1);
        assert_eq!(parsed.interim_interval_secs, 600);
    }
}
