//! Configuration management for the Redfire ACS

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AcsConfig {
    pub server: ServerConfig,
    pub cwmp: CwmpConfig,
    pub device: DeviceConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CwmpConfig {
    /// Hard cap on handling a single CWMP POST, in seconds
    pub session_timeout: u64,
    /// Periodic inform interval advertised to CPEs, in seconds
    pub inform_interval: u64,
}

impl Default for CwmpConfig {
    fn default() -> Self {
        Self {
            session_timeout: 30,
            inform_interval: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Maximum last-inform age before a device is marked offline, in seconds
    pub offline_threshold: u64,
    /// Liveness sweep cadence, in seconds
    pub sweep_interval: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            offline_threshold: 600,
            sweep_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://tr069_acs.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl AcsConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AcsConfig =
            toml::from_str(&contents).map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("ACS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config = AcsConfig::default_config();

        if let Ok(host) = settings.get_string("server.host") {
            config.server.host = host;
        }
        if let Ok(port) = settings.get_int("server.port") {
            config.server.port = port as u16;
        }
        if let Ok(url) = settings.get_string("database.url") {
            config.database.url = url;
        }
        if let Ok(timeout) = settings.get_int("cwmp.session_timeout") {
            config.cwmp.session_timeout = timeout as u64;
        }
        if let Ok(threshold) = settings.get_int("device.offline_threshold") {
            config.device.offline_threshold = threshold as u64;
        }
        if let Ok(level) = settings.get_string("logging.level") {
            config.logging.level = level;
        }

        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::parse("server.port must be non-zero"));
        }
        if self.cwmp.session_timeout == 0 {
            return Err(Error::parse("cwmp.session_timeout must be non-zero"));
        }
        if self.device.offline_threshold == 0 {
            return Err(Error::parse("device.offline_threshold must be non-zero"));
        }
        if self.device.sweep_interval == 0 {
            return Err(Error::parse("device.sweep_interval must be non-zero"));
        }
        if self.database.url.is_empty() {
            return Err(Error::parse("database.url must not be empty"));
        }
        Ok(())
    }
}
