use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(
        default = "default_min_reconnect_time",
        deserialize_with = "deserialize_duration"
    )]
    pub min_reconnect_time: Duration,
    #[serde(
        default = "default_max_reconnect_time",
        deserialize_with = "deserialize_duration"
    )]
    pub max_reconnect_time: Duration,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub web: WebConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_migrations")]
    pub migrations: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            migrations: default_migrations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_server() -> String {
    "crowdsource.kahu.earth".to_string()
}

fn default_port() -> u16 {
    9900
}

fn default_min_reconnect_time() -> Duration {
    Duration::from_millis(100)
}

fn default_max_reconnect_time() -> Duration {
    Duration::from_millis(6000)
}

fn default_database() -> PathBuf {
    PathBuf::from("routecache.sqlite3")
}

fn default_migrations() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_bind() -> String {
    "127.0.0.1:3010".to_string()
}

/// Accepts a bare number of milliseconds or a humantime string ("250ms").
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => humantime::parse_duration(s.trim()).map_err(serde::de::Error::custom),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: default_port(),
            api_key: None,
            min_reconnect_time: default_min_reconnect_time(),
            max_reconnect_time: default_max_reconnect_time(),
            storage: StorageConfig::default(),
            web: WebConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    pub fn from_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_reconnect_time.is_zero() {
            return Err(ConfigError::Invalid(
                "min_reconnect_time must be positive".into(),
            ));
        }
        if self.min_reconnect_time > self.max_reconnect_time {
            return Err(ConfigError::Invalid(format!(
                "min_reconnect_time ({:?}) exceeds max_reconnect_time ({:?})",
                self.min_reconnect_time, self.max_reconnect_time
            )));
        }
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid("server must not be empty".into()));
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// Access credential for the collection service. May be filled in after
/// startup; the connector polls it until present.
#[derive(Debug, Clone, Default)]
pub struct Credential {
    inner: Arc<RwLock<Option<String>>>,
}

impl Credential {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial.filter(|k| !k.is_empty()))),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set(&self, key: Option<String>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = key.filter(|k| !k.is_empty());
    }
}
