//! Deployment configuration: the two redundant key sources and the timeouts applied to them.
//!
//! Values come from an optional file (`.json` or TOML) and are then overridden by environment
//! variables:
//!
//! * `DUALKEY_PRIMARY_ADDR`, `DUALKEY_PRIMARY_STORE`, `DUALKEY_PRIMARY_INDEX`
//! * `DUALKEY_SECONDARY_ADDR`, `DUALKEY_SECONDARY_STORE`, `DUALKEY_SECONDARY_INDEX`
//! * `DUALKEY_CONNECT_TIMEOUT_MS`, `DUALKEY_IO_TIMEOUT_MS`, `DUALKEY_OPERATION_TIMEOUT_MS`

use crate::client::KeyStoreClient;
use crate::coordinator::{RedundantFetcher, RedundantSources};
use crate::errors::{Error, Result};
use crate::materials::CustodyMaterialsManager;
use crate::types::{KeyLocation, KeySource};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:6123";
const ENV_PREFIX: &str = "DUALKEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub address: String,
    pub store_id: u8,
    pub key_index: u8,
}

impl EndpointConfig {
    pub fn source(&self) -> KeySource {
        KeySource::new(
            self.address.clone(),
            KeyLocation::new(self.store_id, self.key_index),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub io_ms: u64,
    pub operation_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 2_000,
            io_ms: 5_000,
            operation_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn io(&self) -> Duration {
        Duration::from_millis(self.io_ms)
    }

    pub fn operation(&self) -> Duration {
        Duration::from_millis(self.operation_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyConfig {
    pub primary: EndpointConfig,
    pub secondary: EndpointConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            primary: EndpointConfig {
                address: DEFAULT_ADDRESS.into(),
                store_id: 40,
                key_index: 1,
            },
            secondary: EndpointConfig {
                address: DEFAULT_ADDRESS.into(),
                store_id: 41,
                key_index: 1,
            },
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl CustodyConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// A config file overlaid with environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|err| {
            Error::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        if path.extension().map(|ext| ext == "json").unwrap_or(false) {
            serde_json::from_str(&data).map_err(|err| {
                Error::Config(format!("invalid json config {}: {err}", path.display()))
            })
        } else {
            toml::from_str(&data).map_err(|err| {
                Error::Config(format!("invalid toml config {}: {err}", path.display()))
            })
        }
    }

    pub fn apply_env(&mut self) -> Result<()> {
        for (role, endpoint) in [
            ("PRIMARY", &mut self.primary),
            ("SECONDARY", &mut self.secondary),
        ] {
            if let Some(address) = env_string(&format!("{ENV_PREFIX}_{role}_ADDR")) {
                endpoint.address = address;
            }
            if let Some(store_id) = env_parse(&format!("{ENV_PREFIX}_{role}_STORE"))? {
                endpoint.store_id = store_id;
            }
            if let Some(key_index) = env_parse(&format!("{ENV_PREFIX}_{role}_INDEX"))? {
                endpoint.key_index = key_index;
            }
        }
        if let Some(ms) = env_parse(&format!("{ENV_PREFIX}_CONNECT_TIMEOUT_MS"))? {
            self.timeouts.connect_ms = ms;
        }
        if let Some(ms) = env_parse(&format!("{ENV_PREFIX}_IO_TIMEOUT_MS"))? {
            self.timeouts.io_ms = ms;
        }
        if let Some(ms) = env_parse(&format!("{ENV_PREFIX}_OPERATION_TIMEOUT_MS"))? {
            self.timeouts.operation_ms = ms;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (field, endpoint) in [("primary", &self.primary), ("secondary", &self.secondary)] {
            if endpoint.address.trim().is_empty() {
                return Err(Error::Config(format!("{field}.address must not be empty")));
            }
        }
        for (field, value) in [
            ("timeouts.connect_ms", self.timeouts.connect_ms),
            ("timeouts.io_ms", self.timeouts.io_ms),
            ("timeouts.operation_ms", self.timeouts.operation_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{field} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn sources(&self) -> RedundantSources {
        RedundantSources::new(self.primary.source(), self.secondary.source())
    }

    pub fn client(&self) -> KeyStoreClient {
        KeyStoreClient::builder()
            .connect_timeout(self.timeouts.connect())
            .io_timeout(self.timeouts.io())
            .build()
    }

    pub fn fetcher(&self) -> RedundantFetcher {
        RedundantFetcher::new(self.client(), self.sources())
            .with_operation_timeout(self.timeouts.operation())
    }

    pub fn materials_manager(&self) -> CustodyMaterialsManager {
        CustodyMaterialsManager::new(self.fetcher())
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_string(name)
        .map(|value| {
            value
                .parse()
                .map_err(|err| Error::Config(format!("{name}={value}: {err}")))
        })
        .transpose()
}
