//! Operator configuration.
//!
//! TOML file selected with `--config`. The Ethereum key-file password is
//! never read from the file; it comes from the `KEEP_ETHEREUM_PASSWORD`
//! environment variable.

use crate::foundation::{Address, OperatorError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const PASSWORD_ENV_VARIABLE: &str = "KEEP_ETHEREUM_PASSWORD";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "Ethereum", default)]
    pub ethereum: EthereumConfig,
    #[serde(rename = "Storage", default)]
    pub storage: StorageConfig,
    #[serde(rename = "LibP2P", default)]
    pub lib_p2p: LibP2PConfig,
    #[serde(rename = "SanctionedApplications", default)]
    pub sanctioned_applications: SanctionedApplicationsConfig,
    /// Interval between operator registration retries, e.g. `"500ms"`.
    #[serde(rename = "RegistrationTicker", default)]
    pub registration_ticker: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EthereumConfig {
    #[serde(rename = "URL", default)]
    pub url: String,
    #[serde(rename = "Account", default)]
    pub account: AccountConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AccountConfig {
    #[serde(rename = "KeyFile", default)]
    pub key_file: String,
    /// Sourced from the environment, never from the config file.
    #[serde(skip)]
    pub key_file_password: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "DataDir", default)]
    pub data_dir: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LibP2PConfig {
    #[serde(rename = "Port", default)]
    pub port: u16,
    #[serde(rename = "Peers", default)]
    pub peers: Vec<String>,
    #[serde(rename = "AnnouncedAddresses", default)]
    pub announced_addresses: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SanctionedApplicationsConfig {
    #[serde(rename = "Addresses", default)]
    pub addresses: Vec<String>,
}

impl SanctionedApplicationsConfig {
    /// The applications this operator serves, as validated addresses.
    pub fn parsed_addresses(&self) -> Result<Vec<Address>> {
        self.addresses
            .iter()
            .map(|raw| {
                raw.parse::<Address>().map_err(|_| {
                    OperatorError::Config(format!("application address [{}] is not a valid hex address", raw))
                })
            })
            .collect()
    }
}

impl Config {
    pub fn registration_ticker(&self) -> Result<Option<Duration>> {
        self.registration_ticker.as_deref().map(parse_duration).transpose()
    }

    /// Startup validation shared by every run mode.
    pub fn validate(&self) -> Result<()> {
        if self.storage.data_dir.is_empty() {
            return Err(OperatorError::Config("missing Storage.DataDir".to_string()));
        }
        self.sanctioned_applications.parsed_addresses()?;
        self.registration_ticker()?;
        Ok(())
    }
}

/// Reads the configuration file and injects the key-file password from the
/// environment.
pub fn read_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|err| OperatorError::Config(format!("failed to read file [{}]: {}", path.display(), err)))?;
    let mut config: Config = toml::from_str(&raw)
        .map_err(|err| OperatorError::Config(format!("failed to decode file [{}]: {}", path.display(), err)))?;
    config.ethereum.account.key_file_password = std::env::var(PASSWORD_ENV_VARIABLE).unwrap_or_default();
    Ok(config)
}

/// Parses duration strings of the `"90s"` / `"500ms"` / `"2m"` / `"1h"`
/// family.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (value, unit) = raw.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| OperatorError::Config(format!("invalid duration [{}]", raw)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(OperatorError::Config(format!("invalid duration unit in [{}]", raw))),
    }
}
