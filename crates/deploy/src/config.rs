//! `Dnd.toml` configuration.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{
    accounts::AccountSource,
    chain::ReceiptPolling,
    plan::{Amount, ProtocolConfig},
};

/// The default name for the configuration file.
pub const CONFIG_FILENAME: &str = "Dnd.toml";

/// Prefix of environment variables overriding configuration keys.
///
/// Nested keys are separated by a double underscore, e.g.
/// `DND_NETWORKS__BSCTEST__URL`.
pub const ENV_PREFIX: &str = "DND_";

/// Top level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Directory holding compiled contract artifacts.
    pub artifacts: PathBuf,
    /// Directory holding one artifact registry per network.
    pub deployments: PathBuf,
    /// Mnemonic used by accounts configured with an index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
    /// Environment variable read when `mnemonic` is unset.
    pub mnemonic_env: String,
    pub polling: ReceiptPolling,
    pub networks: BTreeMap<String, NetworkConfig>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            artifacts: PathBuf::from("artifacts"),
            deployments: PathBuf::from("deployments"),
            mnemonic: None,
            mnemonic_env: "MNEMONIC".to_string(),
            polling: ReceiptPolling::default(),
            networks: BTreeMap::new(),
        }
    }
}

/// One target network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub url: String,
    /// Expected chain id. Checked against the node when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Live networks hold real value. Dev-only tasks refuse to run on them.
    #[serde(default)]
    pub live: bool,
    /// Step tags selected when none are given on the command line.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountSource>,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub faucet: FaucetConfig,
}

/// Amounts handed out by `dnd fund`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaucetConfig {
    /// Role sending the native currency and minting mock collateral.
    pub funder: String,
    /// Native currency, in wei.
    pub native: Amount,
    /// Mock collateral symbol to amount, in base units.
    pub collateral: BTreeMap<String, Amount>,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            funder: "deployer".to_string(),
            native: Amount::tokens(100, 18),
            collateral: BTreeMap::new(),
        }
    }
}

impl DeployConfig {
    /// Load the configuration from `path` (a file, or a directory holding
    /// [`CONFIG_FILENAME`]) layered with `DND_` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let config_path = if path.is_dir() {
            path.join(CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };

        if !config_path.exists() {
            anyhow::bail!("Configuration file not found: {}", config_path.display());
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context(format!("Failed to load config from {}", config_path.display()))?;

        tracing::info!(
            path = %config_path.display(),
            networks = config.networks.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    pub fn network(&self, name: &str) -> Result<&NetworkConfig> {
        self.networks.get(name).with_context(|| {
            format!(
                "Unknown network `{name}`, configured networks: {}",
                self.networks.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    /// Registry directory of a network.
    pub fn registry_dir(&self, network: &str) -> PathBuf {
        self.deployments.join(network)
    }

    /// The configured mnemonic, falling back to the `mnemonic_env` variable.
    pub fn mnemonic(&self) -> Option<String> {
        self.mnemonic
            .clone()
            .or_else(|| std::env::var(&self.mnemonic_env).ok())
            .filter(|phrase| !phrase.trim().is_empty())
    }

    /// A starting configuration for a local dev node.
    pub fn localhost() -> Self {
        let accounts = [
            ("deployer", 1),
            ("creator", 1),
            ("dev_fund", 1),
            ("pool_creator", 0),
            ("timelock_admin", 0),
        ]
        .into_iter()
        .map(|(role, index)| (role.to_string(), AccountSource::Index(index)))
        .collect();

        let network = NetworkConfig {
            url: "http://127.0.0.1:8545".to_string(),
            chain_id: Some(31337),
            live: false,
            tags: Vec::new(),
            accounts,
            protocol: ProtocolConfig {
                collateral_reserve: true,
                ..ProtocolConfig::default()
            },
            faucet: FaucetConfig::default(),
        };

        Self {
            networks: BTreeMap::from([("localhost".to_string(), network)]),
            ..Self::default()
        }
    }
}
