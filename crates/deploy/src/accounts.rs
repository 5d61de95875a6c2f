//! Named accounts.
//!
//! Deployment steps refer to signers by role (`deployer`, `creator`, ...). The
//! roles are resolved once per run into concrete addresses and, where
//! available, local signing keys.

use std::{collections::BTreeMap, str::FromStr};

use alloy_core::primitives::Address;
use alloy_signer_local::{MnemonicBuilder, PrivateKeySigner, coins_bip39::English};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// Where the key or address of a role comes from.
///
/// In TOML:
/// ```toml
/// [networks.localhost.accounts]
/// deployer = 1                                   # mnemonic index
/// treasury_admin = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8"
/// operator = { private_key_env = "OPERATOR_KEY" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AccountSource {
    /// Index on the standard `m/44'/60'/0'/0/{index}` path of the mnemonic.
    Index(u32),
    /// A fixed address with no local signer.
    Address(Address),
    /// A private key read from an environment variable.
    KeyEnv { private_key_env: String },
    /// An inline private key. Prefer [`AccountSource::KeyEnv`] outside dev networks.
    Key { private_key: String },
}

/// A resolved account.
#[derive(Debug, Clone)]
pub struct Account {
    pub role: String,
    pub address: Address,
    signer: Option<PrivateKeySigner>,
}

impl Account {
    pub fn signer(&self) -> Option<&PrivateKeySigner> {
        self.signer.as_ref()
    }
}

/// Role name to account mapping for one network.
#[derive(Debug, Clone, Default)]
pub struct NamedAccounts {
    accounts: BTreeMap<String, Account>,
}

impl NamedAccounts {
    /// Resolve every configured role.
    pub fn resolve(
        sources: &BTreeMap<String, AccountSource>,
        mnemonic: Option<&str>,
    ) -> Result<Self> {
        let mut accounts = BTreeMap::new();

        for (role, source) in sources {
            let (address, signer) = match source {
                AccountSource::Index(index) => {
                    let phrase = mnemonic.ok_or_else(|| {
                        DeployError::InvalidArgument(format!(
                            "account `{role}` uses mnemonic index {index} but no mnemonic is configured"
                        ))
                    })?;
                    let signer = derive_from_mnemonic(phrase, *index)?;
                    (signer.address(), Some(signer))
                }
                AccountSource::Address(address) => (*address, None),
                AccountSource::KeyEnv { private_key_env } => {
                    let key = std::env::var(private_key_env).map_err(|_| {
                        DeployError::InvalidArgument(format!(
                            "account `{role}` reads its key from `{private_key_env}`, which is not set"
                        ))
                    })?;
                    let signer = parse_private_key(role, &key)?;
                    (signer.address(), Some(signer))
                }
                AccountSource::Key { private_key } => {
                    let signer = parse_private_key(role, private_key)?;
                    (signer.address(), Some(signer))
                }
            };

            tracing::debug!(role = %role, address = %address, has_signer = signer.is_some(), "Resolved named account");

            accounts.insert(
                role.clone(),
                Account {
                    role: role.clone(),
                    address,
                    signer,
                },
            );
        }

        Ok(Self { accounts })
    }

    /// Accounts that only carry an address, e.g. unlocked dev-node accounts.
    pub fn from_addresses<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Address)>,
        S: Into<String>,
    {
        let accounts = entries
            .into_iter()
            .map(|(role, address)| {
                let role = role.into();
                (
                    role.clone(),
                    Account {
                        role,
                        address,
                        signer: None,
                    },
                )
            })
            .collect();
        Self { accounts }
    }

    pub fn get(&self, role: &str) -> Result<&Account> {
        self.accounts
            .get(role)
            .ok_or_else(|| DeployError::UnknownAccount(role.to_string()))
    }

    pub fn address(&self, role: &str) -> Result<Address> {
        self.get(role).map(|account| account.address)
    }

    /// The local signer of `role`. Live networks have no unlocked accounts.
    pub fn require_signer(&self, role: &str) -> Result<&PrivateKeySigner> {
        self.get(role)?
            .signer()
            .ok_or_else(|| DeployError::MissingSigner(role.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Distinct local signers, one per address.
    pub fn signers(&self) -> Vec<PrivateKeySigner> {
        let mut by_address = BTreeMap::new();
        for account in self.accounts.values() {
            if let Some(signer) = &account.signer {
                by_address.entry(account.address).or_insert_with(|| signer.clone());
            }
        }
        by_address.into_values().collect()
    }
}

fn derive_from_mnemonic(phrase: &str, index: u32) -> Result<PrivateKeySigner> {
    MnemonicBuilder::<English>::default()
        .phrase(phrase.trim())
        .index(index)
        .and_then(|builder| builder.build())
        .map_err(|e| DeployError::InvalidArgument(format!("failed to derive account {index}: {e}")))
}

fn parse_private_key(role: &str, key: &str) -> Result<PrivateKeySigner> {
    PrivateKeySigner::from_str(key.trim())
        .map_err(|e| DeployError::InvalidArgument(format!("invalid private key for `{role}`: {e}")))
}
