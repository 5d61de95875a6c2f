use std::collections::BTreeSet;

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use comfy_table::{Table, presets::UTF8_FULL};

use crate::{
    ArtifactRegistry, ChainClient, ContractSource, DeployConfig, FundReport, NamedAccounts,
    NetworkConfig, Pipeline, PipelineStep, RpcChainClient, RunReport, StepFilter, build_plan,
    faucet,
};

/// Main deployer that provisions the protocol on one configured network.
#[derive(Debug, Clone)]
pub struct Deployer {
    pub config: DeployConfig,
    pub network_name: String,
    pub network: NetworkConfig,
}

/// On-chain state of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStatus {
    pub name: String,
    pub contract: String,
    pub address: Address,
    pub deployed: bool,
    /// Whether code is present at the recorded address.
    pub has_code: bool,
}

impl Deployer {
    pub fn new(config: DeployConfig, network: &str) -> Result<Self> {
        let network_config = config.network(network)?.clone();
        Ok(Self {
            config,
            network_name: network.to_string(),
            network: network_config,
        })
    }

    /// The protocol steps selected by `tags`, or by the network's default tags
    /// when `tags` is empty.
    pub fn steps(&self, tags: &[String]) -> Vec<PipelineStep> {
        let selected = if tags.is_empty() {
            self.network.tags.as_slice()
        } else {
            tags
        };
        StepFilter::new(selected.iter().cloned()).apply(build_plan(&self.network.protocol))
    }

    /// Resolve the named accounts of the network.
    pub fn accounts(&self) -> Result<NamedAccounts> {
        let mnemonic = self.config.mnemonic();
        NamedAccounts::resolve(&self.network.accounts, mnemonic.as_deref())
            .context(format!("Failed to resolve accounts for {}", self.network_name))
    }

    /// Connect to the network's RPC endpoint with every local signer loaded.
    pub async fn connect(&self, accounts: &NamedAccounts) -> Result<RpcChainClient> {
        let chain = RpcChainClient::connect(&self.network.url, accounts.signers(), self.config.polling)
            .await
            .context(format!("Failed to connect to {}", self.network.url))?;

        if let Some(expected) = self.network.chain_id
            && expected != chain.chain_id()
        {
            anyhow::bail!(
                "Network {} is configured for chain {expected} but {} reports chain {}",
                self.network_name,
                self.network.url,
                chain.chain_id()
            );
        }

        tracing::info!(
            network = %self.network_name,
            chain_id = chain.chain_id(),
            "Connected to network"
        );
        Ok(chain)
    }

    pub fn open_registry(&self, chain_id: u64) -> Result<ArtifactRegistry> {
        let dir = self.config.registry_dir(&self.network_name);
        ArtifactRegistry::open(&dir, chain_id)
            .context(format!("Failed to open artifact registry at {}", dir.display()))
    }

    /// Open the registry for reading while a deploy may hold the writer lock.
    pub fn open_registry_read_only(&self, chain_id: u64) -> Result<ArtifactRegistry> {
        let dir = self.config.registry_dir(&self.network_name);
        ArtifactRegistry::open_read_only(&dir, chain_id)
            .context(format!("Failed to read artifact registry at {}", dir.display()))
    }

    /// Deploy the selected steps against the configured network.
    pub async fn deploy(&self, tags: &[String]) -> Result<RunReport> {
        let accounts = self.accounts()?;
        if self.network.live {
            let roles = self
                .steps(tags)
                .iter()
                .map(|step| step.role().to_string())
                .collect::<BTreeSet<_>>();
            for role in roles {
                accounts
                    .require_signer(&role)
                    .context(format!("Network {} is live", self.network_name))?;
            }
        }
        let chain = self.connect(&accounts).await?;
        let contracts = ContractSource::from_dir(&self.config.artifacts);
        self.deploy_with(&chain, &accounts, &contracts, tags).await
    }

    /// Deploy the selected steps with an explicit chain client.
    pub async fn deploy_with<C: ChainClient>(
        &self,
        chain: &C,
        accounts: &NamedAccounts,
        contracts: &ContractSource,
        tags: &[String],
    ) -> Result<RunReport> {
        let steps = self.steps(tags);
        let mut registry = self.open_registry(chain.chain_id())?;

        tracing::info!(
            network = %self.network_name,
            steps = steps.len(),
            "Starting deployment..."
        );

        let report = Pipeline::new(chain, &mut registry, accounts, contracts)?
            .run(&steps)
            .await
            .context(format!("Deployment to {} failed", self.network_name))?;

        tracing::info!(
            deployed = report.deployed(),
            existing = report.existing(),
            applied = report.applied(),
            already_applied = report.already_applied(),
            "✓ Deployment complete!"
        );
        Ok(report)
    }

    /// Check every registry entry against the chain.
    pub async fn status(&self) -> Result<Vec<ArtifactStatus>> {
        let accounts = self.accounts()?;
        let chain = self.connect(&accounts).await?;
        self.status_with(&chain).await
    }

    pub async fn status_with<C: ChainClient>(&self, chain: &C) -> Result<Vec<ArtifactStatus>> {
        let registry = self.open_registry_read_only(chain.chain_id())?;

        let mut statuses = Vec::new();
        for artifact in registry.list().chain(registry.pending()) {
            let has_code = artifact.deployed && !chain.code_at(artifact.address).await?.is_empty();
            if artifact.deployed && !has_code {
                tracing::warn!(name = %artifact.name, address = %artifact.address, "No code at recorded address");
            }
            statuses.push(ArtifactStatus {
                name: artifact.name.clone(),
                contract: artifact.contract.clone(),
                address: artifact.address,
                deployed: artifact.deployed,
                has_code,
            });
        }
        Ok(statuses)
    }

    /// Fund a dev account from the network's faucet settings.
    pub async fn fund(&self, recipient: Address) -> Result<FundReport> {
        let accounts = self.accounts()?;
        let chain = self.connect(&accounts).await?;
        let registry = self.open_registry_read_only(chain.chain_id())?;
        faucet::fund_account(&chain, &registry, &accounts, &self.network, recipient).await
    }
}

/// Tabular view of [`Deployer::status`].
pub fn status_table(statuses: &[ArtifactStatus]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["Name", "Contract", "Address", "State"]);
    for status in statuses {
        let state = match (status.deployed, status.has_code) {
            (false, _) => "pending",
            (true, true) => "deployed",
            (true, false) => "missing code",
        };
        table.add_row(vec![
            status.name.clone(),
            status.contract.clone(),
            status.address.to_string(),
            state.to_string(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployer(default_tags: &[&str]) -> Deployer {
        let mut config = DeployConfig::localhost();
        if let Some(network) = config.networks.get_mut("localhost") {
            network.tags = default_tags.iter().map(|tag| tag.to_string()).collect();
        }
        Deployer::new(config, "localhost").unwrap()
    }

    #[test]
    fn test_network_tags_are_the_default_selection() {
        let core = deployer(&["core"]).steps(&[]);
        assert!(!core.is_empty());
        assert!(core.iter().all(|step| step.tags.contains("core")));

        assert!(deployer(&["pool"]).steps(&[]).is_empty());
    }

    #[test]
    fn test_cli_tags_override_network_tags() {
        let steps = deployer(&["pool"]).steps(&["core".to_string()]);
        assert!(!steps.is_empty());
        assert!(steps.iter().all(|step| step.tags.contains("core")));
    }

    #[test]
    fn test_unknown_network() {
        assert!(Deployer::new(DeployConfig::localhost(), "mainnet").is_err());
    }
}
