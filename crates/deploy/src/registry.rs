//! Artifact registry.
//!
//! A per-network, name-keyed record of deployed contracts. Records are kept in
//! `<deployments>/<network>/<Name>.json`, one file per artifact, next to a
//! `.chainId` marker and the `.initializations.json` ledger.

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{Address, B256, Bytes, keccak256};
use serde::{Deserialize, Serialize};

use crate::{
    abi::{self, AbiArg},
    chain::{ChainClient, Receipt, TxRequest, TxStatus},
    error::{DeployError, Result},
    fs::FsHandler,
};

const CHAIN_ID_FILE: &str = ".chainId";
const LOCK_FILE: &str = ".lock";
const LEDGER_FILE: &str = ".initializations.json";

/// A deployed (or pending) contract instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub contract: String,
    /// Zero while the deployment is pending.
    pub address: Address,
    pub args: Vec<AbiArg>,
    pub transaction_hash: B256,
    pub bytecode_hash: B256,
    pub deployer: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// False between broadcast and confirmation.
    pub deployed: bool,
}

/// Ledger entry for one initializer of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationRecord {
    pub artifact: String,
    pub initializer: String,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
}

impl InitializationRecord {
    pub fn new(artifact: impl Into<String>, initializer: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            initializer: initializer.into(),
            applied: false,
            transaction_hash: None,
        }
    }
}

/// Everything needed to deploy one named contract instance.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub name: String,
    pub contract: String,
    pub from: Address,
    pub args: Vec<AbiArg>,
    pub bytecode: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// This call recorded a new deployment.
    Deployed(Artifact),
    /// A matching deployment was already recorded.
    Existing(Artifact),
}

impl DeployOutcome {
    pub fn artifact(&self) -> &Artifact {
        match self {
            Self::Deployed(artifact) | Self::Existing(artifact) => artifact,
        }
    }
}

/// Name-keyed store of deployed artifacts for a single network.
///
/// A registry opened from disk holds an exclusive lock on its directory until
/// it is dropped.
#[derive(Debug)]
pub struct ArtifactRegistry {
    chain_id: u64,
    dir: Option<PathBuf>,
    read_only: bool,
    _lock: Option<File>,
    artifacts: BTreeMap<String, Artifact>,
    initializations: BTreeMap<(String, String), InitializationRecord>,
}

impl ArtifactRegistry {
    /// Open (or create) the registry stored in `dir` for `chain_id`.
    pub fn open(dir: impl Into<PathBuf>, chain_id: u64) -> Result<Self> {
        let dir = dir.into();
        FsHandler::create_dir(&dir)?;
        let lock = FsHandler::lock_exclusive(&dir.join(LOCK_FILE))?;

        check_chain_id(&dir, chain_id)?;
        let (artifacts, initializations) = load_records(&dir)?;

        tracing::info!(
            path = %dir.display(),
            chain_id,
            artifacts = artifacts.len(),
            initializations = initializations.len(),
            "Opened artifact registry"
        );

        Ok(Self {
            chain_id,
            dir: Some(dir),
            read_only: false,
            _lock: Some(lock),
            artifacts,
            initializations,
        })
    }

    /// Open the registry in `dir` for reading, without taking the writer lock.
    ///
    /// A missing directory yields an empty registry. Any attempt to record a
    /// deployment or an initialization fails with [`DeployError::ReadOnly`].
    pub fn open_read_only(dir: impl Into<PathBuf>, chain_id: u64) -> Result<Self> {
        let dir = dir.into();
        let (artifacts, initializations) = if dir.is_dir() {
            if dir.join(CHAIN_ID_FILE).exists() {
                check_chain_id(&dir, chain_id)?;
            }
            load_records(&dir)?
        } else {
            Default::default()
        };

        tracing::debug!(
            path = %dir.display(),
            chain_id,
            artifacts = artifacts.len(),
            "Opened artifact registry read-only"
        );

        Ok(Self {
            chain_id,
            dir: Some(dir),
            read_only: true,
            _lock: None,
            artifacts,
            initializations,
        })
    }

    /// A registry that lives only for the current process.
    pub fn in_memory(chain_id: u64) -> Self {
        Self {
            chain_id,
            dir: None,
            read_only: false,
            _lock: None,
            artifacts: BTreeMap::new(),
            initializations: BTreeMap::new(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Look up a deployed artifact. Pending deployments are not returned.
    pub fn get(&self, name: &str) -> Result<&Artifact> {
        self.artifacts
            .get(name)
            .filter(|artifact| artifact.deployed)
            .ok_or_else(|| DeployError::NotFound(name.to_string()))
    }

    pub fn address(&self, name: &str) -> Result<Address> {
        self.get(name).map(|artifact| artifact.address)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Deployed artifacts in name order.
    pub fn list(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values().filter(|artifact| artifact.deployed)
    }

    /// Deployments broadcast but not yet confirmed.
    pub fn pending(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.values().filter(|artifact| !artifact.deployed)
    }

    /// Return the artifact recorded under `request.name`, deploying it first if
    /// needed. At most one creation transaction is sent per call.
    ///
    /// Locally signed deployments are recorded as pending before broadcast, so
    /// a lost reply is re-checked by the next call instead of redeployed.
    pub async fn deploy<C: ChainClient>(
        &mut self,
        chain: &C,
        request: DeployRequest,
    ) -> Result<DeployOutcome> {
        validate_name(&request.name)?;
        let bytecode_hash = keccak256(&request.bytecode);

        if let Some(existing) = self.artifacts.get(&request.name).cloned() {
            if existing.deployed {
                return check_existing(existing, &request, bytecode_hash)
                    .map(DeployOutcome::Existing);
            }

            if let Some(artifact) = self.resolve_pending(chain, existing).await? {
                check_existing(artifact.clone(), &request, bytecode_hash)?;
                return Ok(DeployOutcome::Deployed(artifact));
            }
        }

        let input = abi::encode_deploy(&request.bytecode, &request.args);
        let prepared = chain
            .prepare_transaction(TxRequest::create(request.from, input))
            .await?;

        let mut pending = Artifact {
            name: request.name,
            contract: request.contract,
            address: Address::ZERO,
            args: request.args,
            transaction_hash: prepared.tx_hash.unwrap_or_default(),
            bytecode_hash,
            deployer: request.from,
            block_number: None,
            deployed: false,
        };
        // Node-signed transactions only get a hash once broadcast.
        let recorded = prepared.tx_hash.is_some();
        if recorded {
            self.store(pending.clone())?;
        }

        let tx_hash = match chain.broadcast(prepared).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                if recorded {
                    tracing::warn!(
                        name = %pending.name,
                        tx_hash = %pending.transaction_hash,
                        "Broadcast failed, keeping pending record for the next run"
                    );
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            name = %pending.name,
            contract = %pending.contract,
            %tx_hash,
            "Deployment transaction sent"
        );

        if !recorded || pending.transaction_hash != tx_hash {
            pending.transaction_hash = tx_hash;
            self.store(pending.clone())?;
        }

        // A timeout leaves the pending record in place for the next run.
        let receipt = chain.wait_for_receipt(tx_hash).await?;
        if !receipt.success {
            self.discard(&pending.name)?;
            return Err(DeployError::TransactionFailure {
                context: format!("deployment of `{}`", pending.name),
                tx_hash,
            });
        }

        self.promote(pending, &receipt).map(DeployOutcome::Deployed)
    }

    /// Settle a deployment left pending by an earlier run.
    ///
    /// Returns the promoted artifact, or `None` if the record was discarded and
    /// the contract has to be deployed again.
    async fn resolve_pending<C: ChainClient>(
        &mut self,
        chain: &C,
        pending: Artifact,
    ) -> Result<Option<Artifact>> {
        let tx_hash = pending.transaction_hash;
        tracing::info!(name = %pending.name, %tx_hash, "Re-checking pending deployment");

        let receipt = match chain.transaction_status(tx_hash).await? {
            TxStatus::Confirmed(receipt) => Some(receipt),
            TxStatus::Pending => Some(chain.wait_for_receipt(tx_hash).await?),
            TxStatus::Unknown => None,
        };

        match receipt {
            Some(receipt) if receipt.success => self.promote(pending, &receipt).map(Some),
            Some(_) => {
                tracing::warn!(name = %pending.name, %tx_hash, "Pending deployment reverted, redeploying");
                self.discard(&pending.name)?;
                Ok(None)
            }
            None => {
                tracing::warn!(name = %pending.name, %tx_hash, "Pending deployment unknown to the node, redeploying");
                self.discard(&pending.name)?;
                Ok(None)
            }
        }
    }

    fn promote(&mut self, mut artifact: Artifact, receipt: &Receipt) -> Result<Artifact> {
        artifact.address =
            receipt
                .contract_address
                .ok_or_else(|| DeployError::TransactionFailure {
                    context: format!("deployment of `{}` returned no contract address", artifact.name),
                    tx_hash: receipt.tx_hash,
                })?;
        artifact.block_number = receipt.block_number;
        artifact.deployed = true;

        tracing::info!(
            name = %artifact.name,
            address = %artifact.address,
            block = ?artifact.block_number,
            "Contract deployed"
        );

        self.store(artifact.clone())?;
        Ok(artifact)
    }

    fn ensure_writable(&self) -> Result<()> {
        match (&self.dir, self.read_only) {
            (Some(dir), true) => Err(DeployError::ReadOnly(dir.display().to_string())),
            _ => Ok(()),
        }
    }

    fn store(&mut self, artifact: Artifact) -> Result<()> {
        self.ensure_writable()?;
        if let Some(dir) = &self.dir {
            FsHandler::write_json_atomic(&dir.join(format!("{}.json", artifact.name)), &artifact)?;
        }
        self.artifacts.insert(artifact.name.clone(), artifact);
        Ok(())
    }

    fn discard(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        if let Some(dir) = &self.dir {
            FsHandler::remove(&dir.join(format!("{name}.json")))?;
        }
        self.artifacts.remove(name);
        Ok(())
    }

    /// Ledger entry for the (artifact, initializer) pair, if any.
    pub fn initialization(&self, artifact: &str, initializer: &str) -> Option<&InitializationRecord> {
        self.initializations
            .get(&(artifact.to_string(), initializer.to_string()))
    }

    /// Insert or replace a ledger entry and persist the ledger.
    pub fn record_initialization(&mut self, record: InitializationRecord) -> Result<()> {
        self.ensure_writable()?;
        self.initializations.insert(
            (record.artifact.clone(), record.initializer.clone()),
            record,
        );

        if let Some(dir) = &self.dir {
            let ledger = self.initializations.values().collect::<Vec<_>>();
            FsHandler::write_json_atomic(&dir.join(LEDGER_FILE), &ledger)?;
        }
        Ok(())
    }

    pub fn initializations(&self) -> impl Iterator<Item = &InitializationRecord> {
        self.initializations.values()
    }
}

type Records = (
    BTreeMap<String, Artifact>,
    BTreeMap<(String, String), InitializationRecord>,
);

/// Read every artifact record and the initialization ledger from `dir`.
fn load_records(dir: &Path) -> Result<Records> {
    let mut artifacts = BTreeMap::new();
    let entries = std::fs::read_dir(dir).map_err(|e| DeployError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| DeployError::io(dir, e))?.path();
        let is_record = path.extension().is_some_and(|ext| ext == "json")
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| !name.starts_with('.'));
        if !is_record {
            continue;
        }
        let artifact: Artifact = FsHandler::read_json(&path)?;
        artifacts.insert(artifact.name.clone(), artifact);
    }

    let ledger_path = dir.join(LEDGER_FILE);
    let ledger: Vec<InitializationRecord> = if ledger_path.exists() {
        FsHandler::read_json(&ledger_path)?
    } else {
        Vec::new()
    };
    let initializations = ledger
        .into_iter()
        .map(|record| ((record.artifact.clone(), record.initializer.clone()), record))
        .collect();

    Ok((artifacts, initializations))
}

fn check_existing(
    existing: Artifact,
    request: &DeployRequest,
    bytecode_hash: B256,
) -> Result<Artifact> {
    if existing.args != request.args {
        return Err(DeployError::ConfigurationDrift {
            name: existing.name,
            recorded: existing.args,
            requested: request.args.clone(),
        });
    }

    if existing.contract != request.contract {
        tracing::warn!(
            name = %existing.name,
            recorded = %existing.contract,
            requested = %request.contract,
            "Artifact was deployed from a different contract, keeping existing deployment"
        );
    } else if existing.bytecode_hash != bytecode_hash {
        tracing::warn!(
            name = %existing.name,
            address = %existing.address,
            "Bytecode changed since deployment, keeping existing deployment"
        );
    }

    tracing::debug!(name = %existing.name, address = %existing.address, "Reusing deployment");
    Ok(existing)
}

fn check_chain_id(dir: &Path, chain_id: u64) -> Result<()> {
    let path = dir.join(CHAIN_ID_FILE);
    if !path.exists() {
        return FsHandler::write_atomic(&path, chain_id.to_string().as_bytes());
    }

    let content = std::fs::read_to_string(&path).map_err(|e| DeployError::io(&path, e))?;
    let recorded = content.trim().parse::<u64>().map_err(|e| {
        DeployError::InvalidArgument(format!("malformed chain id in {}: {e}", path.display()))
    })?;

    if recorded != chain_id {
        return Err(DeployError::ChainMismatch {
            path: dir.display().to_string(),
            recorded,
            connected: chain_id,
        });
    }
    Ok(())
}

/// Artifact names double as file names.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DeployError::InvalidArgument(format!(
            "artifact name `{name}` may only contain ASCII letters, digits, `_` and `-`"
        )))
    }
}
