//! Post-deploy initialization calls that must take effect once.

use alloy_core::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::{
    abi::{self, AbiArg},
    chain::{ChainClient, TxRequest, TxStatus},
    error::{DeployError, Result},
    registry::{ArtifactRegistry, InitializationRecord},
};

/// A read-only call that tells whether an initializer already took effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    /// Getter name or full signature, e.g. `treasury` or `hasPool(address)`.
    pub getter: String,
    #[serde(default)]
    pub args: Vec<AbiArg>,
    /// Expected return value. `None` accepts any non-zero return data.
    #[serde(default)]
    pub expect: Option<AbiArg>,
}

impl Probe {
    /// `getter()` returns `true`.
    pub fn flag(getter: &str) -> Self {
        Self::equals(getter, vec![], AbiArg::Bool(true))
    }

    pub fn equals(getter: &str, args: Vec<AbiArg>, expect: impl Into<AbiArg>) -> Self {
        Self {
            getter: getter.to_string(),
            args,
            expect: Some(expect.into()),
        }
    }

    pub fn nonzero(getter: &str, args: Vec<AbiArg>) -> Self {
        Self {
            getter: getter.to_string(),
            args,
            expect: None,
        }
    }

    /// Run the probe against the contract at `target`.
    pub async fn is_satisfied<C: ChainClient>(&self, chain: &C, target: Address) -> Result<bool> {
        let output = chain
            .call(target, abi::encode_call(&self.getter, &self.args))
            .await?;

        Ok(match &self.expect {
            Some(expected) => output.as_ref() == abi::encode_params(std::slice::from_ref(expected)),
            None => output.iter().any(|byte| *byte != 0),
        })
    }
}

/// A state-changing call on a deployed artifact.
#[derive(Debug, Clone)]
pub struct Initializer {
    /// Name of the target artifact.
    pub artifact: String,
    /// Ledger key, unique per artifact.
    pub name: String,
    pub method: String,
    pub args: Vec<AbiArg>,
    pub from: Address,
    pub probe: Option<Probe>,
}

impl Initializer {
    fn label(&self) -> String {
        format!("{}.{}", self.artifact, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Applied { tx_hash: B256 },
    AlreadyApplied,
}

/// Apply `init` unless the ledger or chain state shows it already took effect.
///
/// Once the ledger marks an initializer applied it stays applied: a probe that
/// later disagrees only produces a warning.
pub async fn apply<C: ChainClient>(
    chain: &C,
    registry: &mut ArtifactRegistry,
    init: &Initializer,
) -> Result<InitOutcome> {
    let target = registry
        .get(&init.artifact)
        .map_err(|_| DeployError::MissingDependency {
            step: init.label(),
            dependency: init.artifact.clone(),
        })?
        .address;

    let mut record = registry
        .initialization(&init.artifact, &init.name)
        .cloned()
        .unwrap_or_else(|| InitializationRecord::new(&init.artifact, &init.name));

    if !record.applied
        && let Some(tx_hash) = record.transaction_hash
    {
        if settle_pending(chain, init, tx_hash).await? {
            record.applied = true;
            registry.record_initialization(record)?;
            return Ok(InitOutcome::AlreadyApplied);
        }
        record.transaction_hash = None;
    }

    if record.applied {
        if let Some(probe) = &init.probe
            && !probe.is_satisfied(chain, target).await?
        {
            tracing::warn!(
                initializer = %init.label(),
                getter = %probe.getter,
                "Ledger marks initializer as applied but chain state differs, not re-sending"
            );
        } else {
            tracing::debug!(initializer = %init.label(), "Already applied according to ledger");
        }
        return Ok(InitOutcome::AlreadyApplied);
    }

    if let Some(probe) = &init.probe
        && probe.is_satisfied(chain, target).await?
    {
        tracing::debug!(initializer = %init.label(), "Probe satisfied, skipping");
        record.applied = true;
        registry.record_initialization(record)?;
        return Ok(InitOutcome::AlreadyApplied);
    }

    let input = abi::encode_call(&init.method, &init.args);
    let prepared = chain
        .prepare_transaction(TxRequest::call(init.from, target, input))
        .await?;

    // Kept on a failed broadcast so the next run settles it before re-sending.
    record.transaction_hash = prepared.tx_hash;
    registry.record_initialization(record.clone())?;

    let tx_hash = chain.broadcast(prepared).await?;

    tracing::info!(
        initializer = %init.label(),
        method = %abi::signature(&init.method, &init.args),
        %tx_hash,
        "Initialization transaction sent"
    );

    if record.transaction_hash != Some(tx_hash) {
        record.transaction_hash = Some(tx_hash);
        registry.record_initialization(record.clone())?;
    }

    let receipt = chain.wait_for_receipt(tx_hash).await?;
    if !receipt.success {
        record.transaction_hash = None;
        registry.record_initialization(record)?;
        return Err(DeployError::TransactionFailure {
            context: init.label(),
            tx_hash,
        });
    }

    record.applied = true;
    registry.record_initialization(record)?;

    if let Some(probe) = &init.probe
        && !probe.is_satisfied(chain, target).await?
    {
        tracing::warn!(
            initializer = %init.label(),
            getter = %probe.getter,
            "Probe still unsatisfied after a successful call, check the probe definition"
        );
    }

    Ok(InitOutcome::Applied { tx_hash })
}

/// Whether a transaction recorded by an earlier run went through.
async fn settle_pending<C: ChainClient>(chain: &C, init: &Initializer, tx_hash: B256) -> Result<bool> {
    let receipt = match chain.transaction_status(tx_hash).await? {
        TxStatus::Confirmed(receipt) => receipt,
        TxStatus::Pending => chain.wait_for_receipt(tx_hash).await?,
        TxStatus::Unknown => {
            tracing::warn!(initializer = %init.label(), %tx_hash, "Recorded transaction unknown to the node");
            return Ok(false);
        }
    };

    if !receipt.success {
        tracing::warn!(initializer = %init.label(), %tx_hash, "Recorded transaction reverted");
    }
    Ok(receipt.success)
}
