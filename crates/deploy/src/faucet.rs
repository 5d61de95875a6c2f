//! Faucet for dev accounts: mints mock collateral and sends native currency.

use alloy_core::primitives::{Address, B256};
use anyhow::{Context, Result};

use crate::{
    abi::{self, AbiArg},
    accounts::NamedAccounts,
    chain::{ChainClient, TxRequest},
    config::NetworkConfig,
    registry::ArtifactRegistry,
};

/// Result of a faucet run.
#[derive(Debug, Default)]
pub struct FundReport {
    /// `(artifact, tx_hash)` of every mint.
    pub minted: Vec<(String, B256)>,
    /// Native transfer transaction, if any amount was configured.
    pub native_tx: Option<B256>,
}

/// Fund `recipient` on a dev network.
///
/// Mints every configured mock collateral from the registry and then sends the
/// configured amount of native currency from the funder role.
pub async fn fund_account<C: ChainClient>(
    chain: &C,
    registry: &ArtifactRegistry,
    accounts: &NamedAccounts,
    network: &NetworkConfig,
    recipient: Address,
) -> Result<FundReport> {
    if network.live {
        anyhow::bail!("Refusing to run the faucet on a live network");
    }

    let faucet = &network.faucet;
    let funder = accounts
        .address(&faucet.funder)
        .context("Failed to resolve the faucet funder")?;
    let mut report = FundReport::default();

    for (symbol, amount) in &faucet.collateral {
        let artifact = network
            .protocol
            .pools
            .iter()
            .filter_map(|pool| {
                (pool.collateral.symbol() == symbol.as_str())
                    .then(|| pool.collateral.mock_artifact())
                    .flatten()
            })
            .next();

        let Some(artifact) = artifact else {
            tracing::warn!(%symbol, "No mock collateral configured for symbol, skipping");
            continue;
        };

        let token = registry
            .address(&artifact)
            .context(format!("Mock collateral {artifact} is not deployed"))?;
        let input = abi::encode_call("mint", &[AbiArg::Address(recipient), AbiArg::Uint(amount.0)]);
        let tx_hash = send_and_confirm(chain, TxRequest::call(funder, token, input))
            .await
            .context(format!("Failed to mint {artifact}"))?;

        tracing::info!(%artifact, %recipient, %amount, %tx_hash, "Minted mock collateral");
        report.minted.push((artifact, tx_hash));
    }

    if !faucet.native.0.is_zero() {
        let tx_hash = send_and_confirm(chain, TxRequest::transfer(funder, recipient, faucet.native.0))
            .await
            .context("Failed to send native currency")?;
        let balance = chain.balance_of(recipient).await?;

        tracing::info!(%recipient, amount = %faucet.native, %balance, %tx_hash, "Sent native currency");
        report.native_tx = Some(tx_hash);
    }

    Ok(report)
}

async fn send_and_confirm<C: ChainClient>(chain: &C, tx: TxRequest) -> Result<B256> {
    let tx_hash = chain.send_transaction(tx).await?;
    let receipt = chain.wait_for_receipt(tx_hash).await?;
    if !receipt.success {
        anyhow::bail!("Transaction {tx_hash} reverted");
    }
    Ok(tx_hash)
}
