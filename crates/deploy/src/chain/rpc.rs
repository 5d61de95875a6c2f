//! JSON-RPC implementation of [`ChainClient`].

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloy_consensus::{SignableTransaction, TxEnvelope, TxLegacy};
use alloy_core::primitives::{Address, B256, Bytes, TxKind, U64, U128, U256};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use backon::{ConstantBuilder, Retryable};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use url::Url;

use super::{ChainClient, PreparedTx, Receipt, TxRequest, TxStatus};
use crate::error::ChainError;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gas estimates are padded by this percentage before signing.
const GAS_LIMIT_MARGIN_PERCENT: u64 = 20;

/// How receipts are polled after a transaction is broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptPolling {
    /// Delay between two receipt lookups, in milliseconds.
    pub interval_ms: u64,
    /// Number of lookups before giving up.
    pub max_attempts: usize,
}

impl Default for ReceiptPolling {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_attempts: 180,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    status: Option<U64>,
    contract_address: Option<Address>,
    block_number: Option<U64>,
}

impl From<RpcReceipt> for Receipt {
    fn from(receipt: RpcReceipt) -> Self {
        Self {
            tx_hash: receipt.transaction_hash,
            // Pre-byzantium receipts carry no status field.
            success: receipt.status.is_none_or(|status| status == U64::from(1)),
            contract_address: receipt.contract_address,
            block_number: receipt.block_number.map(|n| n.to::<u64>()),
        }
    }
}

/// A [`ChainClient`] backed by an HTTP JSON-RPC endpoint.
///
/// Transactions from accounts with a local key are signed here and sent with
/// `eth_sendRawTransaction`. Any other sender is assumed to be unlocked on the
/// node (dev networks) and goes through `eth_sendTransaction`.
pub struct RpcChainClient {
    client: reqwest::Client,
    url: Url,
    chain_id: u64,
    signers: HashMap<Address, PrivateKeySigner>,
    polling: ReceiptPolling,
    request_id: AtomicU64,
}

impl RpcChainClient {
    /// Connect to `url`, fetching the chain id from the node.
    pub async fn connect(
        url: &str,
        signers: impl IntoIterator<Item = PrivateKeySigner>,
        polling: ReceiptPolling,
    ) -> Result<Self, ChainError> {
        let url = Url::parse(url).map_err(|e| ChainError::Transport {
            method: "connect".to_string(),
            source: anyhow::anyhow!("invalid RPC url {url}: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ChainError::Transport {
                method: "connect".to_string(),
                source: e.into(),
            })?;

        let mut rpc = Self {
            client,
            url,
            chain_id: 0,
            signers: signers
                .into_iter()
                .map(|signer| (signer.address(), signer))
                .collect(),
            polling,
            request_id: AtomicU64::new(1),
        };

        let chain_id: U64 = rpc.json_rpc_call("eth_chainId", vec![]).await?;
        rpc.chain_id = chain_id.to::<u64>();

        tracing::debug!(
            url = %rpc.url,
            chain_id = rpc.chain_id,
            local_signers = rpc.signers.len(),
            "Connected to RPC endpoint"
        );

        Ok(rpc)
    }

    /// Make a JSON-RPC call and deserialize the result.
    async fn json_rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, ChainError> {
        let transport = |source: anyhow::Error| ChainError::Transport {
            method: method.to_string(),
            source,
        };

        let response = self
            .client
            .post(self.url.clone())
            .json(&json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": self.request_id.fetch_add(1, Ordering::Relaxed),
            }))
            .send()
            .await
            .map_err(|e| transport(e.into()))?;

        let result: Value = response.json().await.map_err(|e| transport(e.into()))?;

        if let Some(error) = result.get("error") {
            return Err(ChainError::Rpc {
                method: method.to_string(),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }

        let result_value = result
            .get("result")
            .cloned()
            .ok_or_else(|| transport(anyhow::anyhow!("no result in response")))?;

        serde_json::from_value(result_value).map_err(|e| transport(e.into()))
    }

    fn tx_json(tx: &TxRequest) -> Value {
        let mut object = Map::new();
        object.insert("from".to_string(), json!(tx.from));
        if let Some(to) = tx.to {
            object.insert("to".to_string(), json!(to));
        }
        object.insert("data".to_string(), json!(tx.input));
        object.insert("value".to_string(), json!(tx.value));
        Value::Object(object)
    }

    async fn prepare_signed(
        &self,
        signer: &PrivateKeySigner,
        tx: TxRequest,
    ) -> Result<PreparedTx, ChainError> {
        let nonce: U64 = self
            .json_rpc_call(
                "eth_getTransactionCount",
                vec![json!(tx.from), json!("pending")],
            )
            .await?;
        let gas_price: U128 = self.json_rpc_call("eth_gasPrice", vec![]).await?;
        let estimate: U64 = self
            .json_rpc_call("eth_estimateGas", vec![Self::tx_json(&tx)])
            .await?;
        let gas_limit = estimate.to::<u64>() * (100 + GAS_LIMIT_MARGIN_PERCENT) / 100;

        let legacy = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: nonce.to::<u64>(),
            gas_price: gas_price.to::<u128>(),
            gas_limit,
            to: tx.to.map_or(TxKind::Create, TxKind::Call),
            value: tx.value,
            input: tx.input.clone(),
        };
        let (tx_hash, raw) = sign_legacy(signer, legacy)?;

        tracing::trace!(
            from = %tx.from,
            nonce = nonce.to::<u64>(),
            gas_limit,
            %tx_hash,
            "Signed transaction"
        );

        Ok(PreparedTx {
            request: tx,
            tx_hash: Some(tx_hash),
            raw: Some(raw),
        })
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<Receipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .json_rpc_call("eth_getTransactionReceipt", vec![json!(tx_hash)])
            .await?;
        Ok(receipt.map(Receipt::from))
    }
}

impl ChainClient for RpcChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn prepare_transaction(&self, tx: TxRequest) -> Result<PreparedTx, ChainError> {
        match self.signers.get(&tx.from) {
            Some(signer) => self.prepare_signed(signer, tx).await,
            None => Ok(PreparedTx::unsigned(tx)),
        }
    }

    async fn broadcast(&self, tx: PreparedTx) -> Result<B256, ChainError> {
        let tx_hash: B256 = match &tx.raw {
            Some(raw) => {
                self.json_rpc_call("eth_sendRawTransaction", vec![json!(raw)])
                    .await?
            }
            None => {
                self.json_rpc_call("eth_sendTransaction", vec![Self::tx_json(&tx.request)])
                    .await?
            }
        };

        if let Some(expected) = tx.tx_hash
            && expected != tx_hash
        {
            tracing::warn!(%expected, returned = %tx_hash, "Node reported a different transaction hash");
        }
        Ok(tx_hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ChainError> {
        if let Some(receipt) = self.receipt(tx_hash).await? {
            return Ok(TxStatus::Confirmed(receipt));
        }

        let tx: Option<Value> = self
            .json_rpc_call("eth_getTransactionByHash", vec![json!(tx_hash)])
            .await?;

        Ok(match tx {
            Some(_) => TxStatus::Pending,
            None => TxStatus::Unknown,
        })
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, ChainError> {
        let fetch = || async move {
            match self.receipt(tx_hash).await? {
                Some(receipt) => Ok(receipt),
                None => Err(ChainError::Timeout(tx_hash)),
            }
        };

        fetch
            .retry(
                ConstantBuilder::default()
                    .with_delay(Duration::from_millis(self.polling.interval_ms))
                    .with_max_times(self.polling.max_attempts),
            )
            .when(|e| matches!(e, ChainError::Timeout(_)))
            .notify(|_, delay| {
                tracing::trace!(%tx_hash, ?delay, "Receipt not available yet, retrying...");
            })
            .await
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ChainError> {
        self.json_rpc_call(
            "eth_call",
            vec![json!({ "to": to, "data": input }), json!("latest")],
        )
        .await
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.json_rpc_call("eth_getCode", vec![json!(address), json!("latest")])
            .await
    }

    async fn balance_of(&self, address: Address) -> Result<U256, ChainError> {
        self.json_rpc_call("eth_getBalance", vec![json!(address), json!("latest")])
            .await
    }
}

/// Sign a legacy EIP-155 transaction, returning its hash and raw encoding.
fn sign_legacy(signer: &PrivateKeySigner, legacy: TxLegacy) -> Result<(B256, Bytes), ChainError> {
    let signature = signer
        .sign_hash_sync(&legacy.signature_hash())
        .map_err(|e| ChainError::Signing(e.to_string()))?;
    let signed = legacy.into_signed(signature);
    let tx_hash = *signed.hash();
    let raw = Bytes::from(TxEnvelope::from(signed).encoded_2718());
    Ok((tx_hash, raw))
}
