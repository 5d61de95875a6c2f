//! Chain interaction layer.
//!
//! The provisioning core only talks to the chain through [`ChainClient`]. Retry
//! and timeout policy for the underlying network calls belongs to the
//! implementation, the core only interprets success, failure and "already done".

use std::future::Future;

use alloy_core::primitives::{Address, B256, Bytes, U256};

use crate::error::ChainError;

pub mod mock;
mod rpc;

pub use mock::{Effect, MockChain};
pub use rpc::{ReceiptPolling, RpcChainClient};

/// A transaction to broadcast. `to == None` creates a contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Option<Address>,
    pub input: Bytes,
    pub value: U256,
}

impl TxRequest {
    /// A contract creation carrying bytecode and encoded constructor args.
    pub fn create(from: Address, input: Bytes) -> Self {
        Self {
            from,
            to: None,
            input,
            value: U256::ZERO,
        }
    }

    /// A state-changing call to a deployed contract.
    pub fn call(from: Address, to: Address, input: Bytes) -> Self {
        Self {
            from,
            to: Some(to),
            input,
            value: U256::ZERO,
        }
    }

    /// A plain native-currency transfer.
    pub fn transfer(from: Address, to: Address, value: U256) -> Self {
        Self {
            from,
            to: Some(to),
            input: Bytes::new(),
            value,
        }
    }
}

/// A transaction ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTx {
    pub request: TxRequest,
    /// Known before broadcast when the transaction is signed locally. Senders
    /// unlocked on the node only learn the hash from the broadcast reply.
    pub tx_hash: Option<B256>,
    /// Signed encoding, `None` when the node signs.
    pub raw: Option<Bytes>,
}

impl PreparedTx {
    /// A transaction the node signs on broadcast.
    pub fn unsigned(request: TxRequest) -> Self {
        Self {
            request,
            tx_hash: None,
            raw: None,
        }
    }
}

/// The mined outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: B256,
    pub success: bool,
    pub contract_address: Option<Address>,
    pub block_number: Option<u64>,
}

/// What the node currently knows about a transaction hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    /// The node has never seen the transaction, or has dropped it.
    Unknown,
    /// Broadcast, not yet mined.
    Pending,
    Confirmed(Receipt),
}

/// Access to an EVM chain.
pub trait ChainClient: Send + Sync {
    /// Chain id of the connected network.
    fn chain_id(&self) -> u64;

    /// Sign `tx` locally when possible, fixing its hash before anything is sent.
    fn prepare_transaction(
        &self,
        tx: TxRequest,
    ) -> impl Future<Output = Result<PreparedTx, ChainError>> + Send;

    /// Broadcast a prepared transaction, returning its hash without waiting
    /// for it. An error does not prove the node never received it.
    fn broadcast(&self, tx: PreparedTx) -> impl Future<Output = Result<B256, ChainError>> + Send;

    /// Prepare and broadcast `tx` in one go.
    fn send_transaction(
        &self,
        tx: TxRequest,
    ) -> impl Future<Output = Result<B256, ChainError>> + Send {
        async move {
            let prepared = self.prepare_transaction(tx).await?;
            self.broadcast(prepared).await
        }
    }

    fn transaction_status(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<TxStatus, ChainError>> + Send;

    /// Wait until the transaction is mined.
    fn wait_for_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Receipt, ChainError>> + Send;

    /// Read-only call against the latest block.
    fn call(
        &self,
        to: Address,
        input: Bytes,
    ) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    fn code_at(&self, address: Address) -> impl Future<Output = Result<Bytes, ChainError>> + Send;

    fn balance_of(&self, address: Address)
    -> impl Future<Output = Result<U256, ChainError>> + Send;
}
