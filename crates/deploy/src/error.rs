//! Error types for the provisioning core.

use alloy_core::primitives::B256;

use crate::abi::AbiArg;

/// Failures reported by a [`crate::ChainClient`].
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The node answered with a JSON-RPC error object.
    #[error("rpc error calling {method}: {message}")]
    Rpc { method: String, message: String },

    /// The request never produced a usable response.
    #[error("transport error calling {method}: {source}")]
    Transport {
        method: String,
        #[source]
        source: anyhow::Error,
    },

    /// A receipt did not show up within the polling budget.
    #[error("timed out waiting for receipt of {0}")]
    Timeout(B256),

    /// Local signing of a transaction failed.
    #[error("failed to sign transaction: {0}")]
    Signing(String),
}

/// Errors produced while provisioning a network.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Recorded constructor arguments differ from the requested ones.
    #[error(
        "configuration drift for `{name}`: recorded args {recorded:?} differ from requested {requested:?}"
    )]
    ConfigurationDrift {
        name: String,
        recorded: Vec<AbiArg>,
        requested: Vec<AbiArg>,
    },

    /// A step ran before one of the artifacts it reads was deployed.
    #[error("step `{step}` requires `{dependency}`, which is not deployed yet")]
    MissingDependency { step: String, dependency: String },

    /// A transaction was mined but reverted.
    #[error("transaction {tx_hash} for {context} reverted")]
    TransactionFailure { context: String, tx_hash: B256 },

    /// The chain interaction layer failed.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// No deployed artifact is registered under the name.
    #[error("no deployed artifact named `{0}`")]
    NotFound(String),

    /// No compiled artifact with creation bytecode exists for the contract.
    #[error("no compiled bytecode for contract `{0}`")]
    ContractNotFound(String),

    /// The named account role is not configured.
    #[error("unknown named account `{0}`")]
    UnknownAccount(String),

    /// The account has no local key and the operation needs one.
    #[error("account `{0}` has no signer")]
    MissingSigner(String),

    /// The registry directory belongs to another chain.
    #[error("registry at {path} was created for chain {recorded}, connected chain is {connected}")]
    ChainMismatch {
        path: String,
        recorded: u64,
        connected: u64,
    },

    /// The registry was opened without the writer lock.
    #[error("registry at {0} is opened read-only")]
    ReadOnly(String),

    /// Another process holds the registry lock.
    #[error("registry at {0} is locked by another run")]
    RegistryLocked(String),

    /// A value could not be converted into the expected ABI shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path}: {source}")]
    Serde {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DeployError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn serde(path: &std::path::Path, source: serde_json::Error) -> Self {
        Self::Serde {
            path: path.display().to_string(),
            source,
        }
    }
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
