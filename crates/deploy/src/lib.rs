//! dnd-deploy - Deployment library for the Diamond protocol.
//!
//! This crate provides an idempotent provisioning core (artifact registry,
//! initialization step, pipeline) and the protocol plan built on top of it.

pub mod abi;
mod accounts;
pub mod chain;
mod config;
mod contracts;
mod deployer;
mod error;
mod faucet;
mod fs;
mod init;
mod pipeline;
mod plan;
mod registry;

pub use abi::AbiArg;
pub use accounts::{Account, AccountSource, NamedAccounts};
pub use chain::{
    ChainClient, Effect, MockChain, PreparedTx, Receipt, ReceiptPolling, RpcChainClient,
    TxRequest, TxStatus,
};
pub use config::{CONFIG_FILENAME, DeployConfig, ENV_PREFIX, FaucetConfig, NetworkConfig};
pub use contracts::ContractSource;
pub use deployer::{ArtifactStatus, Deployer, status_table};
pub use error::{ChainError, DeployError, Result};
pub use faucet::{FundReport, fund_account};
pub use init::{InitOutcome, Initializer, Probe, apply};
pub use pipeline::{
    ArgSpec, DEFAULT_ROLE, Pipeline, PipelineStep, ProbeSpec, RunReport, StepAction, StepFilter,
    StepOutcome, StepReport,
};
pub use plan::{
    Amount, CollateralConfig, DiamondConfig, EpochConfig, ExtraDeployment, OracleConfig,
    PoolConfig, ProtocolConfig, TimelockConfig, build_plan, plan_table,
};
pub use registry::{
    Artifact, ArtifactRegistry, DeployOutcome, DeployRequest, InitializationRecord,
};
