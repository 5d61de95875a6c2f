//! Integration tests for dnd-deploy.
//!
//! These tests run whole pipelines against the in-memory [`MockChain`], with a
//! registry persisted in a temporary directory. Contract state observed by
//! probes is modelled with mock effects.
//! Each test uses a random chain ID so registries never mix.
//! Run with: cargo test --test pipeline_test

use std::path::PathBuf;

use alloy_core::primitives::{Address, Bytes};
use anyhow::{Context, Result};
use dnd_deploy::{
    AbiArg, ArgSpec, ArtifactRegistry, ChainClient, CollateralConfig, ContractSource,
    DeployConfig, DeployError, Deployer, Effect, EpochConfig, MockChain, NamedAccounts,
    OracleConfig, Pipeline, PipelineStep, PoolConfig, ProbeSpec, RunReport, StepOutcome,
    TxRequest, abi,
};
use rand::Rng;
use tempdir::TempDir;

const DEPLOYER: Address = Address::repeat_byte(0xd1);
const CREATOR: Address = Address::repeat_byte(0xc1);
const ADMIN: Address = Address::repeat_byte(0xa1);

/// Generate a random chain ID outside the range of public networks.
fn generate_random_chain_id() -> u64 {
    rand::rng().random_range(100000..=999999)
}

/// Test setup context containing common test infrastructure.
struct TestContext {
    chain: MockChain,
    accounts: NamedAccounts,
    contracts: ContractSource,
    root: TempDir,
    registry_dir: PathBuf,
}

impl TestContext {
    /// Initialize a new test context with a random chain ID and an empty registry.
    fn new(test_prefix: &str) -> Result<Self> {
        let chain_id = generate_random_chain_id();
        let root = TempDir::new(&format!("dnd-{test_prefix}-{chain_id}"))
            .context("Failed to create temporary directory")?;
        let registry_dir = root.path().join("deployments").join("localhost");

        let chain = MockChain::new(chain_id)
            .with_effect("initialize(address)", Effect::flag("initialized()"))
            .with_effect("initialize()", Effect::flag("initialized()"))
            .with_effect("addPool(address)", Effect::mark("hasPool(address)", 0))
            .with_effect("addFoundry(address,address)", Effect::mark("hasFoundry(address)", 0))
            .with_effect("setPool(address)", Effect::store("pool()", 0))
            .with_effect("setTreasury(address)", Effect::store("treasury()", 0));

        let contracts = ContractSource::in_memory(
            [
                "Timelock",
                "CollateralReserve",
                "Treasury",
                "Diamond",
                "DToken",
                "MockCollateral",
                "Pool",
                "Foundry",
                "MockOracle",
            ]
            .into_iter()
            .enumerate()
            .map(|(index, name)| (name, Bytes::from(vec![0x60, index as u8 + 1]))),
        );

        Ok(Self {
            chain,
            accounts: NamedAccounts::from_addresses([
                ("deployer", DEPLOYER),
                ("creator", CREATOR),
                ("timelock_admin", ADMIN),
            ]),
            contracts,
            root,
            registry_dir,
        })
    }

    /// Register an extra mock effect.
    fn with_effect(mut self, signature: &str, effect: Effect) -> Self {
        self.chain = self.chain.with_effect(signature, effect);
        self
    }

    /// Open the registry. It is released when the returned value is dropped.
    fn registry(&self) -> Result<ArtifactRegistry> {
        ArtifactRegistry::open(&self.registry_dir, self.chain.chain_id())
            .context("Failed to open artifact registry")
    }

    /// Run `steps` once against a freshly opened registry.
    async fn run(&self, steps: &[PipelineStep]) -> Result<RunReport, DeployError> {
        let mut registry = ArtifactRegistry::open(&self.registry_dir, self.chain.chain_id())?;
        Pipeline::new(&self.chain, &mut registry, &self.accounts, &self.contracts)?
            .run(steps)
            .await
    }

    /// Snapshot of everything the registry has recorded.
    fn snapshot(&self) -> Result<String> {
        let registry = self.registry()?;
        let artifacts = registry.list().cloned().collect::<Vec<_>>();
        let ledger = registry.initializations().cloned().collect::<Vec<_>>();
        Ok(format!("{artifacts:?}\n{ledger:?}"))
    }
}

fn treasury() -> PipelineStep {
    PipelineStep::deploy("Treasury", "Treasury")
}

fn diamond(symbol: &str) -> PipelineStep {
    PipelineStep::deploy("Diamond", "Diamond").args(vec![
        ArgSpec::literal("DIAMOND"),
        ArgSpec::literal(symbol),
        ArgSpec::artifact("Treasury"),
    ])
}

fn diamond_initialize() -> PipelineStep {
    PipelineStep::call("Diamond", "initialize")
        .args(vec![ArgSpec::account("deployer")])
        .probe(ProbeSpec::flag("initialized"))
}

/// Ten steps deploying and wiring one pool.
fn pool_steps() -> Vec<PipelineStep> {
    vec![
        treasury(),
        diamond("DND"),
        diamond_initialize(),
        PipelineStep::deploy("dBTC", "DToken").args(vec![
            ArgSpec::literal("Diamond-Peg Bitcoin"),
            ArgSpec::literal("dBTC"),
            ArgSpec::artifact("Treasury"),
        ]),
        PipelineStep::deploy("Pool_dBTC", "Pool")
            .from("creator")
            .args(vec![ArgSpec::artifact("dBTC"), ArgSpec::artifact("Diamond")]),
        PipelineStep::call("Treasury", "addPool")
            .args(vec![ArgSpec::artifact("Pool_dBTC")])
            .probe(ProbeSpec::equals(
                "hasPool(address)",
                vec![ArgSpec::artifact("Pool_dBTC")],
                ArgSpec::literal(true),
            )),
        PipelineStep::call("dBTC", "setPool")
            .args(vec![ArgSpec::artifact("Pool_dBTC")])
            .probe(ProbeSpec::equals("pool", vec![], ArgSpec::artifact("Pool_dBTC"))),
        PipelineStep::call("Pool_dBTC", "setTreasury")
            .args(vec![ArgSpec::artifact("Treasury")])
            .probe(ProbeSpec::equals("treasury", vec![], ArgSpec::artifact("Treasury"))),
        PipelineStep::deploy("Foundry_dBTC", "Foundry").from("creator"),
        PipelineStep::call("Treasury", "addFoundry")
            .args(vec![
                ArgSpec::artifact("Foundry_dBTC"),
                ArgSpec::artifact("Pool_dBTC"),
            ])
            .probe(ProbeSpec::equals(
                "hasFoundry(address)",
                vec![ArgSpec::artifact("Foundry_dBTC")],
                ArgSpec::literal(true),
            )),
    ]
}

#[tokio::test]
async fn test_deploy_then_initialize_twice() -> Result<()> {
    let ctx = TestContext::new("e2e")?;
    let steps = vec![treasury(), diamond("DND"), diamond_initialize()];

    let first = ctx.run(&steps).await?;
    assert_eq!(first.deployed(), 2);
    assert_eq!(first.applied(), 1);
    assert_eq!(ctx.chain.transaction_count(), 3);

    let registry = ctx.registry()?;
    let record = registry.get("Diamond")?;
    assert_eq!(record.contract, "Diamond");
    assert_eq!(record.args[2], AbiArg::Address(registry.address("Treasury")?));
    assert!(registry.initialization("Diamond", "initialize").is_some_and(|r| r.applied));
    drop(registry);

    let second = ctx.run(&steps).await?;
    assert!(second.is_noop());
    assert_eq!(second.existing(), 2);
    assert_eq!(second.already_applied(), 1);
    assert_eq!(ctx.chain.transaction_count(), 3);
    assert_eq!(ctx.chain.calls_to("initialize(address)"), 1);

    Ok(())
}

#[tokio::test]
async fn test_second_run_is_a_noop() -> Result<()> {
    let ctx = TestContext::new("noop")?;
    let steps = pool_steps();

    let first = ctx.run(&steps).await?;
    assert_eq!(first.steps.len(), 10);
    assert_eq!(first.deployed(), 5);
    assert_eq!(first.applied(), 5);
    let sent = ctx.chain.transaction_count();
    let before = ctx.snapshot()?;

    let second = ctx.run(&steps).await?;
    assert!(second.is_noop());
    assert_eq!(second.existing(), 5);
    assert_eq!(second.already_applied(), 5);
    assert_eq!(ctx.chain.transaction_count(), sent);
    assert_eq!(ctx.snapshot()?, before);

    Ok(())
}

#[tokio::test]
async fn test_changed_constructor_args_are_rejected() -> Result<()> {
    let ctx = TestContext::new("drift")?;
    ctx.run(&[treasury(), diamond("DND")]).await?;
    let sent = ctx.chain.transaction_count();

    let err = ctx
        .run(&[treasury(), diamond("DMD")])
        .await
        .expect_err("changed args must not be accepted");

    match err {
        DeployError::ConfigurationDrift { name, .. } => assert_eq!(name, "Diamond"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctx.chain.transaction_count(), sent);
    assert_eq!(ctx.chain.deployment_count(), 2);

    Ok(())
}

#[tokio::test]
async fn test_missing_dependency_sends_nothing() -> Result<()> {
    let ctx = TestContext::new("missing")?;

    let err = ctx
        .run(&[diamond("DND")])
        .await
        .expect_err("Diamond needs the Treasury");

    match err {
        DeployError::MissingDependency { step, dependency } => {
            assert_eq!(step, "Diamond");
            assert_eq!(dependency, "Treasury");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(ctx.chain.transaction_count(), 0);

    Ok(())
}

#[tokio::test]
async fn test_initialization_done_elsewhere_is_absorbed() -> Result<()> {
    let ctx = TestContext::new("absorb")?;
    ctx.run(&[treasury(), diamond("DND")]).await?;

    // Someone initializes the Diamond outside the pipeline.
    let target = ctx.registry()?.address("Diamond")?;
    let tx_hash = ctx
        .chain
        .send_transaction(TxRequest::call(
            ADMIN,
            target,
            abi::encode_call("initialize", &[AbiArg::Address(DEPLOYER)]),
        ))
        .await?;
    assert!(ctx.chain.wait_for_receipt(tx_hash).await?.success);

    let report = ctx.run(&[diamond_initialize()]).await?;
    assert_eq!(
        report.outcome("Diamond.initialize"),
        Some(StepOutcome::AlreadyApplied)
    );
    assert_eq!(ctx.chain.calls_to("initialize(address)"), 1);

    Ok(())
}

#[tokio::test]
async fn test_partial_failure_resumes() -> Result<()> {
    let ctx = TestContext::new("resume")?;
    let steps = pool_steps();

    // The fifth transaction is the Pool deployment.
    ctx.chain.fail_nth_transaction(5);
    let err = ctx.run(&steps).await.expect_err("the fifth step reverts");
    assert!(matches!(err, DeployError::TransactionFailure { .. }));
    assert_eq!(ctx.chain.transaction_count(), 5);
    {
        let registry = ctx.registry()?;
        assert!(registry.contains("dBTC"));
        assert!(!registry.contains("Pool_dBTC"));
        assert_eq!(registry.pending().count(), 0);
    }

    let report = ctx.run(&steps).await?;
    assert_eq!(report.existing(), 3);
    assert_eq!(report.already_applied(), 1);
    assert_eq!(report.deployed(), 2);
    assert_eq!(report.applied(), 4);
    assert!(matches!(
        report.outcome("Pool_dBTC"),
        Some(StepOutcome::Deployed { .. })
    ));
    // Steps one to four were not resent.
    assert_eq!(ctx.chain.transaction_count(), 11);

    Ok(())
}

#[tokio::test]
async fn test_registry_survives_restart() -> Result<()> {
    let ctx = TestContext::new("persist")?;
    ctx.run(&[treasury(), diamond("DND"), diamond_initialize()]).await?;

    assert!(ctx.registry_dir.join("Treasury.json").exists());
    assert!(ctx.registry_dir.join("Diamond.json").exists());
    assert!(ctx.registry_dir.join(".initializations.json").exists());

    let record: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(
        ctx.registry_dir.join("Diamond.json"),
    )?)?;
    assert_eq!(record["contract"], "Diamond");
    assert_eq!(record["deployed"], true);

    // A different chain must not reuse this registry.
    let other = MockChain::new(ctx.chain.chain_id() + 1);
    let err = ArtifactRegistry::open(&ctx.registry_dir, other.chain_id())
        .expect_err("registry belongs to another chain");
    assert!(matches!(err, DeployError::ChainMismatch { .. }));

    let report = ctx.run(&[treasury(), diamond("DND"), diamond_initialize()]).await?;
    assert!(report.is_noop());

    Ok(())
}

#[tokio::test]
async fn test_pending_transactions_are_recovered() -> Result<()> {
    let ctx = TestContext::new("pending")?;
    ctx.run(&[treasury()]).await?;

    // The deployment is broadcast but the run dies before it is mined.
    ctx.chain.hold_next_transaction();
    assert!(ctx.run(&[treasury(), diamond("DND")]).await.is_err());
    assert_eq!(ctx.registry()?.pending().count(), 1);
    ctx.chain.mine_pending();

    let report = ctx.run(&[treasury(), diamond("DND")]).await?;
    assert!(matches!(
        report.outcome("Diamond"),
        Some(StepOutcome::Deployed { .. })
    ));
    assert_eq!(ctx.chain.deployment_count(), 2);

    // Same for an initializer call.
    ctx.chain.hold_next_transaction();
    assert!(ctx.run(&[diamond_initialize()]).await.is_err());
    ctx.chain.mine_pending();

    let report = ctx.run(&[diamond_initialize()]).await?;
    assert_eq!(
        report.outcome("Diamond.initialize"),
        Some(StepOutcome::AlreadyApplied)
    );
    assert_eq!(ctx.chain.calls_to("initialize(address)"), 1);
    assert!(
        ctx.registry()?
            .initialization("Diamond", "initialize")
            .is_some_and(|record| record.applied)
    );

    Ok(())
}

#[tokio::test]
async fn test_lost_broadcast_reply_is_not_redeployed() -> Result<()> {
    let ctx = TestContext::new("lost-reply")?;
    ctx.run(&[treasury()]).await?;

    // The node accepts the deployment but the reply never arrives.
    ctx.chain.lose_next_reply();
    let err = ctx
        .run(&[treasury(), diamond("DND")])
        .await
        .expect_err("the broadcast reply is lost");
    assert!(matches!(err, DeployError::Chain(_)));
    assert_eq!(ctx.registry()?.pending().count(), 1);

    let report = ctx.run(&[treasury(), diamond("DND"), diamond_initialize()]).await?;
    assert!(matches!(
        report.outcome("Diamond"),
        Some(StepOutcome::Deployed { .. })
    ));
    assert_eq!(ctx.chain.deployment_count(), 2);

    // Same for an initializer call.
    ctx.chain.lose_next_reply();
    let steps = vec![
        treasury(),
        PipelineStep::call("Treasury", "setTreasury")
            .args(vec![ArgSpec::artifact("Treasury")]),
    ];
    assert!(ctx.run(&steps).await.is_err());
    let report = ctx.run(&steps).await?;
    assert!(report.is_noop());
    assert_eq!(ctx.chain.calls_to("setTreasury(address)"), 1);

    Ok(())
}

#[tokio::test]
async fn test_unmatched_probe_is_applied_once() -> Result<()> {
    let ctx = TestContext::new("probe-once")?;
    // No mock effect backs `oracle()`, so the probe never matches.
    let steps = vec![
        treasury(),
        diamond("DND"),
        PipelineStep::call("Treasury", "setOracle")
            .args(vec![ArgSpec::artifact("Diamond")])
            .probe(ProbeSpec::equals("oracle", vec![], ArgSpec::artifact("Diamond"))),
    ];

    let first = ctx.run(&steps).await?;
    assert_eq!(first.applied(), 1);

    for _ in 0..2 {
        let report = ctx.run(&steps).await?;
        assert!(report.is_noop());
        assert_eq!(report.already_applied(), 1);
    }
    assert_eq!(ctx.chain.calls_to("setOracle(address)"), 1);
    assert!(
        ctx.registry()?
            .initialization("Treasury", "setOracle[Diamond]")
            .is_some_and(|record| record.applied)
    );

    Ok(())
}

#[tokio::test]
async fn test_full_protocol_plan() -> Result<()> {
    let ctx = TestContext::new("plan")?
        .with_effect(
            "initialize(address,address,address,uint256)",
            Effect::flag("initialized()"),
        )
        .with_effect(
            "initialize(address,address,address)",
            Effect::flag("initialized()"),
        )
        .with_effect("setOracleDToken(address)", Effect::store("oracleDToken()", 0))
        .with_effect("setOracleDiamond(address)", Effect::store("oracleDiamond()", 0))
        .with_effect("initializeEpoch(uint256,uint256)", Effect::store("startTime()", 0));
    let chain = &ctx.chain;

    let mut config = DeployConfig::localhost();
    config.deployments = ctx.root.path().join("deployments");
    let network = config
        .networks
        .get_mut("localhost")
        .context("localhost network")?;
    network.protocol.epoch = Some(EpochConfig {
        start_offset_secs: 100,
        duration_secs: 900,
    });
    network.protocol.pools.push(PoolConfig {
        name: "Diamond-Peg Bitcoin".to_string(),
        symbol: "dBTC".to_string(),
        artifact: None,
        collateral: CollateralConfig::Mock {
            name: "Bitcoin".to_string(),
            symbol: "BTCB".to_string(),
            decimals: 18,
        },
        ceiling: "100000000e18".parse()?,
        treasury_in_constructor: true,
        foundry: true,
        utilization_ratio: None,
        excess_collateral_distributed_ratio: None,
        oracle: Some(OracleConfig::Mock {
            dtoken_price: 1_000_000,
            diamond_price: 2_000_000,
        }),
    });

    let deployer = Deployer::new(config, "localhost")?;
    let steps = deployer.steps(&[]);

    let first = deployer
        .deploy_with(chain, &ctx.accounts, &ctx.contracts, &[])
        .await?;
    assert_eq!(first.steps.len(), steps.len());
    assert!(first.already_applied() == 0 && first.existing() == 0);
    let sent = chain.transaction_count();
    assert_eq!(sent, steps.len());

    // Status reads the registry while a deploy holds the writer lock.
    let writer = deployer.open_registry(chain.chain_id())?;
    let statuses = deployer.status_with(chain).await?;
    assert!(statuses.iter().all(|status| status.deployed && status.has_code));
    assert!(statuses.iter().any(|status| status.name == "MockBTCB"));
    drop(writer);

    let second = deployer
        .deploy_with(chain, &ctx.accounts, &ctx.contracts, &[])
        .await?;
    assert!(second.is_noop());
    assert_eq!(chain.transaction_count(), sent);

    // Tag selection only touches the requested steps.
    let core = deployer
        .deploy_with(chain, &ctx.accounts, &ctx.contracts, &["core".to_string()])
        .await?;
    assert!(core.steps.len() < steps.len());
    assert!(core.is_noop());

    Ok(())
}
