//! Protocol deployment plan.
//!
//! Turns a per-network [`ProtocolConfig`] into the ordered step list that
//! bootstraps the protocol: core contracts, then one group of steps per pool,
//! then oracle wiring, the first epoch and any extra deployments.

use std::{fmt, str::FromStr};

use alloy_core::primitives::{Address, U256};
use comfy_table::{Table, presets::UTF8_FULL};
use serde::{Deserialize, Serialize};

use crate::{
    error::DeployError,
    pipeline::{ArgSpec, PipelineStep, ProbeSpec},
};

pub const TAG_CORE: &str = "core";
pub const TAG_POOL: &str = "pool";
pub const TAG_ORACLE: &str = "oracle";
pub const TAG_EPOCH: &str = "epoch";
pub const TAG_EXTRAS: &str = "extras";

/// Artifact names of the core contracts.
pub const TIMELOCK: &str = "Timelock";
pub const COLLATERAL_RESERVE: &str = "CollateralReserve";
pub const TREASURY: &str = "Treasury";
pub const DIAMOND: &str = "Diamond";

/// A token amount in base units.
///
/// Accepts integers and scientific notation strings such as `"100000000e18"`
/// or `"1.5e18"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "AmountRepr", into = "String")]
pub struct Amount(pub U256);

impl Amount {
    /// `whole` tokens of a token with `decimals` decimals.
    pub fn tokens(whole: u64, decimals: u8) -> Self {
        Self(U256::from(whole) * U256::from(10u64).pow(U256::from(decimals)))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AmountRepr {
    Int(u64),
    Str(String),
}

impl TryFrom<AmountRepr> for Amount {
    type Error = DeployError;

    fn try_from(repr: AmountRepr) -> Result<Self, Self::Error> {
        match repr {
            AmountRepr::Int(value) => Ok(Self(U256::from(value))),
            AmountRepr::Str(value) => value.parse(),
        }
    }
}

impl From<Amount> for String {
    fn from(amount: Amount) -> Self {
        amount.0.to_string()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DeployError::InvalidArgument(format!("amount `{s}`: {reason}"));

        let cleaned = s.trim().replace('_', "");
        let (mantissa, exponent) = match cleaned.split_once(['e', 'E']) {
            Some((mantissa, exponent)) => (
                mantissa,
                exponent
                    .parse::<u32>()
                    .map_err(|_| invalid("bad exponent"))?,
            ),
            None => (cleaned.as_str(), 0),
        };

        let (integer, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        let fraction = fraction.trim_end_matches('0');
        let fraction_len = u32::try_from(fraction.len()).map_err(|_| invalid("too many digits"))?;
        let scale = exponent
            .checked_sub(fraction_len)
            .ok_or_else(|| invalid("not a whole number of base units"))?;

        let digits = format!("{integer}{fraction}");
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("not a number"));
        }

        let value = U256::from_str_radix(&digits, 10).map_err(|_| invalid("overflow"))?;
        U256::from(10u64)
            .checked_pow(U256::from(scale))
            .and_then(|factor| value.checked_mul(factor))
            .map(Self)
            .ok_or_else(|| invalid("overflow"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelockConfig {
    /// Role of the timelock admin.
    pub admin: String,
    pub delay_secs: u64,
}

impl Default for TimelockConfig {
    fn default() -> Self {
        Self {
            admin: "timelock_admin".to_string(),
            delay_secs: 12 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiamondConfig {
    pub name: String,
    pub symbol: String,
    /// Roles passed to `initialize`, followed by the current time.
    pub initialize_recipients: Vec<String>,
}

impl Default for DiamondConfig {
    fn default() -> Self {
        Self {
            name: "DIAMOND".to_string(),
            symbol: "DND".to_string(),
            initialize_recipients: vec!["deployer".to_string(); 3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollateralConfig {
    /// Deploy a mintable mock token named `Mock<symbol>`.
    Mock {
        name: String,
        symbol: String,
        #[serde(default = "default_decimals")]
        decimals: u8,
    },
    /// Use a token that already exists on the network.
    Existing { symbol: String, address: Address },
}

fn default_decimals() -> u8 {
    18
}

impl CollateralConfig {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Mock { symbol, .. } | Self::Existing { symbol, .. } => symbol,
        }
    }

    /// Artifact name of a mock collateral.
    pub fn mock_artifact(&self) -> Option<String> {
        match self {
            Self::Mock { symbol, .. } => Some(format!("Mock{symbol}")),
            Self::Existing { .. } => None,
        }
    }

    fn arg(&self) -> ArgSpec {
        match self {
            Self::Mock { symbol, .. } => ArgSpec::artifact(format!("Mock{symbol}")),
            Self::Existing { address, .. } => ArgSpec::literal(*address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OracleConfig {
    /// Fixed-price `MockOracle`s.
    Mock { dtoken_price: u64, diamond_price: u64 },
    /// `VSwapPairOracle`s over existing pairs, refreshed with `update()`.
    Pair {
        dtoken_pair: Address,
        diamond_pair: Address,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// dToken name, e.g. `Diamond-Peg Bitcoin`.
    pub name: String,
    /// dToken symbol, e.g. `dBTC`.
    pub symbol: String,
    /// Artifact name of the dToken. Defaults to the symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub collateral: CollateralConfig,
    #[serde(default = "default_ceiling")]
    pub ceiling: Amount,
    /// Whether the DToken and Pool constructors take the treasury address.
    #[serde(default = "default_true")]
    pub treasury_in_constructor: bool,
    #[serde(default = "default_true")]
    pub foundry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization_ratio: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excess_collateral_distributed_ratio: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle: Option<OracleConfig>,
}

fn default_ceiling() -> Amount {
    Amount::tokens(100_000_000, 18)
}

fn default_true() -> bool {
    true
}

impl PoolConfig {
    pub fn dtoken_artifact(&self) -> String {
        self.artifact.clone().unwrap_or_else(|| self.symbol.clone())
    }

    pub fn pool_artifact(&self) -> String {
        format!("Pool_{}", self.symbol)
    }

    pub fn foundry_artifact(&self) -> String {
        format!("Foundry_{}", self.symbol)
    }

    /// Oracle artifact names for the dToken and Diamond prices.
    pub fn oracle_artifacts(&self, diamond_symbol: &str) -> (String, String) {
        let collateral = self.collateral.symbol();
        (
            format!("PairOracle_{}_{collateral}", self.symbol),
            format!("PairOracle_{diamond_symbol}_{collateral}"),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochConfig {
    /// Delay between deployment and the first epoch.
    pub start_offset_secs: i64,
    pub duration_secs: u64,
}

impl Default for EpochConfig {
    fn default() -> Self {
        Self {
            start_offset_secs: 100,
            duration_secs: 15 * 60,
        }
    }
}

/// A contract deployed from literal arguments, outside the protocol wiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraDeployment {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Everything that differs between two deployments of the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Role deploying Diamond and the dTokens.
    pub deployer_role: String,
    /// Role deploying everything else and sending configuration calls.
    pub creator_role: String,
    pub timelock: TimelockConfig,
    /// Deploy a `CollateralReserve` and pass it to the Treasury.
    pub collateral_reserve: bool,
    pub diamond: DiamondConfig,
    pub pools: Vec<PoolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epoch: Option<EpochConfig>,
    pub extras: Vec<ExtraDeployment>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            deployer_role: "deployer".to_string(),
            creator_role: "creator".to_string(),
            timelock: TimelockConfig::default(),
            collateral_reserve: false,
            diamond: DiamondConfig::default(),
            pools: Vec::new(),
            epoch: None,
            extras: Vec::new(),
        }
    }
}

/// Build the ordered steps deploying and wiring the protocol.
pub fn build_plan(config: &ProtocolConfig) -> Vec<PipelineStep> {
    let mut steps = core_steps(config);
    for pool in &config.pools {
        steps.extend(pool_steps(config, pool));
    }
    for pool in &config.pools {
        if let Some(oracle) = &pool.oracle {
            steps.extend(oracle_steps(config, pool, oracle));
        }
    }
    if let Some(epoch) = &config.epoch {
        steps.push(
            PipelineStep::call(TREASURY, "initializeEpoch")
                .from(&config.creator_role)
                .args(vec![
                    ArgSpec::now_plus(epoch.start_offset_secs),
                    ArgSpec::literal(epoch.duration_secs),
                ])
                .probe(ProbeSpec::nonzero("startTime"))
                .tags([TAG_EPOCH]),
        );
    }
    for extra in &config.extras {
        steps.push(
            PipelineStep::deploy(&extra.name, extra.contract.as_deref().unwrap_or(&extra.name))
                .from(&config.creator_role)
                .args(extra.args.clone())
                .tags([TAG_EXTRAS])
                .tags(extra.tags.iter().cloned()),
        );
    }
    steps
}

fn core_steps(config: &ProtocolConfig) -> Vec<PipelineStep> {
    let creator = &config.creator_role;
    let mut steps = vec![
        PipelineStep::deploy(TIMELOCK, TIMELOCK)
            .from(creator)
            .args(vec![
                ArgSpec::account(&config.timelock.admin),
                ArgSpec::literal(config.timelock.delay_secs),
            ]),
    ];

    let treasury_args = if config.collateral_reserve {
        steps.push(PipelineStep::deploy(COLLATERAL_RESERVE, COLLATERAL_RESERVE).from(creator));
        vec![ArgSpec::artifact(COLLATERAL_RESERVE)]
    } else {
        vec![]
    };
    steps.push(
        PipelineStep::deploy(TREASURY, TREASURY)
            .from(creator)
            .args(treasury_args),
    );

    if config.collateral_reserve {
        steps.push(
            PipelineStep::call(COLLATERAL_RESERVE, "setTreasury")
                .from(creator)
                .args(vec![ArgSpec::artifact(TREASURY)])
                .probe(ProbeSpec::equals("treasury", vec![], ArgSpec::artifact(TREASURY))),
        );
    }

    steps.push(
        PipelineStep::deploy(DIAMOND, DIAMOND)
            .from(&config.deployer_role)
            .args(vec![
                ArgSpec::literal(config.diamond.name.as_str()),
                ArgSpec::literal(config.diamond.symbol.as_str()),
                ArgSpec::artifact(TREASURY),
            ]),
    );

    let mut initialize_args = config
        .diamond
        .initialize_recipients
        .iter()
        .map(ArgSpec::account)
        .collect::<Vec<_>>();
    initialize_args.push(ArgSpec::now());
    steps.push(
        PipelineStep::call(DIAMOND, "initialize")
            .from(creator)
            .args(initialize_args)
            .probe(ProbeSpec::flag("initialized")),
    );

    steps.into_iter().map(|step| step.tags([TAG_CORE])).collect()
}

fn pool_steps(config: &ProtocolConfig, pool: &PoolConfig) -> Vec<PipelineStep> {
    let creator = &config.creator_role;
    let dtoken = pool.dtoken_artifact();
    let pool_name = pool.pool_artifact();
    let collateral = pool.collateral.arg();

    let mut dtoken_args = vec![
        ArgSpec::literal(pool.name.as_str()),
        ArgSpec::literal(pool.symbol.as_str()),
    ];
    let mut pool_args = vec![
        ArgSpec::artifact(&dtoken),
        ArgSpec::artifact(DIAMOND),
        collateral.clone(),
        ArgSpec::literal(pool.ceiling.0),
    ];
    if pool.treasury_in_constructor {
        dtoken_args.push(ArgSpec::artifact(TREASURY));
        pool_args.push(ArgSpec::artifact(TREASURY));
    }

    let mut steps = vec![
        PipelineStep::deploy(&dtoken, "DToken")
            .from(&config.deployer_role)
            .args(dtoken_args),
        PipelineStep::call(&dtoken, "initialize")
            .from(creator)
            .probe(ProbeSpec::flag("initialized")),
    ];

    if let CollateralConfig::Mock {
        name,
        symbol,
        decimals,
    } = &pool.collateral
    {
        steps.push(
            PipelineStep::deploy(format!("Mock{symbol}"), "MockCollateral")
                .from(creator)
                .args(vec![
                    ArgSpec::literal(name.as_str()),
                    ArgSpec::literal(symbol.as_str()),
                    ArgSpec::literal(u64::from(*decimals)),
                ]),
        );
    }

    steps.extend([
        PipelineStep::deploy(&pool_name, "Pool")
            .from(creator)
            .args(pool_args),
        PipelineStep::call(TREASURY, "addPool")
            .from(creator)
            .args(vec![ArgSpec::artifact(&pool_name)])
            .probe(ProbeSpec::equals(
                "hasPool(address)",
                vec![ArgSpec::artifact(&pool_name)],
                ArgSpec::literal(true),
            )),
        PipelineStep::call(&dtoken, "setPool")
            .from(creator)
            .args(vec![ArgSpec::artifact(&pool_name)])
            .probe(ProbeSpec::equals("pool", vec![], ArgSpec::artifact(&pool_name))),
        PipelineStep::call(&pool_name, "setTreasury")
            .from(creator)
            .args(vec![ArgSpec::artifact(TREASURY)])
            .probe(ProbeSpec::equals("treasury", vec![], ArgSpec::artifact(TREASURY))),
    ]);

    if pool.foundry {
        let foundry = pool.foundry_artifact();
        steps.extend([
            PipelineStep::deploy(&foundry, "Foundry").from(creator),
            PipelineStep::call(&foundry, "initialize")
                .from(creator)
                .args(vec![
                    collateral,
                    ArgSpec::artifact(DIAMOND),
                    ArgSpec::artifact(TREASURY),
                ])
                .probe(ProbeSpec::flag("initialized")),
            PipelineStep::call(TREASURY, "addFoundry")
                .from(creator)
                .args(vec![ArgSpec::artifact(&foundry), ArgSpec::artifact(&pool_name)])
                .probe(ProbeSpec::equals(
                    "hasFoundry(address)",
                    vec![ArgSpec::artifact(&foundry)],
                    ArgSpec::literal(true),
                )),
        ]);
    }

    let ratios = [
        ("setUtilizationRatio", "utilizationRatio(address)", pool.utilization_ratio),
        (
            "setExcessCollateralDistributedRatio",
            "excessCollateralDistributedRatio(address)",
            pool.excess_collateral_distributed_ratio,
        ),
    ];
    for (setter, getter, ratio) in ratios {
        if let Some(ratio) = ratio {
            steps.push(
                PipelineStep::call(TREASURY, setter)
                    .from(creator)
                    .args(vec![ArgSpec::artifact(&pool_name), ArgSpec::literal(ratio)])
                    .probe(ProbeSpec::equals(
                        getter,
                        vec![ArgSpec::artifact(&pool_name)],
                        ArgSpec::literal(ratio),
                    )),
            );
        }
    }

    let pool_tag = format!("{TAG_POOL}:{}", pool.symbol);
    steps
        .into_iter()
        .map(|step| step.tags([TAG_POOL, pool_tag.as_str()]))
        .collect()
}

fn oracle_steps(config: &ProtocolConfig, pool: &PoolConfig, oracle: &OracleConfig) -> Vec<PipelineStep> {
    let creator = &config.creator_role;
    let pool_name = pool.pool_artifact();
    let (dtoken_oracle, diamond_oracle) = pool.oracle_artifacts(&config.diamond.symbol);

    let (contract, dtoken_arg, diamond_arg) = match oracle {
        OracleConfig::Mock {
            dtoken_price,
            diamond_price,
        } => (
            "MockOracle",
            ArgSpec::literal(*dtoken_price),
            ArgSpec::literal(*diamond_price),
        ),
        OracleConfig::Pair {
            dtoken_pair,
            diamond_pair,
        } => (
            "VSwapPairOracle",
            ArgSpec::literal(*dtoken_pair),
            ArgSpec::literal(*diamond_pair),
        ),
    };

    let mut steps = vec![
        PipelineStep::deploy(&dtoken_oracle, contract)
            .from(creator)
            .args(vec![dtoken_arg]),
        PipelineStep::deploy(&diamond_oracle, contract)
            .from(creator)
            .args(vec![diamond_arg]),
        PipelineStep::call(&pool_name, "setOracleDToken")
            .from(creator)
            .args(vec![ArgSpec::artifact(&dtoken_oracle)])
            .probe(ProbeSpec::equals(
                "oracleDToken",
                vec![],
                ArgSpec::artifact(&dtoken_oracle),
            )),
        PipelineStep::call(&pool_name, "setOracleDiamond")
            .from(creator)
            .args(vec![ArgSpec::artifact(&diamond_oracle)])
            .probe(ProbeSpec::equals(
                "oracleDiamond",
                vec![],
                ArgSpec::artifact(&diamond_oracle),
            )),
    ];

    // The first price update has no observable flag, only the ledger guards it.
    if matches!(oracle, OracleConfig::Pair { .. }) {
        steps.push(PipelineStep::call(&dtoken_oracle, "update").from(creator));
        steps.push(PipelineStep::call(&diamond_oracle, "update").from(creator));
    }

    let oracle_tag = format!("{TAG_ORACLE}:{}", pool.symbol);
    steps
        .into_iter()
        .map(|step| step.tags([TAG_ORACLE, oracle_tag.as_str()]))
        .collect()
}

/// Tabular view of a step list, for dry runs.
pub fn plan_table(steps: &[PipelineStep]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["#", "Step", "Action", "From", "Tags"]);
    for (index, step) in steps.iter().enumerate() {
        table.add_row(vec![
            (index + 1).to_string(),
            step.label(),
            step.describe(),
            step.role().to_string(),
            step.tags.iter().cloned().collect::<Vec<_>>().join(","),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StepFilter;
    use std::collections::HashSet;

    fn local_config() -> ProtocolConfig {
        ProtocolConfig {
            collateral_reserve: true,
            pools: vec![
                PoolConfig {
                    name: "Diamond-Peg Bitcoin".to_string(),
                    symbol: "dBTC".to_string(),
                    artifact: None,
                    collateral: CollateralConfig::Mock {
                        name: "Binance-Peg Bitcoin Token".to_string(),
                        symbol: "BTCB".to_string(),
                        decimals: 18,
                    },
                    ceiling: default_ceiling(),
                    treasury_in_constructor: true,
                    foundry: true,
                    utilization_ratio: Some(2000),
                    excess_collateral_distributed_ratio: None,
                    oracle: Some(OracleConfig::Mock {
                        dtoken_price: 1_005_999,
                        diamond_price: 2_000_000,
                    }),
                },
                PoolConfig {
                    name: "Diamond-Peg BNB".to_string(),
                    symbol: "dBNB".to_string(),
                    artifact: None,
                    collateral: CollateralConfig::Mock {
                        name: "Wrapped BNB".to_string(),
                        symbol: "BNB".to_string(),
                        decimals: 18,
                    },
                    ceiling: default_ceiling(),
                    treasury_in_constructor: true,
                    foundry: true,
                    utilization_ratio: Some(3000),
                    excess_collateral_distributed_ratio: None,
                    oracle: Some(OracleConfig::Mock {
                        dtoken_price: 1_005_999,
                        diamond_price: 2_000_000,
                    }),
                },
            ],
            epoch: Some(EpochConfig::default()),
            extras: vec![ExtraDeployment {
                name: "Multicall".to_string(),
                contract: None,
                args: vec![],
                tags: vec!["tooling".to_string()],
            }],
            ..ProtocolConfig::default()
        }
    }

    #[test]
    fn test_amount_parsing() {
        let e18 = U256::from(10u64).pow(U256::from(18u64));
        assert_eq!("100000000e18".parse::<Amount>().unwrap(), default_ceiling());
        assert_eq!("1.5e18".parse::<Amount>().unwrap().0, e18 * U256::from(3u64) / U256::from(2u64));
        assert_eq!("1_000".parse::<Amount>().unwrap().0, U256::from(1000u64));
        assert!("1.5".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_serde() {
        #[derive(Deserialize)]
        struct Wrapper {
            a: Amount,
            b: Amount,
        }
        let wrapper: Wrapper = serde_json::from_str(r#"{"a": 42, "b": "2e3"}"#).unwrap();
        assert_eq!(wrapper.a.0, U256::from(42u64));
        assert_eq!(wrapper.b.0, U256::from(2000u64));
    }

    #[test]
    fn test_every_dependency_is_deployed_earlier() {
        let steps = build_plan(&local_config());
        let mut deployed = HashSet::new();

        for step in &steps {
            for dependency in step.dependencies() {
                assert!(
                    deployed.contains(dependency),
                    "{} needs {dependency} before it is deployed",
                    step.label()
                );
            }
            if step.is_deploy() {
                deployed.insert(step.target.as_str());
            }
        }
    }

    #[test]
    fn test_step_labels_are_unique() {
        let steps = build_plan(&local_config());
        let labels = steps.iter().map(PipelineStep::label).collect::<HashSet<_>>();
        assert_eq!(labels.len(), steps.len());
    }

    #[test]
    fn test_artifact_names() {
        let steps = build_plan(&local_config());
        let targets = steps
            .iter()
            .filter(|step| step.is_deploy())
            .map(|step| step.target.as_str())
            .collect::<Vec<_>>();

        for expected in [
            "Timelock",
            "CollateralReserve",
            "Treasury",
            "Diamond",
            "dBTC",
            "MockBTCB",
            "Pool_dBTC",
            "Foundry_dBTC",
            "PairOracle_dBTC_BTCB",
            "PairOracle_DND_BTCB",
            "dBNB",
            "Multicall",
        ] {
            assert!(targets.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_pool_tags_select_one_pool() {
        let steps = StepFilter::new(["pool:dBNB"]).apply(build_plan(&local_config()));
        assert!(!steps.is_empty());
        assert!(steps.iter().all(|step| !step.label().contains("dBTC")));
        assert!(steps.iter().any(|step| step.target == "Pool_dBNB"));
    }

    #[test]
    fn test_existing_collateral_without_reserve() {
        let collateral = Address::repeat_byte(0xcc);
        let config = ProtocolConfig {
            pools: vec![PoolConfig {
                name: "Diamond-Peg ETH".to_string(),
                symbol: "dETH".to_string(),
                artifact: Some("dToken_dETH".to_string()),
                collateral: CollateralConfig::Existing {
                    symbol: "ETH".to_string(),
                    address: collateral,
                },
                ceiling: default_ceiling(),
                treasury_in_constructor: false,
                foundry: true,
                utilization_ratio: None,
                excess_collateral_distributed_ratio: Some(5000),
                oracle: Some(OracleConfig::Pair {
                    dtoken_pair: Address::repeat_byte(0x01),
                    diamond_pair: Address::repeat_byte(0x02),
                }),
            }],
            ..ProtocolConfig::default()
        };

        let steps = build_plan(&config);
        assert!(!steps.iter().any(|step| step.target == COLLATERAL_RESERVE));
        assert!(!steps.iter().any(|step| step.target.starts_with("Mock")));

        let pool = steps.iter().find(|step| step.target == "Pool_dETH").unwrap();
        assert_eq!(pool.dependencies(), vec!["dToken_dETH", "Diamond"]);
        assert!(pool.describe().contains(&collateral.to_string()));

        let labels = steps.iter().map(PipelineStep::label).collect::<Vec<_>>();
        assert!(labels.contains(&"PairOracle_dETH_ETH.update".to_string()));
        assert!(labels.contains(&"Treasury.setExcessCollateralDistributedRatio[Pool_dETH]".to_string()));
    }

    #[test]
    fn test_protocol_config_from_json() {
        let config: ProtocolConfig = serde_json::from_value(serde_json::json!({
            "collateral_reserve": true,
            "pools": [{
                "name": "Diamond-Peg Bitcoin",
                "symbol": "dBTC",
                "collateral": { "kind": "mock", "name": "Bitcoin", "symbol": "BTCB" },
                "ceiling": "100000000e18",
                "oracle": { "kind": "mock", "dtoken_price": 1005999, "diamond_price": 2000000 }
            }]
        }))
        .unwrap();

        assert_eq!(config.creator_role, "creator");
        assert_eq!(config.pools[0].ceiling, default_ceiling());
        assert!(config.pools[0].treasury_in_constructor);
        assert!(matches!(
            config.pools[0].collateral,
            CollateralConfig::Mock { decimals: 18, .. }
        ));
    }
}
