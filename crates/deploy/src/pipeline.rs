//! Ordered execution of deploy and call steps.
//!
//! Steps are plain data. Arguments that depend on earlier steps, on named
//! accounts or on the clock are described by [`ArgSpec`]s and resolved right
//! before the step runs, so a step list can be built, filtered and printed
//! without touching the chain.

use std::{collections::BTreeSet, fmt};

use alloy_core::primitives::{Address, B256, U256};
use comfy_table::{Table, presets::UTF8_FULL};
use serde::{Deserialize, Serialize};

use crate::{
    abi::AbiArg,
    accounts::NamedAccounts,
    chain::ChainClient,
    contracts::ContractSource,
    error::{DeployError, Result},
    init::{self, InitOutcome, Initializer, Probe},
    registry::{ArtifactRegistry, DeployOutcome, DeployRequest},
};

/// Role used when a step does not name one.
pub const DEFAULT_ROLE: &str = "deployer";

/// A step argument, resolved at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgSpec {
    Literal(AbiArg),
    /// Address of a deployed artifact.
    Artifact(String),
    /// Address of a named account.
    Account(String),
    /// Current unix time plus an offset, in seconds.
    Timestamp { offset_secs: i64 },
}

impl ArgSpec {
    pub fn literal(value: impl Into<AbiArg>) -> Self {
        Self::Literal(value.into())
    }

    pub fn artifact(name: impl Into<String>) -> Self {
        Self::Artifact(name.into())
    }

    pub fn account(role: impl Into<String>) -> Self {
        Self::Account(role.into())
    }

    pub fn now() -> Self {
        Self::Timestamp { offset_secs: 0 }
    }

    pub fn now_plus(offset_secs: i64) -> Self {
        Self::Timestamp { offset_secs }
    }

    fn dependency(&self) -> Option<&str> {
        match self {
            Self::Artifact(name) => Some(name),
            _ => None,
        }
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<AbiArg> {
        Ok(match self {
            Self::Literal(value) => value.clone(),
            Self::Artifact(name) => AbiArg::Address(ctx.registry.address(name)?),
            Self::Account(role) => AbiArg::Address(ctx.accounts.address(role)?),
            Self::Timestamp { offset_secs } => {
                let timestamp = ctx.now.saturating_add(*offset_secs);
                let timestamp = u64::try_from(timestamp).map_err(|_| {
                    DeployError::InvalidArgument(format!("timestamp {timestamp} is before the epoch"))
                })?;
                AbiArg::Uint(U256::from(timestamp))
            }
        })
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "{value}"),
            Self::Artifact(name) => write!(f, "@{name}"),
            Self::Account(role) => write!(f, "${role}"),
            Self::Timestamp { offset_secs: 0 } => write!(f, "now"),
            Self::Timestamp { offset_secs } => write!(f, "now{offset_secs:+}s"),
        }
    }
}

/// A [`Probe`] whose arguments are resolved at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub getter: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    #[serde(default)]
    pub expect: Option<ArgSpec>,
}

impl ProbeSpec {
    pub fn flag(getter: &str) -> Self {
        Self::equals(getter, vec![], ArgSpec::literal(true))
    }

    pub fn equals(getter: &str, args: Vec<ArgSpec>, expect: ArgSpec) -> Self {
        Self {
            getter: getter.to_string(),
            args,
            expect: Some(expect),
        }
    }

    pub fn nonzero(getter: &str) -> Self {
        Self {
            getter: getter.to_string(),
            args: vec![],
            expect: None,
        }
    }

    fn resolve(&self, ctx: &ResolveContext<'_>) -> Result<Probe> {
        Ok(Probe {
            getter: self.getter.clone(),
            args: resolve_all(&self.args, ctx)?,
            expect: self.expect.as_ref().map(|spec| spec.resolve(ctx)).transpose()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Deploy {
        contract: String,
        from: String,
        #[serde(default)]
        args: Vec<ArgSpec>,
    },
    Call {
        method: String,
        /// Ledger key. Derived from the method and its artifact arguments when unset.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initializer: Option<String>,
        from: String,
        #[serde(default)]
        args: Vec<ArgSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        probe: Option<ProbeSpec>,
    },
}

/// One deploy or call step of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// Artifact deployed or called by this step.
    pub target: String,
    pub action: StepAction,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl PipelineStep {
    /// Deploy `contract` under the artifact name `name`.
    pub fn deploy(name: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            target: name.into(),
            action: StepAction::Deploy {
                contract: contract.into(),
                from: DEFAULT_ROLE.to_string(),
                args: vec![],
            },
            depends_on: vec![],
            tags: BTreeSet::new(),
        }
    }

    /// Call `method` on the artifact `target`.
    pub fn call(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            action: StepAction::Call {
                method: method.into(),
                initializer: None,
                from: DEFAULT_ROLE.to_string(),
                args: vec![],
                probe: None,
            },
            depends_on: vec![],
            tags: BTreeSet::new(),
        }
    }

    pub fn from(mut self, role: impl Into<String>) -> Self {
        match &mut self.action {
            StepAction::Deploy { from, .. } | StepAction::Call { from, .. } => *from = role.into(),
        }
        self
    }

    pub fn args(mut self, specs: Vec<ArgSpec>) -> Self {
        match &mut self.action {
            StepAction::Deploy { args, .. } | StepAction::Call { args, .. } => *args = specs,
        }
        self
    }

    /// Probe deciding whether the call already took effect. No-op on deploy steps.
    pub fn probe(mut self, spec: ProbeSpec) -> Self {
        if let StepAction::Call { probe, .. } = &mut self.action {
            *probe = Some(spec);
        }
        self
    }

    /// Explicit ledger key for a call step.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        if let StepAction::Call { initializer, .. } = &mut self.action {
            *initializer = Some(name.into());
        }
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn is_deploy(&self) -> bool {
        matches!(self.action, StepAction::Deploy { .. })
    }

    /// Ledger key of a call step, e.g. `addPool[Pool_dBTC]`.
    pub fn initializer_name(&self) -> Option<String> {
        let StepAction::Call {
            method,
            initializer,
            args,
            ..
        } = &self.action
        else {
            return None;
        };

        if let Some(name) = initializer {
            return Some(name.clone());
        }

        let method = method.split('(').next().unwrap_or(method);
        let refs = args.iter().filter_map(ArgSpec::dependency).collect::<Vec<_>>();
        Some(if refs.is_empty() {
            method.to_string()
        } else {
            format!("{method}[{}]", refs.join(","))
        })
    }

    /// Human readable step name.
    pub fn label(&self) -> String {
        match self.initializer_name() {
            Some(initializer) => format!("{}.{initializer}", self.target),
            None => self.target.clone(),
        }
    }

    /// Artifacts that must be deployed before this step runs.
    pub fn dependencies(&self) -> Vec<&str> {
        let (args, probe) = match &self.action {
            StepAction::Deploy { args, .. } => (args, None),
            StepAction::Call { args, probe, .. } => (args, probe.as_ref()),
        };
        let probe_args = probe
            .into_iter()
            .flat_map(|probe| probe.args.iter().chain(probe.expect.iter()));

        let target = (!self.is_deploy()).then_some(self.target.as_str());
        let candidates = target
            .into_iter()
            .chain(self.depends_on.iter().map(String::as_str))
            .chain(args.iter().chain(probe_args).filter_map(ArgSpec::dependency));

        let mut names: Vec<&str> = Vec::new();
        for name in candidates {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// One-line description of what the step does.
    pub fn describe(&self) -> String {
        let join = |args: &[ArgSpec]| {
            args.iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        match &self.action {
            StepAction::Deploy { contract, args, .. } => format!("new {contract}({})", join(args)),
            StepAction::Call { method, args, .. } => format!("{method}({})", join(args)),
        }
    }

    pub fn role(&self) -> &str {
        match &self.action {
            StepAction::Deploy { from, .. } | StepAction::Call { from, .. } => from,
        }
    }
}

/// Selects the steps to run for an environment.
///
/// A step is kept when one of its tags is requested. An empty request keeps
/// every step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepFilter {
    tags: BTreeSet<String>,
}

impl StepFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags
                .into_iter()
                .map(Into::into)
                .filter(|tag: &String| !tag.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, step: &PipelineStep) -> bool {
        self.tags.is_empty() || !self.tags.is_disjoint(&step.tags)
    }

    pub fn apply(&self, steps: Vec<PipelineStep>) -> Vec<PipelineStep> {
        steps.into_iter().filter(|step| self.matches(step)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum StepOutcome {
    Deployed { address: Address },
    Existing { address: Address },
    Applied { tx_hash: B256 },
    AlreadyApplied,
}

impl StepOutcome {
    /// Whether the step sent a transaction.
    pub fn changed_state(&self) -> bool {
        matches!(self, Self::Deployed { .. } | Self::Applied { .. })
    }

    fn detail(&self) -> String {
        match self {
            Self::Deployed { address } | Self::Existing { address } => address.to_string(),
            Self::Applied { tx_hash } => tx_hash.to_string(),
            Self::AlreadyApplied => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: String,
    pub outcome: StepOutcome,
}

/// Per-step outcomes of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn outcome(&self, step: &str) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|report| report.step == step)
            .map(|report| report.outcome)
    }

    pub fn deployed(&self) -> usize {
        self.count(|outcome| matches!(outcome, StepOutcome::Deployed { .. }))
    }

    pub fn existing(&self) -> usize {
        self.count(|outcome| matches!(outcome, StepOutcome::Existing { .. }))
    }

    pub fn applied(&self) -> usize {
        self.count(|outcome| matches!(outcome, StepOutcome::Applied { .. }))
    }

    pub fn already_applied(&self) -> usize {
        self.count(|outcome| matches!(outcome, StepOutcome::AlreadyApplied))
    }

    /// True when the run sent no transaction.
    pub fn is_noop(&self) -> bool {
        !self.steps.iter().any(|report| report.outcome.changed_state())
    }

    fn count(&self, predicate: impl Fn(&StepOutcome) -> bool) -> usize {
        self.steps
            .iter()
            .filter(|report| predicate(&report.outcome))
            .count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["#", "Step", "Outcome", "Address / Tx"]);
        for (index, report) in self.steps.iter().enumerate() {
            table.add_row(vec![
                (index + 1).to_string(),
                report.step.clone(),
                report.outcome.to_string(),
                report.outcome.detail(),
            ]);
        }
        writeln!(f, "{table}")?;
        write!(
            f,
            "{} deployed, {} existing, {} applied, {} already applied",
            self.deployed(),
            self.existing(),
            self.applied(),
            self.already_applied()
        )
    }
}

struct ResolveContext<'a> {
    registry: &'a ArtifactRegistry,
    accounts: &'a NamedAccounts,
    now: i64,
}

fn resolve_all(specs: &[ArgSpec], ctx: &ResolveContext<'_>) -> Result<Vec<AbiArg>> {
    specs.iter().map(|spec| spec.resolve(ctx)).collect()
}

/// Runs steps against one network.
pub struct Pipeline<'a, C> {
    chain: &'a C,
    registry: &'a mut ArtifactRegistry,
    accounts: &'a NamedAccounts,
    contracts: &'a ContractSource,
}

impl<'a, C: ChainClient> Pipeline<'a, C> {
    /// Fails with [`DeployError::ChainMismatch`] if the registry was opened for
    /// another chain.
    pub fn new(
        chain: &'a C,
        registry: &'a mut ArtifactRegistry,
        accounts: &'a NamedAccounts,
        contracts: &'a ContractSource,
    ) -> Result<Self> {
        if chain.chain_id() != registry.chain_id() {
            return Err(DeployError::ChainMismatch {
                path: registry
                    .dir()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_else(|| "<memory>".to_string()),
                recorded: registry.chain_id(),
                connected: chain.chain_id(),
            });
        }

        Ok(Self {
            chain,
            registry,
            accounts,
            contracts,
        })
    }

    /// Run `steps` in order, stopping at the first failure.
    ///
    /// Completed steps stay recorded, so running the same list again resumes
    /// at the failed step.
    pub async fn run(&mut self, steps: &[PipelineStep]) -> Result<RunReport> {
        let mut report = RunReport::default();
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            let label = step.label();
            let outcome = match self.run_step(step, &label).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(step = %label, index = index + 1, total, error = %err, "Step failed");
                    return Err(err);
                }
            };

            tracing::info!(step = %label, index = index + 1, total, %outcome, "Step complete");
            report.steps.push(StepReport {
                step: label,
                outcome,
            });
        }

        Ok(report)
    }

    async fn run_step(&mut self, step: &PipelineStep, label: &str) -> Result<StepOutcome> {
        for dependency in step.dependencies() {
            if !self.registry.contains(dependency) {
                return Err(DeployError::MissingDependency {
                    step: label.to_string(),
                    dependency: dependency.to_string(),
                });
            }
        }

        let ctx = ResolveContext {
            registry: self.registry,
            accounts: self.accounts,
            now: chrono::Utc::now().timestamp(),
        };

        match &step.action {
            StepAction::Deploy {
                contract,
                from,
                args,
            } => {
                let request = DeployRequest {
                    name: step.target.clone(),
                    contract: contract.clone(),
                    from: self.accounts.address(from)?,
                    args: resolve_all(args, &ctx)?,
                    bytecode: self.contracts.bytecode(contract)?,
                };

                Ok(match self.registry.deploy(self.chain, request).await? {
                    DeployOutcome::Deployed(artifact) => StepOutcome::Deployed {
                        address: artifact.address,
                    },
                    DeployOutcome::Existing(artifact) => StepOutcome::Existing {
                        address: artifact.address,
                    },
                })
            }
            StepAction::Call {
                method,
                from,
                args,
                probe,
                ..
            } => {
                let initializer = Initializer {
                    artifact: step.target.clone(),
                    name: step.initializer_name().unwrap_or_else(|| method.clone()),
                    method: method.clone(),
                    args: resolve_all(args, &ctx)?,
                    from: self.accounts.address(from)?,
                    probe: probe.as_ref().map(|probe| probe.resolve(&ctx)).transpose()?,
                };

                Ok(
                    match init::apply(self.chain, self.registry, &initializer).await? {
                        InitOutcome::Applied { tx_hash } => StepOutcome::Applied { tx_hash },
                        InitOutcome::AlreadyApplied => StepOutcome::AlreadyApplied,
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChain, mock::MOCK_CHAIN_ID};

    #[test]
    fn test_initializer_name_from_artifact_args() {
        let step = PipelineStep::call("Treasury", "addPool")
            .args(vec![ArgSpec::artifact("Pool_dBTC")])
            .probe(ProbeSpec::equals(
                "hasPool(address)",
                vec![ArgSpec::artifact("Pool_dBTC")],
                ArgSpec::literal(true),
            ));

        assert_eq!(step.initializer_name().as_deref(), Some("addPool[Pool_dBTC]"));
        assert_eq!(step.label(), "Treasury.addPool[Pool_dBTC]");
        assert_eq!(step.dependencies(), vec!["Treasury", "Pool_dBTC"]);
    }

    #[test]
    fn test_named_call() {
        let step = PipelineStep::call("Pool_dBTC", "setOracle(address)")
            .args(vec![ArgSpec::artifact("Oracle")])
            .named("setOracleDToken");
        assert_eq!(step.label(), "Pool_dBTC.setOracleDToken");
    }

    #[test]
    fn test_deploy_dependencies() {
        let step = PipelineStep::deploy("Diamond", "Diamond")
            .args(vec![
                ArgSpec::literal("Diamond"),
                ArgSpec::literal("DND"),
                ArgSpec::artifact("Treasury"),
            ])
            .depends_on("Timelock");
        assert_eq!(step.dependencies(), vec!["Timelock", "Treasury"]);
        assert_eq!(step.describe(), r#"new Diamond("Diamond", "DND", @Treasury)"#);
    }

    #[test]
    fn test_step_filter() {
        let steps = vec![
            PipelineStep::deploy("Treasury", "Treasury").tags(["core"]),
            PipelineStep::deploy("Pool_dBTC", "Pool").tags(["pool", "pool:dBTC"]),
            PipelineStep::deploy("Multicall", "Multicall").tags(["extras"]),
        ];

        assert_eq!(StepFilter::all().apply(steps.clone()).len(), 3);

        let kept = StepFilter::new(["core", "pool:dBTC"]).apply(steps.clone());
        assert_eq!(
            kept.iter().map(|step| step.target.as_str()).collect::<Vec<_>>(),
            vec!["Treasury", "Pool_dBTC"]
        );

        assert!(StepFilter::new(["mainnet"]).apply(steps).is_empty());
    }

    #[test]
    fn test_step_serde_shape() {
        let step = PipelineStep::call("Treasury", "initializeEpoch")
            .args(vec![ArgSpec::now_plus(3600), ArgSpec::literal(28_800u64)])
            .tags(["epoch"]);

        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["action"]["kind"], "call");
        assert_eq!(json["action"]["args"][0]["timestamp"]["offset_secs"], 3600);

        let back: PipelineStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_timestamp_resolution() {
        let registry = ArtifactRegistry::in_memory(MOCK_CHAIN_ID);
        let accounts = NamedAccounts::default();
        let ctx = ResolveContext {
            registry: &registry,
            accounts: &accounts,
            now: 1_700_000_000,
        };

        assert_eq!(
            ArgSpec::now_plus(60).resolve(&ctx).unwrap(),
            AbiArg::from(1_700_000_060u64)
        );
        assert!(ArgSpec::now_plus(-1_800_000_000).resolve(&ctx).is_err());
        assert!(matches!(
            ArgSpec::artifact("Treasury").resolve(&ctx),
            Err(DeployError::NotFound(_))
        ));
    }

    #[test]
    fn test_pipeline_rejects_foreign_registry() {
        let chain = MockChain::new(1);
        let mut registry = ArtifactRegistry::in_memory(MOCK_CHAIN_ID);
        let accounts = NamedAccounts::default();
        let contracts = ContractSource::default();

        assert!(matches!(
            Pipeline::new(&chain, &mut registry, &accounts, &contracts),
            Err(DeployError::ChainMismatch { .. })
        ));
    }

    #[test]
    fn test_report_counts() {
        let report = RunReport {
            steps: vec![
                StepReport {
                    step: "Treasury".to_string(),
                    outcome: StepOutcome::Existing {
                        address: Address::ZERO,
                    },
                },
                StepReport {
                    step: "Diamond.initialize".to_string(),
                    outcome: StepOutcome::AlreadyApplied,
                },
            ],
        };

        assert!(report.is_noop());
        assert_eq!(report.existing(), 1);
        assert_eq!(report.already_applied(), 1);
        assert!(report.to_string().contains("Diamond.initialize"));
    }
}
