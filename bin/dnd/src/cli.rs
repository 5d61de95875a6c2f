use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Args, Parser, Subcommand};
use dnd_deploy::CONFIG_FILENAME;
use tracing::level_filters::LevelFilter;

/// How `dnd plan` prints the selected steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PlanFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "dnd")]
#[command(
    author,
    version,
    about = "Deploy and wire the Diamond protocol contracts"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "DND_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the configuration file, or to a directory holding a `Dnd.toml`.
    #[arg(long, alias = "conf", global = true, env = "DND_CONFIG", default_value = CONFIG_FILENAME)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Deploy and initialize the selected steps.
    Deploy(TargetArgs),

    /// Print the selected steps without touching the chain.
    Plan {
        #[command(flatten)]
        target: TargetArgs,

        /// Output format.
        #[arg(long, default_value_t = PlanFormat::Table)]
        format: PlanFormat,
    },

    /// Show the artifact registry of a network and check it against the chain.
    Status {
        /// The network to inspect, as named in the configuration.
        #[arg(short, long, env = "DND_NETWORK")]
        network: String,
    },

    /// Mint mock collateral and send native currency to a dev account.
    Fund {
        /// The network to use, as named in the configuration.
        #[arg(short, long, env = "DND_NETWORK")]
        network: String,

        /// The account to fund.
        #[arg(long)]
        account: Address,
    },

    /// Write a starting configuration for a local dev node.
    Init {
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
}

/// Network and step selection.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// The network to deploy to, as named in the configuration.
    #[arg(short, long, env = "DND_NETWORK")]
    pub network: String,

    /// Only run steps carrying one of these tags.
    ///
    /// Defaults to the network's `tags`. An empty selection runs every step.
    #[arg(short, long, value_delimiter = ',', env = "DND_TAGS")]
    pub tags: Vec<String>,
}
