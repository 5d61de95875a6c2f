//! dnd is a CLI tool to deploy and wire the Diamond protocol contracts, idempotently.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command, PlanFormat};
use dnd_deploy::{DeployConfig, Deployer, plan_table, status_table};

#[tokio::main]
async fn main() -> Result<()> {
    // Keys and mnemonics usually live in a local .env file.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    if let Command::Init { force } = cli.command {
        if cli.config.exists() && !force {
            anyhow::bail!(
                "{} already exists, pass --force to overwrite it",
                cli.config.display()
            );
        }
        DeployConfig::localhost().save_to_file(&cli.config)?;
        return Ok(());
    }

    let config = DeployConfig::load(&cli.config)?;

    match cli.command {
        Command::Deploy(target) => {
            let deployer = Deployer::new(config, &target.network)?;
            let report = deployer.deploy(&target.tags).await?;
            println!("{report}");
        }
        Command::Plan { target, format } => {
            let deployer = Deployer::new(config, &target.network)?;
            let steps = deployer.steps(&target.tags);
            match format {
                PlanFormat::Table => println!("{}", plan_table(&steps)),
                PlanFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&steps).context("Failed to serialize steps")?
                ),
            }
        }
        Command::Status { network } => {
            let deployer = Deployer::new(config, &network)?;
            let statuses = deployer.status().await?;
            println!("{}", status_table(&statuses));
        }
        Command::Fund { network, account } => {
            let deployer = Deployer::new(config, &network)?;
            let report = deployer.fund(account).await?;
            tracing::info!(
                %account,
                minted = report.minted.len(),
                native = report.native_tx.is_some(),
                "✓ Account funded"
            );
        }
        Command::Init { .. } => {}
    }

    Ok(())
}
