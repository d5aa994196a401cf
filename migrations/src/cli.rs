//! Definitions of CLI arguments and commands for the migrations binary

use std::{path::PathBuf, time::Duration};

use alloy_primitives::Address;
use clap::{Args, Parser, Subcommand};
use deployer::{
    constants::{
        DEFAULT_CACHE_DIR, DEFAULT_CRAWL_CONCURRENCY, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF,
        DEFAULT_MAX_CRAWL_NODES, DEFAULT_RETRY_BUDGET,
    },
    errors::DeployerError,
    migration::MigrationRegistry,
    retry::RetryPolicy,
    spider::SpiderConfig,
};
use tracing::Level;

use crate::{
    commands::{aliases, enacted, list, register, run, set_root, spider, verify},
    constants::{DEFAULT_ARTIFACTS_DIR, DEFAULT_NETWORKS_FILE},
    utils::Context,
};

/// The command line arguments
#[derive(Parser)]
#[command(about = "Deploy, discover and migrate lending market deployments")]
pub struct Cli {
    /// The network the deployment lives on, as named in the networks file
    #[arg(short, long, env = "NETWORK")]
    pub network: String,

    /// The deployment to operate on, e.g. `usdc`
    #[arg(short, long, env = "DEPLOYMENT")]
    pub deployment: String,

    /// Path to the network registry
    #[arg(long, default_value = DEFAULT_NETWORKS_FILE)]
    pub networks_file: PathBuf,

    /// Directory of the artifact cache
    #[arg(long, default_value = DEFAULT_CACHE_DIR)]
    pub cache_dir: PathBuf,

    /// Directory of compiled contract artifacts
    #[arg(long, default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts_dir: PathBuf,

    /// Private key of the deployer; read-only commands work without one
    #[arg(short, long, env = "PKEY", hide_env_values = true)]
    pub pkey: Option<String>,

    /// The network governance lives on, if not the deployment's
    #[arg(long)]
    pub gov_network: Option<String>,

    /// The deployment holding the governor, if not the deployment itself
    #[arg(long)]
    pub gov_deployment: Option<String>,

    /// The wall-clock budget for retrying a single network call
    #[arg(long, default_value_t = DEFAULT_RETRY_BUDGET.as_millis() as u64)]
    pub retry_budget_ms: u64,

    /// The backoff before the first retry
    #[arg(long, default_value_t = DEFAULT_INITIAL_BACKOFF.as_millis() as u64)]
    pub initial_backoff_ms: u64,

    /// The upper bound on a single backoff
    #[arg(long, default_value_t = DEFAULT_MAX_BACKOFF.as_millis() as u64)]
    pub max_backoff_ms: u64,

    /// The number of contracts probed at once while crawling
    #[arg(long, default_value_t = DEFAULT_CRAWL_CONCURRENCY)]
    pub crawl_concurrency: usize,

    /// The number of contracts a crawl may discover before it is aborted
    #[arg(long, default_value_t = DEFAULT_MAX_CRAWL_NODES)]
    pub max_crawl_nodes: usize,

    /// The log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: Level,

    /// The command to run
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// The (network, deployment) pair holding the governor
    pub fn governance_scope(&self) -> (&str, &str) {
        (
            self.gov_network.as_deref().unwrap_or(&self.network),
            self.gov_deployment.as_deref().unwrap_or(&self.deployment),
        )
    }

    /// The retry policy for network calls
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            budget: Duration::from_millis(self.retry_budget_ms),
            ..Default::default()
        }
    }

    /// The crawl bounds
    pub fn spider_config(&self) -> SpiderConfig {
        SpiderConfig {
            max_concurrency: self.crawl_concurrency,
            max_nodes: self.max_crawl_nodes,
        }
    }
}

/// The subcommands
#[derive(Subcommand)]
pub enum Command {
    /// List the registered migrations and how far each has progressed
    List,
    /// Run migrations
    Run(RunArgs),
    /// Check whether a migration's change is live
    Enacted(MigrationArgs),
    /// Verify a migration's post-conditions
    Verify(MigrationArgs),
    /// Re-crawl the deployment from its roots
    Spider,
    /// Print the resolved alias table
    Aliases,
    /// Set a crawl root
    SetRoot(AliasArgs),
    /// Register a contract this tool did not deploy
    Register(AliasArgs),
}

impl Command {
    /// Check the command against the registry, before connecting to any
    /// network
    pub fn validate(&self, registry: &MigrationRegistry) -> Result<(), DeployerError> {
        match self {
            Command::Run(args) => registry.select(&args.migrations).map(|_| ()),
            Command::Enacted(args) | Command::Verify(args) => {
                registry.get(&args.migration).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Run the command
    pub async fn run(self, ctx: &Context) -> Result<(), DeployerError> {
        match self {
            Command::List => list(ctx),
            Command::Run(args) => run(args, ctx).await,
            Command::Enacted(args) => enacted(args, ctx).await,
            Command::Verify(args) => verify(args, ctx).await,
            Command::Spider => spider(ctx).await,
            Command::Aliases => aliases(ctx).await,
            Command::SetRoot(args) => set_root(args, ctx),
            Command::Register(args) => register(args, ctx),
        }
    }
}

/// Run migrations in order, stopping at the first failure
#[derive(Args)]
pub struct RunArgs {
    /// The migrations to run; all registered migrations if empty
    pub migrations: Vec<String>,

    /// Stop after `prepare`
    #[arg(long)]
    pub prepare_only: bool,

    /// Skip `verify`
    #[arg(long)]
    pub no_verify: bool,

    /// Enact again even if a previous attempt's outcome is unknown
    #[arg(long)]
    pub force_enact: bool,

    /// Abort the run after this many seconds
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,
}

/// Select one migration
#[derive(Args)]
pub struct MigrationArgs {
    /// The migration name
    pub migration: String,
}

/// Bind an alias to an address
#[derive(Args)]
pub struct AliasArgs {
    /// The alias
    pub alias: String,

    /// The contract address in hex
    pub address: Address,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;

    use super::{Cli, Command};

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "migrations",
            "--network",
            "mainnet",
            "--deployment",
            "usdc",
            "--gov-network",
            "ethereum",
            "--retry-budget-ms",
            "5000",
            "run",
            "001_upgrade_market_implementation",
            "--force-enact",
            "--run-timeout-secs",
            "600",
        ])
        .unwrap();

        assert_eq!(cli.governance_scope(), ("ethereum", "usdc"));
        assert_eq!(cli.retry_policy().budget, Duration::from_millis(5000));

        let Command::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert_eq!(args.migrations, vec!["001_upgrade_market_implementation"]);
        assert!(args.force_enact);
        assert!(!args.prepare_only);
        assert_eq!(args.run_timeout_secs, Some(600));
    }

    #[test]
    fn test_addresses_are_validated() {
        let res = Cli::try_parse_from([
            "migrations",
            "--network",
            "mainnet",
            "--deployment",
            "usdc",
            "set-root",
            "market",
            "0x1234",
        ]);
        assert!(res.is_err());
    }
}
