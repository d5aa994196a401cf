//! Implementations of the CLI commands

use std::time::Duration;

use deployer::{
    engine::{MigrationEngine, RunOptions},
    errors::DeployerError,
};
use itertools::Itertools;
use tracing::info;

use crate::{
    cli::{AliasArgs, MigrationArgs, RunArgs},
    utils::Context,
};

/// Print every registered migration with its checkpoint status
pub fn list(ctx: &Context) -> Result<(), DeployerError> {
    let engine = MigrationEngine::new(&ctx.registry, RunOptions::default());
    for (name, status) in engine.statuses(&ctx.deployment) {
        let status = status.map_or_else(|| "registered".to_string(), |s| format!("{:?}", s));
        println!("{:<48} {}", name, status);
    }

    Ok(())
}

/// Run migrations in order
pub async fn run(args: RunArgs, ctx: &Context) -> Result<(), DeployerError> {
    let options = RunOptions {
        prepare_only: args.prepare_only,
        verify: !args.no_verify,
        force_enact: args.force_enact,
        run_timeout: args.run_timeout_secs.map(Duration::from_secs),
    };

    let names: Vec<String> = if args.migrations.is_empty() {
        ctx.registry.names().map(str::to_string).collect()
    } else {
        args.migrations
    };

    info!(
        scope = %ctx.deployment.scope(),
        migrations = %names.iter().join(", "),
        "running migrations"
    );

    let engine = MigrationEngine::new(&ctx.registry, options);
    let reports = engine
        .run(&names, &ctx.deployment, ctx.governance())
        .await?;

    for report in reports {
        println!("{:<48} {:?}", report.name, report.state);
    }
    Ok(())
}

/// Print whether a migration's change is live
pub async fn enacted(args: MigrationArgs, ctx: &Context) -> Result<(), DeployerError> {
    let engine = MigrationEngine::new(&ctx.registry, RunOptions::default());
    let live = engine.enacted(&args.migration, &ctx.deployment).await?;
    println!("{}", live);
    Ok(())
}

/// Verify a migration against its checkpointed vars
pub async fn verify(args: MigrationArgs, ctx: &Context) -> Result<(), DeployerError> {
    let engine = MigrationEngine::new(&ctx.registry, RunOptions::default());
    let report = engine.verify(&args.migration, &ctx.deployment).await?;
    println!("{:<48} {:?}", report.name, report.state);
    Ok(())
}

/// Re-crawl the deployment and print what was found
pub async fn spider(ctx: &Context) -> Result<(), DeployerError> {
    let manifest = ctx.deployment.spider().await?;
    for node in manifest.nodes() {
        let edges = manifest
            .edges_from(node.address)
            .map(|e| format!("{} -> {}", e.label, e.to))
            .join(", ");
        println!("{} {:<12} {}", node.address, node.kind.as_str(), edges);
    }

    Ok(())
}

/// Print the resolved alias table
pub async fn aliases(ctx: &Context) -> Result<(), DeployerError> {
    let table = ctx.deployment.contracts().await?;
    for (alias, record) in table.iter() {
        let marker = if record.is_proxy_target { " (implementation)" } else { "" };
        println!("{:<40} {}{}", alias, record.address, marker);
    }

    Ok(())
}

/// Set a crawl root
pub fn set_root(args: AliasArgs, ctx: &Context) -> Result<(), DeployerError> {
    ctx.deployment.set_root(&args.alias, args.address)?;
    info!(alias = %args.alias, address = %args.address, "set crawl root");
    Ok(())
}

/// Register a contract this tool did not deploy
pub fn register(args: AliasArgs, ctx: &Context) -> Result<(), DeployerError> {
    ctx.deployment.existing(&args.alias, args.address, None, None)?;
    Ok(())
}
