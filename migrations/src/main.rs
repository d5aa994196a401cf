use clap::Parser;
use migrations::{cli::Cli, migrations::registry, utils::setup_context};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .pretty()
        .with_max_level(cli.log_level)
        .init();

    // Configuration problems surface before any network interaction
    let registry = registry()?;
    cli.command.validate(&registry)?;

    let ctx = setup_context(&cli, registry).await?;
    cli.command.run(&ctx).await?;
    Ok(())
}
