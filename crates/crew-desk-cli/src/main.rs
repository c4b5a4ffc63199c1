#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use crew_desk_cli::{run_cli, Cli};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "crew_desk=debug"
    } else {
        "crew_desk=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    run_cli(cli)
}
