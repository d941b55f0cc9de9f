use clap::Parser;

use vigil_core::cli::{self, Cli};
use vigil_core::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli::build_config(&cli);
    init_tracing(&config.log_filter);
    cli::run(cli, config).await
}
