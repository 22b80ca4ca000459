use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = infrapulse_cli::Cli::parse();
    infrapulse_cli::run_cli(cli)
}
