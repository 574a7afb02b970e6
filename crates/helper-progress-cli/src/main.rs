use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = helper_progress_cli::Cli::parse();
    helper_progress_cli::run_cli(cli)
}
