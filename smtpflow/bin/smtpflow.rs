#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::Parser;
use smtpflow::{Config, Smtpflow, config};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Configuration file, overriding the usual search path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = config::find_config_file(
        args.config,
        std::env::var_os(config::CONFIG_ENV).map(PathBuf::from),
    )?;
    let config = Config::load(&path)?;

    Smtpflow::new(config).run().await
}
