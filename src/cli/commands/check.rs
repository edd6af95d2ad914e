use crate::cli::args::CheckConfigArgs;
use crate::config::Config;
use anyhow::{Context, Result};

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config
        .validate()
        .with_context(|| format!("{} is not a valid configuration", args.config.display()))?;
    println!(
        "{}: ok (bind {}, advertise {}, retry ladder {:?}s x{})",
        args.config.display(),
        config.server.bind,
        config.server.advertise_or_bind(),
        config.retry.delays_seconds,
        config.retry.max_retries
    );
    Ok(())
}
