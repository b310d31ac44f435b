use clap::Parser;
use hermod::config::Config;
use hermod::supervisor;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// A caching, accelerating recursive DNS front-end.
#[derive(Debug, Parser)]
#[command(name = "hermod", version)]
struct Args {
    /// Enable the in-place status display and verbose logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut config = Config::from_env();
    config.debug |= args.debug;

    let default_filter = if config.debug { "hermod=debug" } else { "hermod=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match supervisor::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
