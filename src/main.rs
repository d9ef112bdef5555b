use clap::Parser;
use price_lens::{install_prometheus, setup_logging, shutdown_signal, Cli, CliRunner, Commands, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting price-lens v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    // The recorder must exist before the pipeline registers its handles.
    let prometheus = if args.command.wants_metrics(&config) {
        Some(install_prometheus()?)
    } else {
        None
    };

    let cli_runner = CliRunner::new(config.clone(), prometheus)?;

    let result = match args.command {
        command @ Commands::Serve { .. } => cli_runner.run(command).await,
        command => {
            tokio::select! {
                result = cli_runner.run(command) => result,
                _ = shutdown_signal() => {
                    info!("Interrupted");
                    Ok(())
                }
            }
        }
    };

    cli_runner
        .pipeline
        .shutdown(config.timeouts.session_close)
        .await;

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Max concurrent searches: {}", config.max_concurrent_searches);
    info!("Navigation timeout: {:?}", config.timeouts.navigation);
    info!("Request timeout: {:?}", config.timeouts.request);

    Ok(config)
}
