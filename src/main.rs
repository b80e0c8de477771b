use anyhow::Result;
use clap::Parser;
use screenshot_runner::{install_prometheus_exporter, setup_logging, Cli, CliRunner, Config, Metrics};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose);

    info!("Starting screenshot-runner v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    if let Some(port) = args.metrics_port {
        install_prometheus_exporter(port)?;
    }

    let cli_runner = CliRunner::new(config, Metrics::new());

    if let Err(e) = cli_runner.run(args.command).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn load_config(args: &Cli) -> Result<Config> {
    let config = match &args.config {
        Some(path) => {
            let config = Config::from_file(path).await?;
            info!("Configuration loaded from {}", path.display());
            config
        }
        None => Config::default(),
    };

    Ok(config)
}
