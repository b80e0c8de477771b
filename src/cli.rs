use crate::{
    build_tasks, read_pages_from_file, Config, Metrics, PageCapture, ProgressReporter,
    ResourcePool, RunReport, TabFactory, TaskScheduler,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "screenshot-runner")]
#[command(about = "Visual-regression screenshots across pages and viewports")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture every page at every configured viewport
    Run(RunArgs),

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },

    /// Print the capture tasks a run would execute, without launching Chrome
    Tasks {
        #[arg(short, long, help = "File listing page paths (one per line)")]
        pages: PathBuf,

        #[arg(long, help = "Base URL the page paths are resolved against")]
        base_url: Option<String>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(short, long, help = "File listing page paths (one per line)")]
    pub pages: PathBuf,

    #[arg(long, help = "Base URL the page paths are resolved against")]
    pub base_url: Option<String>,

    #[arg(short, long, help = "Output directory for screenshots")]
    pub output: Option<PathBuf>,

    #[arg(short, long, help = "Maximum tasks in flight")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "Number of browser tabs (defaults to concurrency)")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Replace a tab after this many uses")]
    pub recycle_after: Option<usize>,

    #[arg(long, help = "Navigation timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

impl RunArgs {
    /// Command-line values win over the config file.
    pub fn apply(&self, config: &mut Config) {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = Some(pool_size);
        }
        if let Some(recycle_after) = self.recycle_after {
            config.recycle_after = Some(recycle_after);
        }
        if let Some(timeout) = self.timeout {
            config.navigation_timeout_ms = timeout * 1000;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
    }
}

pub struct CliRunner {
    pub config: Config,
    pub metrics: Metrics,
}

impl CliRunner {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        Self { config, metrics }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run(args) => self.run_capture(args).await,
            Commands::Validate { config } => self.validate_config(config).await,
            Commands::Tasks { pages, base_url } => self.list_tasks(pages, base_url).await,
        }
    }

    pub async fn run_capture(&self, args: RunArgs) -> Result<()> {
        let mut config = self.config.clone();
        args.apply(&mut config);
        config.validate()?;

        let pages = read_pages_from_file(&args.pages)
            .await
            .with_context(|| format!("Failed to read pages from {}", args.pages.display()))?;
        let tasks = build_tasks(&pages, &config)?;
        info!("Loaded {} pages, {} capture tasks", pages.len(), tasks.len());

        if tasks.is_empty() {
            warn!("Nothing to capture");
            return Ok(());
        }

        fs::create_dir_all(&config.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

        let factory = TabFactory::launch(&config).await?;
        let pool = Arc::new(ResourcePool::new(
            factory,
            config.pool_size(),
            config.recycle_after,
        )?);
        let reporter = Arc::new(ProgressReporter::for_terminal(tasks.len(), config.concurrency));
        let scheduler = TaskScheduler::new(
            pool.clone(),
            Arc::new(PageCapture::new(&config)),
            reporter,
            config.concurrency,
        )?
        .with_metrics(self.metrics.clone());

        let signal_handler = tokio::spawn({
            let pool = pool.clone();
            async move {
                shutdown_signal().await;
                warn!("Shutdown requested, draining pool");
                pool.shutdown().await;
            }
        });

        let started_at = Utc::now();
        let total = tasks.len();
        let summary = scheduler.run(tasks).await;
        signal_handler.abort();

        let stats = pool.stats().await;
        pool.shutdown().await;
        pool.factory().shutdown().await;

        let report = RunReport::new(started_at, total, &summary, stats);
        let path = report.write_to(&config.output_dir).await?;
        info!("Report written to {}", path.display());

        println!(
            "Captured {}/{} screenshots into {}",
            summary.succeeded,
            total,
            config.output_dir.display()
        );

        if !summary.is_success() {
            bail!("{} of {} captures failed", summary.failures().len(), total);
        }

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = Config::from_file(&config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Base URL: {}", config.base_url);
        println!("  Concurrency: {}", config.concurrency);
        println!("  Pool size: {}", config.pool_size());
        match config.recycle_after {
            Some(n) => println!("  Recycle after: {n} uses"),
            None => println!("  Recycle after: never"),
        }
        println!("  Navigation timeout: {:?}", config.navigation_timeout());
        println!("  Output: {} ({:?})", config.output_dir.display(), config.output_format);
        for viewport in &config.viewports {
            println!(
                "  Viewport {}: {}x{} @{}x{}",
                viewport.name,
                viewport.width,
                viewport.height,
                viewport.device_scale_factor,
                if viewport.mobile { " (mobile)" } else { "" }
            );
        }
        println!("  Page overrides: {}", config.pages.len());

        Ok(())
    }

    pub async fn list_tasks(&self, pages_path: PathBuf, base_url: Option<String>) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(base_url) = base_url {
            config.base_url = base_url;
        }

        let pages = read_pages_from_file(&pages_path)
            .await
            .with_context(|| format!("Failed to read pages from {}", pages_path.display()))?;
        let tasks = build_tasks(&pages, &config)?;

        for task in &tasks {
            let hook = if task.hook.is_some() { " [hook]" } else { "" };
            println!("{}\t{}{}", task.label(), task.url, hook);
        }
        println!("{} tasks", tasks.len());

        Ok(())
    }
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            _ => warn!("Failed to install signal handlers, falling back to Ctrl-C"),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl-C");
    }
}

/// Logs go to stderr; stdout belongs to the progress output.
pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
