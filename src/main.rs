use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use followwatch::config::{self, Config, ProviderConfig};
use followwatch::follows::command::CommandSessionProvider;
use followwatch::follows::http::HttpSessionProvider;
use followwatch::follows::{FollowStreamAdapter, SessionProvider};
use followwatch::notifier::{DiscordNotifier, LogNotifier, Notifier};
use followwatch::store::{self, JsonFileStore, WatermarkStore};
use followwatch::{ConfigError, Monitor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "followwatch")]
#[command(about = "Announce new follows of watched accounts to Discord", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to config file (TOML, or JSON when it ends in .json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the watermark state file
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Log alerts instead of posting them
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll forever (default)
    Run,
    /// Check every target once and exit
    Once,
    /// Print the stored watermarks
    State,
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("followwatch=info"));

    let appender = log_dir.and_then(|dir| {
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("followwatch")
            .filename_suffix("log")
            .build(dir)
            .map_err(|e| eprintln!("file logging disabled, cannot write to {}: {}", dir.display(), e))
            .ok()
    });

    let (file_layer, guard) = match appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

fn build_provider(config: &ProviderConfig) -> Arc<dyn SessionProvider> {
    match config {
        ProviderConfig::Http {
            base_url,
            page_size,
            timeout_secs,
        } => Arc::new(HttpSessionProvider::new(
            base_url.clone(),
            *page_size,
            Duration::from_secs(*timeout_secs),
        )),
        ProviderConfig::Command {
            program,
            args_prefix,
            timeout_secs,
        } => Arc::new(CommandSessionProvider::new(
            program.clone(),
            args_prefix.clone(),
            Duration::from_secs(*timeout_secs),
        )),
    }
}

fn build_notifier(config: &Config, dry_run: bool) -> Result<Arc<dyn Notifier>, ConfigError> {
    if dry_run {
        return Ok(Arc::new(LogNotifier));
    }
    match config.webhook_url() {
        Some(url) => Ok(Arc::new(DiscordNotifier::new(url.to_string()))),
        None => Err(ConfigError::Invalid(
            "notifier.discord_webhook_url is required unless --dry-run is set".to_string(),
        )),
    }
}

/// Flip the shutdown flag on Ctrl+C or SIGTERM.
fn spawn_signal_handler(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("failed to listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => info!("Received Ctrl+C, finishing current target..."),
            () = terminate => info!("Received SIGTERM, finishing current target..."),
        }
        let _ = tx.send(true);
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path)?;

    let log_dir = config
        .log_dir
        .clone()
        .or_else(|| dirs::data_dir().map(|d| d.join("followwatch").join("logs")));
    let _guard = init_logging(log_dir.as_deref());

    let state_path = cli
        .state
        .or_else(|| config.state_path.clone())
        .unwrap_or_else(config::default_state_path);

    if let Some(Commands::State) = cli.command {
        let watermarks = JsonFileStore::new(&state_path)
            .load_all()
            .await
            .with_context(|| format!("reading {}", state_path.display()))?;
        for target in &config.targets {
            match watermarks.get(target) {
                Some(id) => println!("{}\t{}", target, id),
                None => println!("{}\t-", target),
            }
        }
        for (target, id) in watermarks.iter().filter(|(t, _)| !config.targets.contains(*t)) {
            println!("{}\t{}\t(not configured)", target, id);
        }
        return Ok(());
    }

    let notifier = build_notifier(&config, cli.dry_run)?;
    let adapter = FollowStreamAdapter::new(build_provider(&config.provider));
    let store = store::open_for_run(&state_path, cli.dry_run)
        .await
        .with_context(|| format!("opening {}", state_path.display()))?;
    if cli.dry_run {
        info!("Dry run: alerts are logged and {} is left untouched", state_path.display());
    }

    let mut monitor = Monitor::new(
        config.targets.clone(),
        config.poll_interval(),
        adapter,
        notifier,
        store,
    );
    monitor
        .load_state()
        .await
        .with_context(|| format!("loading state from {}", state_path.display()))?;

    let (tx, rx) = watch::channel(false);
    spawn_signal_handler(tx);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Once => {
            let mut rx = rx;
            monitor.run_pass(&mut rx).await;
        }
        _ => monitor.run(rx).await,
    }

    Ok(())
}
