use amux_tracker_daemon::bus::EventBus;
use amux_tracker_daemon::collector::tmux::{TmuxCapture, TmuxFetcher};
use amux_tracker_daemon::command::CommandRunner;
use amux_tracker_daemon::config::ConfigManager;
use amux_tracker_daemon::service::{
    data_dir, now_ms, wait_for_shutdown, InstanceGuard, WatchService,
};
use amux_tracker_daemon::{logging, APP_NAME};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Parser)]
#[command(name = "amux-tracker-daemon", version, about = "amux workspace-activity tracker")]
struct Args {
    /// Optional config file override (TOML).
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Scan interval override in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Run a single scan, print the active workspaces as JSON, and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut manager = match ConfigManager::load_from_fs(args.config) {
        Ok(manager) => manager,
        Err(err) => {
            eprintln!("failed to load config: {err}");
            std::process::exit(2);
        }
    };
    if let Some(level) = args.log_level {
        manager.config_mut().logging.level = level;
    }
    if let Some(interval) = args.interval_ms {
        manager.config_mut().polling.scan_interval_ms = interval;
    }

    // Logs go to stderr (or the configured file); stdout carries the
    // activity-change stream.
    let _log_guard = logging::init(&manager.config().logging);
    tracing::info!(
        daemon = APP_NAME,
        version = amux_tracker_daemon::version(),
        config_path = %manager
            .config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<defaults>".to_string()),
        "daemon bootstrap"
    );

    let runner = Arc::new(CommandRunner::new(&manager.config().multiplexer));
    let fetcher = Arc::new(TmuxFetcher::new(runner.clone()));
    let capture = Arc::new(TmuxCapture::new(runner));
    let bus = Arc::new(EventBus::new(64));

    let mut service = WatchService::new(
        manager.config().clone(),
        Some(fetcher),
        capture,
        bus.clone(),
    );

    if args.once {
        match service.scan_once(now_ms()).await {
            Ok(summary) => {
                let line = serde_json::json!({
                    "active_workspaces": summary.active_workspaces,
                    "sessions_scanned": summary.sessions_scanned,
                });
                println!("{line}");
            }
            Err(err) => {
                tracing::error!(error = %err, "scan failed");
                std::process::exit(1);
            }
        }
        return;
    }

    let _instance = match InstanceGuard::acquire(&data_dir()) {
        Ok(guard) => guard,
        Err(err) => {
            tracing::error!(error = %err, "could not acquire instance lock");
            std::process::exit(1);
        }
    };

    // Stream every activity change as one JSON line on stdout.
    let mut rx = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(change) = rx.recv().await {
            match serde_json::to_string(&change) {
                Ok(line) => println!("{line}"),
                Err(err) => tracing::warn!(error = %err, "could not serialize change"),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let signals = tokio::spawn(wait_for_shutdown(shutdown_tx));

    service.run(shutdown_rx).await;

    signals.abort();
    printer.abort();
}
