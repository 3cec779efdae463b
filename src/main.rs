//! logvault - A Redis-Protocol Log Archiving Daemon
//!
//! This is the main entry point for the logvault server.
//! It reads the configuration, wires the archive manager, command handler and
//! listener together, and runs until SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use logvault::commands::{ArchiveHandler, WriteMode};
use logvault::config::{Config, Settings};
use logvault::server::Server;
use logvault::FileResourceManager;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(settings: &Settings) {
    let mode = match settings.write_mode {
        WriteMode::Sync => "sync".to_string(),
        WriteMode::Queued { capacity } => format!("queued (capacity {})", capacity),
    };
    println!(
        r#"
logvault v{} - Redis-Protocol Log Archiving Daemon
──────────────────────────────────────────────────────────────
Listening on   {}
Archive root   {}
Idle timeout   {}s
Write mode     {}

Use Ctrl+C to shutdown gracefully.
"#,
        logvault::VERSION,
        settings.listen,
        settings.root.display(),
        settings.idle_timeout.as_secs(),
        mode
    );
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = signal::ctrl_c().await;
                info!("received SIGINT, shutting down");
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("received SIGINT, shutting down");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let settings = config.validate().context("invalid configuration")?;

    let manager = FileResourceManager::new(settings.manager_config());
    info!(root = %settings.root.display(), timeout_secs = settings.idle_timeout.as_secs(), "archive manager initialized");

    let handler = ArchiveHandler::new(manager, settings.handler_config());
    let registry = handler.commands().context("failed to build command table")?;

    let server = Server::bind(&settings.listen, registry)
        .await?
        .with_grace_period(settings.grace_period);

    print_banner(&settings);
    handler.init();

    server.serve(shutdown_signal()).await;

    info!("server shutdown complete");
    Ok(())
}
