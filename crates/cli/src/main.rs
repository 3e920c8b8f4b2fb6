use clap::{Parser, Subcommand};
use pagebridge_cli::echo::EchoHandler;
use pagebridge_cli::{get_config_dir, render_config, start_server};
use pagebridge_core::audit::AUDIT_TARGET;
use pagebridge_core::config::AppConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(name = "pagebridge")]
#[command(version)]
#[command(about = "Messenger page webhook bridge")]
struct Cli {
    /// Path to a JSON config file (default: ~/.pagebridge/config.json)
    #[arg(short, long, global = true, env = "PAGEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the webhook server (default)
    Serve {
        /// Override server.host
        #[arg(long)]
        host: Option<String>,
        /// Override server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration with secrets masked
    CheckConfig,
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        get_config_dir().join("logs"),
        "audit.jsonl",
    ));

    let audit_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_level(false)
        .with_file(false)
        .with_line_number(false)
        .without_time() // Timestamp is in JSON
        .with_filter(tracing_subscriber::filter::Targets::new().with_target(AUDIT_TARGET, Level::INFO));

    let stdout_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // EnvFilter can't exclude a target, so audit records are dropped here.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != AUDIT_TARGET
        }));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(audit_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    match cli.command {
        Some(Commands::CheckConfig) => {
            println!("{}", serde_json::to_string_pretty(&render_config(&config))?);
            let missing = config.missing_credentials();
            if !missing.is_empty() {
                anyhow::bail!("missing credentials: {}", missing.join(", "));
            }
            Ok(())
        }
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            start_server(config, Arc::new(EchoHandler), shutdown_signal()).await
        }
        None => start_server(config, Arc::new(EchoHandler), shutdown_signal()).await,
    }
}
