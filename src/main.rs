use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratekeeper::config::{LoggingConfig, ServiceConfig};
use ratekeeper::transport::{serve_http, TcpServer};

/// Local request-admission control service.
#[derive(Debug, Parser)]
#[command(name = "ratekeeper", version, about)]
struct Cli {
    /// Service configuration file (YAML)
    #[arg(short, long, env = "RATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Rate limit rules file, overriding `admission.rules_path`
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Listen address, overriding `server.listen_addr`
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// HTTP middleware address, overriding `server.http_addr`
    #[arg(long)]
    http: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(rules) = cli.rules {
        config.admission.rules_path = Some(rules);
    }
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(http) = cli.http {
        config.server.http_addr = Some(http);
    }
    if cli.log_json {
        config.logging.json = true;
    }

    init_tracing(&config.logging);

    info!("Starting Ratekeeper admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        http_addr = ?config.server.http_addr,
        max_line_length = config.server.max_line_length,
        lock_shards = config.admission.lock_shards,
        failure_mode = ?config.admission.failure_mode,
        "Configuration loaded"
    );

    let engine = Arc::new(config.admission.build_engine()?);
    info!(rules = engine.rules().len(), "Admission engine initialized");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http = match config.server.http_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            Some(tokio::spawn(serve_http(
                listener,
                Arc::clone(&engine),
                stopped(shutdown_rx.clone()),
            )))
        }
        None => None,
    };

    let server = TcpServer::new(config.server.listen_addr, engine)
        .with_max_line_length(config.server.max_line_length);
    let mut tcp = tokio::spawn(server.serve_with_shutdown(stopped(shutdown_rx)));

    // A server that fails to start ends the process without waiting for a signal.
    let finished = tokio::select! {
        _ = wait_for_termination() => None,
        finished = &mut tcp => Some(finished),
    };
    let _ = shutdown_tx.send(true);

    match finished {
        Some(finished) => finished??,
        None => tcp.await??,
    }
    if let Some(http) = http {
        http.await??;
    }

    info!("Ratekeeper admission service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(logging.filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolve once the shutdown flag flips or its sender is gone.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Block until the process is asked to stop.
///
/// A signal source that cannot be registered is logged and ignored, so the
/// service still stops on the other one.
async fn wait_for_termination() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Interrupt handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Terminate handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = interrupt => "interrupt",
        _ = terminate => "terminate",
    };
    info!(signal = signal, "Stopping admission service");
}
