//! CatchBot entry point.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use catchbot::shutdown::wait_for_signal;
use catchbot::CatchConfig;
use catchbot_server::{build_session, init_logging, rest};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "catchbot",
    about = "Watch a live crash game page and log every round result",
    version
)]
struct Cli {
    /// HTTP port for the control surface.
    #[arg(long, env = "PORT", default_value_t = 8001)]
    http_port: u16,

    /// Do not start the browser session on boot.
    #[arg(long)]
    no_autostart: bool,

    /// Log level (trace, debug, info, warn, error). RUST_LOG overrides it.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json_logs);
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    let config = CatchConfig::from_env();
    info!(
        debug_port = config.debug_port,
        results_dir = %config.results_dir.display(),
        interval_ms = config.monitor_interval.as_millis() as u64,
        close_browser_on_stop = config.close_browser_on_stop,
        "configuration loaded"
    );
    let session = build_session(config).context("failed to open result log")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.http_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "port {} is already in use; stop the other process or set PORT / --http-port",
                cli.http_port
            );
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("failed to bind {addr}"))),
    };
    info!("control surface listening on http://{addr}");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let app = rest::router(session.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
    });

    let signal = wait_for_signal();
    tokio::pin!(signal);
    let mut signalled = false;
    let mut start_error = None;

    if !cli.no_autostart {
        let mut starter = tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        tokio::select! {
            joined = &mut starter => {
                start_error = match joined {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(anyhow::Error::new(e)),
                    Err(e) => Some(anyhow::Error::new(e).context("session start task failed")),
                };
            }
            _ = &mut signal => {
                signalled = true;
                info!(state = %session.state(), "signal received while starting");
                // Cancels the start; it tears down before releasing the session.
                session.shutdown(SHUTDOWN_TIMEOUT).await;
                match tokio::time::timeout(SHUTDOWN_TIMEOUT, starter).await {
                    Ok(Ok(outcome)) => {
                        if let Err(e) = outcome {
                            info!(error = %e, "start abandoned");
                        }
                    }
                    Ok(Err(e)) => error!(error = %e, "session start task failed"),
                    Err(_) => error!("session start did not wind down in time"),
                }
            }
        }
    }

    if let Some(e) = &start_error {
        error!(error = %e, "failed to start crash result monitoring");
    } else if !signalled {
        signal.await;
    }
    session.shutdown(SHUTDOWN_TIMEOUT).await;

    let _ = stop_tx.send(());
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await {
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
        Ok(Err(e)) => error!(error = %e, "HTTP server task failed"),
        Err(_) => error!("HTTP server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    info!("CatchBot stopped");
    match start_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
