#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use curvemux::config::{Args, RelayConfig};
use curvemux::control::{serve_bridge, ControlBus};
use curvemux::metrics::{start_metrics_server, HealthState};
use curvemux::proxy::{Proxy, ProxyOptions};
use curvemux::session::ControlCommand;
use curvemux::stream;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    let config: RelayConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let bus = ControlBus::default();
    let control = bus.subscribe();

    let frontend = stream::bind("frontend", config.frontend, config.stream_options()).await?;
    let backend = stream::bind("backend", config.backend, config.stream_options()).await?;

    let bridge = match config.control {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            Some(tokio::spawn(serve_bridge(
                listener,
                bus.clone(),
                config.max_frame_size,
            )))
        }
        None => {
            info!("control bridge disabled");
            None
        }
    };

    let health_state = HealthState::new();

    tokio::spawn({
        let health_state = health_state.clone();
        let metrics_addr = config.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    tokio::spawn({
        let bus = bus.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("received shutdown signal");
                    bus.publish_command(ControlCommand::Terminate);
                }
                Err(e) => warn!("failed to listen for shutdown signal: {}", e),
            }
        }
    });

    let options = ProxyOptions {
        health: health_state,
        ..ProxyOptions::from(&config)
    };
    let result = Proxy::new(frontend, backend, control, options)
        .run(JoinSet::new())
        .await;

    if let Some(bridge) = bridge {
        bridge.abort();
    }
    result?;
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}
