use crate::stream::StreamOptions;
use clap::{ArgAction, Parser};
use curvemux_common::greeting::ReadyProbe;
use curvemux_common::wire::DEFAULT_MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Largest frame body the relay can be configured to accept (64 MiB).
const MAX_ALLOWED_FRAME_SIZE: usize = 64 << 20;
/// Largest offset at which a READY token is looked for.
const MAX_READY_OFFSET: usize = 64;

/// CLI arguments for the relay.
#[derive(Parser, Debug, Clone)]
#[command(name = "curvemux")]
#[command(about = "Relay between clients and a worker that tracks the CURVE handshake")]
#[command(version)]
pub struct Args {
    /// Socket address clients connect to.
    #[arg(long, default_value = "127.0.0.1:9999", env = "CURVEMUX_FRONTEND")]
    pub frontend: SocketAddr,
    /// Socket address workers connect to.
    #[arg(long, default_value = "127.0.0.1:9998", env = "CURVEMUX_BACKEND")]
    pub backend: SocketAddr,
    /// Socket address of the control bridge.
    #[arg(long, default_value = "127.0.0.1:9997", env = "CURVEMUX_CONTROL")]
    pub control: SocketAddr,
    /// Do not open the control bridge; only SIGINT stops the relay.
    #[arg(long)]
    pub no_control: bool,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "CURVEMUX_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum frame body size in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE, env = "CURVEMUX_MAX_FRAME_SIZE")]
    pub max_frame_size: usize,
    /// Offsets at which the READY token is looked for.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "0,3",
        env = "CURVEMUX_READY_OFFSETS"
    )]
    pub ready_offsets: Vec<usize>,
    /// Delay before shutdown so in-flight worker replies drain, in milliseconds.
    #[arg(long, default_value = "100", env = "CURVEMUX_DRAIN_GRACE_MS")]
    pub drain_grace_ms: u64,
    /// How long shutdown waits for in-process workers, in seconds.
    #[arg(long, default_value = "5", env = "CURVEMUX_JOIN_TIMEOUT")]
    pub join_timeout_secs: u64,
    /// Capacity of the message queues behind each endpoint.
    #[arg(long, default_value = "1024", env = "CURVEMUX_CHANNEL_CAPACITY")]
    pub channel_capacity: usize,
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
    /// Write logs to this file instead of stderr.
    #[arg(long, env = "CURVEMUX_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address clients connect to.
    pub frontend: SocketAddr,
    /// Socket address workers connect to.
    pub backend: SocketAddr,
    /// Socket address of the control bridge, if enabled.
    pub control: Option<SocketAddr>,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Maximum frame body size in bytes.
    pub max_frame_size: usize,
    /// Offsets at which the READY token is looked for.
    pub ready_offsets: Vec<usize>,
    /// Shutdown drain delay in milliseconds.
    pub drain_grace_ms: u64,
    /// In-process worker join timeout in seconds.
    pub join_timeout_secs: u64,
    /// Capacity of the message queues behind each endpoint.
    pub channel_capacity: usize,
}

impl RelayConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.frontend == self.backend {
            return Err("frontend and backend must use different addresses".to_string());
        }
        if let Some(control) = self.control {
            if control == self.frontend || control == self.backend {
                return Err(
                    "control address must differ from frontend and backend".to_string(),
                );
            }
        }

        if self.max_frame_size == 0 {
            return Err("max_frame_size must be greater than 0".to_string());
        }
        if self.max_frame_size > MAX_ALLOWED_FRAME_SIZE {
            return Err(format!(
                "max_frame_size exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_FRAME_SIZE
            ));
        }

        if self.ready_offsets.is_empty() {
            return Err("ready_offsets must list at least one offset".to_string());
        }
        if self.ready_offsets.iter().any(|&o| o > MAX_READY_OFFSET) {
            return Err(format!(
                "ready_offsets entries must not exceed {}",
                MAX_READY_OFFSET
            ));
        }

        if self.drain_grace_ms > 60_000 {
            return Err("drain_grace_ms exceeds reasonable limit (60000 ms)".to_string());
        }

        if self.join_timeout_secs == 0 {
            return Err("join_timeout_secs must be greater than 0".to_string());
        }
        if self.join_timeout_secs > 300 {
            return Err("join_timeout_secs exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.channel_capacity == 0 {
            return Err("channel_capacity must be greater than 0".to_string());
        }
        if self.channel_capacity > 65_536 {
            return Err("channel_capacity exceeds reasonable limit (65536)".to_string());
        }
        Ok(())
    }

    /// Probe that recognizes the worker's READY command.
    #[must_use]
    pub fn ready_probe(&self) -> ReadyProbe {
        ReadyProbe::new(self.ready_offsets.clone())
    }

    /// Limits for the frontend and backend listeners.
    #[must_use]
    pub const fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_frame_size: self.max_frame_size,
            capacity: self.channel_capacity,
        }
    }

    /// Shutdown drain delay.
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// In-process worker join timeout.
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            frontend: SocketAddr::from(([127, 0, 0, 1], 9999)),
            backend: SocketAddr::from(([127, 0, 0, 1], 9998)),
            control: Some(SocketAddr::from(([127, 0, 0, 1], 9997))),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            ready_offsets: ReadyProbe::default().offsets().to_vec(),
            drain_grace_ms: 100,
            join_timeout_secs: 5,
            channel_capacity: 1024,
        }
    }
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        Self {
            frontend: args.frontend,
            backend: args.backend,
            control: (!args.no_control).then_some(args.control),
            metrics_addr: args.metrics_addr,
            max_frame_size: args.max_frame_size,
            ready_offsets: args.ready_offsets,
            drain_grace_ms: args.drain_grace_ms,
            join_timeout_secs: args.join_timeout_secs,
            channel_capacity: args.channel_capacity,
        }
    }
}
