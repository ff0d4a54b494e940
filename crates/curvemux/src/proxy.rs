//! The relay event loop.
//!
//! One task owns every piece of relay state. Each iteration waits until one of
//! the endpoints in the current wait set is readable, then gives control,
//! frontend and backend (in that order) one chance each to handle a message.

use crate::config::RelayConfig;
use crate::control::ControlSocket;
use crate::endpoint::Endpoint;
use crate::error::RelayError;
use crate::metrics::{counters, gauges, histograms, HealthState};
use crate::registry::{IdentityRegistry, Learned, Side};
use crate::relay::forward;
use crate::session::{
    BackendPhase, BackendState, ControlCommand, ControlState, FrontendState, Observation,
};
use curvemux_common::greeting::ReadyProbe;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Which endpoints an iteration waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSet {
    /// Always `true`: control is never ignored.
    pub control: bool,
    /// Client requests are accepted.
    pub frontend: bool,
    /// Worker messages are accepted.
    pub backend: bool,
}

/// Tunables for a [`Proxy`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Recognizes the worker's READY command.
    pub ready_probe: ReadyProbe,
    /// Pause between leaving the loop and closing endpoints.
    pub drain_grace: Duration,
    /// Upper bound on waiting for in-process workers at shutdown.
    pub join_timeout: Duration,
    /// Flipped to ready when the worker session is.
    pub health: HealthState,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            ready_probe: ReadyProbe::default(),
            drain_grace: Duration::from_millis(100),
            join_timeout: Duration::from_secs(5),
            health: HealthState::new(),
        }
    }
}

impl From<&RelayConfig> for ProxyOptions {
    fn from(config: &RelayConfig) -> Self {
        Self {
            ready_probe: config.ready_probe(),
            drain_grace: config.drain_grace(),
            join_timeout: config.join_timeout(),
            health: HealthState::new(),
        }
    }
}

/// Relay between one client and one worker.
#[derive(Debug)]
pub struct Proxy {
    frontend: Endpoint,
    backend: Endpoint,
    control: ControlSocket,
    registry: IdentityRegistry,
    control_state: ControlState,
    frontend_state: FrontendState,
    backend_state: BackendState,
    worker_count: usize,
    options: ProxyOptions,
}

impl Proxy {
    /// Relay over the given endpoints, with all state at its initial value.
    #[must_use]
    pub fn new(
        frontend: Endpoint,
        backend: Endpoint,
        control: ControlSocket,
        options: ProxyOptions,
    ) -> Self {
        Self {
            frontend,
            backend,
            control,
            registry: IdentityRegistry::new(),
            control_state: ControlState::default(),
            frontend_state: FrontendState::default(),
            backend_state: BackendState::default(),
            worker_count: 0,
            options,
        }
    }

    /// Endpoints the next iteration waits on.
    #[must_use]
    pub fn wait_set(&self) -> WaitSet {
        let running = self.control_state.is_running();
        let parked = self.backend_state.phase() == BackendPhase::WaitingClient
            && !self.frontend_state.has_client();
        WaitSet {
            control: true,
            frontend: running && self.worker_count > 0,
            backend: running && !parked,
        }
    }

    /// Last command applied from the control channel.
    #[must_use]
    pub const fn control_state(&self) -> ControlState {
        self.control_state
    }

    /// Current backend phase.
    #[must_use]
    pub const fn backend_phase(&self) -> BackendPhase {
        self.backend_state.phase()
    }

    /// Number of workers registered so far.
    #[must_use]
    pub const fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Returns `true` once a client has sent a request.
    #[must_use]
    pub const fn has_client(&self) -> bool {
        self.frontend_state.has_client()
    }

    /// Runs until `TERMINATE` or a fatal error, then shuts down: waits the
    /// drain grace, joins `workers`, and closes frontend, backend and control.
    ///
    /// # Errors
    ///
    /// The fatal error that ended the loop, reported after the endpoints are
    /// released.
    pub async fn run(mut self, mut workers: JoinSet<()>) -> Result<(), RelayError> {
        info!(
            frontend = ?self.frontend.local_addr(),
            backend = ?self.backend.local_addr(),
            "relay started"
        );
        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!("relay stopped: {}", e);
        }
        self.shutdown(&mut workers).await;
        result
    }

    async fn event_loop(&mut self) -> Result<(), RelayError> {
        while self.control_state != ControlState::Terminate {
            self.step().await?;
        }
        Ok(())
    }

    /// One iteration: wait, then handle control, frontend and backend at most
    /// once each.
    ///
    /// Cancel-safe while waiting; nothing is consumed until a handler runs.
    ///
    /// # Errors
    ///
    /// Any fatal [`RelayError`].
    pub async fn step(&mut self) -> Result<(), RelayError> {
        let wait = self.wait_set();
        self.wait(wait).await?;

        if self.control.poll_readable() {
            self.handle_control().await?;
        }
        if wait.frontend && self.control_state.is_running() && self.frontend.poll_readable() {
            self.handle_frontend().await?;
        }
        if wait.backend && self.control_state.is_running() && self.backend.poll_readable() {
            self.handle_backend().await?;
        }
        Ok(())
    }

    async fn wait(&mut self, wait: WaitSet) -> Result<(), RelayError> {
        tokio::select! {
            biased;
            result = self.control.readable() => result,
            result = self.frontend.readable(), if wait.frontend => result,
            result = self.backend.readable(), if wait.backend => result,
        }
    }

    async fn handle_control(&mut self) -> Result<(), RelayError> {
        let payload = self.control.recv().await?;
        match ControlCommand::parse(&payload) {
            Ok(cmd) => {
                info!(command = %cmd, "control command");
                counters::control_commands_total(cmd.as_str());
                self.control_state.apply(cmd);
            }
            Err(e) => {
                warn!("ignoring control message: {}", e);
                counters::control_commands_total("malformed");
            }
        }
        Ok(())
    }

    async fn handle_frontend(&mut self) -> Result<(), RelayError> {
        let id = self.frontend.recv_frame().await?;
        if !id.more {
            warn!(len = id.len(), "client message without content dropped");
            counters::messages_dropped_total("no_content");
            return Ok(());
        }
        if self.registry.learn_or_verify(Side::Client, &id.payload)? == Learned::Learned {
            info!(identity = ?self.registry.get(Side::Client), "client identity learned");
        }
        if self.frontend_state.client_arrived() {
            debug!("first client request");
        }

        let worker = self.registry.route_to(Side::Worker)?.clone();
        let start = Instant::now();
        let stats = forward(&mut self.frontend, &mut self.backend, &worker, None).await?;
        histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
        counters::message_relayed("to_worker", stats.frames, stats.bytes);
        debug!(frames = stats.frames, bytes = stats.bytes, "client -> worker");
        Ok(())
    }

    async fn handle_backend(&mut self) -> Result<(), RelayError> {
        // In waiting_client the identity frame of the parked message was
        // consumed by the call that parked it.
        if self.backend_state.phase() != BackendPhase::WaitingClient {
            let id = self.backend.recv_frame().await?;
            if !id.more {
                warn!(len = id.len(), "worker message without content dropped");
                counters::messages_dropped_total("no_content");
                return Ok(());
            }
            let learned = self.registry.learn_or_verify(Side::Worker, &id.payload)?;
            if learned == Learned::Learned {
                self.backend_state.worker_registered()?;
                self.worker_count += 1;
                gauges::workers_registered(self.worker_count);
                info!(identity = ?self.registry.get(Side::Worker), "worker registered");
            }
        }

        if !self.frontend_state.has_client() {
            debug!("worker message parked until a client arrives");
            return Ok(());
        }
        if self.backend_state.phase() == BackendPhase::WaitingClient {
            self.backend_state.client_present()?;
        }

        let first = self.backend.recv_frame().await?;
        match self
            .backend_state
            .observe(&first, &self.options.ready_probe)?
        {
            Observation::HandshakeStarted => info!("worker greeting uses CURVE, handshake started"),
            Observation::NotCurve(mechanism) => {
                info!(%mechanism, "worker greeting is not CURVE, handshake not tracked");
            }
            Observation::Ready => {
                info!("worker session ready");
                self.options.health.set_ready(true);
            }
            Observation::Unchanged => {}
        }

        let client = self.registry.route_to(Side::Client)?.clone();
        let start = Instant::now();
        let stats = forward(&mut self.backend, &mut self.frontend, &client, Some(first)).await?;
        histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
        counters::message_relayed("to_client", stats.frames, stats.bytes);
        debug!(
            frames = stats.frames,
            bytes = stats.bytes,
            phase = self.backend_state.phase().as_str(),
            "worker -> client"
        );
        Ok(())
    }

    async fn shutdown(self, workers: &mut JoinSet<()>) {
        if !self.options.drain_grace.is_zero() {
            tokio::time::sleep(self.options.drain_grace).await;
        }

        let deadline = tokio::time::Instant::now() + self.options.join_timeout;
        while !workers.is_empty() {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => warn!("worker task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "join timeout reached with {} workers still running",
                        workers.len()
                    );
                    workers.abort_all();
                    break;
                }
            }
        }

        self.frontend.close();
        self.backend.close();
        self.control.close();
        info!("relay shut down");
    }
}
