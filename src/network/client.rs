//! Cnode Client
//!
//! Dials the cnode server, announces `NodeType_Message { AMF }` and then
//! answers every health-check request pushed down the same connection with
//! `HealthCheckResponse { SERVING }`. All traffic uses fixed32 framing.
//!
//! Lost or refused connections are retried with exponential backoff
//! (1, 2, 4 ... capped at 30 s). Stopping is cooperative: the session loop
//! re-checks the running flag at least once per poll interval and the
//! backoff sleep once per second.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::connection::{Readiness, Session};
use super::{connect_with_timeout, RunningFlag, Sidecar, SidecarError};
use crate::config::CnodeConfig;
use crate::protocol::{Framing, HealthCheckResponse, NodeTypeMessage};

/// Largest health-check request accepted from the cnode server
pub const MAX_CNODE_REQUEST_LEN: usize = 256;

/// Granularity of the backoff sleep
pub const BACKOFF_TICK: Duration = Duration::from_secs(1);

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Client already running")]
    AlreadyRunning,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Connecting,
    Identifying,
    Serving,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The running flag was cleared
    Stopped,
    /// The attempt or the session failed
    Failed,
}

/// Reconnect delay schedule, in whole seconds
#[derive(Debug, Clone)]
pub struct Backoff {
    max: u64,
    current: u64,
}

impl Backoff {
    pub fn new(initial_secs: u64, max_secs: u64) -> Self {
        let max = max_secs.max(1);
        Self {
            max,
            current: initial_secs.clamp(1, max),
        }
    }

    /// Delay to wait before the next attempt
    pub fn current_secs(&self) -> u64 {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }
}

/// Persistent cnode session with automatic reconnect
pub struct CnodeClient {
    /// Client configuration
    config: CnodeConfig,
    /// Cleared by `stop`
    running: RunningFlag,
    /// Current state
    state: Arc<RwLock<ClientState>>,
    /// Session loop task
    task: Option<JoinHandle<()>>,
}

impl CnodeClient {
    pub fn new(config: CnodeConfig) -> Self {
        Self {
            config,
            running: RunningFlag::new(),
            state: Arc::new(RwLock::new(ClientState::Stopped)),
            task: None,
        }
    }

    /// Spawn the session loop
    ///
    /// A no-op when the client is disabled or no server address is set.
    pub fn start(&mut self) -> ClientResult<()> {
        if self.task.is_some() {
            return Err(ClientError::AlreadyRunning);
        }

        let Some((host, port)) = self.config.target() else {
            tracing::info!("Cnode client disabled (no server address or AMF_CNODE_ENABLE != 1)");
            return Ok(());
        };
        tracing::info!("Cnode client started -> {}:{}", host, port);

        self.running.set();
        self.task = Some(tokio::spawn(run(
            self.config.clone(),
            self.running.clone(),
            self.state.clone(),
        )));

        Ok(())
    }

    /// Clear the running flag and wait for the session loop to exit
    ///
    /// Returns within one poll interval (or one backoff tick). Safe to call
    /// repeatedly or before `start`.
    pub async fn stop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.running.clear();
        if let Err(e) = task.await {
            tracing::error!("Cnode client task failed: {}", e);
        }
        tracing::info!("Cnode client stopped");
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some() && self.running.is_set()
    }
}

#[async_trait]
impl Sidecar for CnodeClient {
    fn name(&self) -> &'static str {
        "cnode client"
    }

    async fn start(&mut self) -> Result<(), SidecarError> {
        Ok(CnodeClient::start(self)?)
    }

    async fn stop(&mut self) {
        CnodeClient::stop(self).await;
    }

    fn is_running(&self) -> bool {
        CnodeClient::is_running(self)
    }
}

async fn set_state(state: &RwLock<ClientState>, value: ClientState) {
    *state.write().await = value;
}

/// Sleep for `secs` seconds in ticks, returning early once `running` clears
async fn sleep_while_running(secs: u64, running: &RunningFlag) {
    let mut slept = 0;
    while slept < secs && running.is_set() {
        tokio::time::sleep(BACKOFF_TICK).await;
        slept += 1;
    }
}

/// Outer loop: session, backoff, repeat
async fn run(config: CnodeConfig, running: RunningFlag, state: Arc<RwLock<ClientState>>) {
    let mut backoff = Backoff::new(config.initial_backoff_secs, config.max_backoff_secs);

    while running.is_set() {
        match serve_session(&config, &running, &state).await {
            SessionOutcome::Stopped => break,
            SessionOutcome::Failed => {
                if !running.is_set() {
                    break;
                }

                let delay = backoff.current_secs();
                tracing::info!("Cnode session ended; reconnecting in {} s", delay);
                set_state(&state, ClientState::Connecting).await;
                sleep_while_running(delay, &running).await;
                backoff.advance();
            }
        }
    }

    set_state(&state, ClientState::Stopped).await;
    tracing::info!("Cnode client task stopped");
}

/// One connection: dial, identify, serve health checks until error or stop
async fn serve_session(
    config: &CnodeConfig,
    running: &RunningFlag,
    state: &RwLock<ClientState>,
) -> SessionOutcome {
    let Some((host, port)) = config.target() else {
        return SessionOutcome::Stopped;
    };

    set_state(state, ClientState::Connecting).await;
    let (stream, addr) = match connect_with_timeout(host, port, config.connect_timeout()).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::warn!("Cnode connect({}:{}) failed: {}", host, port, e);
            return SessionOutcome::Failed;
        }
    };
    tracing::info!("Cnode connected to {}", addr);

    let mut session = Session::new(stream, addr, Framing::Fixed32, MAX_CNODE_REQUEST_LEN)
        .with_send_timeout(config.connect_timeout());

    set_state(state, ClientState::Identifying).await;
    let identity = match NodeTypeMessage::AMF.encode() {
        Ok(identity) => identity,
        Err(e) => {
            tracing::error!("Cnode NodeType_Message encoding failed: {}", e);
            session.close().await;
            return SessionOutcome::Failed;
        }
    };
    if let Err(e) = session.send(&identity).await {
        tracing::warn!("Cnode send NodeType_Message failed: {}", e);
        session.close().await;
        return SessionOutcome::Failed;
    }
    tracing::info!("Cnode sent NodeType_Message {{ nodetype: AMF }}");

    set_state(state, ClientState::Serving).await;
    let response = HealthCheckResponse::SERVING.encode();
    let poll_interval = config.poll_interval();

    while running.is_set() {
        match session.wait_readable(poll_interval).await {
            Ok(Readiness::Readable) => {}
            Ok(Readiness::Idle) => continue,
            Ok(Readiness::Closed) => {
                tracing::warn!("Cnode connection closed by server");
                break;
            }
            Err(e) => {
                tracing::warn!("Cnode poll error: {}", e);
                break;
            }
        }

        match session.recv().await {
            Ok(request) => {
                tracing::debug!("Cnode health-check request ({} bytes)", request.len());
            }
            Err(e) => {
                tracing::warn!("Cnode read HealthCheckRequest failed: {}", e);
                break;
            }
        }

        if let Err(e) = session.send(&response).await {
            tracing::warn!("Cnode send HealthCheckResponse failed: {}", e);
            break;
        }
        tracing::debug!("Cnode health-check -> SERVING");
    }

    tracing::debug!(
        "Cnode session with {} ended after {} requests",
        session.peer_addr(),
        session.stats().frames_received
    );
    session.close().await;

    if running.is_set() {
        SessionOutcome::Failed
    } else {
        SessionOutcome::Stopped
    }
}
