//! Registration client
//!
//! Announces this node to a registration server once it is operational.
//! Each trigger runs on its own detached task; failures are logged and
//! dropped, and nothing is retried.

use thiserror::Error;
use tokio::task::JoinHandle;

use super::connection::{ConnectionError, Session};
use super::connect_with_timeout;
use crate::config::{RegistrationConfig, ServerConfig};
use crate::protocol::{node_type_name, CodecError, Framing, RegisterRequest, RegisterResponse};

/// Largest RegisterResponse accepted
pub const MAX_REGISTER_RESPONSE_LEN: usize = 128;

/// Registration errors
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Encoding failed: {0}")]
    Encode(#[from] CodecError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Registration server address not configured")]
    NotConfigured,
}

pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// What the registration server said, if anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Accepted,
    Rejected { message: Option<String> },
    NoResponse,
}

/// Sends RegisterRequest on demand
#[derive(Debug, Clone)]
pub struct Registrar {
    request: RegisterRequest,
    config: RegistrationConfig,
}

impl Registrar {
    pub fn new(server: &ServerConfig) -> Self {
        Self {
            request: RegisterRequest::amf(server.advertise_ip(), server.port),
            config: server.registration.clone(),
        }
    }

    pub fn request(&self) -> &RegisterRequest {
        &self.request
    }

    /// Fire-and-forget registration
    ///
    /// Returns the handle of the spawned task, or `None` when registration is
    /// disabled or incompletely configured. Callers are free to drop it.
    pub fn send_registration(&self) -> Option<JoinHandle<()>> {
        if !self.config.enable {
            return None;
        }
        if self.config.target().is_none() {
            tracing::warn!("Registration enabled but registration server IP / port not set");
            return None;
        }

        let registrar = self.clone();
        Some(tokio::spawn(async move {
            match registrar.register_once().await {
                Ok(RegistrationOutcome::Accepted) => {
                    tracing::info!("Registration: server accepted");
                }
                Ok(RegistrationOutcome::Rejected { message }) => {
                    tracing::warn!(
                        "Registration: server rejected{}",
                        message.map(|m| format!(" ({})", m)).unwrap_or_default()
                    );
                }
                Ok(RegistrationOutcome::NoResponse) => {
                    tracing::debug!("Registration: no response from server");
                }
                Err(e) => {
                    tracing::warn!("Registration failed: {}", e);
                }
            }
        }))
    }

    /// One complete registration exchange
    pub async fn register_once(&self) -> RegistrationResult<RegistrationOutcome> {
        let payload = self.request.encode()?;
        let (host, port) = self.config.target().ok_or(RegistrationError::NotConfigured)?;
        let timeout = self.config.timeout();

        let (stream, addr) = connect_with_timeout(host, port, timeout).await?;
        let mut session = Session::new(stream, addr, Framing::Varint, MAX_REGISTER_RESPONSE_LEN)
            .with_send_timeout(timeout);

        if let Err(e) = session.send(&payload).await {
            session.close().await;
            return Err(e.into());
        }

        tracing::info!(
            "Registration sent to {} (node_type={}, ip={}, port={})",
            addr,
            node_type_name(self.request.node_type),
            self.request.ip,
            self.request.port
        );

        // The server may legitimately stay silent
        let outcome = match session.recv_timeout(timeout).await {
            Ok(response) => match RegisterResponse::decode(&response) {
                Some(RegisterResponse { success: true, .. }) => RegistrationOutcome::Accepted,
                Some(RegisterResponse { message, .. }) => RegistrationOutcome::Rejected { message },
                None => RegistrationOutcome::NoResponse,
            },
            Err(e) => {
                tracing::debug!("No RegisterResponse from {}: {}", addr, e);
                RegistrationOutcome::NoResponse
            }
        };

        session.close().await;
        Ok(outcome)
    }
}
