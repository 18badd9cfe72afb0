//! Network module - TCP plumbing for the sidecars
//!
//! Provides:
//! - Health server accepting probes
//! - Registration client (fire-and-forget)
//! - Cnode client holding a persistent session with reconnect
//! - Probe and mock cnode tooling for manual testing

mod server;
mod client;
mod connection;
mod registration;
mod probe;
mod mock_cnode;

pub use server::*;
pub use client::*;
pub use connection::*;
pub use registration::*;
pub use probe::*;
pub use mock_cnode::*;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Cooperative stop flag shared between a loop and its controller
#[derive(Debug, Clone, Default)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Errors surfaced when starting a sidecar
#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Health server: {0}")]
    Server(#[from] ServerError),

    #[error("Cnode client: {0}")]
    Client(#[from] ClientError),
}

/// Lifecycle shared by the long-running sidecars
#[async_trait]
pub trait Sidecar: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Bring the sidecar up. Disabled sidecars succeed without doing anything.
    async fn start(&mut self) -> Result<(), SidecarError>;

    /// Tear the sidecar down. Safe to call repeatedly or before `start`.
    async fn stop(&mut self);

    /// Whether a background task is currently active
    fn is_running(&self) -> bool;
}

/// Start every sidecar in order
///
/// If one fails, those already started are stopped again in reverse order
/// before the error is returned.
pub async fn start_all(sidecars: &mut [Box<dyn Sidecar>]) -> Result<(), SidecarError> {
    for i in 0..sidecars.len() {
        if let Err(e) = sidecars[i].start().await {
            tracing::error!("Failed to start {}: {}", sidecars[i].name(), e);
            for started in sidecars[..i].iter_mut().rev() {
                started.stop().await;
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Stop every sidecar in reverse start order
pub async fn stop_all(sidecars: &mut [Box<dyn Sidecar>]) {
    for sidecar in sidecars.iter_mut().rev() {
        sidecar.stop().await;
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host((host, port)).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Resolve and connect, both bounded by `timeout`
pub async fn connect_with_timeout(
    host: &str,
    port: u16,
    timeout: Duration,
) -> ConnectionResult<(TcpStream, SocketAddr)> {
    let connect = async {
        let addr = resolve_host(host, port).await?;
        let stream = TcpStream::connect(addr).await?;
        Ok::<_, std::io::Error>((stream, addr))
    };

    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ConnectionError::Timeout),
    }
}
