//! Health Server
//!
//! Accepts TCP probes and answers every one of them with a varint-framed
//! `HealthCheckResponse { SERVING }`, then closes the connection. A probe may
//! send a request frame or nothing at all; either way it gets the same reply.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::{ConnectionError, Session};
use super::{RunningFlag, Sidecar, SidecarError};
use crate::config::{ConfigError, ServerConfig};
use crate::protocol::{Framing, HealthCheckResponse};

/// Largest request frame read from a probe
pub const MAX_HEALTH_REQUEST_LEN: usize = 64;

/// Listen backlog
const LISTEN_BACKLOG: u32 = 16;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// TCP health-check responder
pub struct HealthServer {
    /// Server configuration
    config: ServerConfig,
    /// Cleared to make the accept loop exit
    running: RunningFlag,
    /// Bound address while listening
    local_addr: Option<SocketAddr>,
    /// Shutdown signal
    shutdown_tx: Option<mpsc::Sender<()>>,
    /// Accept loop task
    task: Option<JoinHandle<()>>,
}

impl HealthServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: RunningFlag::new(),
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }

    /// Bind and start accepting probes
    ///
    /// Succeeds without binding when the server is disabled.
    pub async fn open(&mut self) -> ServerResult<()> {
        if self.task.is_some() {
            return Err(ServerError::AlreadyRunning);
        }

        if !self.config.enable {
            tracing::info!("Health server disabled");
            return Ok(());
        }

        let bind_addr = self.config.bind_socket_addr()?;
        let listener = bind_listener(bind_addr).map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        tracing::info!("Health server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);
        self.running.set();

        self.task = Some(tokio::spawn(accept_loop(
            listener,
            self.running.clone(),
            shutdown_rx,
            self.config.read_timeout(),
        )));

        Ok(())
    }

    /// Stop accepting and wait for the accept loop to finish
    ///
    /// A no-op when the server is not listening.
    pub async fn close(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };

        self.running.clear();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }

        if let Err(e) = task.await {
            tracing::error!("Health server task failed: {}", e);
        }

        self.local_addr = None;
        tracing::info!("Health server closed");
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.task.is_some() && self.running.is_set()
    }
}

#[async_trait]
impl Sidecar for HealthServer {
    fn name(&self) -> &'static str {
        "health server"
    }

    async fn start(&mut self) -> Result<(), SidecarError> {
        Ok(self.open().await?)
    }

    async fn stop(&mut self) {
        self.close().await;
    }

    fn is_running(&self) -> bool {
        self.is_listening()
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}

async fn accept_loop(
    listener: TcpListener,
    running: RunningFlag,
    mut shutdown_rx: mpsc::Receiver<()>,
    read_timeout: Duration,
) {
    while running.is_set() {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        handle_probe(stream, addr, read_timeout).await;
                    }
                    Err(_) if !running.is_set() => break,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Health server shutdown requested");
                break;
            }
        }
    }

    // Dropping the listener closes the socket
    drop(listener);
    tracing::info!("Health server stopped");
}

/// Serve one probe: best-effort request read, fixed reply, close
async fn handle_probe(stream: TcpStream, addr: SocketAddr, read_timeout: Duration) {
    let mut session = Session::new(stream, addr, Framing::Varint, MAX_HEALTH_REQUEST_LEN);

    // The request never influences the reply
    match session.recv_timeout(read_timeout).await {
        Ok(request) => {
            tracing::debug!("Health check request from {} ({} bytes)", addr, request.len());
        }
        Err(ConnectionError::Timeout) => {
            tracing::debug!("No health check request from {} before deadline", addr);
        }
        Err(e) => {
            tracing::debug!("Health check request from {} unreadable: {}", addr, e);
        }
    }

    if let Err(e) = session.send(&HealthCheckResponse::SERVING.encode()).await {
        tracing::warn!("Failed to answer health check from {}: {}", addr, e);
    }

    session.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const SERVING_FRAME: [u8; 3] = [0x02, 0x08, 0x01];

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    async fn open_server() -> (HealthServer, SocketAddr) {
        let mut server = HealthServer::new(test_config());
        server.open().await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        reply
    }

    #[tokio::test]
    async fn test_silent_probe_gets_reply_after_deadline() {
        let (mut server, addr) = open_server().await;

        let start = Instant::now();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let reply = read_reply(&mut stream).await;
        let elapsed = start.elapsed();

        assert_eq!(reply, SERVING_FRAME);
        assert!(elapsed >= Duration::from_millis(400), "replied too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "replied too late: {:?}", elapsed);

        server.close().await;
    }

    #[tokio::test]
    async fn test_half_closed_probe_gets_reply() {
        let (mut server, addr) = open_server().await;

        let start = Instant::now();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.shutdown().await.unwrap();
        let reply = read_reply(&mut stream).await;

        assert_eq!(reply, SERVING_FRAME);
        assert!(start.elapsed() < Duration::from_millis(1000));

        server.close().await;
    }

    #[tokio::test]
    async fn test_request_content_is_ignored() {
        let (mut server, addr) = open_server().await;

        for request in [&[0x01, 0x7F][..], &[0x02, 0x0A, 0x00][..], &[0x00][..]] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(request).await.unwrap();
            assert_eq!(read_reply(&mut stream).await, SERVING_FRAME);
        }

        server.close().await;
    }

    #[tokio::test]
    async fn test_oversized_request_still_answered() {
        let (mut server, addr) = open_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        // Declares 127 bytes, above the request bound
        stream.write_all(&[0x7F]).await.unwrap();
        assert_eq!(read_reply(&mut stream).await, SERVING_FRAME);
        assert!(server.is_listening());

        server.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_listening() {
        let (mut server, addr) = open_server().await;
        assert!(server.is_listening());

        server.close().await;
        assert!(!server.is_listening());
        assert!(server.local_addr().is_none());
        assert!(TcpStream::connect(addr).await.is_err());

        // Second close is a no-op
        server.close().await;
    }

    #[tokio::test]
    async fn test_close_before_open() {
        let mut server = HealthServer::new(test_config());
        server.close().await;
        server.close().await;
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_disabled_server_does_not_bind() {
        let config = ServerConfig {
            enable: false,
            ..test_config()
        };
        let mut server = HealthServer::new(config);
        server.open().await.unwrap();
        assert!(!server.is_listening());
        assert!(server.local_addr().is_none());
        server.close().await;
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let (mut server, _addr) = open_server().await;
        assert!(matches!(server.open().await, Err(ServerError::AlreadyRunning)));
        server.close().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ServerConfig {
            port: occupied.local_addr().unwrap().port(),
            ..test_config()
        };

        let mut server = HealthServer::new(config);
        assert!(matches!(server.open().await, Err(ServerError::BindFailed(_))));
        assert!(!server.is_listening());
    }

    #[tokio::test]
    async fn test_reopen_after_close() {
        let (mut server, _addr) = open_server().await;
        server.close().await;

        server.open().await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.shutdown().await.unwrap();
        assert_eq!(read_reply(&mut stream).await, SERVING_FRAME);
        server.close().await;
    }
}
