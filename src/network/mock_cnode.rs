//! Mock cnode server
//!
//! Plays the server side of the cnode protocol for manual and automated
//! testing: accept, expect `NodeType_Message { AMF }`, push health-check
//! requests and insist on SERVING replies.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;

use super::client::MAX_CNODE_REQUEST_LEN;
use super::connection::{ConnectionError, Session};
use crate::protocol::{
    node_type_name, CodecError, Framing, HealthCheckRequest, HealthCheckResponse, NodeTypeMessage,
    ServingStatus, NODE_TYPE_AMF,
};

/// Mock cnode failures
#[derive(Error, Debug)]
pub enum MockCnodeError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] CodecError),

    #[error("Accept failed: {0}")]
    Accept(#[from] io::Error),

    #[error("Wrong node type {0:?}, expected 13 (AMF)")]
    WrongNodeType(Option<u64>),

    #[error("Wrong status {0:?}, expected 1 (SERVING)")]
    WrongStatus(Option<u64>),
}

/// Session script
#[derive(Debug, Clone)]
pub struct MockCnodeOptions {
    /// Pause between health checks
    pub interval: Duration,
    /// Health checks per session; 0 keeps going until the client hangs up
    pub count: u32,
    /// Accept another connection after each session
    pub keep_accepting: bool,
    /// Deadline for every read from the client
    pub read_timeout: Duration,
}

impl Default for MockCnodeOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            count: 3,
            keep_accepting: false,
            read_timeout: Duration::from_secs(10),
        }
    }
}

pub struct MockCnodeServer {
    listener: TcpListener,
}

impl MockCnodeServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve sessions; returns whether all of them passed
    pub async fn run(&self, options: &MockCnodeOptions) -> bool {
        let mut all_passed = true;
        let mut session_num = 0u32;

        loop {
            session_num += 1;
            match self.serve_one(options).await {
                Ok(checks) => {
                    tracing::info!("Session {}: PASS ({} health checks)", session_num, checks);
                }
                Err(e) => {
                    tracing::warn!("Session {}: FAIL ({})", session_num, e);
                    all_passed = false;
                }
            }

            if !options.keep_accepting {
                break;
            }
        }

        all_passed
    }

    /// Accept one client and run the script against it
    ///
    /// Returns the number of health checks answered with SERVING.
    pub async fn serve_one(&self, options: &MockCnodeOptions) -> Result<u32, MockCnodeError> {
        let (stream, addr) = self.listener.accept().await?;
        tracing::info!("Connection from {}", addr);

        let mut session = Session::new(stream, addr, Framing::Fixed32, MAX_CNODE_REQUEST_LEN)
            .with_send_timeout(options.read_timeout);
        let result = check_session(&mut session, options).await;
        session.close().await;
        result
    }
}

async fn check_session(
    session: &mut Session,
    options: &MockCnodeOptions,
) -> Result<u32, MockCnodeError> {
    let identity = session.recv_timeout(options.read_timeout).await?;
    let node_type = NodeTypeMessage::decode(&identity).map(|m| m.node_type);
    if node_type != Some(NODE_TYPE_AMF) {
        return Err(MockCnodeError::WrongNodeType(node_type));
    }
    tracing::info!(
        "NodeType_Message nodetype={} ({})",
        NODE_TYPE_AMF,
        node_type_name(NODE_TYPE_AMF)
    );

    let request = HealthCheckRequest::default().encode()?;
    let limit = if options.count == 0 { u32::MAX } else { options.count };
    let mut done = 0;

    while done < limit {
        if done > 0 {
            tokio::time::sleep(options.interval).await;
        }

        if let Err(e) = session.send(&request).await {
            return finish_or_fail(options, done, e);
        }
        let response = match session.recv_timeout(options.read_timeout).await {
            Ok(response) => response,
            Err(e) => return finish_or_fail(options, done, e),
        };

        let status = HealthCheckResponse::decode_status(&response);
        if status.and_then(ServingStatus::from_wire) != Some(ServingStatus::Serving) {
            return Err(MockCnodeError::WrongStatus(status));
        }
        done += 1;
        tracing::info!("HealthCheckResponse {} status=SERVING", done);
    }

    Ok(done)
}

/// In open-ended mode a hang-up is how the session ends
fn finish_or_fail(
    options: &MockCnodeOptions,
    done: u32,
    e: ConnectionError,
) -> Result<u32, MockCnodeError> {
    let hung_up = matches!(e, ConnectionError::Closed | ConnectionError::Io(_));
    if options.count == 0 && done > 0 && hung_up {
        Ok(done)
    } else {
        Err(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CnodeConfig;
    use crate::network::CnodeClient;
    use crate::protocol::{read_frame_fixed32, write_frame_fixed32};
    use tokio::net::TcpStream;

    fn fast_options(count: u32) -> MockCnodeOptions {
        MockCnodeOptions {
            interval: Duration::from_millis(50),
            count,
            keep_accepting: false,
            read_timeout: Duration::from_secs(2),
        }
    }

    async fn bind_local() -> (MockCnodeServer, SocketAddr) {
        let server = MockCnodeServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_mock_against_cnode_client() {
        let (server, addr) = bind_local().await;
        let mut client = CnodeClient::new(CnodeConfig {
            server_ip: Some(addr.ip().to_string()),
            server_port: addr.port(),
            poll_interval_ms: 100,
            ..Default::default()
        });
        client.start().unwrap();

        assert!(server.run(&fast_options(3)).await);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_node_type_fails() {
        let (server, addr) = bind_local().await;
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_frame_fixed32(&mut stream, &[0x08, 0x02]).await.unwrap();
        });

        let result = server.serve_one(&fast_options(1)).await;
        assert!(matches!(result, Err(MockCnodeError::WrongNodeType(Some(2)))));
    }

    #[tokio::test]
    async fn test_wrong_status_fails() {
        let (server, addr) = bind_local().await;
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_frame_fixed32(&mut stream, &[0x08, 0x0D]).await.unwrap();
            let request = read_frame_fixed32(&mut stream, 64).await.unwrap();
            assert_eq!(&request[..], &[0x0A, 0x00]);
            write_frame_fixed32(&mut stream, &[0x08, 0x02]).await.unwrap();
        });

        let result = server.serve_one(&fast_options(1)).await;
        assert!(matches!(result, Err(MockCnodeError::WrongStatus(Some(2)))));
    }

    #[tokio::test]
    async fn test_open_ended_session_ends_on_hangup() {
        let (server, addr) = bind_local().await;
        tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_frame_fixed32(&mut stream, &[0x08, 0x0D]).await.unwrap();
            for _ in 0..2 {
                read_frame_fixed32(&mut stream, 64).await.unwrap();
                write_frame_fixed32(&mut stream, &[0x08, 0x01]).await.unwrap();
            }
        });

        let checks = server.serve_one(&fast_options(0)).await.unwrap();
        assert_eq!(checks, 2);
    }
}
