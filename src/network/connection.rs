//! Connection handling for the sidecars
//!
//! A `Session` owns one TCP stream for its whole life and speaks exactly one
//! framing on it. The socket closes when the session is dropped, so every
//! exit path of the owning task releases it.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::protocol::{CodecError, Framing};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("Connection timeout")]
    Timeout,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Outcome of waiting for inbound data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// At least one byte is waiting
    Readable,
    /// Nothing arrived within the wait
    Idle,
    /// The peer hung up
    Closed,
}

/// Session statistics
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Bytes sent, prefixes included
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
}

/// One framed TCP conversation
pub struct Session {
    /// Remote peer address
    peer_addr: SocketAddr,
    /// The TCP stream
    stream: TcpStream,
    /// Length prefix flavour used in both directions
    framing: Framing,
    /// Largest inbound payload accepted
    max_frame_len: usize,
    /// Deadline for a single send
    send_timeout: Option<Duration>,
    /// Write buffer
    write_buf: BytesMut,
    /// Statistics
    stats: SessionStats,
}

impl Session {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        framing: Framing,
        max_frame_len: usize,
    ) -> Self {
        Self {
            peer_addr,
            stream,
            framing,
            max_frame_len,
            send_timeout: None,
            write_buf: BytesMut::with_capacity(64),
            stats: SessionStats::default(),
        }
    }

    /// Bound every send by `timeout`
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Receive one frame
    pub async fn recv(&mut self) -> ConnectionResult<Bytes> {
        let payload = match self
            .framing
            .read_frame(&mut self.stream, self.max_frame_len)
            .await
        {
            Ok(payload) => payload,
            Err(CodecError::Closed) => return Err(ConnectionError::Closed),
            Err(e) => return Err(e.into()),
        };

        self.stats.frames_received += 1;
        self.stats.bytes_received += payload.len() as u64;
        Ok(payload)
    }

    /// Receive one frame, giving up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Bytes> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Send one frame. A partial write leaves the session unusable.
    pub async fn send(&mut self, payload: &[u8]) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.framing.encode(payload, &mut self.write_buf)?;

        let stream = &mut self.stream;
        let frame = &self.write_buf;
        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        match self.send_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, write).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectionError::Timeout),
            },
            None => write.await?,
        }

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;
        Ok(())
    }

    /// Wait up to `timeout` for inbound data or a hang-up
    ///
    /// Nothing is consumed from the stream.
    pub async fn wait_readable(&mut self, timeout: Duration) -> ConnectionResult<Readiness> {
        let mut probe = [0u8; 1];
        match tokio::time::timeout(timeout, self.stream.peek(&mut probe)).await {
            Err(_) => Ok(Readiness::Idle),
            Ok(Ok(0)) => Ok(Readiness::Closed),
            Ok(Ok(_)) => Ok(Readiness::Readable),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => Ok(Readiness::Idle),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Shut down the write half; the socket itself closes on drop
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(
                "Shutdown of {} session with {} failed: {}",
                self.framing.name(),
                self.peer_addr(),
                e
            );
        }
    }
}
