//! Health probe client
//!
//! The counterpart of the health server: sends an empty HealthCheckRequest
//! and reports the status that comes back.

use std::time::{Duration, Instant};

use super::connect_with_timeout;
use super::connection::{ConnectionResult, Session};
use crate::protocol::{Framing, HealthCheckRequest, HealthCheckResponse, ServingStatus};

/// Largest response accepted from a health server
const MAX_PROBE_RESPONSE_LEN: usize = 64;

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Status value as sent, if the payload carried one
    pub raw_status: Option<u64>,
    /// Round trip including connect
    pub elapsed: Duration,
}

impl ProbeReport {
    pub fn status(&self) -> Option<ServingStatus> {
        self.raw_status.and_then(ServingStatus::from_wire)
    }

    pub fn is_serving(&self) -> bool {
        self.status() == Some(ServingStatus::Serving)
    }

    pub fn describe(&self) -> String {
        match (self.status(), self.raw_status) {
            (Some(status), _) => status.name().to_string(),
            (None, Some(raw)) => format!("UNKNOWN({})", raw),
            (None, None) => "UNKNOWN".to_string(),
        }
    }
}

/// Probe a health server once, everything bounded by `timeout`
pub async fn probe_health(
    host: &str,
    port: u16,
    timeout: Duration,
) -> ConnectionResult<ProbeReport> {
    let start = Instant::now();
    let (stream, addr) = connect_with_timeout(host, port, timeout).await?;
    let mut session = Session::new(stream, addr, Framing::Varint, MAX_PROBE_RESPONSE_LEN)
        .with_send_timeout(timeout);

    let request = HealthCheckRequest::default().encode()?;
    session.send(&request).await?;
    let response = session.recv_timeout(timeout).await?;
    session.close().await;

    Ok(ProbeReport {
        raw_status: HealthCheckResponse::decode_status(&response),
        elapsed: start.elapsed(),
    })
}
