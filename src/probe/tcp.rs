//! TCP connect latency probe.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpSocket;
use tokio::time::{timeout, Instant};

use super::ProbeError;

/// Open one TCP connection to `addr` and measure the connect time.
///
/// Returns latency in milliseconds with sub-millisecond precision. The socket
/// family always matches the address family, and a connection that reports
/// success but carries a pending `SO_ERROR` counts as a failure. The socket is
/// dropped (closed) on every path.
pub async fn connect_rtt(addr: SocketAddr, to: Duration) -> Result<f64, ProbeError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(ProbeError::from_io)?;

    let start = Instant::now();
    let stream = match timeout(to, socket.connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProbeError::from_io(e)),
        Err(_) => return Err(ProbeError::Timeout(to)),
    };
    let rtt_ms = start.elapsed().as_secs_f64() * 1_000.0;

    if let Some(e) = stream.take_error().map_err(ProbeError::from_io)? {
        return Err(ProbeError::from_io(e));
    }

    Ok(rtt_ms)
}
