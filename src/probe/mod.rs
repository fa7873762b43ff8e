//! Probe module for IP speed testing.
//!
//! Supports TCP connect timing, TLS/SNI verification and ICMP echo.

mod icmp;
mod tcp;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use icmp::icmp_ping;
pub use tcp::connect_rtt;
pub use tls::{normalize_host, sni_candidates, verify_any, TlsConnectors};

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused")]
    Refused,
    #[error("network error: {0}")]
    Network(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("certificate verification failed: {0}")]
    CertVerify(String),
    #[error("invalid host name: {0}")]
    InvalidHost(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    /// Short tag used in diagnostics and status reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Timeout(_) => "timeout",
            ProbeError::Refused => "refused",
            ProbeError::Network(_) => "os_error",
            ProbeError::Tls(_) => "tls",
            ProbeError::CertVerify(_) => "cert_verify",
            ProbeError::InvalidHost(_) => "invalid_host",
            ProbeError::Command(_) => "command",
        }
    }

    pub(crate) fn from_io(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::ConnectionRefused => ProbeError::Refused,
            _ => ProbeError::Network(e.to_string()),
        }
    }

    /// Classify an I/O error surfaced by a TLS stream.
    pub(crate) fn from_tls_io(e: std::io::Error) -> Self {
        match e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            Some(rustls::Error::InvalidCertificate(cert)) => {
                ProbeError::CertVerify(format!("{:?}", cert))
            }
            Some(other) => ProbeError::Tls(other.to_string()),
            None => ProbeError::from_io(e),
        }
    }
}

/// Network operations the engine is built on.
#[async_trait]
pub trait Prober: Send + Sync {
    /// One TCP connect; latency in milliseconds.
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<f64, ProbeError>;

    /// One TLS handshake presenting `sni`.
    async fn handshake(
        &self,
        addr: SocketAddr,
        sni: &str,
        timeout: Duration,
        verify_hostname: bool,
    ) -> Result<(), ProbeError>;

    /// One ICMP echo; whole milliseconds (at least 1) or `None`.
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<u32>;
}

/// Production prober backed by real sockets.
#[derive(Clone)]
pub struct NetProber {
    tls: TlsConnectors,
}

impl NetProber {
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            tls: TlsConnectors::new()?,
        })
    }
}

#[async_trait]
impl Prober for NetProber {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<f64, ProbeError> {
        let result = connect_rtt(addr, timeout).await;
        if let Err(e) = &result {
            tracing::debug!(ip = %addr.ip(), port = addr.port(), error = %e, "TCP connect failed");
        }
        result
    }

    async fn handshake(
        &self,
        addr: SocketAddr,
        sni: &str,
        timeout: Duration,
        verify_hostname: bool,
    ) -> Result<(), ProbeError> {
        tls::handshake(self.tls.get(verify_hostname), addr, sni, timeout).await
    }

    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<u32> {
        icmp_ping(ip, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(ProbeError::from_io(refused), ProbeError::Refused);

        let other = std::io::Error::other("network unreachable");
        assert_eq!(ProbeError::from_io(other).kind(), "os_error");
    }

    #[test]
    fn tls_errors_are_classified() {
        let cert = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName),
        );
        assert_eq!(ProbeError::from_tls_io(cert).kind(), "cert_verify");

        let alert = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::HandshakeFailure),
        );
        assert_eq!(ProbeError::from_tls_io(alert).kind(), "tls");
    }
}
