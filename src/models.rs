//! Data model types shared by the probing engine and its callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Delay reported for results that have no usable measurement.
///
/// Sorts after every real measurement.
pub const SENTINEL_DELAY_MS: u32 = 9999;

/// An (IP, domain) pair to be evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub ip: IpAddr,
    pub domain: String,
}

impl Candidate {
    pub fn new(ip: IpAddr, domain: impl Into<String>) -> Self {
        Self {
            ip,
            domain: domain.into(),
        }
    }

    /// Build a candidate from the string pair handed over by the hosts-list
    /// or DNS collaborators.
    pub fn parse(ip: &str, domain: &str) -> Option<Self> {
        let ip = ip.trim().parse::<IpAddr>().ok()?;
        let domain = domain.trim();
        if domain.is_empty() {
            return None;
        }
        Some(Self::new(ip, domain))
    }
}

/// Outcome of one IP evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Status {
    /// TCP reachable, TLS check disabled or nothing to check against.
    Available,
    /// TCP reachable and the TLS handshake succeeded with a matching SNI.
    AvailableTls,
    /// TCP reachable, TLS verification failed (lenient mode).
    AvailableTcpTlsFailed { reason: String },
    /// TCP unreachable, ICMP echo answered.
    AvailableIcmp,
    Failed { reason: String },
    Stopped,
}

impl Status {
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            Status::Available
                | Status::AvailableTls
                | Status::AvailableTcpTlsFailed { .. }
                | Status::AvailableIcmp
        )
    }

    pub fn is_tls_verified(&self) -> bool {
        matches!(self, Status::AvailableTls)
    }

    /// Stable machine-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Available => "available",
            Status::AvailableTls => "available_tls",
            Status::AvailableTcpTlsFailed { .. } => "available_tcp_tls_failed",
            Status::AvailableIcmp => "available_icmp",
            Status::Failed { .. } => "failed",
            Status::Stopped => "stopped",
        }
    }

    /// Human-readable label for display layers.
    pub fn label(&self) -> String {
        match self {
            Status::Available => "available".to_string(),
            Status::AvailableTls => "available (TLS)".to_string(),
            Status::AvailableTcpTlsFailed { reason } => {
                format!("available (TCP, TLS failed: {})", reason)
            }
            Status::AvailableIcmp => "available (ICMP)".to_string(),
            Status::Failed { reason } => format!("failed ({})", reason),
            Status::Stopped => "stopped".to_string(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Result of the TLS/SNI correctness check for one IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub used_hostname: Option<String>,
    pub error_kind: Option<String>,
}

impl VerificationOutcome {
    /// No hostname to check against: trivially verified.
    pub fn skipped() -> Self {
        Self {
            verified: true,
            used_hostname: None,
            error_kind: None,
        }
    }

    pub fn passed(hostname: impl Into<String>) -> Self {
        Self {
            verified: true,
            used_hostname: Some(hostname.into()),
            error_kind: None,
        }
    }

    pub fn failed(hostname: Option<String>, error_kind: impl Into<String>) -> Self {
        Self {
            verified: false,
            used_hostname: hostname,
            error_kind: Some(error_kind.into()),
        }
    }
}

/// One (IP, domain) row of a finished test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub ip: IpAddr,
    pub domain: String,
    pub delay_ms: u32,
    pub status: Status,
    pub jitter_ms: Option<f64>,
    pub stability_score: Option<f64>,
    pub selected: bool,
    pub retry_count: u32,
    pub attempts: u32,
}

/// Progress notification emitted once per finished IP.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub completed: usize,
    pub total: usize,
    /// One row per domain sharing the IP.
    pub results: Vec<TestResult>,
}
