//! Per-IP evaluation with bounded retries.
//!
//! One attempt is a full sampling run, followed by the SNI check when TCP
//! answered or by an ICMP echo when it did not. Failed attempts back off
//! exponentially; cancellation ends the evaluation as `Stopped` at any point.

use std::net::{IpAddr, SocketAddr};

use tokio_util::sync::CancellationToken;

use super::backoff::ExponentialBackoff;
use super::sampler::{sample, SampleParams};
use crate::config::SpeedTestConfig;
use crate::metrics::Metrics;
use crate::models::{Status, TestResult, VerificationOutcome, SENTINEL_DELAY_MS};
use crate::probe::{sni_candidates, verify_any, Prober};

/// Final record of one IP evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub ip: IpAddr,
    pub delay_ms: u32,
    pub status: Status,
    pub metrics: Option<Metrics>,
    pub verification: Option<VerificationOutcome>,
    /// Informational echo time when ICMP is not fallback-only.
    pub icmp_ms: Option<u32>,
    pub attempts: u32,
    pub retry_count: u32,
    pub errors: Vec<String>,
    measure_jitter: bool,
    calculate_stability: bool,
}

impl Evaluation {
    fn new(ip: IpAddr, config: &SpeedTestConfig) -> Self {
        Self {
            ip,
            delay_ms: SENTINEL_DELAY_MS,
            status: Status::Stopped,
            metrics: None,
            verification: None,
            icmp_ms: None,
            attempts: 0,
            retry_count: 0,
            errors: Vec::new(),
            measure_jitter: config.advanced.measure_jitter,
            calculate_stability: config.advanced.calculate_stability,
        }
    }

    pub fn jitter_ms(&self) -> Option<f64> {
        if !self.measure_jitter || !self.status.is_available() {
            return None;
        }
        self.metrics.as_ref().and_then(|m| m.jitter_ms)
    }

    pub fn stability_score(&self) -> Option<f64> {
        if !self.calculate_stability || !self.status.is_available() {
            return None;
        }
        self.metrics
            .as_ref()
            .filter(|m| m.is_reachable())
            .map(|m| m.stability_score)
    }

    /// One row per domain sharing this IP; only `domain` differs.
    pub fn to_results(&self, domains: &[String]) -> Vec<TestResult> {
        domains
            .iter()
            .map(|domain| TestResult {
                ip: self.ip,
                domain: domain.clone(),
                delay_ms: self.delay_ms,
                status: self.status.clone(),
                jitter_ms: self.jitter_ms(),
                stability_score: self.stability_score(),
                selected: false,
                retry_count: self.retry_count,
                attempts: self.attempts,
            })
            .collect()
    }
}

enum Attempt {
    Success {
        delay_ms: u32,
        status: Status,
    },
    Failure {
        reason: String,
    },
    Stopped,
}

/// Evaluate one IP against the domains that reference it.
pub async fn evaluate<P: Prober + ?Sized>(
    prober: &P,
    ip: IpAddr,
    domains: &[String],
    config: &SpeedTestConfig,
    cancel: &CancellationToken,
) -> Evaluation {
    let mut eval = Evaluation::new(ip, config);
    let max_retries = config.retry.effective_retries();
    let backoff = ExponentialBackoff::new(config.retry.backoff_factor);
    let mut last_reason = String::from("no response");

    for retry in 0..=max_retries {
        if cancel.is_cancelled() {
            return eval;
        }
        eval.attempts += 1;

        match run_attempt(prober, &mut eval, domains, config, cancel).await {
            Attempt::Success { delay_ms, status } => {
                eval.delay_ms = delay_ms;
                eval.status = status;
                return eval;
            }
            Attempt::Stopped => {
                eval.status = Status::Stopped;
                eval.delay_ms = SENTINEL_DELAY_MS;
                return eval;
            }
            Attempt::Failure { reason } => {
                tracing::debug!(%ip, attempt = eval.attempts, %reason, "attempt failed");
                eval.errors.push(format!("attempt {}: {}", eval.attempts, reason));
                last_reason = reason;

                if retry < max_retries {
                    let wait = backoff.duration(retry);
                    tokio::select! {
                        _ = cancel.cancelled() => return eval,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    eval.retry_count += 1;
                }
            }
        }
    }

    if cancel.is_cancelled() {
        eval.status = Status::Stopped;
        eval.delay_ms = SENTINEL_DELAY_MS;
        return eval;
    }
    eval.status = Status::Failed {
        reason: format!("{} ({} attempts)", last_reason, eval.attempts),
    };
    eval.delay_ms = SENTINEL_DELAY_MS;
    eval
}

async fn run_attempt<P: Prober + ?Sized>(
    prober: &P,
    eval: &mut Evaluation,
    domains: &[String],
    config: &SpeedTestConfig,
    cancel: &CancellationToken,
) -> Attempt {
    let addr = SocketAddr::new(eval.ip, config.tcp.port);
    let params = SampleParams {
        attempts: config.tcp.attempts,
        timeout: config.tcp.timeout(),
        inter_attempt_delay: config.tcp.inter_attempt_delay(),
    };

    let metrics = sample(prober, addr, params, &config.advanced.stability, cancel).await;
    let median = metrics.median_ms;
    let last_error = metrics.last_error.clone();
    eval.metrics = Some(metrics);

    if cancel.is_cancelled() {
        return Attempt::Stopped;
    }

    let Some(median) = median else {
        if config.icmp.enabled {
            if let Some(ms) = prober.ping(eval.ip, config.icmp.timeout()).await {
                return Attempt::Success {
                    delay_ms: ms.max(1),
                    status: Status::AvailableIcmp,
                };
            }
            if cancel.is_cancelled() {
                return Attempt::Stopped;
            }
        }
        return Attempt::Failure {
            reason: last_error.unwrap_or_else(|| "no response".to_string()),
        };
    };

    let delay_ms = (median.max(0.0) as u32).max(1);

    if config.icmp.enabled && !config.icmp.fallback_only {
        eval.icmp_ms = prober.ping(eval.ip, config.icmp.timeout()).await;
    }

    if !config.tls.enabled {
        return Attempt::Success {
            delay_ms,
            status: Status::Available,
        };
    }

    let hosts = sni_candidates(domains, &config.tls.preferred_hosts, config.tls.try_hosts_limit);
    if hosts.is_empty() {
        return Attempt::Success {
            delay_ms,
            status: Status::Available,
        };
    }

    let outcome = verify_any(
        prober,
        addr,
        &hosts,
        config.tls.timeout(),
        config.tls.verify_hostname,
        config.tls.try_hosts_limit,
        cancel,
    )
    .await;
    let verified = outcome.verified;
    let kind = outcome.error_kind.clone().unwrap_or_else(|| "tls".to_string());
    eval.verification = Some(outcome);

    if verified {
        return Attempt::Success {
            delay_ms,
            status: Status::AvailableTls,
        };
    }
    if cancel.is_cancelled() {
        return Attempt::Stopped;
    }
    if config.tls.strict {
        return Attempt::Failure {
            reason: format!("sni:{}", kind),
        };
    }
    Attempt::Success {
        delay_ms,
        status: Status::AvailableTcpTlsFailed { reason: kind },
    }
}
