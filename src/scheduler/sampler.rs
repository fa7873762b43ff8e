//! Repeated TCP sampling of one IP.

use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::metrics::{Metrics, StabilityWeights};
use crate::probe::Prober;

/// Sampling parameters for one IP.
#[derive(Debug, Clone, Copy)]
pub struct SampleParams {
    pub attempts: u32,
    pub timeout: Duration,
    pub inter_attempt_delay: Duration,
}

/// Issue up to `params.attempts` sequential connects against `addr`.
///
/// The cancellation token is checked before every attempt; on cancellation
/// the metrics cover the samples gathered so far.
pub async fn sample<P: Prober + ?Sized>(
    prober: &P,
    addr: SocketAddr,
    params: SampleParams,
    weights: &StabilityWeights,
    cancel: &CancellationToken,
) -> Metrics {
    let mut samples = Vec::with_capacity(params.attempts as usize);

    for i in 0..params.attempts {
        if cancel.is_cancelled() {
            tracing::debug!(ip = %addr.ip(), taken = samples.len(), "sampling cancelled");
            break;
        }

        samples.push(prober.connect(addr, params.timeout).await);

        let last = i + 1 == params.attempts;
        if !last && !params.inter_attempt_delay.is_zero() {
            tokio::time::sleep(params.inter_attempt_delay).await;
        }
    }

    Metrics::from_samples(&samples, weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::ScriptedProber;

    fn params(attempts: u32) -> SampleParams {
        SampleParams {
            attempts,
            timeout: Duration::from_secs(2),
            inter_attempt_delay: Duration::from_millis(20),
        }
    }

    fn addr(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 443)
    }

    #[tokio::test(start_paused = true)]
    async fn takes_all_attempts() {
        let prober = ScriptedProber::default().tcp("140.82.112.4", 30.0);
        let m = sample(
            &prober,
            addr("140.82.112.4"),
            params(5),
            &StabilityWeights::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(prober.connect_calls(), 5);
        assert_eq!(m.sample_count, 5);
        assert_eq!(m.median_ms, Some(30.0));
        assert_eq!(m.jitter_ms, Some(0.0));
        assert_eq!(m.packet_loss_pct, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_ip_scores_zero() {
        let prober = ScriptedProber::default();
        let m = sample(
            &prober,
            addr("203.0.113.9"),
            params(5),
            &StabilityWeights::default(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(m.median_ms, None);
        assert_eq!(m.stability_score, 0.0);
        assert_eq!(m.packet_loss_pct, 100.0);
        assert_eq!(m.sample_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_keeps_partial_samples() {
        let cancel = CancellationToken::new();
        let prober = ScriptedProber::default()
            .tcp("140.82.112.3", 45.0)
            .cancel_on_connect(2, cancel.clone());

        let m = sample(
            &prober,
            addr("140.82.112.3"),
            params(5),
            &StabilityWeights::default(),
            &cancel,
        )
        .await;

        assert_eq!(prober.connect_calls(), 2);
        assert_eq!(m.sample_count, 2);
        assert_eq!(m.success_count, 2);
        assert_eq!(m.median_ms, Some(45.0));
        assert_eq!(m.packet_loss_pct, 0.0);
    }

    #[tokio::test]
    async fn cancelled_before_start_takes_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let prober = ScriptedProber::default().tcp("140.82.112.3", 45.0);

        let m = sample(
            &prober,
            addr("140.82.112.3"),
            params(5),
            &StabilityWeights::default(),
            &cancel,
        )
        .await;

        assert_eq!(prober.connect_calls(), 0);
        assert!(!m.is_reachable());
    }
}
