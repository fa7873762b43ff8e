//! Latency statistics for a batch of TCP connect samples.

use serde::{Deserialize, Serialize};

use crate::probe::ProbeError;

/// Points and divisors of the stability score components.
///
/// Each component is `max(0, points - value / divisor)`; the sum is capped at 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityWeights {
    pub latency_points: f64,
    pub latency_divisor: f64,
    pub jitter_points: f64,
    pub jitter_divisor: f64,
    pub loss_points: f64,
    pub loss_divisor: f64,
}

impl Default for StabilityWeights {
    fn default() -> Self {
        Self {
            latency_points: 50.0,
            latency_divisor: 10.0,
            jitter_points: 30.0,
            jitter_divisor: 3.33,
            loss_points: 20.0,
            loss_divisor: 5.0,
        }
    }
}

impl StabilityWeights {
    /// Composite 0..=100 score, higher is better.
    pub fn score(&self, median_ms: f64, jitter_ms: f64, packet_loss_pct: f64) -> f64 {
        let latency = (self.latency_points - median_ms / self.latency_divisor).max(0.0);
        let jitter = (self.jitter_points - jitter_ms / self.jitter_divisor).max(0.0);
        let loss = (self.loss_points - packet_loss_pct / self.loss_divisor).max(0.0);
        (latency + jitter + loss).clamp(0.0, 100.0)
    }
}

/// Aggregate of the probes issued against one IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub median_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub stability_score: f64,
    pub success_rate_pct: f64,
    /// Probes actually issued.
    pub sample_count: usize,
    pub success_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Metrics {
    /// Metrics for an IP that never answered.
    pub fn unreachable(sample_count: usize, last_error: Option<String>) -> Self {
        Self {
            median_ms: None,
            mean_ms: None,
            min_ms: None,
            max_ms: None,
            jitter_ms: None,
            packet_loss_pct: 100.0,
            stability_score: 0.0,
            success_rate_pct: 0.0,
            sample_count,
            success_count: 0,
            last_error,
        }
    }

    pub fn from_samples(samples: &[Result<f64, ProbeError>], weights: &StabilityWeights) -> Self {
        let mut latencies: Vec<f64> = samples.iter().filter_map(|s| s.as_ref().ok()).copied().collect();
        let last_error = samples
            .iter()
            .rev()
            .find_map(|s| s.as_ref().err())
            .map(|e| e.to_string());

        if latencies.is_empty() {
            return Self::unreachable(samples.len(), last_error);
        }

        latencies.sort_by(f64::total_cmp);
        let issued = samples.len() as f64;
        let ok = latencies.len();

        let median = median_sorted(&latencies);
        let mean = latencies.iter().sum::<f64>() / ok as f64;
        let jitter = sample_stdev(&latencies, mean);
        let packet_loss_pct = (issued - ok as f64) / issued * 100.0;

        Self {
            median_ms: Some(median),
            mean_ms: Some(mean),
            min_ms: latencies.first().copied(),
            max_ms: latencies.last().copied(),
            jitter_ms: Some(jitter),
            packet_loss_pct,
            stability_score: weights.score(median, jitter, packet_loss_pct),
            success_rate_pct: ok as f64 / issued * 100.0,
            sample_count: samples.len(),
            success_count: ok,
            last_error,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.median_ms.is_some()
    }
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

// Bessel-corrected; zero below two samples.
fn sample_stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}
