//! Ranking and best-IP selection.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::config::RankingConfig;
use crate::models::TestResult;

/// Composite rank score, lower is better.
///
/// Rows that are neither available nor measurable score `f64::INFINITY`.
pub fn composite_score(result: &TestResult, weights: &RankingConfig) -> f64 {
    if !result.status.is_available() {
        return f64::INFINITY;
    }

    let mut score = f64::from(result.delay_ms);
    if let Some(jitter) = result.jitter_ms {
        score += jitter * weights.jitter_weight;
    }
    if let Some(stability) = result.stability_score {
        score += (100.0 - stability) * weights.stability_weight;
    }
    if result.status.is_tls_verified() {
        score -= weights.tls_bonus;
    }
    score
}

fn tier(result: &TestResult) -> u8 {
    if result.status.is_available() {
        0
    } else {
        1
    }
}

/// Total order over results: (tier, score, delay, ip, domain).
pub fn compare(a: &TestResult, b: &TestResult, weights: &RankingConfig) -> Ordering {
    tier(a)
        .cmp(&tier(b))
        .then_with(|| composite_score(a, weights).total_cmp(&composite_score(b, weights)))
        .then_with(|| a.delay_ms.cmp(&b.delay_ms))
        .then_with(|| a.ip.cmp(&b.ip))
        .then_with(|| a.domain.cmp(&b.domain))
}

/// Best first; failed and stopped rows trail every available one.
pub fn rank(results: &[TestResult], weights: &RankingConfig) -> Vec<TestResult> {
    let mut ranked = results.to_vec();
    ranked.sort_by(|a, b| compare(a, b, weights));
    ranked
}

/// Winning row per domain.
///
/// A TLS-verified row always beats an unverified one for the same domain;
/// the composite score decides within each group.
pub fn select_best_per_domain(
    results: &[TestResult],
    weights: &RankingConfig,
) -> BTreeMap<String, TestResult> {
    let mut verified: BTreeMap<&str, &TestResult> = BTreeMap::new();
    let mut fallback: BTreeMap<&str, &TestResult> = BTreeMap::new();

    for r in results.iter().filter(|r| r.status.is_available()) {
        let slot = if r.status.is_tls_verified() {
            &mut verified
        } else {
            &mut fallback
        };
        slot.entry(r.domain.as_str())
            .and_modify(|best| {
                if compare(r, *best, weights) == Ordering::Less {
                    *best = r;
                }
            })
            .or_insert(r);
    }

    let mut best: BTreeMap<String, TestResult> = fallback
        .into_iter()
        .map(|(domain, r)| (domain.to_string(), r.clone()))
        .collect();
    for (domain, r) in verified {
        best.insert(domain.to_string(), r.clone());
    }
    for r in best.values_mut() {
        r.selected = true;
    }
    best
}

/// Flag the rows that won their domain.
pub fn mark_selected(results: &mut [TestResult], best: &BTreeMap<String, TestResult>) {
    for r in results.iter_mut() {
        r.selected = best
            .get(&r.domain)
            .is_some_and(|winner| winner.ip == r.ip);
    }
}

/// `(ip, domain)` pairs for the hosts-file writer, sorted by domain.
pub fn host_entries(best: &BTreeMap<String, TestResult>) -> Vec<(IpAddr, String)> {
    best.iter().map(|(domain, r)| (r.ip, domain.clone())).collect()
}
