//! Scheduler module: concurrent evaluation of candidate IPs.

mod backoff;
mod evaluate;
mod sampler;

pub use backoff::ExponentialBackoff;
pub use evaluate::{evaluate, Evaluation};
pub use sampler::{sample, SampleParams};

use crate::config::{ConfigError, SpeedTestConfig};
use crate::models::{Candidate, ProgressEvent, TestResult};
use crate::probe::{NetProber, ProbeError, Prober};
use crate::ranking;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Orchestrator error types.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("probe setup failed: {0}")]
    Probe(#[from] ProbeError),
    #[error("a run is already in progress")]
    AlreadyRunning,
}

/// Progress counters and the stop signal shared with the caller of a run.
#[derive(Debug, Default)]
pub struct RunState {
    total: AtomicUsize,
    completed: AtomicUsize,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the current run to stop; in-flight evaluations end as `stopped`.
    pub fn request_stop(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// `(completed, total)` unique IPs of the current or last run.
    pub fn progress(&self) -> (usize, usize) {
        (
            self.completed.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn begin(&self, total: usize) -> Result<CancellationToken, RunError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RunError::AlreadyRunning);
        }

        self.total.store(total, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);

        let token = CancellationToken::new();
        match self.cancel.lock() {
            Ok(mut guard) => *guard = token.clone(),
            Err(poisoned) => *poisoned.into_inner() = token.clone(),
        }
        Ok(token)
    }

    fn complete_one(&self) -> usize {
        self.completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct RunningGuard<'a>(&'a RunState);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Outcome of one orchestrated run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_ips: usize,
    pub completed_ips: usize,
    pub cancelled: bool,
    /// Every (IP, domain) row that arrived, best first.
    pub results: Vec<TestResult>,
    /// Winning row per domain.
    pub best: BTreeMap<String, TestResult>,
}

impl RunReport {
    /// `(ip, domain)` pairs for the hosts-file writer.
    pub fn host_entries(&self) -> Vec<(IpAddr, String)> {
        ranking::host_entries(&self.best)
    }
}

/// Deduplicate candidates and group domains by IP, keeping first-seen order.
///
/// Domains are lowercased, so `GitHub.com` and `github.com` are one key.
pub fn group_by_ip(candidates: &[Candidate]) -> Vec<(IpAddr, Vec<String>)> {
    let mut seen: HashSet<(IpAddr, String)> = HashSet::new();
    let mut index: HashMap<IpAddr, usize> = HashMap::new();
    let mut groups: Vec<(IpAddr, Vec<String>)> = Vec::new();

    for c in candidates {
        let domain = c.domain.to_ascii_lowercase();
        if !seen.insert((c.ip, domain.clone())) {
            continue;
        }
        match index.get(&c.ip) {
            Some(&i) => groups[i].1.push(domain),
            None => {
                index.insert(c.ip, groups.len());
                groups.push((c.ip, vec![domain]));
            }
        }
    }
    groups
}

/// Runs one evaluation per unique IP on a bounded pool of tasks.
pub struct Orchestrator<P: Prober + 'static = NetProber> {
    config: Arc<SpeedTestConfig>,
    prober: Arc<P>,
}

impl Orchestrator<NetProber> {
    /// Orchestrator over real sockets.
    pub fn new(config: SpeedTestConfig) -> Result<Self, RunError> {
        let prober = NetProber::new()?;
        Self::with_prober(config, Arc::new(prober))
    }
}

impl<P: Prober + 'static> Orchestrator<P> {
    pub fn with_prober(config: SpeedTestConfig, prober: Arc<P>) -> Result<Self, RunError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            prober,
        })
    }

    pub fn config(&self) -> &SpeedTestConfig {
        &self.config
    }

    /// Evaluate every unique IP among `candidates`.
    ///
    /// Results arrive in completion order; each one is reported on `progress`
    /// as soon as it is in. A stop request aborts in-flight evaluations and
    /// the report covers only the IPs that finished.
    pub async fn run(
        &self,
        candidates: &[Candidate],
        state: Arc<RunState>,
        mut progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Result<RunReport, RunError> {
        let groups = group_by_ip(candidates);
        let total = groups.len();
        let cancel = state.begin(total)?;
        let _running = RunningGuard(&state);
        let started_at = Utc::now();

        let workers = self.config.concurrency.max_workers.min(total).max(1);
        tracing::info!(
            "Starting run: {} candidates, {} unique IPs, {} workers",
            candidates.len(),
            total,
            workers
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();

        for (ip, domains) in groups {
            if cancel.is_cancelled() {
                break;
            }

            let semaphore = semaphore.clone();
            let prober = self.prober.clone();
            let config = self.config.clone();
            let state = state.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok()?,
                    _ = cancel.cancelled() => return None,
                };
                if cancel.is_cancelled() {
                    return None;
                }

                let eval = evaluate(prober.as_ref(), ip, &domains, &config, &cancel).await;
                let completed = state.complete_one();
                tracing::debug!(
                    %ip,
                    status = eval.status.as_str(),
                    delay_ms = eval.delay_ms,
                    attempts = eval.attempts,
                    "evaluation finished"
                );
                Some((eval.to_results(&domains), completed))
            });
        }

        let mut results: Vec<TestResult> = Vec::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = tasks.join_next() => match next {
                    Some(joined) => joined,
                    None => break,
                },
            };

            match joined {
                Ok(Some((rows, completed))) => {
                    if let Some(tx) = &progress {
                        let event = ProgressEvent {
                            completed,
                            total,
                            results: rows.clone(),
                        };
                        if tx.send(event).await.is_err() {
                            tracing::warn!("Progress receiver dropped, continuing without it");
                            progress = None;
                        }
                    }
                    results.extend(rows);
                }
                Ok(None) => {}
                Err(e) if e.is_panic() => tracing::error!("Evaluation task panicked: {}", e),
                Err(_) => {}
            }
        }

        if cancel.is_cancelled() {
            tasks.abort_all();
            while let Some(joined) = tasks.join_next().await {
                if let Ok(Some((rows, _))) = joined {
                    results.extend(rows);
                }
            }
        }

        let mut ranked = ranking::rank(&results, &self.config.ranking);
        let best = ranking::select_best_per_domain(&ranked, &self.config.ranking);
        ranking::mark_selected(&mut ranked, &best);

        let (completed_ips, _) = state.progress();
        let cancelled = cancel.is_cancelled();
        tracing::info!(
            "Run finished: {}/{} IPs, {} domains selected{}",
            completed_ips,
            total,
            best.len(),
            if cancelled { " (stopped)" } else { "" }
        );

        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            total_ips: total,
            completed_ips,
            cancelled,
            results: ranked,
            best,
        })
    }
}
