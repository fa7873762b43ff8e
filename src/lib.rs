//! hostspeed - find the fastest verified IP for each host name.
//!
//! Candidate `(ip, domain)` pairs are probed concurrently with TCP connects,
//! checked with a TLS handshake using the domain as SNI, retried with
//! backoff, and ranked. The winners are what a hosts-file writer needs.

pub mod candidates;
pub mod config;
pub mod metrics;
pub mod models;
pub mod probe;
pub mod ranking;
pub mod scheduler;

pub use config::SpeedTestConfig;
pub use models::{Candidate, ProgressEvent, Status, TestResult};
pub use scheduler::{Orchestrator, RunError, RunReport, RunState};
