//! hostspeed - speed-test candidate IPs and print the best one per host.

use clap::{Parser, ValueEnum};
use hostspeed::candidates::{parse_hosts_text, IpFamily, ParseOptions};
use hostspeed::{Orchestrator, ProgressEvent, RunReport, RunState, SpeedTestConfig};

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Hosts-formatted candidate list (`ip host [host...]`), `-` for stdin
    input: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum concurrent evaluations
    #[arg(short, long)]
    workers: Option<usize>,

    /// Skip the TLS/SNI check
    #[arg(long)]
    no_tls: bool,

    /// Treat a failed TLS check as a failed attempt
    #[arg(long)]
    strict: bool,

    /// Disable the ICMP fallback
    #[arg(long)]
    no_icmp: bool,

    /// Keep only hosts containing this substring
    #[arg(short, long)]
    filter: Option<String>,

    #[arg(long, conflicts_with = "ipv6_only")]
    ipv4_only: bool,

    #[arg(long)]
    ipv6_only: bool,

    #[arg(short, long, value_enum, default_value_t = OutputMode::Hosts)]
    output: OutputMode,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputMode {
    /// `ip domain` lines for the winners
    Hosts,
    /// Full run report
    Json,
    /// Ranked results
    Table,
}

impl Args {
    fn apply(&self, cfg: &mut SpeedTestConfig) {
        if let Some(n) = self.workers {
            cfg.concurrency.max_workers = n;
        }
        if self.no_tls {
            cfg.tls.enabled = false;
        }
        if self.strict {
            cfg.tls.strict = true;
        }
        if self.no_icmp {
            cfg.icmp.enabled = false;
        }
    }

    fn parse_options(&self) -> ParseOptions {
        let family = if self.ipv4_only {
            IpFamily::V4Only
        } else if self.ipv6_only {
            IpFamily::V6Only
        } else {
            IpFamily::Any
        };
        ParseOptions {
            filter: self.filter.clone(),
            family,
        }
    }
}

async fn read_input(path: Option<&Path>) -> std::io::Result<String> {
    match path {
        Some(p) if p != Path::new("-") => tokio::fs::read_to_string(p).await,
        _ => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}

fn print_progress(event: &ProgressEvent) {
    let Some(first) = event.results.first() else {
        return;
    };
    let domains: Vec<&str> = event.results.iter().map(|r| r.domain.as_str()).collect();
    eprintln!(
        "[{}/{}] {} ({}) -> {} {}ms",
        event.completed,
        event.total,
        first.ip,
        domains.join(", "),
        first.status,
        first.delay_ms
    );
}

fn print_table(report: &RunReport) {
    println!(
        "{:<3} {:<40} {:<32} {:>7} {:>8} {:>9}  STATUS",
        "", "IP", "DOMAIN", "DELAY", "JITTER", "STABILITY"
    );
    for r in &report.results {
        let jitter = r.jitter_ms.map_or_else(|| "-".to_string(), |j| format!("{:.2}", j));
        let stability = r
            .stability_score
            .map_or_else(|| "-".to_string(), |s| format!("{:.1}", s));
        println!(
            "{:<3} {:<40} {:<32} {:>7} {:>8} {:>9}  {}",
            if r.selected { "*" } else { "" },
            r.ip,
            r.domain,
            r.delay_ms,
            jitter,
            stability,
            r.status
        );
    }
    eprintln!(
        "\n{}/{} IPs tested{}",
        report.completed_ips,
        report.total_ips,
        if report.cancelled { ", stopped early" } else { "" }
    );
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error + Send + Sync>> {
    // stdout carries the results
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("hostspeed=info".parse()?))
        .init();

    let args = Args::parse();

    let mut cfg = SpeedTestConfig::load(args.config.as_deref())?;
    args.apply(&mut cfg);

    let text = read_input(args.input.as_deref()).await?;
    let candidates = parse_hosts_text(&text, &args.parse_options());
    if candidates.is_empty() {
        tracing::warn!("No usable candidates in input");
        return Ok(ExitCode::FAILURE);
    }

    let orchestrator = Orchestrator::new(cfg)?;
    let state = Arc::new(RunState::new());

    let stopper = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Stop requested, finishing with the results so far");
            stopper.request_stop();
        }
    });

    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_progress(&event);
        }
    });

    let report = orchestrator.run(&candidates, state, Some(tx)).await?;
    printer.await?;

    match args.output {
        OutputMode::Hosts => {
            for (ip, domain) in report.host_entries() {
                println!("{} {}", ip, domain);
            }
        }
        OutputMode::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputMode::Table => print_table(&report),
    }

    Ok(if report.best.is_empty() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
