//! Candidate input from hosts-formatted text.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;

use crate::models::Candidate;

/// Address family restriction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpFamily {
    #[default]
    Any,
    V4Only,
    V6Only,
}

impl IpFamily {
    fn accepts(self, ip: &IpAddr) -> bool {
        match self {
            IpFamily::Any => true,
            IpFamily::V4Only => ip.is_ipv4(),
            IpFamily::V6Only => ip.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Keep only hosts containing this substring (case-insensitive).
    pub filter: Option<String>,
    pub family: IpFamily,
}

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9.-]+$").unwrap())
}

fn valid_hostname(host: &str) -> bool {
    host.contains('.') && hostname_re().is_match(host)
}

/// Parse `ip host [host...]` lines.
///
/// Comments, lines without a valid IP and malformed host names are skipped;
/// `(ip, host)` pairs are deduplicated case-insensitively.
pub fn parse_hosts_text(text: &str, opts: &ParseOptions) -> Vec<Candidate> {
    let filter = opts.filter.as_deref().map(str::to_ascii_lowercase);
    let mut seen: HashSet<(IpAddr, String)> = HashSet::new();
    let mut out = Vec::new();

    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        let mut parts = line.split_whitespace();
        let Some(Ok(ip)) = parts.next().map(str::parse::<IpAddr>) else {
            continue;
        };
        if !opts.family.accepts(&ip) {
            continue;
        }

        for host in parts {
            if !valid_hostname(host) {
                continue;
            }
            let lower = host.to_ascii_lowercase();
            if let Some(f) = &filter {
                if !lower.contains(f.as_str()) {
                    continue;
                }
            }
            if seen.insert((ip, lower)) {
                out.push(Candidate::new(ip, host));
            }
        }
    }

    tracing::debug!("Parsed {} candidates from hosts text", out.len());
    out
}
