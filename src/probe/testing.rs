//! Scripted in-memory prober for engine tests.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ProbeError, Prober};

#[derive(Debug, Clone, Copy)]
enum TcpScript {
    Latency(f64),
    Hang,
}

/// Unknown IPs time out on TCP, fail certificate checks and ignore ICMP.
#[derive(Default)]
pub(crate) struct ScriptedProber {
    tcp: HashMap<IpAddr, TcpScript>,
    tls_ok: HashSet<(IpAddr, String)>,
    icmp: HashMap<IpAddr, u32>,
    cancel_on_connect: Option<(usize, CancellationToken)>,
    cancel_on_ping: Option<CancellationToken>,
    connects: AtomicUsize,
    handshakes: AtomicUsize,
    pings: AtomicUsize,
}

fn ip(s: &str) -> IpAddr {
    s.parse().expect("test IP")
}

impl ScriptedProber {
    pub(crate) fn tcp(mut self, addr: &str, latency_ms: f64) -> Self {
        self.tcp.insert(ip(addr), TcpScript::Latency(latency_ms));
        self
    }

    pub(crate) fn tcp_hang(mut self, addr: &str) -> Self {
        self.tcp.insert(ip(addr), TcpScript::Hang);
        self
    }

    pub(crate) fn tls_ok(mut self, addr: &str, host: &str) -> Self {
        self.tls_ok.insert((ip(addr), host.to_string()));
        self
    }

    pub(crate) fn icmp(mut self, addr: &str, ms: u32) -> Self {
        self.icmp.insert(ip(addr), ms);
        self
    }

    /// Cancel `token` while serving the `n`-th connect call.
    pub(crate) fn cancel_on_connect(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_on_connect = Some((n, token));
        self
    }

    /// Cancel `token` while serving any ping.
    pub(crate) fn cancel_on_ping(mut self, token: CancellationToken) -> Self {
        self.cancel_on_ping = Some(token);
        self
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn handshake_calls(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub(crate) fn ping_calls(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> Result<f64, ProbeError> {
        let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_on_connect {
            if n == *at {
                token.cancel();
            }
        }

        match self.tcp.get(&addr.ip()) {
            Some(TcpScript::Latency(ms)) => Ok(*ms),
            Some(TcpScript::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProbeError::Timeout(timeout))
            }
            None => Err(ProbeError::Timeout(timeout)),
        }
    }

    async fn handshake(
        &self,
        addr: SocketAddr,
        sni: &str,
        _timeout: Duration,
        _verify_hostname: bool,
    ) -> Result<(), ProbeError> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        if self.tls_ok.contains(&(addr.ip(), sni.to_string())) {
            Ok(())
        } else {
            Err(ProbeError::CertVerify("NotValidForName".into()))
        }
    }

    async fn ping(&self, addr: IpAddr, _timeout: Duration) -> Option<u32> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_ping {
            token.cancel();
        }
        self.icmp.get(&addr).copied()
    }
}
