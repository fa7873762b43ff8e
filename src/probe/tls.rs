//! TLS/SNI correctness check.
//!
//! A TCP accept proves little: CDN edges and hijacking middleboxes happily
//! accept port 443 for hosts they do not serve. A handshake that presents the
//! domain as SNI (optionally validating the certificate chain and hostname)
//! shows the IP actually fronts that domain.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::{ProbeError, Prober};
use crate::models::VerificationOutcome;

/// Certificate verifier that accepts any chain but still checks handshake
/// signatures. Used when only "a TLS endpoint answers this SNI" matters.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Prebuilt connectors for both validation modes.
#[derive(Clone)]
pub struct TlsConnectors {
    verifying: TlsConnector,
    permissive: TlsConnector,
}

impl TlsConnectors {
    pub fn new() -> Result<Self, ProbeError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let verifying = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProbeError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let permissive = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProbeError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth();

        Ok(Self {
            verifying: TlsConnector::from(Arc::new(verifying)),
            permissive: TlsConnector::from(Arc::new(permissive)),
        })
    }

    pub fn get(&self, verify_hostname: bool) -> &TlsConnector {
        if verify_hostname {
            &self.verifying
        } else {
            &self.permissive
        }
    }
}

/// Run one TLS handshake against `addr` presenting `sni`.
///
/// The whole exchange, TCP connect included, is bounded by `to`.
pub async fn handshake(
    connector: &TlsConnector,
    addr: SocketAddr,
    sni: &str,
    to: Duration,
) -> Result<(), ProbeError> {
    let server_name = ServerName::try_from(sni.to_owned())
        .map_err(|_| ProbeError::InvalidHost(sni.to_owned()))?;

    let attempt = async {
        let stream = TcpStream::connect(addr).await.map_err(ProbeError::from_io)?;
        let mut tls = connector
            .connect(server_name, stream)
            .await
            .map_err(ProbeError::from_tls_io)?;
        let _ = tls.shutdown().await;
        Ok(())
    };

    timeout(to, attempt).await.map_err(|_| ProbeError::Timeout(to))?
}

/// Reduce user input like `https://GitHub.com:443/path?q#f` to `github.com`.
pub fn normalize_host(host: &str) -> String {
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    static BARE_V6: OnceLock<Regex> = OnceLock::new();
    let scheme = SCHEME.get_or_init(|| Regex::new(r"(?i)^[a-z][a-z0-9+.-]*://").unwrap());
    let bare_v6 = BARE_V6.get_or_init(|| Regex::new(r"^[0-9a-fA-F:]+$").unwrap());

    let h = host.trim();
    let h = scheme.replace(h, "");
    let h = h.split(['/', '?', '#']).next().unwrap_or_default();

    let h = if let Some(rest) = h.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else if h.contains(':') && !bare_v6.is_match(h) {
        h.split(':').next().unwrap_or_default()
    } else {
        h
    };

    h.trim().to_lowercase()
}

/// Order the domains of one IP for SNI checks: preferred hosts first (in
/// preference order), then the rest as seen, deduplicated, at most `limit`.
pub fn sni_candidates(domains: &[String], preferred: &[String], limit: usize) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::with_capacity(domains.len());
    for d in domains {
        let n = normalize_host(d);
        if !n.is_empty() && !cleaned.contains(&n) {
            cleaned.push(n);
        }
    }

    let mut out: Vec<String> = Vec::with_capacity(cleaned.len());
    for p in preferred {
        let p = normalize_host(p);
        if cleaned.contains(&p) && !out.contains(&p) {
            out.push(p);
        }
    }
    for c in cleaned {
        if !out.contains(&c) {
            out.push(c);
        }
    }

    out.truncate(limit.max(1));
    out
}

/// Try each hostname as SNI until one handshake succeeds.
///
/// An empty hostname list verifies trivially. On failure the last error kind
/// and the last hostname tried are reported.
pub async fn verify_any<P: Prober + ?Sized>(
    prober: &P,
    addr: SocketAddr,
    hosts: &[String],
    to: Duration,
    verify_hostname: bool,
    limit: usize,
    cancel: &CancellationToken,
) -> VerificationOutcome {
    let mut normalized: Vec<String> = Vec::with_capacity(hosts.len());
    for h in hosts {
        let n = normalize_host(h);
        if !n.is_empty() && !normalized.contains(&n) {
            normalized.push(n);
        }
    }
    if normalized.is_empty() {
        return VerificationOutcome::skipped();
    }

    let mut last_host = None;
    let mut last_err = String::from("tls");
    for host in normalized.into_iter().take(limit.max(1)) {
        if cancel.is_cancelled() {
            return VerificationOutcome::failed(Some(host), "stopped");
        }

        match prober.handshake(addr, &host, to, verify_hostname).await {
            Ok(()) => {
                tracing::debug!(ip = %addr.ip(), sni = %host, "TLS handshake verified");
                return VerificationOutcome::passed(host);
            }
            Err(e) => {
                tracing::debug!(ip = %addr.ip(), sni = %host, error = %e, "TLS handshake failed");
                last_err = e.kind().to_string();
                last_host = Some(host);
            }
        }
    }

    VerificationOutcome::failed(last_host, last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::ScriptedProber;

    fn addr(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 443)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalizes_urls_and_ports() {
        assert_eq!(normalize_host("https://GitHub.com/login?x=1#top"), "github.com");
        assert_eq!(normalize_host("HTTP://api.github.com:443"), "api.github.com");
        assert_eq!(normalize_host("  raw.githubusercontent.com  "), "raw.githubusercontent.com");
        assert_eq!(normalize_host("2606:50c0:8000::154"), "2606:50c0:8000::154");
        assert_eq!(normalize_host("[2606:50c0::1]:443"), "2606:50c0::1");
        assert_eq!(normalize_host(""), "");
    }

    #[test]
    fn candidates_put_preferred_first_and_respect_limit() {
        let domains = strings(&["assets-cdn.github.com", "API.github.com", "github.com", "api.github.com"]);
        let preferred = strings(&["github.com", "api.github.com", "gist.github.com"]);

        let out = sni_candidates(&domains, &preferred, 3);
        assert_eq!(out, strings(&["github.com", "api.github.com", "assets-cdn.github.com"]));

        let out = sni_candidates(&domains, &preferred, 1);
        assert_eq!(out, strings(&["github.com"]));
    }

    #[test]
    fn candidates_fall_back_to_all_domains() {
        let domains = strings(&["b.example.com", "a.example.com"]);
        let out = sni_candidates(&domains, &strings(&["github.com"]), 3);
        assert_eq!(out, domains);
    }

    #[tokio::test]
    async fn empty_host_list_verifies_without_handshake() {
        let prober = ScriptedProber::default();
        let outcome = verify_any(
            &prober,
            addr("203.0.113.9"),
            &[],
            Duration::from_secs(1),
            true,
            3,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, VerificationOutcome::skipped());
        assert_eq!(prober.handshake_calls(), 0);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let prober = ScriptedProber::default().tls_ok("140.82.112.3", "api.github.com");
        let hosts = strings(&["github.com", "api.github.com", "gist.github.com"]);

        let outcome = verify_any(
            &prober,
            addr("140.82.112.3"),
            &hosts,
            Duration::from_secs(1),
            false,
            3,
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.verified);
        assert_eq!(outcome.used_hostname.as_deref(), Some("api.github.com"));
        assert_eq!(prober.handshake_calls(), 2);
    }

    #[tokio::test]
    async fn reports_last_error_when_all_fail() {
        let prober = ScriptedProber::default();
        let hosts = strings(&["a.example.com", "b.example.com", "c.example.com", "d.example.com"]);

        let outcome = verify_any(
            &prober,
            addr("199.232.69.194"),
            &hosts,
            Duration::from_secs(1),
            true,
            3,
            &CancellationToken::new(),
        )
        .await;

        assert!(!outcome.verified);
        assert_eq!(outcome.used_hostname.as_deref(), Some("c.example.com"));
        assert_eq!(outcome.error_kind.as_deref(), Some("cert_verify"));
        assert_eq!(prober.handshake_calls(), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits() {
        let prober = ScriptedProber::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = verify_any(
            &prober,
            addr("140.82.112.3"),
            &strings(&["github.com"]),
            Duration::from_secs(1),
            true,
            3,
            &cancel,
        )
        .await;

        assert!(!outcome.verified);
        assert_eq!(outcome.error_kind.as_deref(), Some("stopped"));
        assert_eq!(prober.handshake_calls(), 0);
    }

    #[test]
    fn connectors_build() {
        assert!(TlsConnectors::new().is_ok());
    }
}
