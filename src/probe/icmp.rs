//! ICMP echo fallback with native sockets and an OS `ping` command fallback.
//!
//! Only consulted when TCP gives nothing. Every failure mode, including a host
//! with no usable ICMP facility at all, collapses to `None`.

use std::io::Read;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn next_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP fallback: native RAW socket (privileged)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP fallback: native DGRAM socket (unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("ICMP fallback: native sockets unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Send one ICMP echo to `ip` and return the round trip in whole
/// milliseconds, at least 1.
pub async fn icmp_ping(ip: IpAddr, timeout: Duration) -> Option<u32> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    let result = if capability == IcmpCapability::Native {
        let native = tokio::task::spawn_blocking(move || ping_native(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))
            .and_then(|r| r);

        match native {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(%ip, error = %msg, "native ICMP not permitted, falling back to ping command");
                ping_command(ip, timeout).await
            }
            other => other,
        }
    } else {
        ping_command(ip, timeout).await
    };

    match result {
        Ok(ms) => Some(whole_ms(ms)),
        Err(e) => {
            tracing::debug!(%ip, error = %e, "ICMP echo gave no answer");
            None
        }
    }
}

fn whole_ms(ms: f64) -> u32 {
    (ms.max(0.0) as u32).max(1)
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("not permitted") || msg.contains("denied")
}

fn ping_native(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ECHO_REQUEST_V4, ECHO_REPLY_V4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ECHO_REQUEST_V6, ECHO_REPLY_V6),
    };

    // RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(s) => (s, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol))
                .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?,
            false,
        ),
    };

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_ping_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    let mut buf = [0u8; 1500];
    loop {
        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // Raw IPv4 sockets deliver the IP header as well.
        let offset = if raw && ip.is_ipv4() && len > 0 {
            usize::from(buf[0] & 0x0f) * 4
        } else {
            0
        };
        if len < offset + 8 {
            continue;
        }

        let icmp = &buf[offset..len];
        let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
        let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
        // DGRAM sockets have the kernel rewrite the identifier.
        let id_matches = !raw || reply_id == identifier;
        if icmp[0] == reply_type && reply_seq == sequence && id_matches {
            return Ok(elapsed.as_secs_f64() * 1_000.0);
        }
    }
}

/// Echo request with a 56 byte payload. The ICMPv6 checksum is left to the kernel.
fn build_echo_request(kind: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp: u64 = rand::random();
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [odd] = chunks.remainder() {
        sum += u32::from(*odd) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn ping_args(ip: IpAddr, timeout: Duration) -> Vec<String> {
    let ms = timeout.as_millis().max(1);
    if cfg!(windows) {
        vec!["-n".into(), "1".into(), "-w".into(), ms.to_string(), ip.to_string()]
    } else if cfg!(target_os = "macos") {
        vec!["-n".into(), "-c".into(), "1".into(), "-W".into(), ms.to_string(), ip.to_string()]
    } else {
        let secs = ms.div_ceil(1000).max(1);
        vec!["-n".into(), "-c".into(), "1".into(), "-W".into(), secs.to_string(), ip.to_string()]
    }
}

async fn ping_command(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let mut cmd = Command::new("ping");
    cmd.args(ping_args(ip, timeout))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Give the utility a little headroom over its own deadline.
    let deadline = timeout + Duration::from_millis(500);
    let output = tokio::time::timeout(deadline, cmd.output())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if let Some(ms) = parse_ping_output(&stdout).or_else(|| parse_ping_output(&stderr)) {
        return Ok(ms);
    }

    if stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
        return Err(ProbeError::Timeout(timeout));
    }
    Err(ProbeError::Command(format!(
        "ping exited with {} without a round-trip time",
        output.status
    )))
}

/// Extract a round-trip time in milliseconds from ping output.
fn parse_ping_output(output: &str) -> Option<f64> {
    // Per-reply line: "time=12.3 ms", "time<1ms", "时间=12ms"
    static PER_REPLY: OnceLock<Regex> = OnceLock::new();
    let per_reply = PER_REPLY.get_or_init(|| {
        Regex::new(r"(?i)(?:time|时间)\s*(?P<op>[=<])\s*(?P<val>[0-9]+(?:\.[0-9]+)?)\s*ms").unwrap()
    });

    if let Some(caps) = per_reply.captures(output) {
        if let Ok(ms) = caps["val"].parse::<f64>() {
            // "<1ms" means answered faster than the utility can report.
            return Some(if &caps["op"] == "<" { ms.min(1.0) } else { ms });
        }
    }

    // Summary line: "rtt min/avg/max/mdev = a/b/c/d ms" (Linux) or
    // "round-trip min/avg/max/stddev = a/b/c/d ms" (macOS)
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*[0-9.]+/(?P<avg>[0-9.]+)/").unwrap()
    });

    summary
        .captures(output)
        .and_then(|caps| caps["avg"].parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_verifies_to_zero() {
        let packet = build_echo_request(ECHO_REQUEST_V4, 0x1234, 0x0001, true);
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn echo_request_layout() {
        let packet = build_echo_request(ECHO_REQUEST_V6, 0x1234, 0x0001, false);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[2..4], [0, 0]);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
    }

    #[test]
    fn parses_linux_reply() {
        let out = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        assert_eq!(parse_ping_output(out), Some(12.345));
    }

    #[test]
    fn parses_windows_sub_millisecond_reply() {
        let out = "Reply from 192.168.1.1: bytes=32 time<1ms TTL=64";
        let ms = parse_ping_output(out).unwrap();
        assert_eq!(whole_ms(ms), 1);
    }

    #[test]
    fn parses_localised_reply() {
        let out = "来自 140.82.112.3 的回复: 字节=32 时间=80ms TTL=49";
        assert_eq!(parse_ping_output(out), Some(80.0));
    }

    #[test]
    fn parses_macos_summary() {
        let out = r#"PING 1.1.1.1 (1.1.1.1): 56 data bytes

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        assert_eq!(parse_ping_output(out), Some(17.906));
    }

    #[test]
    fn no_time_means_none() {
        assert_eq!(parse_ping_output("Request timed out."), None);
    }

    #[test]
    fn whole_ms_never_reports_zero() {
        assert_eq!(whole_ms(0.2), 1);
        assert_eq!(whole_ms(80.9), 80);
    }

    #[test]
    fn command_args_carry_target() {
        let args = ping_args("203.0.113.9".parse().unwrap(), Duration::from_millis(2000));
        assert_eq!(args.last().map(String::as_str), Some("203.0.113.9"));
        assert!(args.contains(&"1".to_string()));
    }
}
