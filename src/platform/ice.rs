//! ICE candidate grammar: parse and format `candidate:` lines, compute
//! priorities, build host candidates, generate credentials.
//!
//! Accepts both the browser form (`udp`, `tcp ... tcptype active`) and the
//! legacy upper-case form (`UDP`, `TCP-ACT`, `TCP-PASS`).

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};

/// ICE candidate type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }
}

/// ICE transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    TcpActive,
    TcpPassive,
    TcpSimultaneousOpen,
}

/// A parsed ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport: Transport,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub candidate_type: CandidateType,
    /// For srflx/prflx/relay: the related address.
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl IceCandidate {
    /// Format as a `candidate:` attribute value (without the `a=` prefix).
    pub fn to_sdp_line(&self) -> String {
        let (proto, tcptype) = match self.transport {
            Transport::Udp => ("udp", None),
            Transport::TcpActive => ("tcp", Some("active")),
            Transport::TcpPassive => ("tcp", Some("passive")),
            Transport::TcpSimultaneousOpen => ("tcp", Some("so")),
        };
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            proto,
            self.priority,
            self.address,
            self.port,
            self.candidate_type.as_str()
        );
        if let (Some(ra), Some(rp)) = (&self.raddr, self.rport) {
            line.push_str(&format!(" raddr {} rport {}", ra, rp));
        }
        if let Some(t) = tcptype {
            line.push_str(&format!(" tcptype {}", t));
        }
        line
    }
}

/// Parse a candidate line (`a=candidate:`, `candidate:` or bare attribute body).
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let content = line
        .strip_prefix("a=candidate:")
        .or_else(|| line.strip_prefix("candidate:"))
        .with_context(|| format!("not a candidate line: {}", line))?;

    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() < 8 || parts[6] != "typ" {
        bail!("candidate line too short: {}", line);
    }

    let foundation = parts[0].to_string();
    let component: u8 = parts[1].parse().context("bad component")?;
    if component == 0 {
        bail!("component must be >= 1");
    }

    let priority: u32 = parts[3].parse().context("bad priority")?;
    let address = parts[4].to_string();
    if address.is_empty() {
        bail!("empty connection address");
    }
    let port: u16 = parts[5].parse().context("bad port")?;

    let candidate_type = match parts[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type: {}", other),
    };

    // Trailing extension attributes come in name/value pairs.
    let mut raddr = None;
    let mut rport = None;
    let mut tcptype = None;
    for pair in parts[8..].chunks(2) {
        match pair {
            ["raddr", v] => raddr = Some(v.to_string()),
            ["rport", v] => rport = Some(v.parse().context("bad rport")?),
            ["tcptype", v] => tcptype = Some(*v),
            [_, _] => {}
            [dangling] => bail!("dangling candidate attribute: {}", dangling),
            _ => {}
        }
    }

    let transport = match (parts[2].to_ascii_lowercase().as_str(), tcptype) {
        ("udp", _) => Transport::Udp,
        ("tcp-act", _) | ("tcp", Some("active")) => Transport::TcpActive,
        ("tcp-pass", _) | ("tcp", Some("passive")) => Transport::TcpPassive,
        ("tcp", Some("so")) => Transport::TcpSimultaneousOpen,
        ("tcp", _) => bail!("tcp candidate without tcptype"),
        (other, _) => bail!("unsupported transport: {}", other),
    };

    Ok(IceCandidate {
        foundation,
        component,
        transport,
        priority,
        address,
        port,
        candidate_type,
        raddr,
        rport,
    })
}

/// Compute candidate priority per RFC 8445 section 5.1.2.1.
pub fn compute_priority(ctype: CandidateType, local_preference: u16, component: u8) -> u32 {
    let type_preference: u32 = match ctype {
        CandidateType::Host => 126,
        CandidateType::PeerReflexive => 110,
        CandidateType::ServerReflexive => 100,
        CandidateType::Relay => 0,
    };
    (type_preference << 24) | ((local_preference as u32) << 8) | (256 - component as u32)
}

/// Build a UDP host candidate for `addr`.
pub fn host_candidate(addr: SocketAddr, component: u8) -> IceCandidate {
    IceCandidate {
        foundation: "1".into(),
        component,
        transport: Transport::Udp,
        priority: compute_priority(CandidateType::Host, 65535, component),
        address: addr.ip().to_string(),
        port: addr.port(),
        candidate_type: CandidateType::Host,
        raddr: None,
        rport: None,
    }
}

/// ICE credentials (ufrag + pwd).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    /// Fresh random credentials: 8-char ufrag, 32-char hex pwd (RFC 8839 ice-chars).
    pub fn generate() -> Self {
        let ufrag = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let pwd = uuid::Uuid::new_v4().simple().to_string();
        Self { ufrag, pwd }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_candidate() {
        let c = parse_candidate("candidate:1 1 udp 2130706431 10.0.0.1 21730 typ host").unwrap();
        assert_eq!(c.foundation, "1");
        assert_eq!(c.component, 1);
        assert_eq!(c.transport, Transport::Udp);
        assert_eq!(c.priority, 2130706431);
        assert_eq!(c.candidate_type, CandidateType::Host);
        assert!(c.raddr.is_none());
    }

    #[test]
    fn test_parse_browser_srflx_with_extensions() {
        let line = "candidate:842163049 1 udp 1677729535 203.0.113.1 54400 typ srflx raddr 10.0.0.1 rport 54400 generation 0 ufrag abcd network-cost 999";
        let c = parse_candidate(line).unwrap();
        assert_eq!(c.candidate_type, CandidateType::ServerReflexive);
        assert_eq!(c.raddr.as_deref(), Some("10.0.0.1"));
        assert_eq!(c.rport, Some(54400));
    }

    #[test]
    fn test_parse_tcp_forms() {
        let c = parse_candidate("a=candidate:2 1 TCP-PASS 1 10.0.0.1 9 typ host").unwrap();
        assert_eq!(c.transport, Transport::TcpPassive);
        let c = parse_candidate("candidate:2 1 tcp 1518280447 10.0.0.1 9 typ host tcptype active")
            .unwrap();
        assert_eq!(c.transport, Transport::TcpActive);
        assert!(parse_candidate("candidate:2 1 tcp 1 10.0.0.1 9 typ host").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_candidate("").is_err());
        assert!(parse_candidate("garbage").is_err());
        assert!(parse_candidate("candidate:1 1 udp notanumber 10.0.0.1 1 typ host").is_err());
        assert!(parse_candidate("candidate:1 1 udp 1 10.0.0.1 99999 typ host").is_err());
        assert!(parse_candidate("candidate:1 1 sctp 1 10.0.0.1 1 typ host").is_err());
        assert!(parse_candidate("candidate:1 1 udp 1 10.0.0.1 1 typ bogus").is_err());
    }

    #[test]
    fn test_to_sdp_line_parses_back() {
        let c = IceCandidate {
            foundation: "6".into(),
            component: 1,
            transport: Transport::Udp,
            priority: 1694234111,
            address: "203.0.113.1".into(),
            port: 11632,
            candidate_type: CandidateType::ServerReflexive,
            raddr: Some("10.0.0.1".into()),
            rport: Some(11632),
        };
        let line = c.to_sdp_line();
        assert_eq!(
            line,
            "candidate:6 1 udp 1694234111 203.0.113.1 11632 typ srflx raddr 10.0.0.1 rport 11632"
        );
        assert_eq!(parse_candidate(&line).unwrap(), c);
    }

    #[test]
    fn test_compute_priority() {
        assert_eq!(compute_priority(CandidateType::Host, 65535, 1), 2130706431);
        assert!(
            compute_priority(CandidateType::Host, 1, 1)
                > compute_priority(CandidateType::Relay, 1, 1)
        );
    }

    #[test]
    fn test_credentials_shape() {
        let creds = IceCredentials::generate();
        assert_eq!(creds.ufrag.len(), 8);
        assert_eq!(creds.pwd.len(), 32);
        assert_ne!(creds, IceCredentials::generate());
    }
}
