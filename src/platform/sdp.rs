//! Minimal SDP writer/reader for the synthetic transport.
//!
//! Writes a BUNDLE-style description with one `m=` section per sender
//! (opus for audio, VP8 for video), ICE credentials per section and an
//! `a=x-source:` attribute naming the capture device. Reads back enough to
//! validate a remote description and announce its tracks.

use anyhow::{bail, Result};

use super::ice::{self, IceCandidate, IceCredentials};
use super::TrackKind;

/// One media section of a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    pub kind: TrackKind,
    pub mid: String,
    pub track_id: Option<String>,
    /// Capture device feeding this section, if any.
    pub source: Option<String>,
}

/// Inputs for `build_description`.
pub struct DescriptionParams<'a> {
    pub session_id: u64,
    pub version: u64,
    pub local_ip: &'a str,
    pub creds: &'a IceCredentials,
    pub stream_id: &'a str,
    pub sections: &'a [MediaSection],
}

/// What we learn from parsing a description.
#[derive(Debug, Clone)]
pub struct ParsedDescription {
    pub ice: IceCredentials,
    pub stream_id: Option<String>,
    pub sections: Vec<MediaSection>,
    /// Candidates embedded in the description (non-trickle peers).
    pub candidates: Vec<IceCandidate>,
}

/// Render a session description.
pub fn build_description(p: &DescriptionParams) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str(&format!(
        "o=- {} {} IN IP4 {}\r\n",
        p.session_id, p.version, p.local_ip
    ));
    sdp.push_str("s=-\r\n");
    sdp.push_str("t=0 0\r\n");

    let mids: Vec<&str> = p.sections.iter().map(|s| s.mid.as_str()).collect();
    sdp.push_str(&format!("a=group:BUNDLE {}\r\n", mids.join(" ")));
    sdp.push_str(&format!("a=msid-semantic: WMS {}\r\n", p.stream_id));

    for section in p.sections {
        let (m_line, rtpmap) = match section.kind {
            TrackKind::Audio => ("m=audio 9 UDP/TLS/RTP/SAVPF 111", "a=rtpmap:111 opus/48000/2"),
            TrackKind::Video => ("m=video 9 UDP/TLS/RTP/SAVPF 96", "a=rtpmap:96 VP8/90000"),
        };
        sdp.push_str(m_line);
        sdp.push_str("\r\n");
        sdp.push_str("c=IN IP4 0.0.0.0\r\n");
        sdp.push_str(&format!("a=mid:{}\r\n", section.mid));
        sdp.push_str(&format!("a=ice-ufrag:{}\r\n", p.creds.ufrag));
        sdp.push_str(&format!("a=ice-pwd:{}\r\n", p.creds.pwd));
        sdp.push_str("a=sendrecv\r\n");
        sdp.push_str("a=rtcp-mux\r\n");
        sdp.push_str(rtpmap);
        sdp.push_str("\r\n");
        if let Some(ref track_id) = section.track_id {
            sdp.push_str(&format!("a=msid:{} {}\r\n", p.stream_id, track_id));
        }
        if let Some(ref source) = section.source {
            sdp.push_str(&format!("a=x-source:{}\r\n", source));
        }
    }

    sdp
}

/// Parse and validate a session description.
pub fn parse_description(sdp: &str) -> Result<ParsedDescription> {
    let mut lines = sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    match lines.next() {
        Some("v=0") => {}
        Some(other) => bail!("description must start with v=0, got {:?}", other),
        None => bail!("empty description"),
    }

    let mut session_ufrag = None;
    let mut session_pwd = None;
    let mut stream_id = None;
    let mut sections: Vec<MediaSection> = Vec::new();
    let mut section_creds: Vec<(Option<String>, Option<String>)> = Vec::new();
    let mut candidates = Vec::new();
    // Sections of kinds we don't model (application, etc.) are skipped.
    let mut in_known_section = false;
    let mut in_any_section = false;

    for line in lines {
        if let Some(m) = line.strip_prefix("m=") {
            in_any_section = true;
            let kind = match m.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
            in_known_section = kind.is_some();
            if let Some(kind) = kind {
                sections.push(MediaSection {
                    kind,
                    mid: sections.len().to_string(),
                    track_id: None,
                    source: None,
                });
                section_creds.push((None, None));
            }
            continue;
        }

        if let Some(v) = line.strip_prefix("a=ice-ufrag:") {
            if !in_any_section {
                session_ufrag = Some(v.to_string());
            } else if in_known_section {
                if let Some(c) = section_creds.last_mut() {
                    c.0 = Some(v.to_string());
                }
            }
        } else if let Some(v) = line.strip_prefix("a=ice-pwd:") {
            if !in_any_section {
                session_pwd = Some(v.to_string());
            } else if in_known_section {
                if let Some(c) = section_creds.last_mut() {
                    c.1 = Some(v.to_string());
                }
            }
        } else if let Some(v) = line.strip_prefix("a=msid-semantic:") {
            stream_id = v.split_whitespace().nth(1).map(str::to_string);
        } else if !in_known_section {
            continue;
        } else if let Some(v) = line.strip_prefix("a=mid:") {
            if let Some(s) = sections.last_mut() {
                s.mid = v.to_string();
            }
        } else if let Some(v) = line.strip_prefix("a=msid:") {
            let mut parts = v.split_whitespace();
            let stream = parts.next().map(str::to_string);
            if let Some(s) = sections.last_mut() {
                s.track_id = parts.next().map(str::to_string);
            }
            if stream_id.is_none() {
                stream_id = stream;
            }
        } else if let Some(v) = line.strip_prefix("a=x-source:") {
            if let Some(s) = sections.last_mut() {
                s.source = Some(v.to_string());
            }
        } else if line.starts_with("a=candidate:") {
            match ice::parse_candidate(line) {
                Ok(c) => candidates.push(c),
                Err(e) => tracing::debug!("Skipping embedded candidate: {:#}", e),
            }
        }
    }

    if sections.is_empty() {
        bail!("description has no audio or video section");
    }

    // Media-level credentials win; fall back to session level.
    let (ufrag, pwd) = section_creds
        .first()
        .cloned()
        .map(|(u, p)| (u.or(session_ufrag.clone()), p.or(session_pwd.clone())))
        .unwrap_or((session_ufrag, session_pwd));
    let (ufrag, pwd) = match (ufrag, pwd) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => (u, p),
        _ => bail!("description is missing ICE credentials"),
    };

    Ok(ParsedDescription {
        ice: IceCredentials { ufrag, pwd },
        stream_id,
        sections,
        candidates,
    })
}
